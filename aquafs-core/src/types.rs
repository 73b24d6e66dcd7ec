// vim: tw=80
//! Common type definitions used throughout AquaFS

use std::fmt;

use divbuf::{DivBuf, DivBufMut};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Our scatter-gather list.  A vector of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Mutable version of `SGList`.  Uniquely owned.
pub type SGListMut = Vec<IoVecMut>;

/// Indexes a zone within one zoned device.  A zone is the smallest unit that
/// can be independently reset.
pub type ZoneT = u32;

/// Indexes a backend device within a RAID set.
pub type DevT = u32;

/// Indexes a logical-zone slot.  Slot `k` belongs to logical zone
/// `k / device_count` at intra-zone position `k % device_count`.
pub type SlotT = u32;

/// AquaFS's error type.
///
/// The variants are semantic rather than transport-level: a backend that
/// fails with `EIO` and a backend that fails with `ENXIO` both surface as
/// [`Error::Io`] here.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The operation is not implemented for this device or mode.
    NotSupported(String),
    /// Misaligned offset, offset past device end, bad URI, or a bad
    /// argument of any other stripe.
    InvalidArgument(String),
    /// A backend-level failure.
    Io(String),
    /// The allocator could not satisfy a mapping request.
    NoSpace,
    /// Persisted state disagrees with the currently attached backends.
    Corruption(String),
}

impl Error {
    pub fn not_supported<S: Into<String>>(msg: S) -> Self {
        Error::NotSupported(msg.into())
    }

    pub fn inval<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn io<S: Into<String>>(msg: S) -> Self {
        Error::Io(msg.into())
    }

    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotSupported(msg) => write!(f, "Not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "I/O error: {msg}"),
            Error::NoSpace => "No space".fmt(f),
            Error::Corruption(msg) => write!(f, "Corruption: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
