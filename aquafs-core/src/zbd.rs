// vim: tw=80

//! The zoned block device backend capability set.
//!
//! Everything above this trait — the RAID virtualization layer included —
//! speaks to physical storage exclusively through [`ZonedBackend`].  A
//! production implementation wraps one host-managed zoned device; the
//! in-crate [`MemBackend`](crate::mem_backend::MemBackend) simulates one in
//! RAM for testing.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
};

use crate::types::*;

/// Future representing an operation on a zoned backend.
pub type ZbdFut<T> =
    Pin<Box<dyn Future<Output = Result<T>> + Send + Sync>>;

/// The state of one zone, as reported by `list_zones`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneCondition {
    /// Never written since the last reset.
    Empty,
    /// Has an active write pointer.
    Open,
    /// Written and then closed; may be reopened by writing at the wp.
    Closed,
    /// The write pointer has reached the zone's capacity.
    Full,
    /// Unreadable and unwritable.  Never re-enters service without operator
    /// action outside this layer.
    Offline,
}

/// A snapshot of one zone's geometry and state.
///
/// All fields are in bytes.  `capacity` may be smaller than `len` (the zone
/// size): some devices expose zones whose usable capacity is less than their
/// address-space footprint.
#[derive(Clone, Copy, Debug)]
pub struct ZoneInfo {
    /// First byte of the zone.
    pub start: u64,
    /// Next writable byte.  `start <= wp <= start + capacity`.
    pub wp: u64,
    /// Usable bytes in the zone.
    pub capacity: u64,
    /// Address-space footprint of the zone.
    pub len: u64,
    pub cond: ZoneCondition,
    /// Sequential-write-required?
    pub swr: bool,
}

impl ZoneInfo {
    pub fn is_offline(&self) -> bool {
        self.cond == ZoneCondition::Offline
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.cond,
                 ZoneCondition::Empty | ZoneCondition::Open |
                 ZoneCondition::Closed)
            && self.wp < self.start + self.capacity
    }

    pub fn is_active(&self) -> bool {
        matches!(self.cond, ZoneCondition::Open | ZoneCondition::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.cond == ZoneCondition::Open
    }

    /// Bytes written since the last reset.
    pub fn live(&self) -> u64 {
        debug_assert!(self.wp >= self.start);
        self.wp - self.start
    }
}

/// Zone-resource limits reported by `open`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenLimits {
    pub max_active_zones: u32,
    pub max_open_zones: u32,
}

impl OpenLimits {
    /// Combine limits across the members of a RAID set.  The weakest member
    /// bounds the whole set.
    pub fn combine(self, other: OpenLimits) -> OpenLimits {
        OpenLimits {
            max_active_zones:
                self.max_active_zones.min(other.max_active_zones),
            max_open_zones: self.max_open_zones.min(other.max_open_zones),
        }
    }
}

/// Outcome of a zone reset.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResetInfo {
    /// The device discovered the zone offline instead of resetting it.
    pub offline: bool,
    /// Usable capacity of the zone after the reset.
    pub max_capacity: u64,
}

/// One zoned block device.
///
/// Writes to a sequential-write-required zone must be block-aligned and must
/// start at the zone's current write pointer; the caller serializes writes
/// to one zone.  Reads clamp at the write pointer, so a short read means
/// end-of-data within the zone.
pub trait ZonedBackend: Send + Sync {
    /// Acquire the device's handles.
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdFut<OpenLimits>;

    /// Block size in bytes.  All I/O is aligned to this.
    fn block_size(&self) -> u64;

    /// Zone size in bytes.  Zones are uniformly sized.
    fn zone_size(&self) -> u64;

    /// Number of zones on the device.
    fn nr_zones(&self) -> ZoneT;

    /// Snapshot the state of every zone, in increasing `start` order.
    fn list_zones(&self) -> Result<Vec<ZoneInfo>>;

    /// Read up to `buf.len()` bytes at `offset`.  Returns the number of
    /// bytes read; short only at end-of-data.  `direct` bypasses the page
    /// cache and requires block-aligned offset and length.
    ///
    /// Takes `self` by `Arc` so implementations may re-issue the operation
    /// from error paths.
    fn read_at(self: Arc<Self>, buf: IoVecMut, offset: u64, direct: bool)
        -> ZbdFut<usize>;

    /// Append `buf` at `offset`, which must equal the containing zone's
    /// write pointer.  Returns the number of bytes written.
    fn write_at(&self, buf: IoVec, offset: u64) -> ZbdFut<usize>;

    /// Free the zone beginning at `start`; writing may resume from `start`.
    fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo>;

    /// Transition the zone to `Full`.  Does not affect data.
    fn finish_zone(&self, start: u64) -> ZbdFut<()>;

    /// Transition an open zone to `Closed`.  Does not affect data.
    fn close_zone(&self, start: u64) -> ZbdFut<()>;

    /// Advise the device that cached data for the range is no longer
    /// needed.
    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()>;

    /// Human-readable device name, e.g. `dev:nullb0`.
    fn name(&self) -> String;

    /// Test hook: make the zone report `Offline` from the next
    /// `list_zones` on, and make reads and writes into it fail.
    fn set_simulated_offline(&self, zone: ZoneT);

    /// The state of one zone.
    fn zone_info(&self, idx: ZoneT) -> Result<ZoneInfo> {
        self.list_zones()?
            .get(idx as usize)
            .copied()
            .ok_or_else(|| Error::inval(format!("zone {idx} out of range")))
    }

    fn zone_is_swr(&self, idx: ZoneT) -> Result<bool> {
        Ok(self.zone_info(idx)?.swr)
    }

    fn zone_is_offline(&self, idx: ZoneT) -> Result<bool> {
        Ok(self.zone_info(idx)?.is_offline())
    }

    fn zone_is_writable(&self, idx: ZoneT) -> Result<bool> {
        Ok(self.zone_info(idx)?.is_writable())
    }

    fn zone_is_active(&self, idx: ZoneT) -> Result<bool> {
        Ok(self.zone_info(idx)?.is_active())
    }

    fn zone_is_open(&self, idx: ZoneT) -> Result<bool> {
        Ok(self.zone_info(idx)?.is_open())
    }

    fn zone_start(&self, idx: ZoneT) -> Result<u64> {
        Ok(self.zone_info(idx)?.start)
    }

    fn zone_wp(&self, idx: ZoneT) -> Result<u64> {
        Ok(self.zone_info(idx)?.wp)
    }

    fn zone_max_capacity(&self, idx: ZoneT) -> Result<u64> {
        Ok(self.zone_info(idx)?.capacity)
    }
}

#[cfg(test)]
mockall::mock! {
    pub Backend {}
    impl ZonedBackend for Backend {
        fn open(&self, readonly: bool, exclusive: bool) -> ZbdFut<OpenLimits>;
        fn block_size(&self) -> u64;
        fn zone_size(&self) -> u64;
        fn nr_zones(&self) -> ZoneT;
        fn list_zones(&self) -> Result<Vec<ZoneInfo>>;
        fn read_at(self: Arc<Self>, buf: IoVecMut, offset: u64, direct: bool)
            -> ZbdFut<usize>;
        fn write_at(&self, buf: IoVec, offset: u64) -> ZbdFut<usize>;
        fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo>;
        fn finish_zone(&self, start: u64) -> ZbdFut<()>;
        fn close_zone(&self, start: u64) -> ZbdFut<()>;
        fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()>;
        fn name(&self) -> String;
        fn set_simulated_offline(&self, zone: ZoneT);
    }
}
