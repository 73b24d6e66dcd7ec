// vim: tw=80

//! AquaFS core: a user-space filesystem layer for Zoned Block Devices.
//!
//! The heart of this crate is the zoned RAID virtualization layer in
//! [`raid`]: it aggregates several zoned block devices into a single logical
//! zoned device, striping, mirroring, concatenating, or remapping zones
//! across the underlying devices while preserving zone semantics
//! (sequential-write, reset-to-reuse, capacity and write-pointer reporting).

pub mod mem_backend;
pub mod raid;
pub mod types;
pub mod util;
pub mod zbd;

pub use crate::types::*;
pub use crate::util::*;
