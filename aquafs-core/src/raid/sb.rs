// vim: tw=80

//! Superblock descriptors for the RAID layer.
//!
//! Two compact records let a mounted instance recover its allocator state:
//! [`RaidBasicInfo`] pins the main mode and device geometry, and
//! [`RaidAppendInfo`] replays the full device-zone map and mode map.  Both
//! encode with bincode's legacy functions, which produce fixed-width
//! little-endian integers and 64-bit length prefixes for the outer lists;
//! there is no endianness flag on disk.

use serde_derive::{Deserialize, Serialize};

use crate::types::*;
use super::{RaidMode, RaidZonedDevice};

/// Serialized size of [`RaidBasicInfo`]: five 32-bit words.
pub const BASIC_INFO_SIZE: usize = 20;

/// Geometry and main mode of a RAID set, written to the superblock whenever
/// the virtual device is RAID-enabled.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RaidBasicInfo {
    pub main_mode: RaidMode,
    pub nr_devices: u32,
    /// Backing device block size in bytes.  All devices agree.
    pub dev_block_size: u32,
    /// Backing device zone size in bytes.
    pub dev_zone_size: u32,
    /// Zones per backing device.
    pub dev_nr_zones: u32,
}

impl RaidBasicInfo {
    pub fn load(dev: &dyn RaidZonedDevice) -> Self {
        let def = dev.def_dev();
        RaidBasicInfo {
            main_mode: dev.main_mode(),
            nr_devices: dev.nr_dev() as u32,
            dev_block_size: def.block_size() as u32,
            dev_zone_size: def.zone_size() as u32,
            dev_nr_zones: def.nr_zones(),
        }
    }

    /// Does this record describe the currently attached backends?  Mount
    /// fails with `Corruption` when it does not.
    pub fn compatible(&self, dev: &dyn RaidZonedDevice) -> Result<()> {
        let disk = RaidBasicInfo::load(dev);
        if self.main_mode != disk.main_mode {
            return Err(Error::corruption(format!(
                "main_mode mismatch: superblock raid{} != disk raid{}",
                self.main_mode, disk.main_mode)));
        }
        if self.nr_devices != disk.nr_devices {
            return Err(Error::corruption("nr_devices mismatch"));
        }
        if self.dev_block_size != disk.dev_block_size {
            return Err(Error::corruption("dev_block_size mismatch"));
        }
        if self.dev_zone_size != disk.dev_zone_size {
            return Err(Error::corruption("dev_zone_size mismatch"));
        }
        if self.dev_nr_zones != disk.dev_nr_zones {
            return Err(Error::corruption("dev_nr_zones mismatch"));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("infallible for a plain struct")
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf).map_err(|e| {
            Error::corruption(format!("bad raid basic info: {e}"))
        })
    }
}

/// One persisted slot binding.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MapRecord {
    pub slot: SlotT,
    pub device_idx: DevT,
    pub zone_idx: ZoneT,
    /// Nonzero records are skipped on replay.
    pub invalid: u16,
}

/// One persisted per-zone mode assignment.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ModeRecord {
    pub zone: ZoneT,
    pub mode: RaidMode,
    pub option: u32,
}

/// The full device-zone map and mode map of an auto-raid device,
/// length-prefixed.  Follows [`RaidBasicInfo`] in the superblock when
/// `main_mode` is `Auto`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RaidAppendInfo {
    pub device_zone_map: Vec<MapRecord>,
    pub mode_map: Vec<ModeRecord>,
}

impl RaidAppendInfo {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("infallible for plain records")
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf).map_err(|e| {
            Error::corruption(format!("bad raid append info: {e}"))
        })
    }
}

#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;

    use super::*;

    fn basic() -> RaidBasicInfo {
        RaidBasicInfo {
            main_mode: RaidMode::Auto,
            nr_devices: 4,
            dev_block_size: 4096,
            dev_zone_size: 1 << 16,
            dev_nr_zones: 8,
        }
    }

    #[test]
    fn basic_info_size() {
        assert_eq!(basic().encode().len(), BASIC_INFO_SIZE);
    }

    #[test]
    fn basic_info_layout() {
        // five little-endian words, no padding, no endianness flag
        let buf = basic().encode();
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());        // Auto
        assert_eq!(&buf[4..8], &4u32.to_le_bytes());
        assert_eq!(&buf[8..12], &4096u32.to_le_bytes());
        assert_eq!(&buf[12..16], &(1u32 << 16).to_le_bytes());
        assert_eq!(&buf[16..20], &8u32.to_le_bytes());
    }

    #[test]
    fn basic_info_roundtrip() {
        let bi = basic();
        assert_eq!(RaidBasicInfo::decode(&bi.encode()).unwrap(), bi);
    }

    #[test]
    fn basic_info_truncated() {
        let e = RaidBasicInfo::decode(&basic().encode()[..10]).unwrap_err();
        assert!(matches!(e, Error::Corruption(_)));
    }

    #[test]
    fn append_info_roundtrip() {
        let ai = RaidAppendInfo {
            device_zone_map: vec![
                MapRecord { slot: 0, device_idx: 0, zone_idx: 0, invalid: 0 },
                MapRecord { slot: 1, device_idx: 1, zone_idx: 3, invalid: 0 },
            ],
            mode_map: vec![
                ModeRecord { zone: 0, mode: RaidMode::None, option: 0 },
                ModeRecord { zone: 1, mode: RaidMode::Raid1, option: 0 },
            ],
        };
        let buf = ai.encode();
        // u64 list length prefix, then fixed-width records
        assert_eq!(&buf[0..8], &2u64.to_le_bytes());
        assert_eq!(RaidAppendInfo::decode(&buf).unwrap(), ai);
    }

    #[test]
    fn append_info_bad_mode_byte() {
        let ai = RaidAppendInfo {
            device_zone_map: vec![],
            mode_map: vec![
                ModeRecord { zone: 0, mode: RaidMode::Raid1, option: 0 },
            ],
        };
        let mut buf = ai.encode();
        // corrupt the high byte of the mode word: no such variant
        let mode_off = buf.len() - 5;
        buf[mode_off] ^= 0xff;
        assert!(RaidAppendInfo::decode(&buf).is_err());
    }
}
