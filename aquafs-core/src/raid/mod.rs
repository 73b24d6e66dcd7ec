// vim: tw=80

//! The zoned RAID virtualization layer.
//!
//! This module aggregates several [`ZonedBackend`]s into one logical zoned
//! device.  Five variants share the backend surface and differ only in
//! address translation and fan-out:
//!
//! * [`NullRaid`] — pass-through to the first backend (`raidn`)
//! * [`ConcatRaid`] — disjoint union of the backends' zones (`raidc`)
//! * [`Raid0`] — block-level striping across all backends (`raid0`)
//! * [`Raid1`] — every write mirrored to all backends (`raid1`)
//! * [`AutoRaid`] — per-logical-zone mode, chosen through the
//!   [`ZoneAllocator`] (`raida`)

use std::{
    fmt,
    str::FromStr,
    sync::Arc,
};

use futures::TryStreamExt;
use futures::stream::FuturesUnordered;
use serde_derive::{Deserialize, Serialize};

use crate::{
    types::*,
    zbd::*,
};

mod allocator;
mod auto;
mod concat;
mod null_raid;
mod raid0;
mod raid1;
mod sb;

pub use self::allocator::{RaidMapEntry, RaidModeEntry, ZoneAllocator};
pub use self::auto::{AutoRaid, META_ZONE_COUNT};
pub use self::concat::ConcatRaid;
pub use self::null_raid::NullRaid;
pub use self::raid0::Raid0;
pub use self::raid1::Raid1;
pub use self::sb::{
    BASIC_INFO_SIZE,
    MapRecord,
    ModeRecord,
    RaidAppendInfo,
    RaidBasicInfo,
};

/// Redundancy mode of a RAID set, or of one logical zone within an auto-raid
/// set.
///
/// The discriminants are part of the on-disk format; new variants go at the
/// end.  `Raid5`, `Raid6` and `Raid10` parse and serialize but have no
/// implementation.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RaidMode {
    /// No RAID: use the first backend only.
    None,
    /// Block-level striping.
    Raid0,
    /// Mirroring.
    Raid1,
    Raid5,
    Raid6,
    Raid10,
    /// Concatenation.
    Concat,
    /// Per-logical-zone mode selection.
    Auto,
}

impl fmt::Display for RaidMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaidMode::None => "n",
            RaidMode::Raid0 => "0",
            RaidMode::Raid1 => "1",
            RaidMode::Raid5 => "5",
            RaidMode::Raid6 => "6",
            RaidMode::Raid10 => "10",
            RaidMode::Concat => "c",
            RaidMode::Auto => "a",
        };
        s.fmt(f)
    }
}

impl FromStr for RaidMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "n" | "N" => Ok(RaidMode::None),
            "0" => Ok(RaidMode::Raid0),
            "1" => Ok(RaidMode::Raid1),
            "5" => Ok(RaidMode::Raid5),
            "6" => Ok(RaidMode::Raid6),
            "10" => Ok(RaidMode::Raid10),
            "c" | "C" => Ok(RaidMode::Concat),
            "a" | "A" => Ok(RaidMode::Auto),
            _ => Err(Error::inval(format!("unknown raid mode {s:?}"))),
        }
    }
}

/// A parsed `raid<mode>:dev:<name>[,dev:<name>]*` device URI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaidUri {
    pub mode: RaidMode,
    pub devices: Vec<String>,
}

impl FromStr for RaidUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("raid")
            .ok_or_else(|| Error::inval(format!("bad raid uri {s:?}")))?;
        let (mode_str, devs) = rest.split_once(':')
            .ok_or_else(|| Error::inval(format!("bad raid uri {s:?}")))?;
        let mode = mode_str.parse()?;
        let devices = devs.split(',').map(|spec| {
            spec.strip_prefix("dev:")
                .map(str::to_owned)
                .ok_or_else(|| {
                    Error::inval(format!("bad device spec {spec:?}"))
                })
        }).collect::<Result<Vec<_>>>()?;
        if devices.is_empty() || devices.iter().any(String::is_empty) {
            return Err(Error::inval(format!("bad raid uri {s:?}")));
        }
        Ok(RaidUri { mode, devices })
    }
}

/// The virtual zoned device exposed to the filesystem.
///
/// Every variant implements the whole [`ZonedBackend`] surface — the layers
/// above cannot tell one backend from an aggregate of eight — plus the
/// RAID-specific operations here.
pub trait RaidZonedDevice: ZonedBackend {
    fn main_mode(&self) -> RaidMode;

    fn nr_dev(&self) -> usize;

    /// The first backend.  Geometry is uniform across the set, so per-device
    /// geometry questions are answered here.
    fn def_dev(&self) -> &Arc<dyn ZonedBackend>;

    /// The persistable layout, for modes that keep one.
    fn append_info(&self) -> Option<RaidAppendInfo> {
        None
    }

    /// Replace the layout with a persisted one.  Bootstrap only.
    fn layout_setup(&self, _append: &RaidAppendInfo) -> Result<()> {
        Err(Error::not_supported("layout setup requires auto-raid"))
    }

    /// Merge persisted layout entries that are missing locally.
    fn layout_update(&self, _append: &RaidAppendInfo) -> Result<()> {
        Err(Error::not_supported("layout update requires auto-raid"))
    }

    /// Scan the backends for offline zones and rebuild what can be rebuilt.
    fn scan_and_rebuild(self: Arc<Self>) -> ZbdFut<()>;
}

impl fmt::Debug for dyn RaidZonedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaidZonedDevice")
            .field("main_mode", &self.main_mode())
            .field("nr_dev", &self.nr_dev())
            .finish()
    }
}

/// Create a virtual zoned device over `devices`.
///
/// Auto-raid provisions fresh zones as mirrors by default; use
/// [`AutoRaid::new`] directly to choose another default.
pub fn create(mode: RaidMode, devices: Vec<Arc<dyn ZonedBackend>>)
    -> Result<Arc<dyn RaidZonedDevice>>
{
    match mode {
        RaidMode::None =>
            Ok(Arc::new(NullRaid::new(devices)?)),
        RaidMode::Concat =>
            Ok(Arc::new(ConcatRaid::new(devices)?)),
        RaidMode::Raid0 =>
            Ok(Arc::new(Raid0::new(devices)?)),
        RaidMode::Raid1 =>
            Ok(Arc::new(Raid1::new(devices)?)),
        RaidMode::Auto =>
            Ok(Arc::new(AutoRaid::new(devices, RaidMode::Raid1)?)),
        other =>
            Err(Error::not_supported(
                format!("raid{other} is not implemented"))),
    }
}

/// Recover a virtual zoned device from its superblock records.
///
/// `basic` must describe the attached backends or the mount fails with
/// `Corruption`.  For auto-raid, a persisted `append` replaces the default
/// layout.
pub fn open(basic: &RaidBasicInfo, append: Option<&RaidAppendInfo>,
            devices: Vec<Arc<dyn ZonedBackend>>)
    -> Result<Arc<dyn RaidZonedDevice>>
{
    let dev = create(basic.main_mode, devices)?;
    basic.compatible(&*dev)?;
    if let Some(append) = append {
        dev.layout_setup(append)?;
    }
    Ok(dev)
}

/// All backends of one virtual device must share a geometry.
fn validate_devices(devices: &[Arc<dyn ZonedBackend>]) -> Result<()> {
    let def = devices.first()
        .ok_or_else(|| Error::inval("a raid set needs at least one device"))?;
    for d in &devices[1..] {
        if d.block_size() != def.block_size() ||
            d.zone_size() != def.zone_size() ||
            d.nr_zones() != def.nr_zones()
        {
            return Err(Error::inval(format!(
                "backend {} geometry differs from {}",
                d.name(), def.name())));
        }
    }
    Ok(())
}

/// Open every backend and report the weakest zone-resource limits.
fn open_all(devices: &[Arc<dyn ZonedBackend>], readonly: bool,
            exclusive: bool) -> ZbdFut<OpenLimits>
{
    let futs = devices.iter()
        .map(|d| d.open(readonly, exclusive))
        .collect::<FuturesUnordered<_>>();
    Box::pin(async move {
        let limits = futs.try_collect::<Vec<_>>().await?;
        limits.into_iter()
            .reduce(OpenLimits::combine)
            .ok_or_else(|| Error::inval("no devices"))
    })
}

/// `raid<mode>:dev:a,dev:b`, the URI shape the CLI tools accept.
fn raid_name(mode: RaidMode, devices: &[Arc<dyn ZonedBackend>]) -> String {
    let devs = devices.iter()
        .map(|d| d.name())
        .collect::<Vec<_>>()
        .join(",");
    format!("raid{mode}:{devs}")
}
