// vim: tw=80

use std::sync::Arc;

use futures::future;

use crate::{
    types::*,
    zbd::*,
};
use super::{
    RaidMode,
    RaidZonedDevice,
    open_all,
    raid_name,
    validate_devices,
};

/// `NullRaid`: RAID-level pass-through.
///
/// Adapts the virtual-device surface to the first backend without providing
/// any redundancy.  Extra backends are opened but otherwise idle.
pub struct NullRaid {
    devices: Vec<Arc<dyn ZonedBackend>>,
}

impl NullRaid {
    pub fn new(devices: Vec<Arc<dyn ZonedBackend>>) -> Result<Self> {
        validate_devices(&devices)?;
        Ok(NullRaid { devices })
    }

    fn def(&self) -> &Arc<dyn ZonedBackend> {
        &self.devices[0]
    }
}

impl ZonedBackend for NullRaid {
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdFut<OpenLimits> {
        open_all(&self.devices, readonly, exclusive)
    }

    fn block_size(&self) -> u64 {
        self.def().block_size()
    }

    fn zone_size(&self) -> u64 {
        self.def().zone_size()
    }

    fn nr_zones(&self) -> ZoneT {
        self.def().nr_zones()
    }

    fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        self.def().list_zones()
    }

    fn read_at(self: Arc<Self>, buf: IoVecMut, offset: u64, direct: bool)
        -> ZbdFut<usize>
    {
        self.def().clone().read_at(buf, offset, direct)
    }

    fn write_at(&self, buf: IoVec, offset: u64) -> ZbdFut<usize> {
        self.def().write_at(buf, offset)
    }

    fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo> {
        self.def().reset_zone(start)
    }

    fn finish_zone(&self, start: u64) -> ZbdFut<()> {
        self.def().finish_zone(start)
    }

    fn close_zone(&self, start: u64) -> ZbdFut<()> {
        self.def().close_zone(start)
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        self.def().invalidate_cache(offset, len)
    }

    fn name(&self) -> String {
        raid_name(RaidMode::None, &self.devices)
    }

    fn set_simulated_offline(&self, zone: ZoneT) {
        self.def().set_simulated_offline(zone)
    }
}

impl RaidZonedDevice for NullRaid {
    fn main_mode(&self) -> RaidMode {
        RaidMode::None
    }

    fn nr_dev(&self) -> usize {
        self.devices.len()
    }

    fn def_dev(&self) -> &Arc<dyn ZonedBackend> {
        self.def()
    }

    fn scan_and_rebuild(self: Arc<Self>) -> ZbdFut<()> {
        Box::pin(future::ok(()))
    }
}
