// vim: tw=80

use std::sync::Arc;

use futures::{TryFutureExt, TryStreamExt};
use futures::{future, stream::FuturesUnordered};
use tracing::warn;

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

/// `Raid1`: every backend holds a full replica at identical offsets.
///
/// Writes fan out to all replicas and are all-or-nothing: the call returns
/// only once every replica has acknowledged, and any replica's error is the
/// overall error.  Reads are served by the first replica and fall back to
/// the next on failure, so replicas advance in lockstep and any healthy one
/// answers for the set.
pub struct Raid1 {
    devices: Vec<Arc<dyn ZonedBackend>>,
}

impl Raid1 {
    pub fn new(devices: Vec<Arc<dyn ZonedBackend>>) -> Result<Self> {
        validate_devices(&devices)?;
        if devices.len() < 2 {
            return Err(Error::inval("raid1 needs at least two devices"));
        }
        Ok(Raid1 { devices })
    }
}

impl ZonedBackend for Raid1 {
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdFut<OpenLimits> {
        open_all(&self.devices, readonly, exclusive)
    }

    fn block_size(&self) -> u64 {
        self.devices[0].block_size()
    }

    fn zone_size(&self) -> u64 {
        self.devices[0].zone_size()
    }

    fn nr_zones(&self) -> ZoneT {
        self.devices[0].nr_zones()
    }

    fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        self.devices[0].list_zones()
    }

    fn read_at(self: Arc<Self>, buf: IoVecMut, offset: u64, direct: bool)
        -> ZbdFut<usize>
    {
        Box::pin(async move {
            let dbi = buf.clone_inaccessible();
            let mut buf = Some(buf);
            let mut last = Error::io("no readable replica");
            for dev in &self.devices {
                let b = match buf.take() {
                    Some(b) => b,
                    None => dbi.try_mut().unwrap(),
                };
                match dev.clone().read_at(b, offset, direct).await {
                    Ok(n) => return Ok(n),
                    Err(e) => {
                        warn!("replica read at {:#x} failed on {}: {}",
                              offset, dev.name(), e);
                        last = e;
                    }
                }
            }
            Err(last)
        })
    }

    fn write_at(&self, buf: IoVec, offset: u64) -> ZbdFut<usize> {
        let futs = self.devices.iter()
            .map(|dev| dev.write_at(buf.clone(), offset))
            .collect::<FuturesUnordered<_>>();
        Box::pin(async move {
            let written = futs.try_collect::<Vec<_>>().await?;
            Ok(written[0])
        })
    }

    fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo> {
        let futs = self.devices.iter()
            .map(|d| d.reset_zone(start))
            .collect::<FuturesUnordered<_>>();
        Box::pin(async move {
            let infos = futs.try_collect::<Vec<_>>().await?;
            Ok(ResetInfo {
                offline: infos.iter().any(|i| i.offline),
                max_capacity: infos[0].max_capacity,
            })
        })
    }

    fn finish_zone(&self, start: u64) -> ZbdFut<()> {
        let futs = self.devices.iter()
            .map(|d| d.finish_zone(start))
            .collect::<FuturesUnordered<_>>();
        Box::pin(futs.try_collect::<Vec<_>>().map_ok(|_| ()))
    }

    fn close_zone(&self, start: u64) -> ZbdFut<()> {
        let futs = self.devices.iter()
            .map(|d| d.close_zone(start))
            .collect::<FuturesUnordered<_>>();
        Box::pin(futs.try_collect::<Vec<_>>().map_ok(|_| ()))
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        for d in &self.devices {
            d.invalidate_cache(offset, len)?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        raid_name(RaidMode::Raid1, &self.devices)
    }

    fn set_simulated_offline(&self, zone: ZoneT) {
        self.devices[0].set_simulated_offline(zone)
    }
}

impl RaidZonedDevice for Raid1 {
    fn main_mode(&self) -> RaidMode {
        RaidMode::Raid1
    }

    fn nr_dev(&self) -> usize {
        self.devices.len()
    }

    fn def_dev(&self) -> &Arc<dyn ZonedBackend> {
        &self.devices[0]
    }

    fn scan_and_rebuild(self: Arc<Self>) -> ZbdFut<()> {
        Box::pin(future::ok(()))
    }
}
