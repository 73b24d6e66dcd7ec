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

/// `ConcatRaid`: the logical device is the disjoint union of all backends.
///
/// The backend owning the largest prefix not exceeding an offset absorbs the
/// operation; nothing is ever split across backends.  Zone numbering runs
/// through the backends in order, with the synthesized zone list shifting
/// each backend's starts by the byte prefix of its predecessors so starts
/// stay monotonic.
pub struct ConcatRaid {
    devices: Vec<Arc<dyn ZonedBackend>>,
    dev_size: u64,
}

impl ConcatRaid {
    pub fn new(devices: Vec<Arc<dyn ZonedBackend>>) -> Result<Self> {
        validate_devices(&devices)?;
        let def = &devices[0];
        let dev_size = def.zone_size() * u64::from(def.nr_zones());
        Ok(ConcatRaid { devices, dev_size })
    }

    /// Which backend absorbs `offset`, and at which local offset.
    fn route(&self, offset: u64) -> Result<(usize, u64)> {
        let mut local = offset;
        for i in 0..self.devices.len() {
            if local < self.dev_size {
                return Ok((i, local));
            }
            local -= self.dev_size;
        }
        Err(Error::inval(format!("offset {offset:#x} past device end")))
    }
}

impl ZonedBackend for ConcatRaid {
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
        self.devices.iter().map(|d| d.nr_zones()).sum()
    }

    fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        let mut zones = Vec::with_capacity(self.nr_zones() as usize);
        let mut prefix = 0;
        for dev in &self.devices {
            for z in dev.list_zones()? {
                zones.push(ZoneInfo {
                    start: z.start + prefix,
                    wp: z.wp + prefix,
                    ..z
                });
            }
            prefix += self.dev_size;
        }
        Ok(zones)
    }

    fn read_at(self: Arc<Self>, buf: IoVecMut, offset: u64, direct: bool)
        -> ZbdFut<usize>
    {
        match self.route(offset) {
            Ok((i, local)) =>
                self.devices[i].clone().read_at(buf, local, direct),
            Err(e) => Box::pin(future::err(e)),
        }
    }

    fn write_at(&self, buf: IoVec, offset: u64) -> ZbdFut<usize> {
        match self.route(offset) {
            Ok((i, local)) => self.devices[i].write_at(buf, local),
            Err(e) => Box::pin(future::err(e)),
        }
    }

    fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo> {
        match self.route(start) {
            Ok((i, local)) => self.devices[i].reset_zone(local),
            Err(e) => Box::pin(future::err(e)),
        }
    }

    fn finish_zone(&self, start: u64) -> ZbdFut<()> {
        match self.route(start) {
            Ok((i, local)) => self.devices[i].finish_zone(local),
            Err(e) => Box::pin(future::err(e)),
        }
    }

    fn close_zone(&self, start: u64) -> ZbdFut<()> {
        match self.route(start) {
            Ok((i, local)) => self.devices[i].close_zone(local),
            Err(e) => Box::pin(future::err(e)),
        }
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        let (i, local) = self.route(offset)?;
        self.devices[i].invalidate_cache(local, len)
    }

    fn name(&self) -> String {
        raid_name(RaidMode::Concat, &self.devices)
    }

    fn set_simulated_offline(&self, zone: ZoneT) {
        let per_dev = self.devices[0].nr_zones();
        let dev = (zone / per_dev) as usize;
        if let Some(d) = self.devices.get(dev) {
            d.set_simulated_offline(zone % per_dev);
        }
    }
}

impl RaidZonedDevice for ConcatRaid {
    fn main_mode(&self) -> RaidMode {
        RaidMode::Concat
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

#[cfg(test)]
mod t {
    use divbuf::DivBufShared;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;

    use crate::mem_backend::MemBackend;
    use super::*;

    const BS: u64 = 4096;
    const ZS: u64 = 1 << 16;

    fn concat() -> (Arc<ConcatRaid>, Vec<Arc<MemBackend>>) {
        let backends = (0..2).map(|i| {
            Arc::new(MemBackend::new(&format!("nullb{i}"), BS, ZS, 4))
        }).collect::<Vec<_>>();
        let devices = backends.iter()
            .map(|b| b.clone() as Arc<dyn ZonedBackend>)
            .collect();
        (Arc::new(ConcatRaid::new(devices).unwrap()), backends)
    }

    #[test]
    fn second_backend_absorbs_its_prefix() {
        // writing the first zone of the second backend leaves the first
        // backend untouched
        let (cr, backends) = concat();
        let dbs = DivBufShared::from(vec![0xaau8; BS as usize]);
        let n = cr.write_at(dbs.try_const().unwrap(), 4 * ZS)
            .now_or_never().unwrap().unwrap();
        assert_eq!(n, BS as usize);
        for z in 0..4 {
            assert_eq!(backends[0].zone_info(z).unwrap().live(), 0);
        }
        assert_eq!(backends[1].zone_info(0).unwrap().live(), BS);
    }

    #[test]
    fn roundtrip_across_the_seam() {
        let (cr, _) = concat();
        let dbs = DivBufShared::from(vec![0x17u8; BS as usize]);
        cr.write_at(dbs.try_const().unwrap(), 4 * ZS)
            .now_or_never().unwrap().unwrap();

        let rdbs = DivBufShared::from(vec![0u8; BS as usize]);
        let n = cr.clone().read_at(rdbs.try_mut().unwrap(), 4 * ZS, false)
            .now_or_never().unwrap().unwrap();
        assert_eq!(n, BS as usize);
        assert_eq!(&rdbs.try_const().unwrap()[..],
                   &[0x17u8; BS as usize][..]);
    }

    #[test]
    fn zone_list_is_monotonic() {
        let (cr, _) = concat();
        let zones = cr.list_zones().unwrap();
        assert_eq!(zones.len(), 8);
        for (i, z) in zones.iter().enumerate() {
            assert_eq!(z.start, i as u64 * ZS);
        }
    }

    #[test]
    fn zone_ops_route() {
        let (cr, backends) = concat();
        let dbs = DivBufShared::from(vec![1u8; BS as usize]);
        cr.write_at(dbs.try_const().unwrap(), 5 * ZS)
            .now_or_never().unwrap().unwrap();
        cr.finish_zone(5 * ZS).now_or_never().unwrap().unwrap();
        assert_eq!(backends[1].zone_wp(1).unwrap(), 2 * ZS);
        let ri = cr.reset_zone(5 * ZS).now_or_never().unwrap().unwrap();
        assert_eq!(ri.max_capacity, ZS);
        assert_eq!(backends[1].zone_wp(1).unwrap(), ZS);
    }

    #[test]
    fn past_the_end() {
        let (cr, _) = concat();
        let dbs = DivBufShared::from(vec![0u8; BS as usize]);
        let e = cr.write_at(dbs.try_const().unwrap(), 8 * ZS)
            .now_or_never().unwrap().unwrap_err();
        assert!(matches!(e, Error::InvalidArgument(_)));
    }
}
