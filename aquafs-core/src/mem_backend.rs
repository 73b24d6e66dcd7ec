// vim: tw=80

//! A RAM-backed zoned block device.
//!
//! `MemBackend` implements the full [`ZonedBackend`] contract — sequential
//! write enforcement, write-pointer clamped reads, zone state transitions —
//! against an in-memory store.  It exists so that the RAID layer and the
//! filesystem above it can be exercised without zoned hardware, and it
//! carries the simulated-offline hook used by the fault-injection tests.

use std::sync::{Arc, Mutex};

use futures::future;

use crate::{
    types::*,
    util::*,
    zbd::*,
};

struct Zone {
    wp: u64,
    capacity: u64,
    cond: ZoneCondition,
    data: Vec<u8>,
    offline: bool,
}

struct Inner {
    readonly: bool,
    zones: Vec<Zone>,
}

/// RAM-backed implementation of [`ZonedBackend`].
pub struct MemBackend {
    name: String,
    block_size: u64,
    zone_size: u64,
    nr_zones: ZoneT,
    inner: Mutex<Inner>,
}

impl MemBackend {
    pub fn new(name: &str, block_size: u64, zone_size: u64, nr_zones: ZoneT)
        -> Self
    {
        assert!(block_size > 0 && zone_size % block_size == 0,
                "zone size must be a multiple of the block size");
        let zones = (0..nr_zones).map(|i| Zone {
            wp: u64::from(i) * zone_size,
            capacity: zone_size,
            cond: ZoneCondition::Empty,
            data: Vec::new(),
            offline: false,
        }).collect();
        MemBackend {
            name: name.to_owned(),
            block_size,
            zone_size,
            nr_zones,
            inner: Mutex::new(Inner { readonly: false, zones }),
        }
    }

    fn zone_index(&self, offset: u64) -> Result<usize> {
        let idx = offset / self.zone_size;
        if idx >= u64::from(self.nr_zones) {
            Err(Error::inval(format!("offset {offset:#x} past device end")))
        } else {
            Ok(idx as usize)
        }
    }

    fn do_read(&self, buf: &mut IoVecMut, offset: u64, direct: bool)
        -> Result<usize>
    {
        if direct && (!is_aligned(offset, self.block_size) ||
                      !is_aligned(buf.len() as u64, self.block_size))
        {
            return Err(Error::inval("direct read must be block-aligned"));
        }
        let idx = self.zone_index(offset)?;
        let inner = self.inner.lock().unwrap();
        let zone = &inner.zones[idx];
        if zone.offline {
            return Err(Error::io(
                format!("read in offline zone {idx} of {}", self.name)));
        }
        let avail = zone.wp.saturating_sub(offset);
        let n = (buf.len() as u64).min(avail) as usize;
        if n > 0 {
            let zoff = (offset - idx as u64 * self.zone_size) as usize;
            buf[..n].copy_from_slice(&zone.data[zoff..zoff + n]);
        }
        Ok(n)
    }

    fn do_write(&self, buf: &IoVec, offset: u64) -> Result<usize> {
        if !is_aligned(offset, self.block_size) ||
            !is_aligned(buf.len() as u64, self.block_size)
        {
            return Err(Error::inval("write must be block-aligned"));
        }
        let idx = self.zone_index(offset)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.readonly {
            return Err(Error::io("device is open read-only"));
        }
        let zone = &mut inner.zones[idx];
        let start = idx as u64 * self.zone_size;
        if zone.offline {
            return Err(Error::io(
                format!("write in offline zone {idx} of {}", self.name)));
        }
        if offset != zone.wp {
            return Err(Error::inval(format!(
                "unaligned write: offset {offset:#x} != wp {:#x}", zone.wp)));
        }
        let end = offset + buf.len() as u64;
        if end > start + zone.capacity {
            return Err(Error::inval("write beyond zone capacity"));
        }
        zone.data.extend_from_slice(&buf[..]);
        zone.wp = end;
        zone.cond = if zone.wp == start + zone.capacity {
            ZoneCondition::Full
        } else {
            ZoneCondition::Open
        };
        Ok(buf.len())
    }
}

impl ZonedBackend for MemBackend {
    fn open(&self, readonly: bool, _exclusive: bool) -> ZbdFut<OpenLimits> {
        self.inner.lock().unwrap().readonly = readonly;
        Box::pin(future::ok(OpenLimits {
            max_active_zones: self.nr_zones,
            max_open_zones: self.nr_zones,
        }))
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn zone_size(&self) -> u64 {
        self.zone_size
    }

    fn nr_zones(&self) -> ZoneT {
        self.nr_zones
    }

    fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.zones.iter().enumerate().map(|(i, z)| ZoneInfo {
            start: i as u64 * self.zone_size,
            wp: z.wp,
            capacity: z.capacity,
            len: self.zone_size,
            cond: if z.offline { ZoneCondition::Offline } else { z.cond },
            swr: true,
        }).collect())
    }

    fn read_at(self: Arc<Self>, mut buf: IoVecMut, offset: u64, direct: bool)
        -> ZbdFut<usize>
    {
        let r = self.do_read(&mut buf, offset, direct);
        Box::pin(future::ready(r))
    }

    fn write_at(&self, buf: IoVec, offset: u64) -> ZbdFut<usize> {
        let r = self.do_write(&buf, offset);
        Box::pin(future::ready(r))
    }

    fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo> {
        let r = (|| {
            if !is_aligned(start, self.zone_size) {
                return Err(Error::inval("reset must be zone-aligned"));
            }
            let idx = self.zone_index(start)?;
            let mut inner = self.inner.lock().unwrap();
            if inner.readonly {
                return Err(Error::not_supported(
                    "reset on a read-only device"));
            }
            let zone = &mut inner.zones[idx];
            if zone.offline {
                return Ok(ResetInfo { offline: true, max_capacity: 0 });
            }
            zone.data.clear();
            zone.wp = start;
            zone.cond = ZoneCondition::Empty;
            Ok(ResetInfo { offline: false, max_capacity: zone.capacity })
        })();
        Box::pin(future::ready(r))
    }

    fn finish_zone(&self, start: u64) -> ZbdFut<()> {
        let r = (|| {
            if !is_aligned(start, self.zone_size) {
                return Err(Error::inval("finish must be zone-aligned"));
            }
            let idx = self.zone_index(start)?;
            let mut inner = self.inner.lock().unwrap();
            let zone = &mut inner.zones[idx];
            if zone.offline {
                return Err(Error::io(format!("zone {idx} is offline")));
            }
            let capacity = zone.capacity;
            zone.data.resize(capacity as usize, 0);
            zone.wp = start + capacity;
            zone.cond = ZoneCondition::Full;
            Ok(())
        })();
        Box::pin(future::ready(r))
    }

    fn close_zone(&self, start: u64) -> ZbdFut<()> {
        let r = (|| {
            if !is_aligned(start, self.zone_size) {
                return Err(Error::inval("close must be zone-aligned"));
            }
            let idx = self.zone_index(start)?;
            let mut inner = self.inner.lock().unwrap();
            let zone = &mut inner.zones[idx];
            if zone.cond == ZoneCondition::Open {
                zone.cond = ZoneCondition::Closed;
            }
            Ok(())
        })();
        Box::pin(future::ready(r))
    }

    fn invalidate_cache(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        format!("dev:{}", self.name)
    }

    fn set_simulated_offline(&self, zone: ZoneT) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(z) = inner.zones.get_mut(zone as usize) {
            z.offline = true;
        }
    }
}

#[cfg(test)]
mod t {
    use divbuf::DivBufShared;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;

    use super::*;

    const BS: u64 = 4096;
    const ZS: u64 = 1 << 16;

    fn backend() -> Arc<MemBackend> {
        Arc::new(MemBackend::new("membe0", BS, ZS, 4))
    }

    fn wbuf(byte: u8, len: usize) -> IoVec {
        DivBufShared::from(vec![byte; len]).try_const().unwrap()
    }

    mod write_at {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn roundtrip() {
            let be = backend();
            assert_eq!(be.write_at(wbuf(0xaa, 8192), 0)
                       .now_or_never().unwrap().unwrap(), 8192);

            let dbs = DivBufShared::from(vec![0u8; 8192]);
            let buf = dbs.try_mut().unwrap();
            assert_eq!(be.clone().read_at(buf, 0, false)
                       .now_or_never().unwrap().unwrap(), 8192);
            assert_eq!(&dbs.try_const().unwrap()[..], &[0xaau8; 8192][..]);
        }

        #[test]
        fn must_start_at_wp() {
            let be = backend();
            let e = be.write_at(wbuf(0, 4096), 4096)
                .now_or_never().unwrap().unwrap_err();
            assert!(matches!(e, Error::InvalidArgument(_)));
        }

        #[test]
        fn must_be_block_aligned() {
            let be = backend();
            let e = be.write_at(wbuf(0, 512), 0)
                .now_or_never().unwrap().unwrap_err();
            assert!(matches!(e, Error::InvalidArgument(_)));
        }

        #[test]
        fn must_not_cross_capacity() {
            let be = backend();
            be.write_at(wbuf(0, (ZS - BS) as usize), 0)
                .now_or_never().unwrap().unwrap();
            let e = be.write_at(wbuf(0, 8192), ZS - BS)
                .now_or_never().unwrap().unwrap_err();
            assert!(matches!(e, Error::InvalidArgument(_)));
        }

        #[test]
        fn fills_zone_to_full() {
            let be = backend();
            be.write_at(wbuf(1, ZS as usize), 0)
                .now_or_never().unwrap().unwrap();
            assert_eq!(be.zone_info(0).unwrap().cond, ZoneCondition::Full);
        }
    }

    mod read_at {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn short_at_wp() {
            let be = backend();
            be.write_at(wbuf(0x5a, 4096), 0).now_or_never().unwrap().unwrap();

            let dbs = DivBufShared::from(vec![0u8; 8192]);
            let buf = dbs.try_mut().unwrap();
            assert_eq!(be.clone().read_at(buf, 0, false)
                       .now_or_never().unwrap().unwrap(), 4096);
        }

        #[test]
        fn zero_len_past_wp() {
            let be = backend();
            let dbs = DivBufShared::from(vec![0u8; 4096]);
            let buf = dbs.try_mut().unwrap();
            assert_eq!(be.clone().read_at(buf, 0, false)
                       .now_or_never().unwrap().unwrap(), 0);
        }

        #[test]
        fn direct_requires_alignment() {
            let be = backend();
            let dbs = DivBufShared::from(vec![0u8; 512]);
            let buf = dbs.try_mut().unwrap();
            let e = be.clone().read_at(buf, 0, true)
                .now_or_never().unwrap().unwrap_err();
            assert!(matches!(e, Error::InvalidArgument(_)));
        }

        #[test]
        fn fails_in_offline_zone() {
            let be = backend();
            be.set_simulated_offline(0);
            let dbs = DivBufShared::from(vec![0u8; 4096]);
            let buf = dbs.try_mut().unwrap();
            let e = be.clone().read_at(buf, 0, false)
                .now_or_never().unwrap().unwrap_err();
            assert!(matches!(e, Error::Io(_)));
        }
    }

    mod reset_zone {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn idempotent() {
            let be = backend();
            be.write_at(wbuf(0x77, 8192), 0).now_or_never().unwrap().unwrap();
            let ri = be.reset_zone(0).now_or_never().unwrap().unwrap();
            assert_eq!(ri, ResetInfo { offline: false, max_capacity: ZS });

            // after a reset, reads return no data until a new write
            let dbs = DivBufShared::from(vec![0u8; 4096]);
            let buf = dbs.try_mut().unwrap();
            assert_eq!(be.clone().read_at(buf, 0, false)
                       .now_or_never().unwrap().unwrap(), 0);
            be.reset_zone(0).now_or_never().unwrap().unwrap();
        }

        #[test]
        fn readonly_fails() {
            let be = backend();
            be.open(true, false).now_or_never().unwrap().unwrap();
            let e = be.reset_zone(0).now_or_never().unwrap().unwrap_err();
            assert!(matches!(e, Error::NotSupported(_)));
        }

        #[test]
        fn offline_reports() {
            let be = backend();
            be.set_simulated_offline(1);
            let ri = be.reset_zone(ZS).now_or_never().unwrap().unwrap();
            assert!(ri.offline);
        }
    }

    mod list_zones {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn monotonic_starts() {
            let be = backend();
            let zones = be.list_zones().unwrap();
            assert_eq!(zones.len(), 4);
            for w in zones.windows(2) {
                assert!(w[0].start < w[1].start);
            }
            for z in &zones {
                assert!(z.capacity <= z.len);
            }
        }

        #[test]
        fn simulated_offline() {
            let be = backend();
            be.set_simulated_offline(2);
            assert!(be.zone_is_offline(2).unwrap());
            assert!(!be.zone_is_offline(1).unwrap());
        }
    }

    mod zone_transitions {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn finish_then_close() {
            let be = backend();
            be.write_at(wbuf(3, 4096), 0).now_or_never().unwrap().unwrap();
            assert!(be.zone_is_open(0).unwrap());
            be.close_zone(0).now_or_never().unwrap().unwrap();
            assert_eq!(be.zone_info(0).unwrap().cond, ZoneCondition::Closed);
            be.finish_zone(0).now_or_never().unwrap().unwrap();
            assert_eq!(be.zone_info(0).unwrap().cond, ZoneCondition::Full);
            assert_eq!(be.zone_wp(0).unwrap(), ZS);
        }
    }
}
