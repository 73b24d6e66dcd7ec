// vim: tw=80

use std::sync::Arc;

use futures::{TryFutureExt, TryStreamExt};
use futures::{future, stream::FuturesUnordered};

use crate::{
    types::*,
    util::*,
    zbd::*,
};
use super::{
    RaidMode,
    RaidZonedDevice,
    open_all,
    raid_name,
    validate_devices,
};

/// `Raid0`: block-level striping across all backends.
///
/// One logical zone aggregates one zone from every backend, so the logical
/// zone size is `nr_dev` backing zones.  Consecutive stripe blocks visit the
/// backends round-robin; nothing is stored redundantly.
pub struct Raid0 {
    devices: Vec<Arc<dyn ZonedBackend>>,
    block_size: u64,
    dev_zone_size: u64,
    nr_zones: ZoneT,
}

impl Raid0 {
    pub fn new(devices: Vec<Arc<dyn ZonedBackend>>) -> Result<Self> {
        validate_devices(&devices)?;
        let def = &devices[0];
        let (block_size, dev_zone_size, nr_zones) =
            (def.block_size(), def.zone_size(), def.nr_zones());
        Ok(Raid0 { devices, block_size, dev_zone_size, nr_zones })
    }

    fn nr_dev64(&self) -> u64 {
        self.devices.len() as u64
    }

    fn total_size(&self) -> u64 {
        u64::from(self.nr_zones) * self.zone_size()
    }

    /// The backend that owns the stripe block containing `pos`.
    fn dev_for(&self, pos: u64) -> usize {
        ((pos / self.block_size) % self.nr_dev64()) as usize
    }

    /// The backing-device byte offset of `pos`.
    fn backing_pos(&self, pos: u64) -> u64 {
        let blk = pos / self.block_size;
        (blk / self.nr_dev64()) * self.block_size + pos % self.block_size
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.total_size() {
            Err(Error::inval(format!("offset {offset:#x} past device end")))
        } else {
            Ok(())
        }
    }
}

impl ZonedBackend for Raid0 {
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdFut<OpenLimits> {
        open_all(&self.devices, readonly, exclusive)
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn zone_size(&self) -> u64 {
        self.dev_zone_size * self.nr_dev64()
    }

    fn nr_zones(&self) -> ZoneT {
        self.nr_zones
    }

    fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        let lists = self.devices.iter()
            .map(|d| d.list_zones())
            .collect::<Result<Vec<_>>>()?;
        let d = self.nr_dev64();
        Ok(lists[0].iter().enumerate().map(|(i, z0)| {
            let live: u64 = lists.iter().map(|l| l[i].live()).sum();
            ZoneInfo {
                start: z0.start * d,
                wp: z0.start * d + live,
                capacity: z0.capacity * d,
                len: z0.len * d,
                cond: z0.cond,
                swr: z0.swr,
            }
        }).collect())
    }

    fn read_at(self: Arc<Self>, mut buf: IoVecMut, offset: u64, direct: bool)
        -> ZbdFut<usize>
    {
        if let Err(e) = self.check_range(offset, buf.len()) {
            return Box::pin(future::err(e));
        }
        // split at stripe-block boundaries; reads are unordered, so issue
        // every segment concurrently and total them up in logical order
        let mut pos = offset;
        let mut segs = Vec::new();
        while !buf.is_empty() {
            let req = (buf.len() as u64)
                .min(self.block_size - pos % self.block_size) as usize;
            let seg = buf.split_to(req);
            segs.push((self.dev_for(pos), self.backing_pos(pos), seg));
            pos += req as u64;
        }
        let futs = segs.into_iter().enumerate().map(|(i, (d, off, seg))| {
            let dev = self.devices[d].clone();
            let req = seg.len();
            async move {
                let got = dev.read_at(seg, off, direct).await?;
                Ok::<_, Error>((i, req, got))
            }
        }).collect::<FuturesUnordered<_>>();
        Box::pin(async move {
            let mut results = futs.try_collect::<Vec<_>>().await?;
            results.sort_unstable_by_key(|r| r.0);
            let mut total = 0;
            for (_, req, got) in results {
                total += got;
                if got < req {
                    break;
                }
            }
            Ok(total)
        })
    }

    fn write_at(&self, mut buf: IoVec, offset: u64) -> ZbdFut<usize> {
        if let Err(e) = self.check_range(offset, buf.len()) {
            return Box::pin(future::err(e));
        }
        // split at stripe-block boundaries and group by backend: segments
        // for one backend are sequential appends and must stay ordered, but
        // the backends proceed in parallel
        let mut by_dev: Vec<Vec<(u64, IoVec)>> =
            vec![Vec::new(); self.devices.len()];
        let mut pos = offset;
        while !buf.is_empty() {
            let req = (buf.len() as u64)
                .min(self.block_size - pos % self.block_size) as usize;
            let seg = buf.split_to(req);
            by_dev[self.dev_for(pos)].push((self.backing_pos(pos), seg));
            pos += req as u64;
        }
        let futs = by_dev.into_iter().enumerate()
            .filter(|(_, segs)| !segs.is_empty())
            .map(|(i, segs)| {
                let dev = self.devices[i].clone();
                async move {
                    let mut written = 0;
                    for (off, seg) in segs {
                        written += dev.write_at(seg, off).await?;
                    }
                    Ok::<_, Error>(written)
                }
            }).collect::<FuturesUnordered<_>>();
        Box::pin(async move {
            let written = futs.try_collect::<Vec<_>>().await?;
            Ok(written.into_iter().sum())
        })
    }

    fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo> {
        if !is_aligned(start, self.zone_size()) {
            return Box::pin(future::err(
                Error::inval("reset must be zone-aligned")));
        }
        let local = start / self.nr_dev64();
        let futs = self.devices.iter()
            .map(|d| d.reset_zone(local))
            .collect::<FuturesUnordered<_>>();
        Box::pin(async move {
            let infos = futs.try_collect::<Vec<_>>().await?;
            Ok(ResetInfo {
                offline: infos.iter().any(|i| i.offline),
                max_capacity: infos.iter().map(|i| i.max_capacity).sum(),
            })
        })
    }

    fn finish_zone(&self, start: u64) -> ZbdFut<()> {
        if !is_aligned(start, self.zone_size()) {
            return Box::pin(future::err(
                Error::inval("finish must be zone-aligned")));
        }
        let local = start / self.nr_dev64();
        let futs = self.devices.iter()
            .map(|d| d.finish_zone(local))
            .collect::<FuturesUnordered<_>>();
        Box::pin(futs.try_collect::<Vec<_>>().map_ok(|_| ()))
    }

    fn close_zone(&self, start: u64) -> ZbdFut<()> {
        if !is_aligned(start, self.zone_size()) {
            return Box::pin(future::err(
                Error::inval("close must be zone-aligned")));
        }
        let local = start / self.nr_dev64();
        let futs = self.devices.iter()
            .map(|d| d.close_zone(local))
            .collect::<FuturesUnordered<_>>();
        Box::pin(futs.try_collect::<Vec<_>>().map_ok(|_| ()))
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        let local = self.backing_pos(offset);
        for d in &self.devices {
            d.invalidate_cache(local, len / self.nr_dev64())?;
        }
        Ok(())
    }

    fn name(&self) -> String {
        raid_name(RaidMode::Raid0, &self.devices)
    }

    fn set_simulated_offline(&self, zone: ZoneT) {
        for d in &self.devices {
            d.set_simulated_offline(zone);
        }
    }
}

impl RaidZonedDevice for Raid0 {
    fn main_mode(&self) -> RaidMode {
        RaidMode::Raid0
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
    const NDEV: usize = 4;

    fn raid0() -> (Arc<Raid0>, Vec<Arc<MemBackend>>) {
        let backends = (0..NDEV).map(|i| {
            Arc::new(MemBackend::new(&format!("nullb{i}"), BS, ZS, 4))
        }).collect::<Vec<_>>();
        let devices = backends.iter()
            .map(|b| b.clone() as Arc<dyn ZonedBackend>)
            .collect();
        (Arc::new(Raid0::new(devices).unwrap()), backends)
    }

    #[test]
    fn translation() {
        let (r0, _) = raid0();
        // consecutive blocks round-robin across the backends
        assert_eq!(r0.dev_for(0), 0);
        assert_eq!(r0.dev_for(BS), 1);
        assert_eq!(r0.dev_for(3 * BS), 3);
        assert_eq!(r0.dev_for(4 * BS), 0);
        // and pack densely on each backend
        assert_eq!(r0.backing_pos(0), 0);
        assert_eq!(r0.backing_pos(BS), 0);
        assert_eq!(r0.backing_pos(4 * BS), BS);
        assert_eq!(r0.backing_pos(5 * BS + 17), BS + 17);
    }

    #[test]
    fn round_robin_fill() {
        // filling the first logical zone advances every backing zone's wp
        // by exactly the backing zone size, and block k lands on backend
        // k mod NDEV
        let (r0, backends) = raid0();
        let lzs = r0.zone_size() as usize;
        let mut pattern = Vec::with_capacity(lzs);
        for blk in 0..(lzs / BS as usize) {
            pattern.extend(std::iter::repeat(blk as u8).take(BS as usize));
        }
        let dbs = DivBufShared::from(pattern);
        let n = r0.write_at(dbs.try_const().unwrap(), 0)
            .now_or_never().unwrap().unwrap();
        assert_eq!(n, lzs);

        for (i, be) in backends.iter().enumerate() {
            assert_eq!(be.zone_info(0).unwrap().live(), ZS);
            // block k of backend i holds logical block k * NDEV + i
            let rdbs = DivBufShared::from(vec![0u8; ZS as usize]);
            let got = be.clone()
                .read_at(rdbs.try_mut().unwrap(), 0, false)
                .now_or_never().unwrap().unwrap();
            assert_eq!(got, ZS as usize);
            let data = rdbs.try_const().unwrap();
            for k in 0..(ZS / BS) as usize {
                let logical_blk = k * NDEV + i;
                assert_eq!(data[k * BS as usize], logical_blk as u8);
            }
        }
    }

    #[test]
    fn roundtrip_by_byte() {
        let (r0, _) = raid0();
        let len = 3 * BS as usize;
        for p in (0..(r0.zone_size() - len as u64)).step_by(5 * BS as usize) {
            let pattern = (0..len).map(|i| (i ^ p as usize) as u8)
                .collect::<Vec<_>>();
            // stripes are append-only, so rewind everything first
            for z in 0..r0.nr_zones() {
                r0.reset_zone(u64::from(z) * r0.zone_size())
                    .now_or_never().unwrap().unwrap();
            }
            // pad up to p so the write lands at the write pointer
            if p > 0 {
                let pad = DivBufShared::from(vec![0u8; p as usize]);
                r0.write_at(pad.try_const().unwrap(), 0)
                    .now_or_never().unwrap().unwrap();
            }
            let dbs = DivBufShared::from(pattern.clone());
            r0.write_at(dbs.try_const().unwrap(), p)
                .now_or_never().unwrap().unwrap();
            let rdbs = DivBufShared::from(vec![0u8; len]);
            let got = r0.clone().read_at(rdbs.try_mut().unwrap(), p, false)
                .now_or_never().unwrap().unwrap();
            assert_eq!(got, len);
            assert_eq!(&rdbs.try_const().unwrap()[..], &pattern[..]);
        }
    }

    #[test]
    fn wp_aggregation() {
        // 3 blocks of data on every backend: the logical wp advances by
        // NDEV * 3 blocks
        let (r0, _) = raid0();
        let len = NDEV * 3 * BS as usize;
        let dbs = DivBufShared::from(vec![9u8; len]);
        r0.write_at(dbs.try_const().unwrap(), 0)
            .now_or_never().unwrap().unwrap();
        assert_eq!(r0.zone_wp(0).unwrap() - r0.zone_start(0).unwrap(),
                   len as u64);
    }

    #[test]
    fn zone_list_is_scaled() {
        let (r0, _) = raid0();
        let zones = r0.list_zones().unwrap();
        assert_eq!(zones.len(), 4);
        for (i, z) in zones.iter().enumerate() {
            assert_eq!(z.start, i as u64 * ZS * NDEV as u64);
            assert_eq!(z.capacity, ZS * NDEV as u64);
            assert_eq!(z.len, ZS * NDEV as u64);
        }
    }

    #[test]
    fn reset_scales_capacity() {
        let (r0, backends) = raid0();
        let dbs = DivBufShared::from(vec![1u8; 4 * BS as usize]);
        r0.write_at(dbs.try_const().unwrap(), 0)
            .now_or_never().unwrap().unwrap();
        let ri = r0.reset_zone(0).now_or_never().unwrap().unwrap();
        assert_eq!(ri.max_capacity, ZS * NDEV as u64);
        for be in &backends {
            assert_eq!(be.zone_info(0).unwrap().live(), 0);
        }
    }

    #[test]
    fn misaligned_reset() {
        let (r0, _) = raid0();
        let e = r0.reset_zone(ZS).now_or_never().unwrap().unwrap_err();
        assert!(matches!(e, Error::InvalidArgument(_)));
    }

    #[test]
    fn past_the_end() {
        let (r0, _) = raid0();
        let dbs = DivBufShared::from(vec![0u8; BS as usize]);
        let e = r0.write_at(dbs.try_const().unwrap(), r0.total_size())
            .now_or_never().unwrap().unwrap_err();
        assert!(matches!(e, Error::InvalidArgument(_)));
    }
}
