// vim: tw=80

use std::sync::{Arc, Mutex, RwLock};

use divbuf::{DivBufInaccessible, DivBufShared};
use futures::TryStreamExt;
use futures::{future, stream::FuturesUnordered};
use tracing::{error, info, warn};

use crate::{
    types::*,
    util::*,
    zbd::*,
};
use super::{
    MapRecord,
    ModeRecord,
    RaidAppendInfo,
    RaidMapEntry,
    RaidMode,
    RaidZonedDevice,
    ZoneAllocator,
    open_all,
    raid_name,
    validate_devices,
};

/// Logical zones reserved at the front of the device for the filesystem
/// superblock and manifest.  They are mode `None` and live on the first
/// backend.
pub const META_ZONE_COUNT: ZoneT = 3;

/// One planned write, produced under the allocator lock and executed
/// without it.
enum WriteOp {
    /// A single-backend segment (`None`/`Concat` zones).
    Single { dev: usize, off: u64, buf: IoVec },
    /// One mirrored segment, fanned out to every replica of a slot.
    Mirror { targets: Vec<(usize, ZoneT, u64)>, buf: IoVec },
    /// Block segments of a striped range, ordered per backend.
    Stripe { by_dev: Vec<Vec<(u64, IoVec)>> },
}

/// `AutoRaid`: per-logical-zone redundancy.
///
/// Every logical zone spans `nr_dev` backing zones chosen by the
/// [`ZoneAllocator`], and carries its own mode: the reserved meta zones are
/// unreplicated (`None`), everything else defaults to the mode configured at
/// create time (`Raid0` or `Raid1`) until a persisted layout says otherwise.
///
/// Because the logical geometry no longer corresponds to any single
/// backend's zone list, `AutoRaid` synthesizes its own: a read-through
/// cache filled from allocator plus backend state and invalidated by every
/// mutating operation.
pub struct AutoRaid {
    devices: Vec<Arc<dyn ZonedBackend>>,
    allocator: Arc<RwLock<ZoneAllocator>>,
    zone_cache: Arc<Mutex<Option<Vec<ZoneInfo>>>>,
    default_mode: RaidMode,
    block_size: u64,
    dev_zone_size: u64,
    nr_zones: ZoneT,
}

impl AutoRaid {
    /// `default_mode` governs zones that no persisted layout covers:
    /// `Raid0` or `Raid1`.
    pub fn new(devices: Vec<Arc<dyn ZonedBackend>>, default_mode: RaidMode)
        -> Result<Self>
    {
        validate_devices(&devices)?;
        if !matches!(default_mode, RaidMode::Raid0 | RaidMode::Raid1) {
            return Err(Error::inval(format!(
                "raid{default_mode} cannot be the auto-raid default")));
        }
        let def = &devices[0];
        let (block_size, dev_zone_size, nr_zones) =
            (def.block_size(), def.zone_size(), def.nr_zones());
        let mut allocator = ZoneAllocator::new();
        allocator.set_info(devices.len() as DevT, nr_zones);
        // meta zones: one backing zone each, on the first device
        for idx in 0..META_ZONE_COUNT.min(nr_zones) {
            allocator.add_mapping(idx * devices.len() as SlotT, 0, idx)?;
            allocator.set_mode(idx, RaidMode::None, 0);
        }
        Ok(AutoRaid {
            devices,
            allocator: Arc::new(RwLock::new(allocator)),
            zone_cache: Arc::new(Mutex::new(None)),
            default_mode,
            block_size,
            dev_zone_size,
            nr_zones,
        })
    }

    fn nr_dev32(&self) -> u32 {
        self.devices.len() as u32
    }

    /// Logical zone size: one backing zone from every device.
    fn lzs(&self) -> u64 {
        self.dev_zone_size * self.devices.len() as u64
    }

    fn total_size(&self) -> u64 {
        u64::from(self.nr_zones) * self.lzs()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.total_size() {
            Err(Error::inval(format!("offset {offset:#x} past device end")))
        } else {
            Ok(())
        }
    }

    fn invalidate_zone_cache(&self) {
        *self.zone_cache.lock().unwrap() = None;
    }

    /// A copy of the allocator state, for inspection and persistence.
    pub fn allocator_snapshot(&self) -> ZoneAllocator {
        self.allocator.read().unwrap().clone()
    }

    /// The slot owning byte `pos`, under the zone's mode.
    fn slot_of(&self, alloc: &ZoneAllocator, pos: u64) -> Result<SlotT> {
        let zone = (pos / self.lzs()) as ZoneT;
        let mode = alloc.mode(zone).ok_or_else(|| {
            Error::inval(format!("logical zone {zone} is unmapped"))
        })?;
        let sub = match mode.mode {
            RaidMode::None | RaidMode::Concat | RaidMode::Raid1 =>
                ((pos % self.lzs()) / self.dev_zone_size) as u32,
            RaidMode::Raid0 =>
                ((pos / self.block_size) % self.devices.len() as u64) as u32,
            other => return Err(Error::not_supported(
                format!("raid{other} zone"))),
        };
        Ok(zone * self.nr_dev32() + sub)
    }

    /// Resolve `pos` to its primary backing device and byte offset, or
    /// `None` for a hole in the mapping.
    fn lookup(&self, alloc: &ZoneAllocator, pos: u64)
        -> Result<Option<(usize, u64)>>
    {
        let zone = (pos / self.lzs()) as ZoneT;
        let mode = alloc.mode(zone).ok_or_else(|| {
            Error::inval(format!("logical zone {zone} is unmapped"))
        })?;
        let slot = self.slot_of(alloc, pos)?;
        let Some(entry) = alloc.replicas(slot).first() else {
            return Ok(None);
        };
        let base = u64::from(entry.zone_idx) * self.dev_zone_size;
        let off = match mode.mode {
            RaidMode::Raid0 => {
                let blk_in_zone =
                    (pos / self.block_size) % (self.lzs() / self.block_size);
                base + (blk_in_zone / self.devices.len() as u64)
                    * self.block_size
                    + pos % self.block_size
            }
            _ => base + pos % self.dev_zone_size,
        };
        Ok(Some((entry.device_idx as usize, off)))
    }

    /// Read one range confined to a single logical zone.
    async fn read_chunk(self: Arc<Self>, buf: IoVecMut, pos: u64,
                        direct: bool) -> Result<usize>
    {
        let zone = (pos / self.lzs()) as ZoneT;
        let mode = self.allocator.read().unwrap().mode(zone)
            .ok_or_else(|| {
                Error::inval(format!("logical zone {zone} is unmapped"))
            })?;
        match mode.mode {
            RaidMode::None | RaidMode::Concat =>
                self.read_linear(buf, pos, direct).await,
            RaidMode::Raid0 =>
                self.read_striped(buf, pos, direct).await,
            RaidMode::Raid1 =>
                self.read_mirrored(buf, pos, direct).await,
            other =>
                Err(Error::not_supported(format!("raid{other} zone"))),
        }
    }

    async fn read_linear(self: Arc<Self>, mut buf: IoVecMut, mut pos: u64,
                         direct: bool) -> Result<usize>
    {
        let mut total = 0;
        while !buf.is_empty() {
            let req = (buf.len() as u64)
                .min(self.dev_zone_size - pos % self.dev_zone_size) as usize;
            let seg = buf.split_to(req);
            let mapping = {
                let alloc = self.allocator.read().unwrap();
                self.lookup(&alloc, pos)?
            };
            let Some((dev, off)) = mapping else {
                // a hole in the mapping reads as end-of-data
                break;
            };
            let got = self.devices[dev].clone()
                .read_at(seg, off, direct).await?;
            total += got;
            if got < req {
                break;
            }
            pos += req as u64;
        }
        Ok(total)
    }

    async fn read_striped(self: Arc<Self>, mut buf: IoVecMut, mut pos: u64,
                          direct: bool) -> Result<usize>
    {
        let mut segs = Vec::new();
        {
            let alloc = self.allocator.read().unwrap();
            while !buf.is_empty() {
                let req = (buf.len() as u64)
                    .min(self.block_size - pos % self.block_size) as usize;
                let seg = buf.split_to(req);
                match self.lookup(&alloc, pos)? {
                    Some((dev, off)) => segs.push((dev, off, seg)),
                    None => break,
                }
                pos += req as u64;
            }
        }
        let futs = segs.into_iter().enumerate().map(|(i, (d, off, seg))| {
            let dev = self.devices[d].clone();
            let req = seg.len();
            async move {
                let got = dev.read_at(seg, off, direct).await?;
                Ok::<_, Error>((i, req, got))
            }
        }).collect::<FuturesUnordered<_>>();
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
    }

    async fn read_mirrored(self: Arc<Self>, mut buf: IoVecMut, mut pos: u64,
                           direct: bool) -> Result<usize>
    {
        let mut total = 0;
        while !buf.is_empty() {
            let req = (buf.len() as u64)
                .min(self.dev_zone_size - pos % self.dev_zone_size) as usize;
            let seg = buf.split_to(req);
            let got = self.clone().read_mirror_seg(seg, pos, direct).await?;
            total += got;
            if got < req {
                break;
            }
            pos += req as u64;
        }
        Ok(total)
    }

    /// Read one segment of a mirrored slot.  A failed replica triggers the
    /// rebuild procedure; the read is retried once afterwards.
    async fn read_mirror_seg(self: Arc<Self>, buf: IoVecMut, pos: u64,
                             direct: bool) -> Result<usize>
    {
        let dbi = buf.clone_inaccessible();
        match self.clone().try_replicas(Some(buf), &dbi, pos, direct).await {
            Ok(n) => Ok(n),
            Err((Some((slot, dev, zone)), first_err)) => {
                if let Err(e) =
                    self.clone().rebuild_slot(slot, dev, zone).await
                {
                    error!("failed to restore slot {slot}: {e}");
                    return Err(first_err);
                }
                self.try_replicas(None, &dbi, pos, direct).await
                    .map_err(|(_, e)| e)
            }
            Err((None, e)) => Err(e),
        }
    }

    /// Read from the slot's replicas, first in the list first.  On failure
    /// of every replica, reports the first failed backing zone so the
    /// caller can rebuild it.
    async fn try_replicas(self: Arc<Self>, mut buf: Option<IoVecMut>,
                          dbi: &DivBufInaccessible, pos: u64, direct: bool)
        -> std::result::Result<usize, (Option<(SlotT, DevT, ZoneT)>, Error)>
    {
        let (slot, replicas) = {
            let alloc = self.allocator.read().unwrap();
            let slot = self.slot_of(&alloc, pos).map_err(|e| (None, e))?;
            (slot, alloc.replicas(slot).to_vec())
        };
        if replicas.is_empty() {
            return Err((None, Error::io("slot has no replicas")));
        }
        let inner = pos % self.dev_zone_size;
        let mut failed = None;
        let mut last = Error::io("no readable replica");
        for m in &replicas {
            let b = match buf.take() {
                Some(b) => b,
                None => dbi.try_mut().unwrap(),
            };
            let off = u64::from(m.zone_idx) * self.dev_zone_size + inner;
            let r = self.devices[m.device_idx as usize].clone()
                .read_at(b, off, direct).await;
            match r {
                Ok(n) => {
                    if let Some((d, z)) = failed {
                        // served from a peer, but one replica is sick
                        warn!("replica dev {d} zone {z} failed; rebuilding");
                        if let Err(e) =
                            self.clone().rebuild_slot(slot, d, z).await
                        {
                            error!("failed to restore slot {slot}: {e}");
                        }
                    }
                    return Ok(n);
                }
                Err(e) => {
                    warn!("mirror read at {pos:#x} failed on dev {} zone \
                           {}: {e}", m.device_idx, m.zone_idx);
                    if failed.is_none() {
                        failed = Some((m.device_idx, m.zone_idx));
                    }
                    last = e;
                }
            }
        }
        Err((failed.map(|(d, z)| (slot, d, z)), last))
    }

    /// Replace an offline replica of a mirrored slot with a fresh backing
    /// zone on the same device, then clone the healthy peer's live range
    /// into it.
    async fn rebuild_slot(self: Arc<Self>, slot: SlotT, dev: DevT,
                          zone: ZoneT) -> Result<()>
    {
        let (peer, new_zone) = {
            let mut alloc = self.allocator.write().unwrap();
            let still_mapped = alloc.replicas(slot).iter().any(|m| {
                m.device_idx == dev && m.zone_idx == zone
            });
            if alloc.is_offline(dev, zone) && !still_mapped {
                // a concurrent rebuild already replaced this replica
                return Ok(());
            }
            alloc.set_offline(dev, zone);
            alloc.remove_mapping(slot, dev, zone);
            let peer = alloc.replicas(slot).first().copied()
                .ok_or_else(|| {
                    Error::io("no healthy replica to rebuild from")
                })?;
            let new_zone = alloc.create_one_mapping_at(slot, dev)
                .map_err(|_| Error::io("cannot recover"))?;
            (peer, new_zone)
        };
        self.invalidate_zone_cache();
        info!("rebuilding slot {slot}: dev {dev} zone {zone} replaced by \
               zone {new_zone}");
        let src = &self.devices[peer.device_idx as usize];
        let zi = src.zone_info(peer.zone_idx)?;
        let live = zi.live();
        let target = &self.devices[dev as usize];
        let target_start = u64::from(new_zone) * self.dev_zone_size;
        target.reset_zone(target_start).await?;
        if live > 0 {
            let dbs = DivBufShared::from(vec![0u8; live as usize]);
            let got = src.clone()
                .read_at(dbs.try_mut().unwrap(), zi.start, false).await?;
            if got as u64 != live {
                return Err(Error::io(
                    "cannot recover: short read from healthy replica"));
            }
            let wrote = target
                .write_at(dbs.try_const().unwrap(), target_start).await?;
            if wrote as u64 != live {
                return Err(Error::io(
                    "cannot recover: short write to fresh zone"));
            }
        }
        self.invalidate_zone_cache();
        info!("restored {live:#x} bytes to dev {dev} zone {new_zone}");
        Ok(())
    }

    /// Split a write into per-slot operations under the allocator lock.
    fn plan_write(&self, mut buf: IoVec, mut pos: u64)
        -> Result<Vec<WriteOp>>
    {
        let alloc = self.allocator.read().unwrap();
        let mut ops = Vec::new();
        while !buf.is_empty() {
            let req = (buf.len() as u64)
                .min(self.dev_zone_size - pos % self.dev_zone_size) as usize;
            let mut seg = buf.split_to(req);
            let zone = (pos / self.lzs()) as ZoneT;
            let mode = alloc.mode(zone).ok_or_else(|| {
                Error::inval(format!("logical zone {zone} is unmapped"))
            })?;
            match mode.mode {
                RaidMode::None | RaidMode::Concat => {
                    let (dev, off) = self.lookup(&alloc, pos)?
                        .ok_or_else(|| Error::inval(format!(
                            "write into unmapped slot at {pos:#x}")))?;
                    ops.push(WriteOp::Single { dev, off, buf: seg });
                }
                RaidMode::Raid1 => {
                    let slot = self.slot_of(&alloc, pos)?;
                    let replicas = alloc.replicas(slot);
                    if replicas.is_empty() {
                        return Err(Error::inval(format!(
                            "write into unmapped slot at {pos:#x}")));
                    }
                    let inner = pos % self.dev_zone_size;
                    let targets = replicas.iter().map(|m| {
                        (m.device_idx as usize, m.zone_idx,
                         u64::from(m.zone_idx) * self.dev_zone_size + inner)
                    }).collect();
                    ops.push(WriteOp::Mirror { targets, buf: seg });
                }
                RaidMode::Raid0 => {
                    let mut by_dev: Vec<Vec<(u64, IoVec)>> =
                        vec![Vec::new(); self.devices.len()];
                    let mut p = pos;
                    while !seg.is_empty() {
                        let r = (seg.len() as u64)
                            .min(self.block_size - p % self.block_size)
                            as usize;
                        let s = seg.split_to(r);
                        let (dev, off) = self.lookup(&alloc, p)?
                            .ok_or_else(|| Error::inval(format!(
                                "write into unmapped slot at {p:#x}")))?;
                        by_dev[dev].push((off, s));
                        p += r as u64;
                    }
                    ops.push(WriteOp::Stripe { by_dev });
                }
                other => {
                    return Err(Error::not_supported(
                        format!("raid{other} zone")));
                }
            }
            pos += req as u64;
        }
        Ok(ops)
    }

    /// Every replica of every mapped slot of one logical zone, with the
    /// intra-zone slot position attached.
    fn zone_targets(&self, zone: ZoneT)
        -> Result<Vec<(usize, usize, RaidMapEntry)>>
    {
        let alloc = self.allocator.read().unwrap();
        alloc.mode(zone).ok_or_else(|| {
            Error::inval(format!("logical zone {zone} is unmapped"))
        })?;
        let mut targets = Vec::new();
        for sub in 0..self.nr_dev32() {
            let slot = zone * self.nr_dev32() + sub;
            for (ri, m) in alloc.replicas(slot).iter().enumerate() {
                targets.push((sub as usize, ri, *m));
            }
        }
        Ok(targets)
    }
}

impl ZonedBackend for AutoRaid {
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdFut<OpenLimits> {
        let devices = self.devices.clone();
        let allocator = self.allocator.clone();
        let cache = self.zone_cache.clone();
        let default_mode = self.default_mode;
        let nr_zones = self.nr_zones;
        Box::pin(async move {
            let limits = open_all(&devices, readonly, exclusive).await?;
            let mut alloc = allocator.write().unwrap();
            // record zones that are already dead
            for (di, dev) in devices.iter().enumerate() {
                for (zi, z) in dev.list_zones()?.iter().enumerate() {
                    if z.is_offline() {
                        alloc.set_offline(di as DevT, zi as ZoneT);
                    }
                }
            }
            // a persisted layout replayed by layout_setup wins; otherwise
            // provision the default, sparing free zones for dynamic
            // allocation and rebuild
            if !alloc.any_mode_at_or_above(META_ZONE_COUNT) {
                let (last, nreplicas) = match default_mode {
                    RaidMode::Raid0 => (nr_zones / 2, 1),
                    _ => (nr_zones / 3, 2),
                };
                for idx in META_ZONE_COUNT.min(last)..last {
                    match alloc.create_mapping(idx, nreplicas) {
                        Ok(()) =>
                            alloc.set_mode(idx, default_mode, 0),
                        Err(e) =>
                            warn!("failed to provision zone {idx}: {e}"),
                    }
                }
            }
            drop(alloc);
            *cache.lock().unwrap() = None;
            Ok(limits)
        })
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn zone_size(&self) -> u64 {
        self.lzs()
    }

    fn nr_zones(&self) -> ZoneT {
        self.nr_zones
    }

    fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        let mut cache = self.zone_cache.lock().unwrap();
        if let Some(zones) = &*cache {
            return Ok(zones.clone());
        }
        let alloc = self.allocator.read().unwrap();
        let dev_lists = self.devices.iter()
            .map(|d| d.list_zones())
            .collect::<Result<Vec<_>>>()?;
        let lzs = self.lzs();
        let zones = (0..self.nr_zones).map(|z| {
            let start = u64::from(z) * lzs;
            let firsts = (0..self.nr_dev32()).filter_map(|sub| {
                alloc.replicas(z * self.nr_dev32() + sub).first()
            }).collect::<Vec<_>>();
            if alloc.mode(z).is_none() || firsts.is_empty() {
                // unprovisioned zones are unusable until a layout maps them
                return ZoneInfo {
                    start,
                    wp: start,
                    capacity: 0,
                    len: lzs,
                    cond: ZoneCondition::Offline,
                    swr: true,
                };
            }
            let backing = |m: &RaidMapEntry| {
                dev_lists[m.device_idx as usize][m.zone_idx as usize]
            };
            // replicas advance in lockstep, so the first replica of each
            // slot speaks for the slot
            let live: u64 = firsts.iter().map(|m| backing(m).live()).sum();
            let capacity: u64 =
                firsts.iter().map(|m| backing(m).capacity).sum();
            let f0 = backing(firsts[0]);
            ZoneInfo {
                start,
                wp: start + live,
                capacity,
                len: lzs,
                cond: f0.cond,
                swr: f0.swr,
            }
        }).collect::<Vec<_>>();
        *cache = Some(zones.clone());
        Ok(zones)
    }

    fn read_at(self: Arc<Self>, buf: IoVecMut, offset: u64, direct: bool)
        -> ZbdFut<usize>
    {
        if let Err(e) = self.check_range(offset, buf.len()) {
            return Box::pin(future::err(e));
        }
        Box::pin(async move {
            let mut buf = buf;
            let mut pos = offset;
            let mut total = 0;
            while !buf.is_empty() {
                let req = (buf.len() as u64)
                    .min(self.lzs() - pos % self.lzs()) as usize;
                let seg = buf.split_to(req);
                let got =
                    self.clone().read_chunk(seg, pos, direct).await?;
                total += got;
                if got < req {
                    break;
                }
                pos += req as u64;
            }
            Ok(total)
        })
    }

    fn write_at(&self, buf: IoVec, offset: u64) -> ZbdFut<usize> {
        if let Err(e) = self.check_range(offset, buf.len()) {
            return Box::pin(future::err(e));
        }
        let ops = match self.plan_write(buf, offset) {
            Ok(ops) => ops,
            Err(e) => return Box::pin(future::err(e)),
        };
        let devices = self.devices.clone();
        let allocator = self.allocator.clone();
        let cache = self.zone_cache.clone();
        Box::pin(async move {
            let mut total = 0;
            let mut failure = None;
            'ops: for op in ops {
                match op {
                    WriteOp::Single { dev, off, buf } => {
                        match devices[dev].write_at(buf, off).await {
                            Ok(n) => total += n,
                            Err(e) => {
                                failure = Some(e);
                                break 'ops;
                            }
                        }
                    }
                    WriteOp::Mirror { targets, buf } => {
                        // all-or-nothing: every replica acknowledges or the
                        // write fails
                        let futs = targets.iter().map(|(di, zi, off)| {
                            let dev = devices[*di].clone();
                            let buf = buf.clone();
                            let (di, zi, off) = (*di as DevT, *zi, *off);
                            async move {
                                dev.write_at(buf, off).await
                                    .map_err(|e| (di, zi, e))
                            }
                        }).collect::<FuturesUnordered<_>>();
                        match futs.try_collect::<Vec<_>>().await {
                            Ok(ns) => total += ns[0],
                            Err((d, z, e)) => {
                                warn!("mirror write failed on dev {d} zone \
                                       {z}: {e}");
                                allocator.write().unwrap().set_offline(d, z);
                                failure = Some(e);
                                break 'ops;
                            }
                        }
                    }
                    WriteOp::Stripe { by_dev } => {
                        let futs = by_dev.into_iter().enumerate()
                            .filter(|(_, segs)| !segs.is_empty())
                            .map(|(i, segs)| {
                                let dev = devices[i].clone();
                                async move {
                                    let mut n = 0;
                                    for (off, seg) in segs {
                                        n += dev.write_at(seg, off).await?;
                                    }
                                    Ok::<_, Error>(n)
                                }
                            }).collect::<FuturesUnordered<_>>();
                        match futs.try_collect::<Vec<_>>().await {
                            Ok(ns) => total += ns.iter().sum::<usize>(),
                            Err(e) => {
                                failure = Some(e);
                                break 'ops;
                            }
                        }
                    }
                }
            }
            *cache.lock().unwrap() = None;
            match failure {
                Some(e) => Err(e),
                None => Ok(total),
            }
        })
    }

    fn reset_zone(&self, start: u64) -> ZbdFut<ResetInfo> {
        if !is_aligned(start, self.lzs()) {
            return Box::pin(future::err(
                Error::inval("reset must be zone-aligned")));
        }
        let zone = (start / self.lzs()) as ZoneT;
        let targets = match self.zone_targets(zone) {
            Ok(t) => t,
            Err(e) => return Box::pin(future::err(e)),
        };
        let dev_zone_size = self.dev_zone_size;
        let devices = self.devices.clone();
        let cache = self.zone_cache.clone();
        Box::pin(async move {
            let futs = targets.into_iter().map(|(_, ri, m)| {
                let dev = devices[m.device_idx as usize].clone();
                async move {
                    let info = dev
                        .reset_zone(u64::from(m.zone_idx) * dev_zone_size)
                        .await?;
                    Ok::<_, Error>((ri, info))
                }
            }).collect::<FuturesUnordered<_>>();
            let infos = futs.try_collect::<Vec<_>>().await;
            *cache.lock().unwrap() = None;
            let infos = infos?;
            Ok(ResetInfo {
                offline: infos.iter().any(|(_, i)| i.offline),
                // replicas store the same bytes; only each slot's first
                // contributes capacity
                max_capacity: infos.iter()
                    .filter(|(ri, _)| *ri == 0)
                    .map(|(_, i)| i.max_capacity)
                    .sum(),
            })
        })
    }

    fn finish_zone(&self, start: u64) -> ZbdFut<()> {
        if !is_aligned(start, self.lzs()) {
            return Box::pin(future::err(
                Error::inval("finish must be zone-aligned")));
        }
        let zone = (start / self.lzs()) as ZoneT;
        let targets = match self.zone_targets(zone) {
            Ok(t) => t,
            Err(e) => return Box::pin(future::err(e)),
        };
        let dev_zone_size = self.dev_zone_size;
        let devices = self.devices.clone();
        let cache = self.zone_cache.clone();
        Box::pin(async move {
            let futs = targets.into_iter().map(|(_, _, m)| {
                devices[m.device_idx as usize]
                    .finish_zone(u64::from(m.zone_idx) * dev_zone_size)
            }).collect::<FuturesUnordered<_>>();
            let r = futs.try_collect::<Vec<_>>().await;
            *cache.lock().unwrap() = None;
            r.map(|_| ())
        })
    }

    fn close_zone(&self, start: u64) -> ZbdFut<()> {
        if !is_aligned(start, self.lzs()) {
            return Box::pin(future::err(
                Error::inval("close must be zone-aligned")));
        }
        let zone = (start / self.lzs()) as ZoneT;
        let targets = match self.zone_targets(zone) {
            Ok(t) => t,
            Err(e) => return Box::pin(future::err(e)),
        };
        let dev_zone_size = self.dev_zone_size;
        let devices = self.devices.clone();
        let cache = self.zone_cache.clone();
        Box::pin(async move {
            let futs = targets.into_iter().map(|(_, _, m)| {
                devices[m.device_idx as usize]
                    .close_zone(u64::from(m.zone_idx) * dev_zone_size)
            }).collect::<FuturesUnordered<_>>();
            let r = futs.try_collect::<Vec<_>>().await;
            *cache.lock().unwrap() = None;
            r.map(|_| ())
        })
    }

    fn invalidate_cache(&self, offset: u64, len: u64) -> Result<()> {
        let alloc = self.allocator.read().unwrap();
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            if let Some((dev, off)) = self.lookup(&alloc, pos)? {
                self.devices[dev]
                    .invalidate_cache(off, self.dev_zone_size)?;
            }
            pos += self.dev_zone_size;
        }
        Ok(())
    }

    fn name(&self) -> String {
        raid_name(RaidMode::Auto, &self.devices)
    }

    fn set_simulated_offline(&self, zone: ZoneT) {
        let alloc = self.allocator.read().unwrap();
        if let Some(m) = alloc.replicas(zone * self.nr_dev32()).first() {
            self.devices[m.device_idx as usize]
                .set_simulated_offline(m.zone_idx);
        }
    }
}

impl RaidZonedDevice for AutoRaid {
    fn main_mode(&self) -> RaidMode {
        RaidMode::Auto
    }

    fn nr_dev(&self) -> usize {
        self.devices.len()
    }

    fn def_dev(&self) -> &Arc<dyn ZonedBackend> {
        &self.devices[0]
    }

    fn append_info(&self) -> Option<RaidAppendInfo> {
        let alloc = self.allocator.read().unwrap();
        Some(RaidAppendInfo {
            device_zone_map: alloc.mappings().map(|(slot, m)| {
                MapRecord {
                    slot,
                    device_idx: m.device_idx,
                    zone_idx: m.zone_idx,
                    invalid: m.invalid,
                }
            }).collect(),
            mode_map: alloc.modes().map(|(zone, m)| {
                ModeRecord { zone, mode: m.mode, option: m.option }
            }).collect(),
        })
    }

    fn layout_setup(&self, append: &RaidAppendInfo) -> Result<()> {
        // build the replacement aside, then swap: a bad record must not
        // leave a half-replayed layout behind
        let mut fresh = ZoneAllocator::new();
        {
            let current = self.allocator.read().unwrap();
            fresh.set_info(current.device_nr(), current.zone_nr());
            for (d, z) in current.offline_set() {
                fresh.set_offline(*d, *z);
            }
        }
        for r in &append.device_zone_map {
            if r.invalid != 0 {
                continue;
            }
            fresh.add_mapping(r.slot, r.device_idx, r.zone_idx)
                .map_err(|e| {
                    Error::corruption(format!("bad layout record: {e}"))
                })?;
        }
        for m in &append.mode_map {
            fresh.set_mode(m.zone, m.mode, m.option);
        }
        info!("layout setup: {} bindings, {} mode entries",
              append.device_zone_map.len(), append.mode_map.len());
        *self.allocator.write().unwrap() = fresh;
        self.invalidate_zone_cache();
        Ok(())
    }

    fn layout_update(&self, append: &RaidAppendInfo) -> Result<()> {
        let mut alloc = self.allocator.write().unwrap();
        for r in &append.device_zone_map {
            if r.invalid != 0 || !alloc.replicas(r.slot).is_empty() {
                continue;
            }
            alloc.add_mapping(r.slot, r.device_idx, r.zone_idx)?;
        }
        for m in &append.mode_map {
            if alloc.mode(m.zone).is_none() {
                alloc.set_mode(m.zone, m.mode, m.option);
            }
        }
        drop(alloc);
        self.invalidate_zone_cache();
        Ok(())
    }

    fn scan_and_rebuild(self: Arc<Self>) -> ZbdFut<()> {
        Box::pin(async move {
            let offline = self.devices.iter().map(|d| {
                Ok::<_, Error>(d.list_zones()?.iter()
                    .map(ZoneInfo::is_offline)
                    .collect::<Vec<_>>())
            }).collect::<Result<Vec<_>>>()?;
            let (victims, unrecoverable) = {
                let alloc = self.allocator.read().unwrap();
                let mut victims = Vec::new();
                let mut unrecoverable = false;
                for (slot, m) in alloc.mappings() {
                    if !offline[m.device_idx as usize][m.zone_idx as usize] {
                        continue;
                    }
                    let zone = slot / self.nr_dev32();
                    match alloc.mode(zone).map(|me| me.mode) {
                        Some(RaidMode::Raid1) =>
                            victims.push((slot, m.device_idx, m.zone_idx)),
                        _ => {
                            error!("slot {slot} lost dev {} zone {} and \
                                    cannot be rebuilt",
                                   m.device_idx, m.zone_idx);
                            unrecoverable = true;
                        }
                    }
                }
                (victims, unrecoverable)
            };
            for (slot, dev, zone) in victims {
                self.clone().rebuild_slot(slot, dev, zone).await?;
            }
            if unrecoverable {
                Err(Error::io("cannot recover data"))
            } else {
                Ok(())
            }
        })
    }
}
