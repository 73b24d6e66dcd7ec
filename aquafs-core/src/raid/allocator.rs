// vim: tw=80

//! The zone allocator: pure, in-memory bookkeeping of how logical raid-zone
//! slots bind to backing device zones.
//!
//! The allocator never performs I/O.  Forward lookup is a flat vector
//! indexed by slot; uniqueness of `(device, zone)` bindings is enforced
//! through an inverse map; offline backing zones are excluded from all
//! allocation.  Every operation is deterministic: the same initial state and
//! operation sequence produce the same mappings on every run.

use std::collections::{HashMap, HashSet};

use crate::types::*;
use super::RaidMode;

/// One binding of a logical-zone slot to a backing zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaidMapEntry {
    pub device_idx: DevT,
    pub zone_idx: ZoneT,
    /// Nonzero entries are ignored when replaying a persisted layout.
    pub invalid: u16,
}

/// The redundancy mode of one logical zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaidModeEntry {
    pub mode: RaidMode,
    /// Extra per-mode option word, reserved for modes that need one.
    pub option: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ZoneAllocator {
    /// slot -> replica list.  Length 1 for stripe/concat/none slots, >= 2
    /// for mirror slots.
    device_zone_map: Vec<Vec<RaidMapEntry>>,
    /// (device, zone) -> slot, for uniqueness checks.
    inverse_map: HashMap<(DevT, ZoneT), SlotT>,
    /// logical zone -> mode.
    mode_map: Vec<Option<RaidModeEntry>>,
    offline: HashSet<(DevT, ZoneT)>,
    device_nr: DevT,
    zone_nr: ZoneT,
}

impl ZoneAllocator {
    pub fn new() -> Self {
        ZoneAllocator::default()
    }

    /// Size the tables.  `zone_nr` is the per-device zone count, which also
    /// equals the logical zone count.
    pub fn set_info(&mut self, device_nr: DevT, zone_nr: ZoneT) {
        self.device_nr = device_nr;
        self.zone_nr = zone_nr;
        self.device_zone_map
            .resize((device_nr * zone_nr) as usize, Vec::new());
        self.mode_map.resize(zone_nr as usize, None);
    }

    pub fn device_nr(&self) -> DevT {
        self.device_nr
    }

    pub fn zone_nr(&self) -> ZoneT {
        self.zone_nr
    }

    /// Append a binding to `slot`'s replica list.  Rejects a backing zone
    /// that is already bound elsewhere.
    pub fn add_mapping(&mut self, slot: SlotT, device_idx: DevT,
                       zone_idx: ZoneT) -> Result<()>
    {
        if slot as usize >= self.device_zone_map.len() {
            return Err(Error::inval(format!("slot {slot} out of range")));
        }
        if device_idx >= self.device_nr || zone_idx >= self.zone_nr {
            return Err(Error::inval(
                format!("no such backing zone {device_idx}/{zone_idx}")));
        }
        let key = (device_idx, zone_idx);
        if let Some(bound) = self.inverse_map.get(&key) {
            return Err(Error::inval(format!(
                "backing zone {device_idx}/{zone_idx} already bound to slot \
                 {bound}")));
        }
        self.device_zone_map[slot as usize]
            .push(RaidMapEntry { device_idx, zone_idx, invalid: 0 });
        self.inverse_map.insert(key, slot);
        Ok(())
    }

    /// Drop one binding from `slot`'s replica list.  A no-op if the binding
    /// is already gone.
    pub fn remove_mapping(&mut self, slot: SlotT, device_idx: DevT,
                          zone_idx: ZoneT)
    {
        if let Some(replicas) = self.device_zone_map.get_mut(slot as usize) {
            replicas.retain(|m| {
                m.device_idx != device_idx || m.zone_idx != zone_idx
            });
        }
        self.inverse_map.remove(&(device_idx, zone_idx));
    }

    pub fn set_mode(&mut self, zone: ZoneT, mode: RaidMode, option: u32) {
        if let Some(slot) = self.mode_map.get_mut(zone as usize) {
            *slot = Some(RaidModeEntry { mode, option });
        }
    }

    pub fn mode(&self, zone: ZoneT) -> Option<RaidModeEntry> {
        self.mode_map.get(zone as usize).copied().flatten()
    }

    /// Does any logical zone at or above `first` have a mode assigned?
    pub fn any_mode_at_or_above(&self, first: ZoneT) -> bool {
        self.mode_map.iter().skip(first as usize).any(Option::is_some)
    }

    pub fn replicas(&self, slot: SlotT) -> &[RaidMapEntry] {
        self.device_zone_map.get(slot as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn set_offline(&mut self, device_idx: DevT, zone_idx: ZoneT) {
        self.offline.insert((device_idx, zone_idx));
    }

    pub fn is_offline(&self, device_idx: DevT, zone_idx: ZoneT) -> bool {
        self.offline.contains(&(device_idx, zone_idx))
    }

    pub fn offline_set(&self) -> &HashSet<(DevT, ZoneT)> {
        &self.offline
    }

    fn free(&self, device_idx: DevT, zone_idx: ZoneT) -> bool {
        !self.inverse_map.contains_key(&(device_idx, zone_idx)) &&
            !self.offline.contains(&(device_idx, zone_idx))
    }

    /// The lowest-indexed backing zone on `device` that is neither bound nor
    /// offline.
    pub fn find_free_zone_on_device(&self, device: DevT) -> Option<ZoneT> {
        (0..self.zone_nr).find(|z| self.free(device, *z))
    }

    /// The lowest-indexed device whose zone `zone_idx` is neither bound nor
    /// offline.
    pub fn find_free_device_for_zone(&self, zone_idx: ZoneT) -> Option<DevT> {
        (0..self.device_nr).find(|d| self.free(*d, zone_idx))
    }

    /// Bind `device_nr * replicas` backing zones to the slots of
    /// `logical_zone`, one zone per backing device where possible, wrapping
    /// to another device when one runs dry.  All-or-nothing: on `NoSpace`
    /// the tables are untouched.
    pub fn create_mapping(&mut self, logical_zone: ZoneT, replicas: usize)
        -> Result<()>
    {
        if logical_zone >= self.zone_nr || replicas == 0 {
            return Err(Error::inval(
                format!("bad mapping request for zone {logical_zone}")));
        }
        let d = self.device_nr;
        let mut staged = HashSet::<(DevT, ZoneT)>::new();
        let mut plan =
            Vec::<(SlotT, DevT, ZoneT)>::with_capacity(d as usize * replicas);
        for i in 0..d as usize * replicas {
            let slot = logical_zone * d + (i / replicas) as SlotT;
            let preferred = (i % d as usize) as DevT;
            let slot_devs = plan.iter()
                .filter(|(s, _, _)| *s == slot)
                .map(|(_, dev, _)| *dev)
                .collect::<Vec<_>>();
            let mut found = None;
            for k in 0..d {
                let dev = (preferred + k) % d;
                // replicas of one slot must land on distinct devices
                if slot_devs.contains(&dev) {
                    continue;
                }
                let zone = (0..self.zone_nr).find(|z| {
                    self.free(dev, *z) && !staged.contains(&(dev, *z))
                });
                if let Some(z) = zone {
                    found = Some((dev, z));
                    break;
                }
            }
            match found {
                Some((dev, z)) => {
                    staged.insert((dev, z));
                    plan.push((slot, dev, z));
                }
                None => return Err(Error::NoSpace),
            }
        }
        for (slot, dev, z) in plan {
            self.add_mapping(slot, dev, z)?;
        }
        Ok(())
    }

    /// Bind one fresh backing zone on `device` to `slot`.  Used by rebuild
    /// to replace an offline replica on the same device.
    pub fn create_one_mapping_at(&mut self, slot: SlotT, device: DevT)
        -> Result<ZoneT>
    {
        match self.find_free_zone_on_device(device) {
            Some(z) => {
                self.add_mapping(slot, device, z)?;
                Ok(z)
            }
            None => Err(Error::NoSpace),
        }
    }

    /// Forget every slot binding and mode entry.  The offline set is
    /// runtime state and survives; the caller decides what replaces the
    /// layout.
    pub fn clear_mappings(&mut self) {
        for replicas in &mut self.device_zone_map {
            replicas.clear();
        }
        self.inverse_map.clear();
        self.mode_map.iter_mut().for_each(|m| *m = None);
    }

    /// Iterate all bindings in slot order.
    pub fn mappings(&self)
        -> impl Iterator<Item = (SlotT, &RaidMapEntry)> + '_
    {
        self.device_zone_map.iter().enumerate().flat_map(|(slot, replicas)| {
            replicas.iter().map(move |m| (slot as SlotT, m))
        })
    }

    /// Iterate all mode entries in logical-zone order.
    pub fn modes(&self)
        -> impl Iterator<Item = (ZoneT, RaidModeEntry)> + '_
    {
        self.mode_map.iter().enumerate().filter_map(|(zone, m)| {
            m.map(|m| (zone as ZoneT, m))
        })
    }
}

#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;

    use super::*;

    fn allocator(d: DevT, z: ZoneT) -> ZoneAllocator {
        let mut a = ZoneAllocator::new();
        a.set_info(d, z);
        a
    }

    mod add_mapping {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn uniqueness() {
            let mut a = allocator(2, 4);
            a.add_mapping(0, 0, 0).unwrap();
            let e = a.add_mapping(5, 0, 0).unwrap_err();
            assert!(matches!(e, Error::InvalidArgument(_)));
            assert!(a.replicas(5).is_empty());
        }

        #[test]
        fn out_of_range() {
            let mut a = allocator(2, 4);
            assert!(a.add_mapping(0, 2, 0).is_err());
            assert!(a.add_mapping(0, 0, 4).is_err());
            assert!(a.add_mapping(8, 0, 0).is_err());
        }

        #[test]
        fn remove() {
            let mut a = allocator(2, 4);
            a.add_mapping(0, 0, 0).unwrap();
            a.add_mapping(0, 1, 0).unwrap();
            a.remove_mapping(0, 0, 0);
            assert_eq!(a.replicas(0),
                       &[RaidMapEntry {
                           device_idx: 1,
                           zone_idx: 0,
                           invalid: 0
                       }]);
            // the freed zone is allocatable again
            assert_eq!(a.find_free_device_for_zone(0), Some(0));
        }
    }

    mod create_mapping {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn one_zone_per_device() {
            let mut a = allocator(4, 8);
            a.create_mapping(0, 1).unwrap();
            for j in 0..4 {
                assert_eq!(a.replicas(j),
                           &[RaidMapEntry {
                               device_idx: j,
                               zone_idx: 0,
                               invalid: 0
                           }]);
            }
        }

        #[test]
        fn mirror_replicas_on_distinct_devices() {
            let mut a = allocator(4, 8);
            a.create_mapping(0, 2).unwrap();
            for j in 0..4 {
                let replicas = a.replicas(j);
                assert_eq!(replicas.len(), 2);
                assert_ne!(replicas[0].device_idx, replicas[1].device_idx);
            }
        }

        #[test]
        fn wraps_when_a_device_is_short() {
            let mut a = allocator(2, 4);
            // consume all of device 0
            for z in 0..4 {
                a.add_mapping(7, 0, z).unwrap();
            }
            a.create_mapping(0, 1).unwrap();
            // both slots land on device 1
            assert_eq!(a.replicas(0)[0].device_idx, 1);
            assert_eq!(a.replicas(1)[0].device_idx, 1);
        }

        #[test]
        fn no_space_is_all_or_nothing() {
            let mut a = allocator(2, 2);
            a.create_mapping(0, 1).unwrap();
            a.create_mapping(1, 1).unwrap();
            let before = a.mappings().count();
            assert_eq!(a.create_mapping(0, 1).unwrap_err(), Error::NoSpace);
            assert_eq!(a.mappings().count(), before);
        }

        #[test]
        fn skips_offline_zones() {
            let mut a = allocator(2, 4);
            a.set_offline(0, 0);
            a.create_mapping(0, 1).unwrap();
            assert_eq!(a.replicas(0)[0],
                       RaidMapEntry {
                           device_idx: 0,
                           zone_idx: 1,
                           invalid: 0
                       });
        }

        #[test]
        fn deterministic() {
            let build = || {
                let mut a = allocator(4, 16);
                for z in 0..4 {
                    a.create_mapping(z, 2).unwrap();
                }
                a.mappings()
                    .map(|(s, m)| (s, *m))
                    .collect::<Vec<_>>()
            };
            assert_eq!(build(), build());
        }
    }

    mod create_one_mapping_at {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn basic() {
            let mut a = allocator(2, 4);
            a.add_mapping(0, 0, 0).unwrap();
            let z = a.create_one_mapping_at(0, 0).unwrap();
            assert_eq!(z, 1);
            assert_eq!(a.replicas(0).len(), 2);
        }

        #[test]
        fn no_space() {
            let mut a = allocator(1, 2);
            a.add_mapping(0, 0, 0).unwrap();
            a.set_offline(0, 1);
            assert_eq!(a.create_one_mapping_at(1, 0).unwrap_err(),
                       Error::NoSpace);
        }
    }

    mod find_free {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn skips_bound_and_offline() {
            let mut a = allocator(2, 3);
            a.add_mapping(0, 0, 0).unwrap();
            a.set_offline(0, 1);
            assert_eq!(a.find_free_zone_on_device(0), Some(2));
            assert_eq!(a.find_free_device_for_zone(0), Some(1));
            assert_eq!(a.find_free_device_for_zone(1), Some(1));
        }

        #[test]
        fn exhausted() {
            let mut a = allocator(1, 1);
            a.add_mapping(0, 0, 0).unwrap();
            assert_eq!(a.find_free_zone_on_device(0), None);
            assert_eq!(a.find_free_device_for_zone(0), None);
        }
    }
}
