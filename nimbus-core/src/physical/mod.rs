//! Physical data instances and their placement.
//!
//! A physical data instance (PDI) is one worker-local materialization of a
//! logical datum at some version. The map tracks, per (worker, datum), the
//! unordered set of instances with their pin counts, dirty flags and
//! last-access epochs, and answers the binder's two questions: where can a
//! required version be found (reuse, local copy, or remote copy), and which
//! instance can be overwritten or evicted to make room.
//!
//! Pinning prevents eviction while a task holds a binding. A dirty instance
//! holds content newer than any other copy in the cluster, so eviction
//! prefers clean instances and, among dirty ones, those whose version is
//! covered elsewhere.

use std::collections::{BTreeSet, HashMap};

use crate::{
    error::{NimbusError, Result},
    ids::{DataVersion, JobId, LogicalDataId, PhysicalDataId, WorkerId},
};

/// One worker-local materialization of a logical datum.
#[derive(Clone, Debug)]
pub struct PhysicalInstance {
    pub id: PhysicalDataId,
    pub worker: WorkerId,
    pub ldo: LogicalDataId,
    pub version: DataVersion,
    pub pin_count: u32,
    pub last_access: u64,
    pub dirty: bool,
    /// The task that will commit the next version into this instance.
    pub pending_writer: Option<(JobId, DataVersion)>,
}

/// How a required version can be materialized on the chosen worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Materialization {
    /// An instance at the required version is already on the worker.
    Reuse(PhysicalDataId),
    /// The version is on the worker but claimed by a pending writer; copy it
    /// into a fresh instance first.
    LocalCopy { from: PhysicalDataId },
    /// The version lives on another worker.
    RemoteCopy {
        from_worker: WorkerId,
        from: PhysicalDataId,
    },
    /// The datum has never been materialized; create an empty instance.
    Create,
}

/// Outcome of an allocation request for a write or copy destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// An obsolete instance on the worker can be overwritten in place.
    Reused(PhysicalDataId),
    /// A new instance must be created; `evicted` names the victim that made
    /// room, if eviction was needed.
    NeedsCreate { evicted: Option<PhysicalDataId> },
}

#[derive(Debug, Default)]
pub struct PhysicalMap {
    instances: HashMap<PhysicalDataId, PhysicalInstance>,
    by_worker_ldo: HashMap<(WorkerId, LogicalDataId), BTreeSet<PhysicalDataId>>,
    by_worker: HashMap<WorkerId, BTreeSet<PhysicalDataId>>,
    epoch: u64,
}

impl PhysicalMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PhysicalDataId) -> Option<&PhysicalInstance> {
        self.instances.get(&id)
    }

    pub fn count_on(&self, worker: WorkerId) -> usize {
        self.by_worker.get(&worker).map(|s| s.len()).unwrap_or(0)
    }

    pub fn instances_on(
        &self,
        worker: WorkerId,
        ldo: LogicalDataId,
    ) -> impl Iterator<Item = &PhysicalInstance> {
        self.by_worker_ldo
            .get(&(worker, ldo))
            .into_iter()
            .flatten()
            .filter_map(|id| self.instances.get(id))
    }

    /// Register a freshly created instance.
    pub fn insert_new(
        &mut self,
        id: PhysicalDataId,
        worker: WorkerId,
        ldo: LogicalDataId,
        version: DataVersion,
    ) {
        self.epoch += 1;
        self.instances.insert(
            id,
            PhysicalInstance {
                id,
                worker,
                ldo,
                version,
                pin_count: 0,
                last_access: self.epoch,
                dirty: false,
                pending_writer: None,
            },
        );
        self.by_worker_ldo.entry((worker, ldo)).or_default().insert(id);
        self.by_worker.entry(worker).or_default().insert(id);
    }

    pub fn touch(&mut self, id: PhysicalDataId) {
        self.epoch += 1;
        let epoch = self.epoch;
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.last_access = epoch;
        }
    }

    pub fn pin(&mut self, id: PhysicalDataId) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.pin_count += 1;
        }
    }

    pub fn unpin(&mut self, id: PhysicalDataId) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.pin_count = instance.pin_count.saturating_sub(1);
        }
    }

    pub fn mark_dirty(&mut self, id: PhysicalDataId) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.dirty = true;
        }
    }

    pub fn set_pending_writer(&mut self, id: PhysicalDataId, job: JobId, version: DataVersion) {
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.pending_writer = Some((job, version));
        }
    }

    /// A writer committed: the instance now holds `version` and no other
    /// copy does.
    pub fn commit_write(&mut self, id: PhysicalDataId, version: DataVersion) {
        self.touch(id);
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.version = version;
            instance.dirty = true;
            instance.pending_writer = None;
        }
    }

    /// A copy completed: the destination now replicates `version`, and the
    /// version is no longer unique to its source. A pending writer keeps its
    /// claim on the destination; the copy only seeded its input.
    pub fn commit_copy(
        &mut self,
        from: PhysicalDataId,
        to: PhysicalDataId,
        version: DataVersion,
    ) {
        self.touch(to);
        if let Some(instance) = self.instances.get_mut(&to) {
            instance.version = version;
            instance.dirty = false;
        }
        if let Some(source) = self.instances.get_mut(&from) {
            if source.version == version {
                source.dirty = false;
            }
        }
    }

    /// Where can `worker` obtain `ldo` at `version`? Returns `None` when the
    /// version exists nowhere in the cluster (a fatal bind error upstream).
    pub fn require_version(
        &self,
        worker: WorkerId,
        ldo: LogicalDataId,
        version: DataVersion,
    ) -> Option<Materialization> {
        // Exact hit on the worker. An instance claimed by a pending writer
        // cannot be shared; it seeds a local copy instead.
        let mut claimed = None;
        for instance in self.instances_on(worker, ldo) {
            if instance.version == version {
                if instance.pending_writer.is_none() {
                    return Some(Materialization::Reuse(instance.id));
                }
                claimed = Some(instance.id);
            }
        }
        if let Some(from) = claimed {
            return Some(Materialization::LocalCopy { from });
        }

        // Remote hit: pick deterministically by (worker, id).
        let mut remote: Option<(WorkerId, PhysicalDataId)> = None;
        for instance in self.instances.values() {
            if instance.ldo == ldo && instance.version == version && instance.worker != worker {
                let candidate = (instance.worker, instance.id);
                if remote.map(|best| candidate < best).unwrap_or(true) {
                    remote = Some(candidate);
                }
            }
        }
        if let Some((from_worker, from)) = remote {
            return Some(Materialization::RemoteCopy { from_worker, from });
        }

        // Never materialized anywhere: only version 0 (the initial state)
        // can be created out of thin air.
        (version == 0).then_some(Materialization::Create)
    }

    /// True when some other instance replicates (ldo, version).
    fn covered_elsewhere(&self, except: PhysicalDataId) -> bool {
        let Some(instance) = self.instances.get(&except) else {
            return false;
        };
        self.instances.values().any(|other| {
            other.id != except && other.ldo == instance.ldo && other.version >= instance.version
        })
    }

    /// Find or make room for a destination instance of `ldo` on `worker`.
    ///
    /// Preference order: overwrite an obsolete unpinned instance of the same
    /// datum; create within capacity; evict an unpinned victim (clean
    /// preferred, then dirty-but-covered, LRU tie-break). Fails with
    /// allocation pressure when every instance on the worker is pinned or
    /// claimed.
    pub fn allocate(
        &mut self,
        worker: WorkerId,
        ldo: LogicalDataId,
        capacity: usize,
    ) -> Result<Allocation> {
        // Overwrite an obsolete instance of the same datum when possible.
        let reusable = self
            .instances_on(worker, ldo)
            .filter(|i| i.pin_count == 0 && !i.dirty && i.pending_writer.is_none())
            .map(|i| (i.last_access, i.id))
            .min();
        if let Some((_, id)) = reusable {
            self.touch(id);
            return Ok(Allocation::Reused(id));
        }

        if self.count_on(worker) < capacity {
            return Ok(Allocation::NeedsCreate { evicted: None });
        }

        let victim = self.pick_eviction_victim(worker);
        match victim {
            Some(id) => {
                self.remove(id);
                Ok(Allocation::NeedsCreate { evicted: Some(id) })
            }
            None => Err(NimbusError::AllocationPressure { worker }),
        }
    }

    fn pick_eviction_victim(&self, worker: WorkerId) -> Option<PhysicalDataId> {
        let candidates: Vec<&PhysicalInstance> = self
            .by_worker
            .get(&worker)
            .into_iter()
            .flatten()
            .filter_map(|id| self.instances.get(id))
            .filter(|i| i.pin_count == 0 && i.pending_writer.is_none())
            .collect();

        // Rank: clean first, then dirty instances whose version another copy
        // covers; a dirty sole copy is never evicted. LRU breaks ties.
        candidates
            .iter()
            .filter_map(|i| {
                let rank = if !i.dirty {
                    0
                } else if self.covered_elsewhere(i.id) {
                    1
                } else {
                    return None;
                };
                Some((rank, i.last_access, i.id))
            })
            .min()
            .map(|(_, _, id)| id)
    }

    pub fn remove(&mut self, id: PhysicalDataId) {
        if let Some(instance) = self.instances.remove(&id) {
            if let Some(set) = self.by_worker_ldo.get_mut(&(instance.worker, instance.ldo)) {
                set.remove(&id);
            }
            if let Some(set) = self.by_worker.get_mut(&instance.worker) {
                set.remove(&id);
            }
        }
    }

    /// Drop every instance of a lost worker; returns the removed ids.
    pub fn remove_worker(&mut self, worker: WorkerId) -> Vec<PhysicalDataId> {
        let ids: Vec<PhysicalDataId> = self
            .by_worker
            .get(&worker)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for &id in &ids {
            self.remove(id);
        }
        ids
    }

    /// The instance of (worker, ldo) at exactly `version`, if any.
    pub fn find_at_version(
        &self,
        worker: WorkerId,
        ldo: LogicalDataId,
        version: DataVersion,
    ) -> Option<PhysicalDataId> {
        self.instances_on(worker, ldo)
            .find(|i| i.version == version)
            .map(|i| i.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(worker: WorkerId, instances: &[(PhysicalDataId, LogicalDataId, DataVersion)]) -> PhysicalMap {
        let mut map = PhysicalMap::new();
        for &(id, ldo, version) in instances {
            map.insert_new(id, worker, ldo, version);
        }
        map
    }

    #[test]
    fn reuse_beats_copy() {
        let map = map_with(1, &[(100, 1, 3)]);
        assert_eq!(
            map.require_version(1, 1, 3),
            Some(Materialization::Reuse(100))
        );
    }

    #[test]
    fn claimed_instance_seeds_local_copy() {
        let mut map = map_with(1, &[(100, 1, 3)]);
        map.set_pending_writer(100, 10, 4);
        assert_eq!(
            map.require_version(1, 1, 3),
            Some(Materialization::LocalCopy { from: 100 })
        );
    }

    #[test]
    fn remote_copy_when_version_lives_elsewhere() {
        let mut map = map_with(1, &[(100, 1, 3)]);
        map.insert_new(200, 2, 2, 1);
        assert_eq!(
            map.require_version(2, 1, 3),
            Some(Materialization::RemoteCopy {
                from_worker: 1,
                from: 100
            })
        );
    }

    #[test]
    fn unmaterialized_datum_is_created_at_version_zero() {
        let map = PhysicalMap::new();
        assert_eq!(map.require_version(1, 1, 0), Some(Materialization::Create));
        // A positive version that exists nowhere is a bind error.
        assert_eq!(map.require_version(1, 1, 2), None);
    }

    #[test]
    fn pinned_instances_are_never_evicted() {
        let mut map = map_with(1, &[(100, 1, 1), (101, 2, 1)]);
        map.pin(100);
        map.pin(101);
        let err = map.allocate(1, 3, 2).unwrap_err();
        assert!(matches!(err, NimbusError::AllocationPressure { worker: 1 }));

        map.unpin(101);
        match map.allocate(1, 3, 2).unwrap() {
            Allocation::NeedsCreate { evicted } => assert_eq!(evicted, Some(101)),
            other => panic!("unexpected allocation {other:?}"),
        }
    }

    #[test]
    fn eviction_prefers_clean_then_covered_dirty() {
        let mut map = map_with(1, &[(100, 1, 1), (101, 2, 1)]);
        map.mark_dirty(100);
        // Clean 101 goes first even though 100 is older by access order.
        match map.allocate(1, 3, 2).unwrap() {
            Allocation::NeedsCreate { evicted } => assert_eq!(evicted, Some(101)),
            other => panic!("unexpected allocation {other:?}"),
        }

        // 100 is dirty and the sole copy: not evictable.
        map.insert_new(102, 1, 3, 1);
        map.pin(102);
        let err = map.allocate(1, 4, 2).unwrap_err();
        assert!(matches!(err, NimbusError::AllocationPressure { .. }));

        // Replicate version 1 of datum 1 on another worker; now 100 is fair game.
        map.insert_new(200, 2, 1, 1);
        match map.allocate(1, 4, 2).unwrap() {
            Allocation::NeedsCreate { evicted } => assert_eq!(evicted, Some(100)),
            other => panic!("unexpected allocation {other:?}"),
        }
    }

    #[test]
    fn obsolete_same_datum_instance_is_overwritten_in_place() {
        let mut map = map_with(1, &[(100, 1, 1)]);
        assert_eq!(map.allocate(1, 1, 4).unwrap(), Allocation::Reused(100));
    }

    #[test]
    fn commit_write_marks_dirty_and_commit_copy_clears_it() {
        let mut map = map_with(1, &[(100, 1, 1)]);
        map.insert_new(200, 2, 1, 0);
        map.set_pending_writer(100, 10, 2);
        map.commit_write(100, 2);
        assert!(map.get(100).unwrap().dirty);
        assert_eq!(map.get(100).unwrap().version, 2);

        map.commit_copy(100, 200, 2);
        assert!(!map.get(200).unwrap().dirty);
        assert!(!map.get(100).unwrap().dirty);
    }
}
