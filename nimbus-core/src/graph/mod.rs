//! The dependency graph of outstanding tasks.
//!
//! Tasks enter the graph from spawn commands (or template expansion) and
//! leave it once done and no longer referenced as a predecessor. A task is
//! ready when every id in its before-set is either marked done or absent
//! from the graph entirely; absence means the predecessor completed and was
//! collected. The graph relies on the application to keep the before/after
//! relation acyclic; it does not check.
//!
//! Binder-emitted create and copy tasks land here too, pre-assigned to a
//! worker, so that readiness gating covers the synthetic edges
//! `create < receive < compute` and `send < receive`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use bytes::Bytes;

use crate::{
    command::{SpawnCompute, SpawnCopy, TemplateTag},
    error::{NimbusError, Result},
    geometry::GeometricRegion,
    ids::{DataVersion, JobDepth, JobId, LogicalDataId, PhysicalDataId, WorkerId, ROOT_JOB_ID},
    registry::DataRegistry,
};

/// What a task does. Tagged-union dispatch; no hierarchy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobKind {
    Compute { name: String },
    Combine,
    LocalCopy,
    RemoteCopySend,
    RemoteCopyReceive,
    MegaRcr,
    CreateData,
    SaveData,
    LoadData,
    /// Placeholder occupying one job id for a whole template instantiation.
    Complex { template: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Ready,
    Assigned,
    Running,
    Done,
    Failed,
}

/// One outstanding task.
#[derive(Clone, Debug)]
pub struct JobEntry {
    pub id: JobId,
    pub kind: JobKind,
    pub read: BTreeSet<LogicalDataId>,
    pub write: BTreeSet<LogicalDataId>,
    pub before: BTreeSet<JobId>,
    pub after: BTreeSet<JobId>,
    pub parent: JobId,
    pub params: Bytes,
    pub sterile: bool,
    pub region: Option<GeometricRegion>,
    pub worker: Option<WorkerId>,
    pub state: JobState,
    pub depth: JobDepth,
    /// Versions the binder resolved for the read-set, filled at bind time.
    pub read_versions: BTreeMap<LogicalDataId, DataVersion>,
    /// Versions this writer will produce, assigned at spawn.
    pub write_versions: BTreeMap<LogicalDataId, DataVersion>,
    /// Physical instances pinned for this task while assigned.
    pub bound: Vec<PhysicalDataId>,
    /// Source and destination instances of a copy task.
    pub copy_from: Option<PhysicalDataId>,
    pub copy_to: Option<PhysicalDataId>,
    pub template: Option<TemplateTag>,
}

impl JobEntry {
    pub fn new(id: JobId, kind: JobKind) -> Self {
        Self {
            id,
            kind,
            read: BTreeSet::new(),
            write: BTreeSet::new(),
            before: BTreeSet::new(),
            after: BTreeSet::new(),
            parent: ROOT_JOB_ID,
            params: Bytes::new(),
            sterile: true,
            region: None,
            worker: None,
            state: JobState::Pending,
            depth: 0,
            read_versions: BTreeMap::new(),
            write_versions: BTreeMap::new(),
            bound: Vec::new(),
            copy_from: None,
            copy_to: None,
            template: None,
        }
    }

    pub fn from_spawn(spawn: &SpawnCompute) -> Self {
        let mut entry = Self::new(
            spawn.job_id,
            JobKind::Compute {
                name: spawn.name.clone(),
            },
        );
        entry.read = spawn.read.clone();
        entry.write = spawn.write.clone();
        entry.before = spawn.before.clone();
        entry.after = spawn.after.clone();
        entry.parent = spawn.parent;
        entry.sterile = spawn.sterile;
        entry.region = spawn.region;
        entry.params = spawn.params.clone();
        entry
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.kind, JobKind::Compute { .. } | JobKind::Combine)
    }
}

/// The controller's table of outstanding tasks.
#[derive(Debug, Default)]
pub struct JobGraph {
    jobs: HashMap<JobId, JobEntry>,
    /// Outstanding (not yet done) predecessors per live task.
    blockers: HashMap<JobId, BTreeSet<JobId>>,
    /// Reverse edges: predecessor id -> tasks waiting on it.
    dependents: HashMap<JobId, BTreeSet<JobId>>,
    /// Live tasks referencing a given id as predecessor; a done task is
    /// collected once its count drops to zero.
    pred_refs: HashMap<JobId, usize>,
    /// Every id ever inserted; used to validate parent and before refs.
    seen: HashSet<JobId>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn entry(&self, id: JobId) -> Option<&JobEntry> {
        self.jobs.get(&id)
    }

    pub fn entry_mut(&mut self, id: JobId) -> Option<&mut JobEntry> {
        self.jobs.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobEntry> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether `id` completed: it was inserted at some point and is either
    /// marked done or already collected.
    pub fn is_done(&self, id: JobId) -> bool {
        match self.jobs.get(&id) {
            Some(entry) => entry.state == JobState::Done,
            None => self.seen.contains(&id),
        }
    }

    /// Validate a compute spawn against the catalog and the graph.
    pub fn validate_spawn(&self, spawn: &SpawnCompute, registry: &DataRegistry) -> Result<()> {
        if self.seen.contains(&spawn.job_id) {
            return Err(NimbusError::InvalidSpawn(format!(
                "job id {} already spawned",
                spawn.job_id
            )));
        }
        for ldo in spawn.read.iter().chain(spawn.write.iter()) {
            if !registry.contains(*ldo) {
                return Err(NimbusError::InvalidSpawn(format!(
                    "job {} references undefined data {ldo}",
                    spawn.job_id
                )));
            }
        }
        if spawn.parent != ROOT_JOB_ID && !self.seen.contains(&spawn.parent) {
            return Err(NimbusError::InvalidSpawn(format!(
                "job {} references unknown parent {}",
                spawn.job_id, spawn.parent
            )));
        }
        for before in &spawn.before {
            if !self.seen.contains(before) {
                return Err(NimbusError::InvalidSpawn(format!(
                    "job {} lists unknown predecessor {before}",
                    spawn.job_id
                )));
            }
        }
        Ok(())
    }

    /// Validate an explicit copy spawn.
    pub fn validate_copy_spawn(&self, spawn: &SpawnCopy, registry: &DataRegistry) -> Result<()> {
        if self.seen.contains(&spawn.job_id) {
            return Err(NimbusError::InvalidSpawn(format!(
                "job id {} already spawned",
                spawn.job_id
            )));
        }
        for ldo in [spawn.from_ldo, spawn.to_ldo] {
            if !registry.contains(ldo) {
                return Err(NimbusError::InvalidSpawn(format!(
                    "copy job {} references undefined data {ldo}",
                    spawn.job_id
                )));
            }
        }
        Ok(())
    }

    /// The spawn-tree depth a task would get: one past the deepest parent or
    /// predecessor still observable in the graph.
    pub fn depth_for(&self, parent: JobId, before: &BTreeSet<JobId>) -> JobDepth {
        let mut depth = 0;
        if let Some(parent) = self.jobs.get(&parent) {
            depth = depth.max(parent.depth + 1);
        }
        for before in before {
            if let Some(predecessor) = self.jobs.get(before) {
                depth = depth.max(predecessor.depth + 1);
            }
        }
        depth
    }

    /// Insert a task, computing its depth and readiness.
    pub fn insert(&mut self, mut entry: JobEntry) {
        let id = entry.id;
        let mut blockers = BTreeSet::new();
        entry.depth = self.depth_for(entry.parent, &entry.before);
        for &before in &entry.before {
            if let Some(predecessor) = self.jobs.get(&before) {
                if predecessor.state != JobState::Done {
                    blockers.insert(before);
                }
                self.dependents.entry(before).or_default().insert(id);
                *self.pred_refs.entry(before).or_insert(0) += 1;
            }
        }
        if entry.state == JobState::Pending && blockers.is_empty() {
            entry.state = JobState::Ready;
        }
        self.blockers.insert(id, blockers);
        self.seen.insert(id);
        self.jobs.insert(id, entry);
    }

    /// Ready tasks in id order, for deterministic assignment.
    pub fn ready_jobs(&self) -> Vec<JobId> {
        let mut ready: Vec<JobId> = self
            .jobs
            .values()
            .filter(|e| e.state == JobState::Ready)
            .map(|e| e.id)
            .collect();
        ready.sort_unstable();
        ready
    }

    pub fn mark_assigned(&mut self, id: JobId, worker: WorkerId) {
        if let Some(entry) = self.jobs.get_mut(&id) {
            entry.worker = Some(worker);
            entry.state = JobState::Assigned;
        }
    }

    pub fn mark_running(&mut self, id: JobId) {
        if let Some(entry) = self.jobs.get_mut(&id) {
            entry.state = JobState::Running;
        }
    }

    /// Mark a task done; returns tasks that became ready. Re-delivery for an
    /// already-done or collected task is a no-op.
    pub fn mark_done(&mut self, id: JobId) -> Vec<JobId> {
        let Some(entry) = self.jobs.get_mut(&id) else {
            return Vec::new();
        };
        if entry.state == JobState::Done {
            return Vec::new();
        }
        entry.state = JobState::Done;
        let before: Vec<JobId> = entry.before.iter().copied().collect();

        // This task no longer needs its predecessors retained.
        for b in before {
            self.release_pred_ref(b);
        }

        let mut newly_ready = Vec::new();
        if let Some(waiters) = self.dependents.get(&id).cloned() {
            for waiter in waiters {
                if let Some(blockers) = self.blockers.get_mut(&waiter) {
                    blockers.remove(&id);
                    if blockers.is_empty() {
                        if let Some(w) = self.jobs.get_mut(&waiter) {
                            if w.state == JobState::Pending {
                                w.state = JobState::Ready;
                                newly_ready.push(waiter);
                            }
                        }
                    }
                }
            }
        }

        // Collect immediately when nobody references this task.
        if self.pred_refs.get(&id).copied().unwrap_or(0) == 0 {
            self.collect(id);
        }
        newly_ready.sort_unstable();
        newly_ready
    }

    fn release_pred_ref(&mut self, id: JobId) {
        if let Some(count) = self.pred_refs.get_mut(&id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pred_refs.remove(&id);
                if self.jobs.get(&id).map(|e| e.state) == Some(JobState::Done) {
                    self.collect(id);
                }
            }
        }
    }

    fn collect(&mut self, id: JobId) {
        self.jobs.remove(&id);
        self.blockers.remove(&id);
        self.dependents.remove(&id);
    }

    /// Fail every assigned or running task of a lost worker.
    pub fn fail_worker(&mut self, worker: WorkerId) -> Vec<JobId> {
        let mut failed = Vec::new();
        for entry in self.jobs.values_mut() {
            if entry.worker == Some(worker)
                && matches!(entry.state, JobState::Assigned | JobState::Running)
            {
                entry.state = JobState::Failed;
                failed.push(entry.id);
            }
        }
        failed.sort_unstable();
        failed
    }

    /// Reset a failed task for respawn: recompute blockers against the
    /// current graph and clear its binding.
    pub fn reset_failed(&mut self, id: JobId) {
        let Some(entry) = self.jobs.get(&id) else {
            return;
        };
        if entry.state != JobState::Failed {
            return;
        }
        let blockers: BTreeSet<JobId> = entry
            .before
            .iter()
            .copied()
            .filter(|b| {
                self.jobs
                    .get(b)
                    .map(|e| e.state != JobState::Done)
                    .unwrap_or(false)
            })
            .collect();
        let ready = blockers.is_empty();
        self.blockers.insert(id, blockers);
        let entry = self.jobs.get_mut(&id).expect("entry present");
        entry.worker = None;
        entry.bound.clear();
        entry.read_versions.clear();
        entry.state = if ready { JobState::Ready } else { JobState::Pending };
    }

    /// Transitive before-closure of a task over tasks still in the graph.
    /// Completed (collected) predecessors appear as members but cannot be
    /// expanded further.
    pub fn before_closure(&self, id: JobId) -> HashSet<JobId> {
        let mut closure = HashSet::new();
        let mut stack: Vec<JobId> = match self.jobs.get(&id) {
            Some(entry) => entry.before.iter().copied().collect(),
            None => return closure,
        };
        while let Some(next) = stack.pop() {
            if !closure.insert(next) {
                continue;
            }
            if let Some(entry) = self.jobs.get(&next) {
                stack.extend(entry.before.iter().copied());
            }
        }
        closure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometricRegion;

    fn compute(id: JobId, before: &[JobId]) -> JobEntry {
        let mut entry = JobEntry::new(id, JobKind::Compute { name: "noop".into() });
        entry.before = before.iter().copied().collect();
        entry
    }

    #[test]
    fn task_with_no_predecessors_is_ready() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        assert_eq!(graph.ready_jobs(), vec![1]);
    }

    #[test]
    fn readiness_waits_for_every_predecessor() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        graph.insert(compute(2, &[]));
        graph.insert(compute(3, &[1, 2]));
        assert_eq!(graph.ready_jobs(), vec![1, 2]);

        assert!(graph.mark_done(1).is_empty());
        let ready = graph.mark_done(2);
        assert_eq!(ready, vec![3]);
        assert_eq!(graph.ready_jobs(), vec![3]);
    }

    #[test]
    fn done_tasks_are_collected_when_unreferenced() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        graph.insert(compute(2, &[1]));
        graph.mark_done(1);
        // Still retained: task 2 references it.
        assert!(graph.contains(1));
        graph.mark_done(2);
        assert!(!graph.contains(1));
        assert!(!graph.contains(2));
        assert!(graph.is_done(1));
        assert!(graph.is_done(2));
    }

    #[test]
    fn predecessor_absent_from_graph_counts_as_done() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        graph.mark_done(1);
        assert!(!graph.contains(1));
        // Spawned after its predecessor was collected.
        graph.insert(compute(2, &[1]));
        assert_eq!(graph.ready_jobs(), vec![2]);
    }

    #[test]
    fn duplicate_job_done_is_a_noop() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        graph.insert(compute(2, &[1]));
        assert_eq!(graph.mark_done(1), vec![2]);
        assert!(graph.mark_done(1).is_empty());
        assert!(graph.mark_done(1).is_empty());
    }

    #[test]
    fn spawn_validation_rejects_unknowns() {
        let mut registry = DataRegistry::new();
        registry
            .define_partition(0, GeometricRegion::new(0, 0, 0, 4, 4, 4))
            .unwrap();
        registry.define_data("d", 1, 0, vec![]).unwrap();
        let graph = JobGraph::new();

        let mut spawn = SpawnCompute {
            name: "noop".into(),
            job_id: 10,
            read: [1].into_iter().collect(),
            write: [1].into_iter().collect(),
            before: Default::default(),
            after: Default::default(),
            parent: ROOT_JOB_ID,
            future: None,
            sterile: true,
            region: None,
            params: Bytes::new(),
        };
        assert!(graph.validate_spawn(&spawn, &registry).is_ok());

        spawn.read.insert(99);
        assert!(matches!(
            graph.validate_spawn(&spawn, &registry).unwrap_err(),
            NimbusError::InvalidSpawn(_)
        ));
        spawn.read.remove(&99);

        spawn.parent = 77;
        assert!(matches!(
            graph.validate_spawn(&spawn, &registry).unwrap_err(),
            NimbusError::InvalidSpawn(_)
        ));
    }

    #[test]
    fn failed_worker_tasks_can_be_respawned() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        graph.mark_assigned(1, 7);
        assert_eq!(graph.fail_worker(7), vec![1]);
        graph.reset_failed(1);
        let entry = graph.entry(1).unwrap();
        assert_eq!(entry.state, JobState::Ready);
        assert_eq!(entry.worker, None);
    }

    #[test]
    fn before_closure_is_transitive() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        graph.insert(compute(2, &[1]));
        graph.insert(compute(3, &[2]));
        let closure = graph.before_closure(3);
        assert!(closure.contains(&1));
        assert!(closure.contains(&2));
        assert!(!closure.contains(&3));
    }

    #[test]
    fn depth_follows_the_longest_observed_chain() {
        let mut graph = JobGraph::new();
        graph.insert(compute(1, &[]));
        graph.insert(compute(2, &[1]));
        graph.insert(compute(3, &[2]));
        assert_eq!(graph.entry(3).unwrap().depth, 2);
    }
}
