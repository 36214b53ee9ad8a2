//! Checkpoint metadata catalog.
//!
//! A checkpoint groups the tasks logically contained in it together with an
//! index of persisted snapshots: for each datum and version, the workers
//! holding a saved copy and the opaque handle each worker uses to reload it.
//! The core never interprets handles; they are byte strings minted by the
//! worker that performed the save.
//!
//! On worker loss the controller rewinds to the most recent complete
//! checkpoint: version chains roll back to the checkpointed versions and
//! load commands are issued to surviving workers using the indexed handles.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use crate::{
    error::{NimbusError, Result},
    ids::{CheckpointId, DataVersion, JobId, LogicalDataId, WorkerId},
};

/// A worker holding a snapshot, with the handle it uses to reload it.
pub type WorkerHandle = (WorkerId, Bytes);

/// Metadata for one checkpoint.
#[derive(Debug)]
pub struct CheckpointEntry {
    id: CheckpointId,
    /// Tasks logically contained in the checkpoint, and whether each has
    /// completed.
    jobs: HashMap<JobId, bool>,
    /// In-flight save tasks: job -> (datum, version, worker).
    pending_saves: HashMap<JobId, (LogicalDataId, DataVersion, WorkerId)>,
    /// datum -> version -> workers holding a persisted snapshot.
    index: HashMap<LogicalDataId, BTreeMap<DataVersion, Vec<WorkerHandle>>>,
    pending: i64,
}

impl CheckpointEntry {
    pub fn new(id: CheckpointId) -> Self {
        Self {
            id,
            jobs: HashMap::new(),
            pending_saves: HashMap::new(),
            index: HashMap::new(),
            pending: 0,
        }
    }

    pub fn id(&self) -> CheckpointId {
        self.id
    }

    /// Record a task as belonging to this checkpoint.
    pub fn add_job(&mut self, job: JobId) {
        if self.jobs.insert(job, false).is_none() {
            self.pending += 1;
        }
    }

    /// Record a contained task as complete.
    pub fn complete_job(&mut self, job: JobId) {
        if let Some(done) = self.jobs.get_mut(&job) {
            if !*done {
                *done = true;
                self.pending -= 1;
            }
        }
    }

    /// Register an in-flight save task.
    pub fn add_save_data_job(
        &mut self,
        job: JobId,
        ldo: LogicalDataId,
        version: DataVersion,
        worker: WorkerId,
    ) {
        self.pending_saves.insert(job, (ldo, version, worker));
        self.pending += 1;
    }

    /// A save task finished; index the snapshot under the worker's handle.
    pub fn notify_save_data_job_done(&mut self, job: JobId, handle: Bytes) -> Result<()> {
        let (ldo, version, worker) = self.pending_saves.remove(&job).ok_or_else(|| {
            NimbusError::Conflict(format!("save job {job} unknown to checkpoint {}", self.id))
        })?;
        self.index
            .entry(ldo)
            .or_default()
            .entry(version)
            .or_default()
            .push((worker, handle));
        self.pending -= 1;
        Ok(())
    }

    /// Candidate (worker, handle) pairs for reloading `ldo`, preferring the
    /// most recent snapshot at or below `version`.
    pub fn get_handle_to_load_data(
        &self,
        ldo: LogicalDataId,
        version: DataVersion,
    ) -> Vec<WorkerHandle> {
        let Some(versions) = self.index.get(&ldo) else {
            return Vec::new();
        };
        versions
            .range(..=version)
            .next_back()
            .map(|(_, handles)| handles.clone())
            .unwrap_or_default()
    }

    /// The version this checkpoint persisted for `ldo`, if any.
    pub fn saved_version(&self, ldo: LogicalDataId) -> Option<DataVersion> {
        self.index
            .get(&ldo)
            .and_then(|versions| versions.keys().next_back().copied())
    }

    /// Data saved by this checkpoint, as (datum, version) pairs.
    pub fn saved_data(&self) -> impl Iterator<Item = (LogicalDataId, DataVersion)> + '_ {
        self.index.iter().flat_map(|(ldo, versions)| {
            versions.keys().map(move |&version| (*ldo, version))
        })
    }

    pub fn is_complete(&self) -> bool {
        self.pending == 0
    }
}

/// The controller's catalog of checkpoints.
#[derive(Debug, Default)]
pub struct CheckpointIndex {
    entries: BTreeMap<CheckpointId, CheckpointEntry>,
}

impl CheckpointIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: CheckpointEntry) {
        self.entries.insert(entry.id(), entry);
    }

    pub fn entry(&self, id: CheckpointId) -> Option<&CheckpointEntry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: CheckpointId) -> Option<&mut CheckpointEntry> {
        self.entries.get_mut(&id)
    }

    /// The newest checkpoint whose saves have all landed.
    pub fn latest_complete(&self) -> Option<&CheckpointEntry> {
        self.entries.values().rev().find(|e| e.is_complete())
    }
}
