//! The controller's scheduling engine and core loop.
//!
//! A single scheduler core owns every engine structure: the data registry,
//! the version table, the job graph, the physical map, the template manager
//! and the checkpoint index. Worker- and user-interface tasks enqueue parsed
//! commands into bounded queues; the core drains a batch per iteration,
//! updates the graph, runs the binder, and emits worker commands. Nothing in
//! the engine is locked against itself; cross-task access ends at the
//! queues.
//!
//! Recoverable failures (invalid spawns, conflicts, allocation pressure)
//! are logged and absorbed; a fatal invariant violation terminates the loop
//! gracefully with a nonzero status. Worker loss rolls affected data back to
//! the latest complete checkpoint and respawns the failed tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, error, info, warn};

use crate::{
    command::{
        ControllerCommand, FinalizeTemplate, Handshake, HandshakeAck, JobDone, JobDoneRelay,
        LoadData, MegaJobDone, PrepareRewind, SaveData, SaveDataDone, SpawnCompute, SpawnCopy,
        SpawnTemplate, TemplateTag, Terminate, WorkerCommand,
    },
    config::Config,
    checkpoint::{CheckpointEntry, CheckpointIndex},
    error::{NimbusError, Result},
    graph::{JobEntry, JobGraph, JobKind, JobState},
    ids::{
        CheckpointId, ExitStatus, IdDomain, IdMaker, JobId, LogicalDataId, TemplateGenerationId,
        WorkerId,
    },
    lineage::VersionTable,
    physical::PhysicalMap,
    registry::DataRegistry,
    template::{ComplexJob, TemplateManager},
};

/// A registered worker, from the coarse-locked registry.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub address: String,
    pub port: u16,
    pub capacity: usize,
    pub queue_depth: usize,
    pub alive: bool,
    pub missed_handshakes: u32,
}

/// How one worker participated in a template's recording generation: the
/// exact command sequence it received, replayed at instantiation to refresh
/// ids without rebuilding anything.
#[derive(Debug, Default)]
pub(crate) struct WorkerRecording {
    pub(crate) commands: Vec<WorkerCommand>,
}

/// Recording progress for one template: sealed by the application's end
/// marker, finalized on workers once every recorded task has been assigned.
#[derive(Debug, Default)]
pub(crate) struct RecordingState {
    pub(crate) sealed: bool,
    pub(crate) outstanding: BTreeSet<JobId>,
    pub(crate) finalized_on_workers: bool,
    pub(crate) generation: TemplateGenerationId,
}

/// The controller's state and command handlers. Emitted worker commands are
/// collected into an output vector; the surrounding loop owns delivery.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) registry: DataRegistry,
    pub(crate) versions: VersionTable,
    pub(crate) graph: JobGraph,
    pub(crate) physical: PhysicalMap,
    pub(crate) templates: TemplateManager,
    pub(crate) checkpoints: CheckpointIndex,
    pub(crate) ids: IdMaker,
    pub(crate) workers: BTreeMap<WorkerId, WorkerInfo>,
    next_worker_id: WorkerId,

    /// Complex placeholders by job id, plus the inner-task reverse index.
    pub(crate) complex: HashMap<JobId, ComplexJob>,
    pub(crate) inner_to_complex: HashMap<JobId, JobId>,

    /// Template currently under detection, if any.
    pub(crate) recording: Option<String>,
    pub(crate) recordings: HashMap<String, RecordingState>,
    pub(crate) mirrors: HashMap<String, BTreeMap<WorkerId, WorkerRecording>>,

    /// Instantiation outer dependencies awaiting completion relays.
    pub(crate) outer_waiters: HashMap<JobId, BTreeSet<WorkerId>>,

    /// In-flight save jobs and the open checkpoint.
    pub(crate) save_jobs: HashMap<JobId, CheckpointId>,
    pub(crate) open_checkpoint: Option<CheckpointId>,

    pub(crate) terminate: Option<ExitStatus>,
}

/// Commands the engine wants delivered, each to one worker.
pub type Outbox = Vec<(WorkerId, WorkerCommand)>;

impl Engine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: DataRegistry::new(),
            versions: VersionTable::new(),
            graph: JobGraph::new(),
            physical: PhysicalMap::new(),
            templates: TemplateManager::new(),
            checkpoints: CheckpointIndex::new(),
            ids: IdMaker::new(),
            workers: BTreeMap::new(),
            next_worker_id: 1,
            complex: HashMap::new(),
            inner_to_complex: HashMap::new(),
            recording: None,
            recordings: HashMap::new(),
            mirrors: HashMap::new(),
            outer_waiters: HashMap::new(),
            save_jobs: HashMap::new(),
            open_checkpoint: None,
            terminate: None,
        }
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.terminate
    }

    /// Latest recorded version of a datum.
    pub fn data_version(&self, ldo: LogicalDataId) -> crate::ids::DataVersion {
        self.versions.last_version(ldo)
    }

    /// The datum's full lineage chain, oldest first.
    pub fn lineage_chain(&self, ldo: LogicalDataId) -> Vec<crate::lineage::LineageEntry> {
        self.versions
            .lineage(ldo)
            .map(|l| l.chain().to_vec())
            .unwrap_or_default()
    }

    pub fn job_state(&self, job: JobId) -> Option<JobState> {
        self.graph.entry(job).map(|e| e.state)
    }

    pub fn job_worker(&self, job: JobId) -> Option<WorkerId> {
        self.graph.entry(job).and_then(|e| e.worker)
    }

    pub fn instance_count(&self, worker: WorkerId) -> usize {
        self.physical.count_on(worker)
    }

    pub fn has_instance_at(
        &self,
        worker: WorkerId,
        ldo: LogicalDataId,
        version: crate::ids::DataVersion,
    ) -> bool {
        self.physical.find_at_version(worker, ldo, version).is_some()
    }

    /// Whether enough workers registered for scheduling to begin.
    pub fn cluster_ready(&self) -> bool {
        self.workers.values().filter(|w| w.alive).count() >= self.config.min_workers
    }

    /// Termination is complete once requested and the graph has drained.
    pub fn drained(&self) -> bool {
        self.terminate.is_some() && self.graph.is_empty()
    }

    // -- command dispatch ---------------------------------------------------

    /// Apply one upward command. Recoverable errors are absorbed here (the
    /// offending command is dropped and logged); only fatal errors surface.
    pub fn process_command(
        &mut self,
        from: Option<WorkerId>,
        command: ControllerCommand,
        out: &mut Outbox,
    ) -> Result<()> {
        let result = self.dispatch(command, out);
        match result {
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(%err, worker = ?from, "dropped command");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn dispatch(&mut self, command: ControllerCommand, out: &mut Outbox) -> Result<()> {
        match command {
            ControllerCommand::Handshake(handshake) => self.on_handshake(handshake, out),
            ControllerCommand::DefinePartition(cmd) => {
                self.registry.define_partition(cmd.partition, cmd.region)
            }
            ControllerCommand::DefineData(cmd) => {
                self.registry
                    .define_data(&cmd.name, cmd.ldo, cmd.partition, cmd.neighbors)
            }
            ControllerCommand::SpawnCompute(spawn) => self.on_spawn_compute(spawn),
            ControllerCommand::SpawnCopy(spawn) => self.on_spawn_copy(spawn),
            ControllerCommand::JobDone(done) => self.on_job_done(done, out),
            ControllerCommand::MegaJobDone(done) => self.on_mega_job_done(done, out),
            ControllerCommand::SaveDataDone(done) => self.on_save_data_done(done, out),
            ControllerCommand::StartTemplate(cmd) => self.on_start_template(&cmd.name),
            ControllerCommand::EndTemplate(cmd) => self.on_end_template(&cmd.name, out),
            ControllerCommand::SpawnTemplate(spawn) => self.on_spawn_template(spawn, out),
            ControllerCommand::Terminate(Terminate { exit_status }) => {
                info!(exit_status, "application requested termination");
                self.terminate = Some(exit_status);
                Ok(())
            }
        }
    }

    fn on_handshake(&mut self, handshake: Handshake, out: &mut Outbox) -> Result<()> {
        let id = match handshake.worker_id {
            Some(id) if self.workers.contains_key(&id) => {
                let worker = self.workers.get_mut(&id).expect("registered worker");
                worker.missed_handshakes = 0;
                worker.alive = true;
                return Ok(());
            }
            Some(id) => id,
            None => {
                let id = self.next_worker_id;
                self.next_worker_id += 1;
                id
            }
        };
        info!(worker = id, address = %handshake.address, "worker registered");
        self.workers.insert(
            id,
            WorkerInfo {
                id,
                address: handshake.address,
                port: handshake.port,
                capacity: handshake.capabilities.instance_capacity,
                queue_depth: 0,
                alive: true,
                missed_handshakes: 0,
            },
        );
        out.push((id, WorkerCommand::HandshakeAck(HandshakeAck { worker_id: id })));
        Ok(())
    }

    fn on_spawn_compute(&mut self, spawn: SpawnCompute) -> Result<()> {
        self.graph.validate_spawn(&spawn, &self.registry)?;

        // Recording pass: the spawn also becomes a template slot.
        if let Some(name) = self.recording.clone() {
            self.templates.add_compute_job(&name, &spawn)?;
            if let Some(state) = self.recordings.get_mut(&name) {
                state.outstanding.insert(spawn.job_id);
            }
        }

        let mut entry = JobEntry::from_spawn(&spawn);
        if let Some(name) = &self.recording {
            entry.template = Some(TemplateTag {
                name: name.clone(),
                generation: self.recordings[name].generation,
            });
        }
        self.record_write_versions(&mut entry)?;
        self.graph.insert(entry);
        Ok(())
    }

    fn on_spawn_copy(&mut self, spawn: SpawnCopy) -> Result<()> {
        self.graph.validate_copy_spawn(&spawn, &self.registry)?;
        let mut entry = JobEntry::new(spawn.job_id, JobKind::LocalCopy);
        entry.read = [spawn.from_ldo].into_iter().collect();
        entry.write = [spawn.to_ldo].into_iter().collect();
        entry.before = spawn.before;
        entry.after = spawn.after;
        entry.parent = spawn.parent;
        entry.params = spawn.params;
        entry.sterile = true;
        self.record_write_versions(&mut entry)?;
        self.graph.insert(entry);
        Ok(())
    }

    /// Assign the versions a writer will produce and append them to the
    /// lineage chains.
    fn record_write_versions(&mut self, entry: &mut JobEntry) -> Result<()> {
        entry.depth = self.graph.depth_for(entry.parent, &entry.before);
        let write: Vec<LogicalDataId> = entry.write.iter().copied().collect();
        for ldo in write {
            let version =
                self.versions
                    .record_writer(ldo, entry.id, entry.depth, entry.sterile)?;
            entry.write_versions.insert(ldo, version);
        }
        Ok(())
    }

    fn on_job_done(&mut self, done: JobDone, out: &mut Outbox) -> Result<()> {
        if done.failed {
            if let Some(worker) = self.graph.entry(done.job_id).and_then(|e| e.worker) {
                warn!(job = done.job_id, worker, "kernel failure; treating worker as lost");
                return self.lose_worker(worker, out);
            }
        }
        debug!(job = done.job_id, run_time = done.run_time, wait_time = done.wait_time, "job done");
        self.complete_job(done.job_id, out);
        Ok(())
    }

    fn on_mega_job_done(&mut self, done: MegaJobDone, out: &mut Outbox) -> Result<()> {
        debug!(template = %done.template.name, generation = done.template.generation, jobs = done.job_ids.len(), "frame completed");
        for job in done.job_ids {
            self.complete_job(job, out);
        }
        if self.config.checkpoint_interval > 0
            && done.template.generation % self.config.checkpoint_interval == 0
        {
            self.take_checkpoint(out)?;
        }
        Ok(())
    }

    /// All bookkeeping for one completed task. Idempotent: completions for
    /// unknown or already-done tasks are no-ops.
    pub(crate) fn complete_job(&mut self, job_id: JobId, out: &mut Outbox) {
        let Some(entry) = self.graph.entry(job_id) else {
            return;
        };
        if entry.state == JobState::Done {
            return;
        }
        let kind = entry.kind.clone();
        let worker = entry.worker;
        let sterile = entry.sterile;
        let bound = entry.bound.clone();
        let copy_from = entry.copy_from;
        let copy_to = entry.copy_to;
        let write_versions = entry.write_versions.clone();

        if let Some(worker) = worker {
            if let Some(info) = self.workers.get_mut(&worker) {
                info.queue_depth = info.queue_depth.saturating_sub(1);
            }
        }

        // Commit data effects.
        match kind {
            JobKind::Compute { .. } | JobKind::Combine => {
                for &pdi in &bound {
                    let is_writer = self
                        .physical
                        .get(pdi)
                        .and_then(|i| i.pending_writer)
                        .map(|(writer, _)| writer == job_id)
                        .unwrap_or(false);
                    if is_writer {
                        let version = self
                            .physical
                            .get(pdi)
                            .and_then(|i| i.pending_writer)
                            .map(|(_, v)| v)
                            .unwrap_or(0);
                        self.physical.commit_write(pdi, version);
                    }
                }
            }
            JobKind::LocalCopy
            | JobKind::RemoteCopyReceive
            | JobKind::MegaRcr
            | JobKind::LoadData => {
                if let (Some(to), Some(&version)) =
                    (copy_to, write_versions.values().next())
                {
                    match copy_from {
                        Some(from) => self.physical.commit_copy(from, to, version),
                        None => self.physical.commit_copy(to, to, version),
                    }
                }
            }
            _ => {}
        }

        for pdi in bound {
            self.physical.unpin(pdi);
        }

        self.graph.mark_done(job_id);

        // A branching parent cleared: garbage-collect chain entries older
        // than the earliest non-sterile writer still live.
        if !sterile {
            for &ldo in write_versions.keys() {
                let live: BTreeSet<JobId> = self
                    .graph
                    .iter()
                    .filter(|e| {
                        !e.sterile && e.state != JobState::Done && e.write.contains(&ldo)
                    })
                    .map(|e| e.id)
                    .collect();
                if !live.is_empty() {
                    if let Err(err) = self.versions.lineage_mut(ldo).clean_chain(&live) {
                        warn!(ldo, %err, "chain cleanup skipped");
                    }
                }
            }
        }

        // Complex placeholder accounting: completes at expansion boundary.
        if let Some(&complex_id) = self.inner_to_complex.get(&job_id) {
            let finished = self
                .complex
                .get_mut(&complex_id)
                .map(|c| c.mark_inner_done(job_id))
                .unwrap_or(false);
            self.inner_to_complex.remove(&job_id);
            if finished {
                self.complex.remove(&complex_id);
                self.graph.mark_done(complex_id);
            }
        }

        // Checkpoint membership.
        if let Some(cp) = self.open_checkpoint {
            if let Some(entry) = self.checkpoints.entry_mut(cp) {
                entry.complete_job(job_id);
            }
        }

        // Recording progress: finalize worker templates once every recorded
        // task of a sealed template has gone out and come back.
        self.advance_recordings(out);

        // Relay the completion to execution templates waiting on it.
        if let Some(waiters) = self.outer_waiters.remove(&job_id) {
            for worker in waiters {
                out.push((
                    worker,
                    WorkerCommand::JobDoneRelay(JobDoneRelay { job_id }),
                ));
            }
        }
    }

    fn advance_recordings(&mut self, out: &mut Outbox) {
        let mut to_finalize = Vec::new();
        for (name, state) in self.recordings.iter_mut() {
            if state.sealed && !state.finalized_on_workers {
                state
                    .outstanding
                    .retain(|&job| !matches!(
                        self.graph.entry(job).map(|e| e.state),
                        None | Some(JobState::Done)
                    ));
                if state.outstanding.is_empty() {
                    state.finalized_on_workers = true;
                    to_finalize.push(name.clone());
                }
            }
        }
        for name in to_finalize {
            if let Some(mirror) = self.mirrors.get(&name) {
                for &worker in mirror.keys() {
                    out.push((
                        worker,
                        WorkerCommand::FinalizeTemplate(FinalizeTemplate { name: name.clone() }),
                    ));
                }
            }
        }
    }

    fn on_save_data_done(&mut self, done: SaveDataDone, out: &mut Outbox) -> Result<()> {
        let checkpoint = self.save_jobs.remove(&done.job_id).ok_or_else(|| {
            NimbusError::Conflict(format!("save job {} is not in flight", done.job_id))
        })?;
        if checkpoint != done.checkpoint {
            return Err(NimbusError::Conflict(format!(
                "save job {} reported checkpoint {} but belongs to {}",
                done.job_id, done.checkpoint, checkpoint
            )));
        }
        if let Some(entry) = self.checkpoints.entry_mut(checkpoint) {
            entry.notify_save_data_job_done(done.job_id, done.handle)?;
        }
        self.complete_job(done.job_id, out);
        Ok(())
    }

    fn on_start_template(&mut self, name: &str) -> Result<()> {
        self.templates.detect_new(name)?;
        let generation = self.templates.next_generation(name);
        self.recording = Some(name.to_string());
        self.recordings.insert(
            name.to_string(),
            RecordingState {
                sealed: false,
                outstanding: BTreeSet::new(),
                finalized_on_workers: false,
                generation,
            },
        );
        self.mirrors.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    fn on_end_template(&mut self, name: &str, out: &mut Outbox) -> Result<()> {
        self.templates.finalize(name)?;
        if self.recording.as_deref() == Some(name) {
            self.recording = None;
        }
        if let Some(state) = self.recordings.get_mut(name) {
            state.sealed = true;
        }
        // Everything may already be done when the seal arrives.
        self.advance_recordings(out);
        Ok(())
    }

    fn on_spawn_template(&mut self, spawn: SpawnTemplate, out: &mut Outbox) -> Result<()> {
        let generation = self.templates.next_generation(&spawn.name);
        let spawns = self.templates.instantiate(
            &spawn.name,
            &spawn.inner,
            &spawn.outer,
            &spawn.params,
            spawn.parent,
        )?;

        // The complex placeholder occupies one job id.
        let complex_id = self.ids.next(IdDomain::Job);
        let mut placeholder = JobEntry::new(
            complex_id,
            JobKind::Complex {
                template: spawn.name.clone(),
            },
        );
        placeholder.parent = spawn.parent;
        placeholder.sterile = false;
        self.graph.insert(placeholder);
        self.graph.mark_running(complex_id);

        let tag = TemplateTag {
            name: spawn.name.clone(),
            generation,
        };

        // Inner tasks enter the graph like ordinary spawns, already bound to
        // the workers the recording pass chose.
        let mut inner_ids = Vec::with_capacity(spawns.len());
        for template_spawn in &spawns {
            let mut entry = JobEntry::from_spawn(template_spawn);
            entry.template = Some(tag.clone());
            self.record_write_versions(&mut entry)?;
            inner_ids.push(entry.id);
            self.graph.insert(entry);
            self.inner_to_complex.insert(template_spawn.job_id, complex_id);
        }
        self.complex.insert(
            complex_id,
            ComplexJob::new(complex_id, &spawn.name, generation, spawn.parent, inner_ids),
        );

        self.instantiate_on_workers(&spawn, generation, out)
    }

    /// Snapshot the latest version of every datum: one save task per datum,
    /// issued to a worker holding that version.
    pub fn take_checkpoint(&mut self, out: &mut Outbox) -> Result<()> {
        let checkpoint = self.ids.next(IdDomain::Checkpoint);
        let mut entry = CheckpointEntry::new(checkpoint);
        let mut saves = Vec::new();

        for object in self.registry.iter() {
            let version = self.versions.last_version(object.id);
            if version == 0 {
                continue;
            }
            // Any worker holding the latest version can persist it.
            let holder = self
                .workers
                .keys()
                .copied()
                .find_map(|w| {
                    self.physical
                        .find_at_version(w, object.id, version)
                        .map(|pdi| (w, pdi))
                });
            let Some((worker, pdi)) = holder else {
                continue;
            };
            let job_id = self.ids.next(IdDomain::Job);
            entry.add_save_data_job(job_id, object.id, version, worker);
            self.save_jobs.insert(job_id, checkpoint);
            saves.push((worker, pdi, object.id, version, job_id));
        }

        info!(checkpoint, saves = saves.len(), "taking checkpoint");
        self.checkpoints.insert(entry);
        self.open_checkpoint = Some(checkpoint);

        for (worker, pdi, ldo, version, job_id) in saves {
            let mut job = JobEntry::new(job_id, JobKind::SaveData);
            job.worker = Some(worker);
            job.state = JobState::Assigned;
            self.graph.insert(job);
            self.graph.mark_assigned(job_id, worker);
            self.physical.pin(pdi);
            if let Some(entry) = self.graph.entry_mut(job_id) {
                entry.bound.push(pdi);
            }
            out.push((
                worker,
                WorkerCommand::SaveData(SaveData {
                    job_id,
                    checkpoint,
                    from: pdi,
                    ldo,
                    version,
                    before: BTreeSet::new(),
                    after: BTreeSet::new(),
                }),
            ));
        }
        Ok(())
    }

    // -- worker loss and rewind ---------------------------------------------

    /// A worker missed too many handshakes or reported a failure: fail its
    /// tasks, roll affected data back to the latest complete checkpoint, and
    /// respawn.
    pub fn lose_worker(&mut self, worker: WorkerId, out: &mut Outbox) -> Result<()> {
        let Some(info) = self.workers.get_mut(&worker) else {
            return Ok(());
        };
        if !info.alive {
            return Ok(());
        }
        error!(worker, "worker lost; rewinding");
        info.alive = false;
        info.queue_depth = 0;

        let failed = self.graph.fail_worker(worker);
        self.physical.remove_worker(worker);

        // Data whose newest state lived only on the lost worker.
        let mut affected: BTreeSet<LogicalDataId> = BTreeSet::new();
        for object in self.registry.iter() {
            let version = self.versions.last_version(object.id);
            if version == 0 {
                continue;
            }
            let covered = self
                .workers
                .values()
                .filter(|w| w.alive)
                .any(|w| self.physical.find_at_version(w.id, object.id, version).is_some());
            if !covered {
                affected.insert(object.id);
            }
        }

        // Halt surviving execution templates before reinstantiating.
        if !self.mirrors.is_empty() {
            let templates: Vec<String> = self.mirrors.keys().cloned().collect();
            for info in self.workers.values().filter(|w| w.alive) {
                out.push((
                    info.id,
                    WorkerCommand::PrepareRewind(PrepareRewind {
                        templates: templates.clone(),
                    }),
                ));
            }
        }

        if !affected.is_empty() {
            let Some(checkpoint) = self.checkpoints.latest_complete() else {
                return Err(NimbusError::fatal(format!(
                    "worker {worker} lost data {affected:?} with no complete checkpoint"
                )));
            };
            let checkpoint_id = checkpoint.id();
            let mut loads = Vec::new();
            for &ldo in &affected {
                let version = checkpoint.saved_version(ldo).unwrap_or(0);
                let handles = if version > 0 {
                    checkpoint.get_handle_to_load_data(ldo, version)
                } else {
                    Vec::new()
                };
                loads.push((ldo, version, handles));
            }

            // Snapshots live on shared storage: any surviving worker can
            // reload a handle, whoever saved it.
            let holder = self
                .workers
                .values()
                .filter(|w| w.alive)
                .map(|w| w.id)
                .next()
                .ok_or_else(|| {
                    NimbusError::fatal("every worker lost; cannot rewind".to_string())
                })?;

            for (ldo, version, handles) in loads {
                self.versions.lineage_mut(ldo).truncate_to(version);
                if version == 0 {
                    continue;
                }
                let Some((_, handle)) = handles.into_iter().next() else {
                    return Err(NimbusError::fatal(format!(
                        "checkpoint {checkpoint_id} has no handle for data {ldo}"
                    )));
                };
                let job_id = self.ids.next(IdDomain::Job);
                let pdi = self.ids.next(IdDomain::PhysicalData);
                self.physical.insert_new(pdi, holder, ldo, 0);
                let mut job = JobEntry::new(job_id, JobKind::LoadData);
                job.worker = Some(holder);
                job.copy_to = Some(pdi);
                job.write = [ldo].into_iter().collect();
                job.write_versions.insert(ldo, version);
                job.state = JobState::Assigned;
                self.graph.insert(job);
                self.graph.mark_assigned(job_id, holder);
                out.push((
                    holder,
                    WorkerCommand::LoadData(LoadData {
                        job_id,
                        to: pdi,
                        handle,
                        before: BTreeSet::new(),
                        after: BTreeSet::new(),
                    }),
                ));
            }

            // Reconcile live writers back into the rolled-back chains, in
            // version order.
            let mut reinsert: Vec<(LogicalDataId, crate::ids::DataVersion, JobId, crate::ids::JobDepth)> =
                Vec::new();
            for entry in self.graph.iter() {
                if entry.state == JobState::Done {
                    continue;
                }
                for (&ldo, &version) in &entry.write_versions {
                    if affected.contains(&ldo) && version > self.versions.last_version(ldo) {
                        reinsert.push((ldo, version, entry.id, entry.depth));
                    }
                }
            }
            reinsert.sort_unstable_by_key(|&(ldo, version, _, _)| (ldo, version));
            for (ldo, version, job, depth) in reinsert {
                self.versions
                    .lineage_mut(ldo)
                    .insert_parent_entry(job, version, depth)?;
            }
        }

        for job in failed {
            self.graph.reset_failed(job);
        }
        Ok(())
    }

    /// Periodic liveness sweep: every alive worker owes a handshake per
    /// interval.
    pub fn tick_handshakes(&mut self, out: &mut Outbox) -> Result<()> {
        let threshold = self.config.handshake_miss_threshold;
        let stale: Vec<WorkerId> = self
            .workers
            .values_mut()
            .filter(|w| w.alive)
            .filter_map(|w| {
                w.missed_handshakes += 1;
                (w.missed_handshakes > threshold).then_some(w.id)
            })
            .collect();
        for worker in stale {
            self.lose_worker(worker, out)?;
        }
        Ok(())
    }

    /// Broadcast termination to every live worker.
    pub fn broadcast_terminate(&self, out: &mut Outbox) {
        let exit_status = self.terminate.unwrap_or(0);
        for info in self.workers.values().filter(|w| w.alive) {
            out.push((info.id, WorkerCommand::Terminate(Terminate { exit_status })));
        }
    }

    /// Operator-requested termination.
    pub fn request_terminate(&mut self, exit_status: ExitStatus) {
        self.terminate = Some(exit_status);
    }

    /// Pre-register workers from a cluster map: one `id address port` line
    /// per worker. Registered entries activate on handshake. Returns the
    /// number of entries loaded.
    pub fn load_cluster_map(&mut self, text: &str) -> usize {
        let mut loaded = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = (|| {
                let id: WorkerId = fields.next()?.parse().ok()?;
                let address = fields.next()?.to_string();
                let port: u16 = fields.next()?.parse().ok()?;
                Some((id, address, port))
            })();
            let Some((id, address, port)) = parsed else {
                warn!(line, "skipping malformed cluster map entry");
                continue;
            };
            self.workers.entry(id).or_insert(WorkerInfo {
                id,
                address,
                port,
                capacity: self.config.instance_capacity,
                queue_depth: 0,
                alive: false,
                missed_handshakes: 0,
            });
            self.next_worker_id = self.next_worker_id.max(id + 1);
            loaded += 1;
        }
        loaded
    }
}

mod instantiate;
mod runtime;
pub use runtime::{AdminCommand, Controller};
