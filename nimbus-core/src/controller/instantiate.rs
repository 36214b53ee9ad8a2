//! Hot-path template instantiation.
//!
//! The recording generation captured, per worker, the exact command sequence
//! the binder emitted. Later instantiations replay those recordings without
//! re-running the binder: fresh job ids are bound to the recorded slots, the
//! physical instances are reused, and each participating worker receives a
//! single instantiate command instead of the full sequence. The replay
//! derives the inner/outer/physical slot orders with the same discovery walk
//! the worker-side execution template uses, so the two sides always agree on
//! slot numbering.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;

use crate::{
    command::{
        InstantiateTemplate, JobDoneRelay, SpawnTemplate, TemplateTag, WorkerCommand,
    },
    error::{NimbusError, Result},
    graph::{JobEntry, JobKind, JobState},
    ids::{IdDomain, JobId, PhysicalDataId, TemplateGenerationId, WorkerId},
};

use super::{Engine, Outbox};

impl Engine {
    /// Capture a command emitted during a template's recording generation.
    pub(crate) fn record_mirror(
        &mut self,
        tag: &TemplateTag,
        worker: WorkerId,
        command: &WorkerCommand,
    ) {
        if let Some(mirror) = self.mirrors.get_mut(&tag.name) {
            mirror.entry(worker).or_default().commands.push(command.clone());
        }
    }

    /// Replay every worker's recording for a new generation.
    pub(crate) fn instantiate_on_workers(
        &mut self,
        spawn: &SpawnTemplate,
        generation: TemplateGenerationId,
        out: &mut Outbox,
    ) -> Result<()> {
        let mirror = self.mirrors.get(&spawn.name).ok_or_else(|| {
            NimbusError::Conflict(format!("template {} has no recorded layout", spawn.name))
        })?;

        // First pass: map every recording-time inner id to its current id.
        // Compute slots take the application-supplied ids; copies get fresh
        // controller-range ids.
        let mut recorded: Vec<(WorkerId, Vec<WorkerCommand>)> = mirror
            .iter()
            .map(|(&worker, recording)| (worker, recording.commands.clone()))
            .collect();
        recorded.sort_by_key(|(worker, _)| *worker);

        let entry = self.templates.get(&spawn.name).ok_or_else(|| {
            NimbusError::Conflict(format!("template {} has not been detected", spawn.name))
        })?;

        let mut current_of: HashMap<JobId, JobId> = HashMap::new();
        let mut copy_count = 0;
        for (_, commands) in &recorded {
            for command in commands {
                let recorded_id = command_job_id(command);
                match entry.slot_of_recorded_job(recorded_id) {
                    Some(slot) => {
                        current_of.insert(recorded_id, spawn.inner[slot]);
                    }
                    None => copy_count += 1,
                }
            }
        }
        let copy_ids = self.ids.get_new_ids(IdDomain::Job, copy_count);
        let mut next_copy = copy_ids.into_iter();
        for (_, commands) in &recorded {
            for command in commands {
                let recorded_id = command_job_id(command);
                if entry.slot_of_recorded_job(recorded_id).is_none() {
                    current_of.insert(recorded_id, next_copy.next().expect("sized above"));
                }
            }
        }

        // Resolve a recording-time dependency to its current id. Template
        // members refresh; template outer dependencies come from the spawn;
        // anything else was one-time setup, long done.
        let resolve = |id: JobId| -> JobId {
            if let Some(&current) = current_of.get(&id) {
                return current;
            }
            if let Some(slot) = entry.outer_slot_of_recorded(id) {
                return spawn.outer[slot];
            }
            id
        };

        // Second pass: per worker, derive the slot tables and rebuild the
        // graph entries for this generation.
        let mut per_worker: Vec<(WorkerId, InstantiateTemplate)> = Vec::new();
        let mut copy_entries: Vec<(WorkerId, JobEntry)> = Vec::new();
        let mut outer_registrations: Vec<(JobId, WorkerId)> = Vec::new();
        let mut write_bindings: Vec<(JobId, WorkerId, Vec<PhysicalDataId>)> = Vec::new();

        for (worker, commands) in &recorded {
            let worker = *worker;
            let inner_recorded: BTreeSet<JobId> =
                commands.iter().map(command_job_id).collect();

            let mut inner = Vec::with_capacity(commands.len());
            let mut params = Vec::with_capacity(commands.len());
            let mut physical = Vec::new();
            let mut seen_phys: BTreeSet<PhysicalDataId> = BTreeSet::new();
            let mut outer = Vec::new();
            let mut seen_outer: BTreeSet<JobId> = BTreeSet::new();

            for command in commands {
                let recorded_id = command_job_id(command);
                let current_id = current_of[&recorded_id];
                inner.push(current_id);

                // Parameters: compute slots take the caller's blob; copies
                // carry none.
                match entry.slot_of_recorded_job(recorded_id) {
                    Some(slot) => params.push(spawn.params[slot].clone()),
                    None => params.push(Bytes::new()),
                }

                // Physical ids, in the worker's discovery order.
                for pdi in command_physical_ids(command) {
                    if seen_phys.insert(pdi) {
                        physical.push(pdi);
                    }
                }

                // Outer dependencies, in the worker's discovery order.
                for &dep in command_before(command) {
                    if !inner_recorded.contains(&dep) && seen_outer.insert(dep) {
                        let current_dep = resolve(dep);
                        outer.push(current_dep);
                        outer_registrations.push((current_dep, worker));
                    }
                }

                // Rebuild graph-side bookkeeping for this generation.
                match command {
                    WorkerCommand::ComputeJob(compute) => {
                        write_bindings.push((current_id, worker, compute.write.clone()));
                    }
                    WorkerCommand::CombineJob(combine) => {
                        write_bindings.push((current_id, worker, combine.reduce.clone()));
                    }
                    _ => {
                        let mut job = copy_entry_for(command, current_id);
                        for dep in command_before(command) {
                            job.before.insert(resolve(*dep));
                        }
                        copy_entries.push((worker, job));
                    }
                }
            }

            per_worker.push((
                worker,
                InstantiateTemplate {
                    name: spawn.name.clone(),
                    inner,
                    outer,
                    extra_dependency: BTreeSet::new(),
                    params,
                    physical,
                    generation,
                },
            ));
        }

        // Apply graph effects. Compute tasks were inserted by the caller;
        // bind them to their recorded workers and pending writes.
        for (job_id, worker, write_pdis) in write_bindings {
            self.graph.mark_assigned(job_id, worker);
            if let Some(info) = self.workers.get_mut(&worker) {
                info.queue_depth += 1;
            }
            let write_versions = self
                .graph
                .entry(job_id)
                .map(|e| e.write_versions.clone())
                .unwrap_or_default();
            // The binder emits write sets in ascending datum order; the
            // recorded command preserves it, so the zip below lines up.
            for ((_, &version), &pdi) in write_versions.iter().zip(write_pdis.iter()) {
                self.physical.set_pending_writer(pdi, job_id, version);
            }
            if let Some(entry) = self.graph.entry_mut(job_id) {
                entry.bound = write_pdis;
            }
        }

        let complex_id = self
            .complex
            .values()
            .find(|c| c.template == spawn.name && c.generation == generation)
            .map(|c| c.job_id);
        for (worker, mut job) in copy_entries {
            job.worker = Some(worker);
            job.state = JobState::Assigned;
            // The copy reproduces whatever version its source instance will
            // hold this generation.
            if let Some(to) = job.copy_to {
                if let Some(instance) = self.physical.get(to) {
                    job.write = [instance.ldo].into_iter().collect();
                    let version = job
                        .copy_from
                        .and_then(|from| self.physical.get(from))
                        .and_then(|i| i.pending_writer)
                        .map(|(_, v)| v)
                        .unwrap_or_else(|| self.versions.last_version(instance.ldo));
                    job.write_versions.insert(instance.ldo, version);
                }
            }
            let job_id = job.id;
            self.graph.insert(job);
            self.graph.mark_assigned(job_id, worker);
            if let Some(complex_id) = complex_id {
                if let Some(complex) = self.complex.get_mut(&complex_id) {
                    complex.add_inner(job_id);
                }
                self.inner_to_complex.insert(job_id, complex_id);
            }
        }

        for (worker, command) in per_worker {
            out.push((worker, WorkerCommand::InstantiateTemplate(command)));
        }

        // Register completion relays; dependencies that already finished are
        // relayed immediately.
        for (dep, worker) in outer_registrations {
            if self.graph.is_done(dep) || !self.graph.contains(dep) {
                out.push((worker, WorkerCommand::JobDoneRelay(JobDoneRelay { job_id: dep })));
            } else {
                self.outer_waiters.entry(dep).or_default().insert(worker);
            }
        }
        Ok(())
    }
}

fn command_job_id(command: &WorkerCommand) -> JobId {
    match command {
        WorkerCommand::ComputeJob(c) => c.job_id,
        WorkerCommand::CombineJob(c) => c.job_id,
        WorkerCommand::LocalCopy(c) => c.job_id,
        WorkerCommand::RemoteCopySend(c) => c.job_id,
        WorkerCommand::RemoteCopyReceive(c) => c.job_id,
        WorkerCommand::MegaRcr(c) => c.job_id,
        _ => 0,
    }
}

fn command_before(command: &WorkerCommand) -> &BTreeSet<JobId> {
    static EMPTY: std::sync::OnceLock<BTreeSet<JobId>> = std::sync::OnceLock::new();
    match command {
        WorkerCommand::ComputeJob(c) => &c.before,
        WorkerCommand::CombineJob(c) => &c.before,
        WorkerCommand::LocalCopy(c) => &c.before,
        WorkerCommand::RemoteCopySend(c) => &c.before,
        WorkerCommand::RemoteCopyReceive(c) => &c.before,
        WorkerCommand::MegaRcr(c) => &c.before,
        _ => EMPTY.get_or_init(BTreeSet::new),
    }
}

/// Physical ids referenced by a command, in the worker-side discovery order.
fn command_physical_ids(command: &WorkerCommand) -> Vec<PhysicalDataId> {
    match command {
        WorkerCommand::ComputeJob(c) => {
            c.read.iter().chain(c.write.iter()).copied().collect()
        }
        WorkerCommand::CombineJob(c) => {
            c.scratch.iter().chain(c.reduce.iter()).copied().collect()
        }
        WorkerCommand::LocalCopy(c) => vec![c.from, c.to],
        WorkerCommand::RemoteCopySend(c) => vec![c.from],
        WorkerCommand::RemoteCopyReceive(c) => vec![c.to],
        WorkerCommand::MegaRcr(c) => c.receives.iter().map(|(_, pdi)| *pdi).collect(),
        _ => Vec::new(),
    }
}

/// A graph entry for a replayed copy task (before-set filled by the caller).
fn copy_entry_for(command: &WorkerCommand, job_id: JobId) -> JobEntry {
    match command {
        WorkerCommand::LocalCopy(c) => {
            let mut job = JobEntry::new(job_id, JobKind::LocalCopy);
            job.copy_from = Some(c.from);
            job.copy_to = Some(c.to);
            job
        }
        WorkerCommand::RemoteCopySend(_) => JobEntry::new(job_id, JobKind::RemoteCopySend),
        WorkerCommand::RemoteCopyReceive(c) => {
            let mut job = JobEntry::new(job_id, JobKind::RemoteCopyReceive);
            job.copy_to = Some(c.to);
            job
        }
        WorkerCommand::MegaRcr(c) => {
            let mut job = JobEntry::new(job_id, JobKind::MegaRcr);
            job.copy_to = c.receives.first().map(|(_, pdi)| *pdi);
            job
        }
        _ => JobEntry::new(job_id, JobKind::LocalCopy),
    }
}
