//! The assigner: binds ready tasks to workers and materializes their data.
//!
//! For every ready compute task the binder picks the cheapest worker
//! (weighing remote copy traffic, eviction pressure and queue depth, with
//! worker id breaking ties for determinism), resolves the version each read
//! datum must be at, and emits whatever create and copy tasks are needed to
//! put those versions on the chosen worker. Synthetic edges order the
//! emissions: a create precedes the copy that fills it, a copy precedes the
//! reader, and a send precedes its receive (expressed on the receiving side
//! as a data-delivery precondition).
//!
//! A task that writes a datum it also reads never updates a shared instance
//! in place: it gets its own destination, the required version is copied in
//! first, and the kernel overwrites the private copy. That keeps every
//! (datum, writer) binding exclusive per worker.
//!
//! Remote transfers for plain readers are batched per round: readers of the
//! same datum version on the same destination share one send and one
//! (possibly mega) receive. A task whose allocation fails under pressure
//! simply stays ready for the next round; the binder never pins across
//! rounds, so pressure cannot deadlock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::{
    command::{
        CombineJob, ComputeJob, CreateData, LocalCopy, MegaRcr, RemoteCopyReceive,
        RemoteCopySend, TemplateTag, WorkerCommand,
    },
    error::{NimbusError, Result},
    graph::{JobEntry, JobKind, JobState},
    ids::{DataVersion, IdDomain, JobId, LogicalDataId, PhysicalDataId, WorkerId},
    physical::{Allocation, Materialization},
};

use super::controller::{Engine, Outbox};

/// Cost weight for bytes that must be copied in from another worker.
const ALPHA: f64 = 1.0;
/// Cost weight for bytes that must be evicted to make room.
const BETA: f64 = 0.5;
/// Cost weight per task already queued on the worker.
const GAMMA: f64 = 16.0;

/// One remote transfer planned this round, shared by every plain reader of
/// the same (datum, version) on the same destination.
struct RemotePlan {
    ldo: LogicalDataId,
    version: DataVersion,
    from_worker: WorkerId,
    from_pdi: PhysicalDataId,
    to_worker: WorkerId,
    dest_pdi: PhysicalDataId,
    /// Job id of the receive (or mega receive) node; readers order after it.
    container_job: JobId,
    receive_ids: Vec<JobId>,
    /// Create task that allocated the destination, if one was needed.
    create_before: BTreeSet<JobId>,
    readers: BTreeSet<JobId>,
    /// The task that produced the transferred version, ordering the send.
    source_writer: Option<JobId>,
    template: Option<TemplateTag>,
}

#[derive(Default)]
struct RoundPlans {
    plans: Vec<RemotePlan>,
    index: HashMap<(LogicalDataId, DataVersion, WorkerId), usize>,
}

impl Engine {
    /// One scheduling round: assign every ready task that can be hosted.
    /// Returns the number of tasks assigned.
    pub fn assign_ready_jobs(&mut self, out: &mut Outbox) -> Result<usize> {
        if !self.cluster_ready() {
            return Ok(0);
        }
        let mut plans = RoundPlans::default();
        let mut assigned = 0;
        for job_id in self.graph.ready_jobs() {
            let bindable = self
                .graph
                .entry(job_id)
                .map(|e| {
                    e.worker.is_none()
                        && matches!(
                            e.kind,
                            JobKind::Compute { .. } | JobKind::Combine | JobKind::LocalCopy
                        )
                })
                .unwrap_or(false);
            if !bindable {
                continue;
            }
            match self.bind_job(job_id, &mut plans, out) {
                Ok(()) => assigned += 1,
                Err(NimbusError::AllocationPressure { worker }) => {
                    debug!(job = job_id, worker, "allocation pressure; task stays ready");
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    debug!(job = job_id, %err, "task not bindable this round");
                }
            }
        }
        self.flush_remote_plans(plans, out);
        Ok(assigned)
    }

    /// Resolve the version a reader requires for each datum in its read-set.
    fn resolve_read_versions(
        &self,
        job_id: JobId,
        read: &BTreeSet<LogicalDataId>,
    ) -> BTreeMap<LogicalDataId, DataVersion> {
        let closure = self.graph.before_closure(job_id);
        let mut versions = BTreeMap::new();
        for &ldo in read {
            let version = self
                .versions
                .lineage(ldo)
                .map(|lineage| {
                    lineage.required_version(|writer| {
                        writer != job_id
                            && (closure.contains(&writer) || self.graph.is_done(writer))
                    })
                })
                .unwrap_or(0);
            versions.insert(ldo, version);
        }
        versions
    }

    /// Pick the cheapest live worker for a task.
    fn choose_worker(
        &self,
        entry: &JobEntry,
        read_versions: &BTreeMap<LogicalDataId, DataVersion>,
    ) -> Result<WorkerId> {
        let mut best: Option<(f64, WorkerId)> = None;
        for info in self.workers.values().filter(|w| w.alive) {
            let mut remote_bytes = 0u64;
            let mut needed_new = 0usize;
            let mut volume_total = 0u64;
            let mut volume_count = 0u64;

            for (&ldo, &version) in read_versions {
                let volume = self
                    .registry
                    .lookup(ldo)
                    .map(|o| o.region.volume())
                    .unwrap_or(0);
                volume_total += volume;
                volume_count += 1;
                match self.physical.require_version(info.id, ldo, version) {
                    Some(Materialization::Reuse(_)) if !entry.write.contains(&ldo) => {}
                    Some(Materialization::RemoteCopy { .. }) | None => {
                        remote_bytes += volume;
                        needed_new += 1;
                    }
                    _ => needed_new += 1,
                }
            }
            for &ldo in entry.write.iter().filter(|l| !entry.read.contains(l)) {
                let volume = self
                    .registry
                    .lookup(ldo)
                    .map(|o| o.region.volume())
                    .unwrap_or(0);
                volume_total += volume;
                volume_count += 1;
                let reusable = self
                    .physical
                    .instances_on(info.id, ldo)
                    .any(|i| i.pin_count == 0 && !i.dirty && i.pending_writer.is_none());
                if !reusable {
                    needed_new += 1;
                }
            }

            let free = info.capacity.saturating_sub(self.physical.count_on(info.id));
            let evict_need = needed_new.saturating_sub(free) as u64;
            let mean_volume = if volume_count > 0 {
                volume_total / volume_count
            } else {
                0
            };
            let cost = ALPHA * remote_bytes as f64
                + BETA * (evict_need * mean_volume) as f64
                + GAMMA * info.queue_depth as f64;

            let better = match best {
                None => true,
                Some((best_cost, best_id)) => {
                    cost < best_cost || (cost == best_cost && info.id < best_id)
                }
            };
            if better {
                best = Some((cost, info.id));
            }
        }
        best.map(|(_, id)| id)
            .ok_or(NimbusError::AllocationPressure { worker: 0 })
    }

    fn bind_job(&mut self, job_id: JobId, plans: &mut RoundPlans, out: &mut Outbox) -> Result<()> {
        let entry = self
            .graph
            .entry(job_id)
            .cloned()
            .ok_or_else(|| NimbusError::fatal(format!("binding unknown job {job_id}")))?;
        let read_versions = self.resolve_read_versions(job_id, &entry.read);
        let worker = self.choose_worker(&entry, &read_versions)?;
        let capacity = self.workers[&worker].capacity;
        let tag = entry.template.clone();

        let mut synthetic_before: BTreeSet<JobId> = BTreeSet::new();
        let mut read_pdis: Vec<(LogicalDataId, PhysicalDataId)> = Vec::new();
        let mut write_pdis: Vec<(LogicalDataId, PhysicalDataId)> = Vec::new();

        for (&ldo, &version) in &read_versions {
            let source = self.physical.require_version(worker, ldo, version);
            let Some(source) = source else {
                return Err(NimbusError::fatal(format!(
                    "data {ldo} has no instance at version {version} anywhere in the cluster"
                )));
            };

            if entry.write.contains(&ldo) {
                // Read-write: private destination, required version copied
                // in, kernel overwrites in place.
                let source_pdi = match source {
                    Materialization::Reuse(pdi) | Materialization::LocalCopy { from: pdi } => {
                        Some(pdi)
                    }
                    _ => None,
                };
                // Keep the source safe from eviction while making room.
                if let Some(pdi) = source_pdi {
                    self.physical.pin(pdi);
                }
                let allocated = self.create_instance(worker, ldo, capacity, job_id, out);
                if let Some(pdi) = source_pdi {
                    self.physical.unpin(pdi);
                }
                let (dest, create_job) = allocated?;
                let create_set: BTreeSet<JobId> = create_job.into_iter().collect();
                synthetic_before.extend(create_set.iter().copied());

                match source {
                    Materialization::Create => {}
                    Materialization::Reuse(from) | Materialization::LocalCopy { from } => {
                        if from != dest {
                            let copy_job = self.emit_local_copy(
                                worker, ldo, version, from, dest, &create_set, job_id, &tag, out,
                            );
                            synthetic_before.insert(copy_job);
                        }
                    }
                    Materialization::RemoteCopy { from_worker, from } => {
                        let receive_job = self.emit_remote_copy_into(
                            ldo, version, from_worker, from, worker, dest, &create_set, job_id,
                            &tag, out,
                        );
                        synthetic_before.insert(receive_job);
                    }
                }
                read_pdis.push((ldo, dest));
                write_pdis.push((ldo, dest));
            } else {
                // Plain read: reuse where possible, otherwise materialize.
                match source {
                    Materialization::Reuse(pdi) => {
                        self.physical.touch(pdi);
                        read_pdis.push((ldo, pdi));
                    }
                    Materialization::Create => {
                        let (pdi, create_job) =
                            self.create_instance(worker, ldo, capacity, job_id, out)?;
                        synthetic_before.extend(create_job);
                        read_pdis.push((ldo, pdi));
                    }
                    Materialization::LocalCopy { from } => {
                        self.physical.pin(from);
                        let allocated = self.create_instance(worker, ldo, capacity, job_id, out);
                        self.physical.unpin(from);
                        let (dest, create_job) = allocated?;
                        let create_set: BTreeSet<JobId> = create_job.into_iter().collect();
                        synthetic_before.extend(create_set.iter().copied());
                        let copy_job = self.emit_local_copy(
                            worker, ldo, version, from, dest, &create_set, job_id, &tag, out,
                        );
                        synthetic_before.insert(copy_job);
                        read_pdis.push((ldo, dest));
                    }
                    Materialization::RemoteCopy { from_worker, from } => {
                        let container = self.join_remote_plan(
                            plans, ldo, version, from_worker, from, worker, capacity, job_id,
                            &tag, out,
                        )?;
                        synthetic_before.insert(container);
                        read_pdis.push((ldo, self.plan_dest(plans, ldo, version, worker)));
                    }
                }
            }
        }

        // Write-only data: an instance to overwrite, no copy-in needed.
        for &ldo in entry.write.iter().filter(|l| !entry.read.contains(l)) {
            let (pdi, create_job) = self.create_instance(worker, ldo, capacity, job_id, out)?;
            synthetic_before.extend(create_job);
            write_pdis.push((ldo, pdi));
        }
        write_pdis.sort_unstable_by_key(|&(ldo, _)| ldo);

        // Claim every destination for this writer.
        for &(ldo, pdi) in &write_pdis {
            let version = entry.write_versions.get(&ldo).copied().unwrap_or(0);
            self.physical.set_pending_writer(pdi, job_id, version);
        }

        // Emit the resolved command.
        let mut before = entry.before.clone();
        before.extend(synthetic_before);
        let command = match &entry.kind {
            JobKind::LocalCopy => WorkerCommand::LocalCopy(LocalCopy {
                job_id,
                from: read_pdis.first().map(|&(_, p)| p).unwrap_or_default(),
                to: write_pdis.first().map(|&(_, p)| p).unwrap_or_default(),
                before,
                after: entry.after.clone(),
                template: tag.clone(),
            }),
            JobKind::Compute { name } => WorkerCommand::ComputeJob(ComputeJob {
                name: name.clone(),
                job_id,
                read: read_pdis.iter().map(|&(_, p)| p).collect(),
                write: write_pdis.iter().map(|&(_, p)| p).collect(),
                before,
                after: entry.after.clone(),
                params: entry.params.clone(),
                template: tag.clone(),
            }),
            JobKind::Combine => WorkerCommand::CombineJob(CombineJob {
                job_id,
                scratch: read_pdis.iter().map(|&(_, p)| p).collect(),
                reduce: write_pdis.iter().map(|&(_, p)| p).collect(),
                before,
                after: entry.after.clone(),
                template: tag.clone(),
            }),
            other => {
                return Err(NimbusError::fatal(format!(
                    "binder cannot emit command for job kind {other:?}"
                )));
            }
        };
        out.push((worker, command.clone()));
        if let Some(tag) = &tag {
            self.record_mirror(tag, worker, &command);
        }

        // Pin every binding until completion.
        let mut bound = Vec::new();
        for &(_, pdi) in read_pdis.iter().chain(write_pdis.iter()) {
            if !bound.contains(&pdi) {
                self.physical.pin(pdi);
                bound.push(pdi);
            }
        }
        if matches!(entry.kind, JobKind::LocalCopy) {
            if let Some(job) = self.graph.entry_mut(job_id) {
                job.copy_from = read_pdis.first().map(|&(_, p)| p);
                job.copy_to = write_pdis.first().map(|&(_, p)| p);
            }
        }
        if let Some(job) = self.graph.entry_mut(job_id) {
            job.read_versions = read_versions;
            job.bound = bound;
        }
        self.graph.mark_assigned(job_id, worker);
        if let Some(info) = self.workers.get_mut(&worker) {
            info.queue_depth += 1;
        }
        Ok(())
    }

    /// Find or make room for a destination instance, emitting a create task
    /// when a fresh one is needed.
    fn create_instance(
        &mut self,
        worker: WorkerId,
        ldo: LogicalDataId,
        capacity: usize,
        reader: JobId,
        out: &mut Outbox,
    ) -> Result<(PhysicalDataId, Option<JobId>)> {
        match self.physical.allocate(worker, ldo, capacity)? {
            Allocation::Reused(pdi) => Ok((pdi, None)),
            Allocation::NeedsCreate { evicted } => {
                if let Some(evicted) = evicted {
                    debug!(worker, evicted, "evicted instance to make room");
                }
                let pdi = self.ids.next(IdDomain::PhysicalData);
                let job_id = self.ids.next(IdDomain::Job);
                self.physical.insert_new(pdi, worker, ldo, 0);
                let name = self
                    .registry
                    .lookup(ldo)
                    .map(|o| o.name.clone())
                    .unwrap_or_default();

                let mut job = JobEntry::new(job_id, JobKind::CreateData);
                job.worker = Some(worker);
                job.state = JobState::Assigned;
                job.after.insert(reader);
                self.graph.insert(job);
                self.graph.mark_assigned(job_id, worker);

                out.push((
                    worker,
                    WorkerCommand::CreateData(CreateData {
                        name,
                        ldo,
                        job_id,
                        before: BTreeSet::new(),
                        after: [reader].into_iter().collect(),
                        pdi,
                    }),
                ));
                Ok((pdi, Some(job_id)))
            }
        }
    }

    /// The task that produced this version, for ordering copies behind it
    /// when the pattern is replayed.
    fn source_writer(&self, ldo: LogicalDataId, version: DataVersion) -> Option<JobId> {
        self.versions.lineage(ldo).and_then(|l| l.writer_of(version))
    }

    /// Emit a local copy task moving `version` of `ldo` between two
    /// instances on the same worker.
    #[allow(clippy::too_many_arguments)]
    fn emit_local_copy(
        &mut self,
        worker: WorkerId,
        ldo: LogicalDataId,
        version: DataVersion,
        from: PhysicalDataId,
        to: PhysicalDataId,
        create_before: &BTreeSet<JobId>,
        reader: JobId,
        tag: &Option<TemplateTag>,
        out: &mut Outbox,
    ) -> JobId {
        let copy_job = self.ids.next(IdDomain::Job);
        let mut before = create_before.clone();
        before.extend(self.source_writer(ldo, version));

        let mut job = JobEntry::new(copy_job, JobKind::LocalCopy);
        job.worker = Some(worker);
        job.state = JobState::Assigned;
        job.before = before.clone();
        job.after.insert(reader);
        job.write = [ldo].into_iter().collect();
        job.write_versions.insert(ldo, version);
        job.copy_from = Some(from);
        job.copy_to = Some(to);
        job.bound = vec![from, to];
        self.graph.insert(job);
        self.graph.mark_assigned(copy_job, worker);
        self.physical.pin(from);
        self.physical.pin(to);

        let command = WorkerCommand::LocalCopy(LocalCopy {
            job_id: copy_job,
            from,
            to,
            before,
            after: [reader].into_iter().collect(),
            template: tag.clone(),
        });
        out.push((worker, command.clone()));
        if let Some(tag) = tag {
            self.record_mirror(tag, worker, &command);
        }
        if let Some(info) = self.workers.get_mut(&worker) {
            info.queue_depth += 1;
        }
        copy_job
    }

    /// Emit an unshared remote transfer into a specific destination
    /// instance (used for read-write bindings, which cannot share).
    #[allow(clippy::too_many_arguments)]
    fn emit_remote_copy_into(
        &mut self,
        ldo: LogicalDataId,
        version: DataVersion,
        from_worker: WorkerId,
        from: PhysicalDataId,
        to_worker: WorkerId,
        dest: PhysicalDataId,
        create_before: &BTreeSet<JobId>,
        reader: JobId,
        tag: &Option<TemplateTag>,
        out: &mut Outbox,
    ) -> JobId {
        let send_job = self.ids.next(IdDomain::Job);
        let receive_job = self.ids.next(IdDomain::Job);
        let send_before: BTreeSet<JobId> = self.source_writer(ldo, version).into_iter().collect();

        let mut send_entry = JobEntry::new(send_job, JobKind::RemoteCopySend);
        send_entry.worker = Some(from_worker);
        send_entry.state = JobState::Assigned;
        send_entry.before = send_before.clone();
        send_entry.after.insert(receive_job);
        send_entry.bound = vec![from];
        self.graph.insert(send_entry);
        self.graph.mark_assigned(send_job, from_worker);
        self.physical.pin(from);

        let mut receive_entry = JobEntry::new(receive_job, JobKind::RemoteCopyReceive);
        receive_entry.worker = Some(to_worker);
        receive_entry.state = JobState::Assigned;
        receive_entry.before = create_before.clone();
        receive_entry.before.insert(send_job);
        receive_entry.after.insert(reader);
        receive_entry.write = [ldo].into_iter().collect();
        receive_entry.write_versions.insert(ldo, version);
        receive_entry.copy_from = Some(from);
        receive_entry.copy_to = Some(dest);
        receive_entry.bound = vec![dest];
        self.graph.insert(receive_entry);
        self.graph.mark_assigned(receive_job, to_worker);
        self.physical.pin(dest);

        let send_command = WorkerCommand::RemoteCopySend(RemoteCopySend {
            job_id: send_job,
            receive_job_ids: vec![receive_job],
            from,
            to_worker,
            before: send_before,
            after: [receive_job].into_iter().collect(),
            template: tag.clone(),
        });
        let receive_command = WorkerCommand::RemoteCopyReceive(RemoteCopyReceive {
            job_id: receive_job,
            to: dest,
            before: create_before.clone(),
            after: [reader].into_iter().collect(),
            template: tag.clone(),
        });
        out.push((from_worker, send_command.clone()));
        out.push((to_worker, receive_command.clone()));
        if let Some(tag) = tag {
            self.record_mirror(tag, from_worker, &send_command);
            self.record_mirror(tag, to_worker, &receive_command);
        }
        for worker in [from_worker, to_worker] {
            if let Some(info) = self.workers.get_mut(&worker) {
                info.queue_depth += 1;
            }
        }
        receive_job
    }

    /// Join (or open) this round's shared transfer plan for (ldo, version)
    /// to the destination worker; returns the container job the reader must
    /// order after.
    #[allow(clippy::too_many_arguments)]
    fn join_remote_plan(
        &mut self,
        plans: &mut RoundPlans,
        ldo: LogicalDataId,
        version: DataVersion,
        from_worker: WorkerId,
        from_pdi: PhysicalDataId,
        to_worker: WorkerId,
        capacity: usize,
        reader: JobId,
        tag: &Option<TemplateTag>,
        out: &mut Outbox,
    ) -> Result<JobId> {
        if let Some(&index) = plans.index.get(&(ldo, version, to_worker)) {
            let receive_id = self.ids.next(IdDomain::Job);
            let plan = &mut plans.plans[index];
            plan.receive_ids.push(receive_id);
            plan.readers.insert(reader);
            return Ok(plan.container_job);
        }

        let (dest, create_job) = self.create_instance(to_worker, ldo, capacity, reader, out)?;
        let container_job = self.ids.next(IdDomain::Job);
        let receive_id = self.ids.next(IdDomain::Job);
        let index = plans.plans.len();
        plans.index.insert((ldo, version, to_worker), index);
        plans.plans.push(RemotePlan {
            ldo,
            version,
            from_worker,
            from_pdi,
            to_worker,
            dest_pdi: dest,
            container_job,
            receive_ids: vec![receive_id],
            create_before: create_job.into_iter().collect(),
            readers: [reader].into_iter().collect(),
            source_writer: self.source_writer(ldo, version),
            template: tag.clone(),
        });
        Ok(container_job)
    }

    fn plan_dest(
        &self,
        plans: &RoundPlans,
        ldo: LogicalDataId,
        version: DataVersion,
        worker: WorkerId,
    ) -> PhysicalDataId {
        plans
            .index
            .get(&(ldo, version, worker))
            .map(|&i| plans.plans[i].dest_pdi)
            .unwrap_or_default()
    }

    /// Emit the transfers planned this round: one send on the source worker
    /// and one receive (mega when multiplexed) on the destination.
    fn flush_remote_plans(&mut self, plans: RoundPlans, out: &mut Outbox) {
        for plan in plans.plans {
            let send_job = self.ids.next(IdDomain::Job);
            let send_before: BTreeSet<JobId> = plan.source_writer.into_iter().collect();

            let mut send_entry = JobEntry::new(send_job, JobKind::RemoteCopySend);
            send_entry.worker = Some(plan.from_worker);
            send_entry.state = JobState::Assigned;
            send_entry.before = send_before.clone();
            send_entry.after.insert(plan.container_job);
            send_entry.bound = vec![plan.from_pdi];
            self.graph.insert(send_entry);
            self.graph.mark_assigned(send_job, plan.from_worker);
            self.physical.pin(plan.from_pdi);

            let mut container_entry = if plan.receive_ids.len() == 1 {
                JobEntry::new(plan.container_job, JobKind::RemoteCopyReceive)
            } else {
                JobEntry::new(plan.container_job, JobKind::MegaRcr)
            };
            container_entry.worker = Some(plan.to_worker);
            container_entry.state = JobState::Assigned;
            container_entry.before = plan.create_before.clone();
            container_entry.before.insert(send_job);
            container_entry.after = plan.readers.clone();
            container_entry.write = [plan.ldo].into_iter().collect();
            container_entry.write_versions.insert(plan.ldo, plan.version);
            container_entry.copy_from = Some(plan.from_pdi);
            container_entry.copy_to = Some(plan.dest_pdi);
            container_entry.bound = vec![plan.dest_pdi];
            self.graph.insert(container_entry);
            self.graph.mark_assigned(plan.container_job, plan.to_worker);
            self.physical.pin(plan.dest_pdi);

            let receive_ids = if plan.receive_ids.len() == 1 {
                vec![plan.container_job]
            } else {
                plan.receive_ids.clone()
            };
            let send_command = WorkerCommand::RemoteCopySend(RemoteCopySend {
                job_id: send_job,
                receive_job_ids: receive_ids,
                from: plan.from_pdi,
                to_worker: plan.to_worker,
                before: send_before,
                after: [plan.container_job].into_iter().collect(),
                template: plan.template.clone(),
            });
            out.push((plan.from_worker, send_command.clone()));

            let receive_command = if plan.receive_ids.len() == 1 {
                WorkerCommand::RemoteCopyReceive(RemoteCopyReceive {
                    job_id: plan.container_job,
                    to: plan.dest_pdi,
                    before: plan.create_before.clone(),
                    after: plan.readers.clone(),
                    template: plan.template.clone(),
                })
            } else {
                WorkerCommand::MegaRcr(MegaRcr {
                    job_id: plan.container_job,
                    receives: plan
                        .receive_ids
                        .iter()
                        .map(|&id| (id, plan.dest_pdi))
                        .collect(),
                    before: plan.create_before.clone(),
                    after: plan.readers.clone(),
                    template: plan.template.clone(),
                })
            };
            out.push((plan.to_worker, receive_command.clone()));

            if let Some(tag) = &plan.template {
                self.record_mirror(tag, plan.from_worker, &send_command);
                self.record_mirror(tag, plan.to_worker, &receive_command);
            }
            for worker in [plan.from_worker, plan.to_worker] {
                if let Some(info) = self.workers.get_mut(&worker) {
                    info.queue_depth += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        command::{ControllerCommand, Handshake, JobDone, SpawnCompute, WorkerCapabilities},
        config::Config,
        geometry::GeometricRegion,
        ids::ROOT_JOB_ID,
    };

    fn cluster(capacities: &[usize]) -> Engine {
        let config = Config {
            min_workers: capacities.len(),
            checkpoint_interval: 0,
            ..Default::default()
        };
        let mut engine = Engine::new(config);
        let mut out = Vec::new();
        for (index, &capacity) in capacities.iter().enumerate() {
            engine
                .process_command(
                    None,
                    ControllerCommand::Handshake(Handshake {
                        worker_id: Some(index as WorkerId + 1),
                        address: format!("10.0.0.{}", index + 1),
                        port: 5801,
                        capabilities: WorkerCapabilities {
                            instance_capacity: capacity,
                            threads: 2,
                        },
                    }),
                    &mut out,
                )
                .unwrap();
        }
        engine
    }

    fn define_datum(engine: &mut Engine, ldo: LogicalDataId, side: i64) {
        engine
            .registry
            .define_partition(ldo as u32, GeometricRegion::new(0, 0, 0, side, side, side))
            .unwrap();
        engine
            .registry
            .define_data(&format!("datum-{ldo}"), ldo, ldo as u32, vec![])
            .unwrap();
    }

    fn spawn(
        engine: &mut Engine,
        out: &mut Outbox,
        job_id: JobId,
        read: &[LogicalDataId],
        write: &[LogicalDataId],
        before: &[JobId],
    ) {
        engine
            .process_command(
                None,
                ControllerCommand::SpawnCompute(SpawnCompute {
                    name: "probe".into(),
                    job_id,
                    read: read.iter().copied().collect(),
                    write: write.iter().copied().collect(),
                    before: before.iter().copied().collect(),
                    after: BTreeSet::new(),
                    parent: ROOT_JOB_ID,
                    future: None,
                    sterile: true,
                    region: None,
                    params: Bytes::new(),
                }),
                out,
            )
            .unwrap();
    }

    fn job_done(engine: &mut Engine, out: &mut Outbox, job_id: JobId) {
        engine
            .process_command(
                None,
                ControllerCommand::JobDone(JobDone {
                    job_id,
                    after: BTreeSet::new(),
                    params: Bytes::new(),
                    run_time: 0.1,
                    wait_time: 0.0,
                    failed: false,
                }),
                out,
            )
            .unwrap();
    }

    fn probe_entry(read: &[LogicalDataId], write: &[LogicalDataId]) -> JobEntry {
        let mut entry = JobEntry::new(999, JobKind::Compute { name: "probe".into() });
        entry.read = read.iter().copied().collect();
        entry.write = write.iter().copied().collect();
        entry
    }

    #[test]
    fn cost_prefers_the_worker_holding_the_required_version() {
        let mut engine = cluster(&[8, 8]);
        define_datum(&mut engine, 1, 4);
        // Worker 2 holds the version the reader needs; remote bytes make
        // worker 1 lose despite the id tiebreak favoring it.
        engine.physical.insert_new(100, 2, 1, 1);

        let entry = probe_entry(&[1], &[]);
        let versions: BTreeMap<LogicalDataId, DataVersion> = [(1, 1)].into_iter().collect();
        assert_eq!(engine.choose_worker(&entry, &versions).unwrap(), 2);
    }

    #[test]
    fn equal_costs_break_ties_by_worker_id() {
        let mut engine = cluster(&[8, 8]);
        define_datum(&mut engine, 1, 4);
        let entry = probe_entry(&[], &[1]);
        assert_eq!(engine.choose_worker(&entry, &BTreeMap::new()).unwrap(), 1);
    }

    #[test]
    fn queue_depth_raises_cost() {
        let mut engine = cluster(&[8, 8]);
        define_datum(&mut engine, 1, 4);
        engine.workers.get_mut(&1).unwrap().queue_depth = 3;
        let entry = probe_entry(&[], &[1]);
        assert_eq!(engine.choose_worker(&entry, &BTreeMap::new()).unwrap(), 2);
    }

    #[test]
    fn no_live_worker_surfaces_allocation_pressure() {
        let mut engine = cluster(&[8, 8]);
        define_datum(&mut engine, 1, 4);
        for worker in engine.workers.values_mut() {
            worker.alive = false;
        }
        let err = engine
            .choose_worker(&probe_entry(&[], &[1]), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, NimbusError::AllocationPressure { .. }));
    }

    #[test]
    fn read_write_binding_copies_into_a_private_instance() {
        let mut engine = cluster(&[8]);
        let mut out = Vec::new();
        define_datum(&mut engine, 1, 4);

        spawn(&mut engine, &mut out, 1001, &[], &[1], &[]);
        engine.assign_ready_jobs(&mut out).unwrap();
        let create = out
            .iter()
            .find_map(|(_, c)| match c {
                WorkerCommand::CreateData(create) => Some(create.clone()),
                _ => None,
            })
            .unwrap();
        job_done(&mut engine, &mut out, create.job_id);
        job_done(&mut engine, &mut out, 1001);

        spawn(&mut engine, &mut out, 1002, &[1], &[1], &[1001]);
        out.clear();
        assert_eq!(engine.assign_ready_jobs(&mut out).unwrap(), 1);

        let copy = out
            .iter()
            .find_map(|(_, c)| match c {
                WorkerCommand::LocalCopy(copy) => Some(copy.clone()),
                _ => None,
            })
            .unwrap();
        let compute = out
            .iter()
            .find_map(|(_, c)| match c {
                WorkerCommand::ComputeJob(compute) if compute.job_id == 1002 => {
                    Some(compute.clone())
                }
                _ => None,
            })
            .unwrap();

        // The required version is copied into a private destination, and the
        // kernel reads and overwrites that copy, ordered after the seed.
        assert_ne!(copy.to, copy.from);
        assert_eq!(compute.read, vec![copy.to]);
        assert_eq!(compute.write, vec![copy.to]);
        assert!(compute.before.contains(&copy.job_id));

        // The destination is claimed for version 2 and pinned until done.
        let dest = engine.physical.get(copy.to).unwrap();
        assert_eq!(dest.pending_writer, Some((1002, 2)));
        assert!(dest.pin_count > 0);
    }

    #[test]
    fn co_ready_readers_share_a_plan_and_flush_as_mega() {
        let mut engine = cluster(&[8, 8]);
        define_datum(&mut engine, 1, 4);
        engine.physical.insert_new(100, 1, 1, 1);

        let mut plans = RoundPlans::default();
        let mut out = Vec::new();
        let first = engine
            .join_remote_plan(&mut plans, 1, 1, 1, 100, 2, 8, 1003, &None, &mut out)
            .unwrap();
        let second = engine
            .join_remote_plan(&mut plans, 1, 1, 1, 100, 2, 8, 1004, &None, &mut out)
            .unwrap();

        // Same (datum, version, destination): one shared container.
        assert_eq!(first, second);
        assert_eq!(plans.plans.len(), 1);
        assert_eq!(plans.plans[0].receive_ids.len(), 2);
        let dest = engine.plan_dest(&plans, 1, 1, 2);
        assert_eq!(dest, plans.plans[0].dest_pdi);

        // A different version opens its own transfer.
        let third = engine
            .join_remote_plan(&mut plans, 1, 2, 1, 101, 2, 8, 1005, &None, &mut out)
            .unwrap();
        assert_ne!(third, first);

        out.clear();
        engine.flush_remote_plans(plans, &mut out);
        let sends: Vec<_> = out
            .iter()
            .filter_map(|(w, c)| match c {
                WorkerCommand::RemoteCopySend(send) => Some((*w, send.clone())),
                _ => None,
            })
            .collect();
        let megas: Vec<_> = out
            .iter()
            .filter_map(|(w, c)| match c {
                WorkerCommand::MegaRcr(mega) => Some((*w, mega.clone())),
                _ => None,
            })
            .collect();
        let singles: Vec<_> = out
            .iter()
            .filter_map(|(w, c)| match c {
                WorkerCommand::RemoteCopyReceive(receive) => Some((*w, receive.clone())),
                _ => None,
            })
            .collect();

        // The shared plan flushes as one send carrying both receive ids and
        // one mega receive; the solo plan stays a plain receive addressed by
        // its container id.
        assert_eq!(sends.len(), 2);
        assert_eq!(megas.len(), 1);
        assert_eq!(singles.len(), 1);
        let mega = &megas[0].1;
        assert_eq!(mega.job_id, first);
        assert_eq!(mega.receives.len(), 2);
        assert!(mega.receives.iter().all(|&(_, pdi)| pdi == dest));
        assert_eq!(singles[0].1.job_id, third);
        let mega_send = sends.iter().find(|(_, s)| s.receive_job_ids.len() == 2).unwrap();
        let solo_send = sends
            .iter()
            .find(|(_, s)| s.receive_job_ids == vec![third])
            .unwrap();
        assert_eq!(mega_send.0, 1);
        assert_eq!(mega_send.1.to_worker, 2);
        assert_eq!(solo_send.1.to_worker, 2);
    }

    #[test]
    fn allocation_pressure_leaves_the_task_ready_for_the_next_round() {
        let mut engine = cluster(&[1]);
        let mut out = Vec::new();
        define_datum(&mut engine, 1, 2);
        // The single instance slot is held by a pinned instance.
        engine.physical.insert_new(100, 1, 9, 0);
        engine.physical.pin(100);

        spawn(&mut engine, &mut out, 1003, &[], &[1], &[]);
        assert_eq!(engine.assign_ready_jobs(&mut out).unwrap(), 0);
        let entry = engine.graph.entry(1003).unwrap();
        assert_eq!(entry.state, JobState::Ready);
        assert_eq!(entry.worker, None);

        // Unpinning makes the instance evictable; the retry succeeds.
        engine.physical.unpin(100);
        assert_eq!(engine.assign_ready_jobs(&mut out).unwrap(), 1);
        assert_eq!(engine.graph.entry(1003).unwrap().state, JobState::Assigned);
    }
}
