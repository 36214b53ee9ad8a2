//! The worker runtime.
//!
//! A worker hosts physical data instances and executes the commands the
//! controller resolves for it. One scheduler-client task owns the routing
//! state: it drains the worker's command and data endpoints, feeds tagged
//! command sequences into execution templates, tracks direct (untemplated)
//! tasks in a small dependency table, and pushes released tasks into a pool
//! of executor tasks. Kernels run to completion on blocking threads;
//! cancellation is template-wide rewind, never per task.
//!
//! Completions flow back through the same task: direct tasks report an
//! individual job-done upward; template tasks are rolled up into a single
//! mega-job-done per instantiation by the execution template.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::{
    command::{
        ControllerCommand, DataMessage, Handshake, JobDone, MegaRcr, RemoteCopyReceive,
        SaveDataDone, WorkerCapabilities, WorkerCommand,
    },
    config::Config,
    error::NimbusError,
    execution::{ExecutionTemplate, ReadyJob, ReceiveEvent, ResolvedTask},
    ids::{CheckpointId, ExitStatus, JobId, PhysicalDataId, WorkerId},
    kernel::KernelRegistry,
    retry::RetryStrategy,
    serializer::Serializer,
    transport::{controller_endpoint, data_endpoint, worker_endpoint, BusEndpoint, CommandBus},
};

/// What an executor task runs. Template tasks arrive pre-resolved; direct
/// commands resolve into the same shapes plus the create/save/load kinds a
/// template never contains.
#[derive(Clone, Debug)]
enum WorkerTask {
    Resolved(ResolvedTask),
    Create { pdi: PhysicalDataId },
    Save { checkpoint: CheckpointId, from: PhysicalDataId },
    Load { to: PhysicalDataId, handle: Bytes },
}

#[derive(Clone, Debug)]
struct RunnableJob {
    job_id: JobId,
    /// Template name when released by an execution template.
    template: Option<String>,
    task: WorkerTask,
    queued_at: Instant,
}

/// One direct task waiting for its preconditions.
struct PendingDirect {
    task: WorkerTask,
    remaining: usize,
    deliveries: Vec<(PhysicalDataId, Bytes)>,
    /// Destination instance per expected receive id; the sender does not
    /// know it, so the receiving side resolves it.
    dest_of_receive: HashMap<JobId, PhysicalDataId>,
}

/// Dependency table for untemplated tasks: a task releases when every
/// before-id is done and, for receives, every delivery has landed.
#[derive(Default)]
struct DirectTable {
    pending: HashMap<JobId, PendingDirect>,
    waiters: HashMap<JobId, Vec<JobId>>,
    done: HashSet<JobId>,
    /// receive-job-id -> waiting receive task.
    receives: HashMap<JobId, JobId>,
    /// Deliveries that arrived before their receive command.
    early: Vec<DataMessage>,
}

impl DirectTable {
    fn admit(
        &mut self,
        job_id: JobId,
        before: &BTreeSet<JobId>,
        receive_dests: &[(JobId, PhysicalDataId)],
        task: WorkerTask,
    ) -> Vec<RunnableJob> {
        let mut remaining = receive_dests.len();
        for &dep in before {
            if !self.done.contains(&dep) {
                remaining += 1;
                self.waiters.entry(dep).or_default().push(job_id);
            }
        }
        for &(receive, _) in receive_dests {
            self.receives.insert(receive, job_id);
        }
        self.pending.insert(
            job_id,
            PendingDirect {
                task,
                remaining,
                deliveries: Vec::new(),
                dest_of_receive: receive_dests.iter().copied().collect(),
            },
        );

        let mut released = Vec::new();
        // Deliveries may have raced the command.
        let early = std::mem::take(&mut self.early);
        for message in early {
            if self.receives.get(&message.receive_job_id) == Some(&job_id) {
                released.extend(self.deliver(message));
            } else {
                self.early.push(message);
            }
        }
        released.extend(self.release_if_ready(job_id, 0));
        released
    }

    fn deliver(&mut self, message: DataMessage) -> Vec<RunnableJob> {
        let Some(&job_id) = self.receives.get(&message.receive_job_id) else {
            self.early.push(message);
            return Vec::new();
        };
        if let Some(pending) = self.pending.get_mut(&job_id) {
            let dest = pending
                .dest_of_receive
                .get(&message.receive_job_id)
                .copied()
                .unwrap_or(message.to_physical_id);
            pending.deliveries.push((dest, message.data));
            return self.release_if_ready(job_id, 1);
        }
        Vec::new()
    }

    fn complete(&mut self, job_id: JobId) -> Vec<RunnableJob> {
        if !self.done.insert(job_id) {
            return Vec::new();
        }
        let mut released = Vec::new();
        for waiter in self.waiters.remove(&job_id).unwrap_or_default() {
            released.extend(self.release_if_ready(waiter, 1));
        }
        released
    }

    fn release_if_ready(&mut self, job_id: JobId, decrement: usize) -> Vec<RunnableJob> {
        let Some(pending) = self.pending.get_mut(&job_id) else {
            return Vec::new();
        };
        pending.remaining = pending.remaining.saturating_sub(decrement);
        if pending.remaining > 0 {
            return Vec::new();
        }
        let mut pending = self.pending.remove(&job_id).expect("checked above");
        // Attach buffered deliveries to the receive task.
        let task = match pending.task {
            WorkerTask::Resolved(ResolvedTask::RemoteCopyReceive { .. }) => {
                WorkerTask::Resolved(ResolvedTask::RemoteCopyReceive {
                    deliveries: std::mem::take(&mut pending.deliveries),
                })
            }
            WorkerTask::Resolved(ResolvedTask::MegaRcr { .. }) => {
                WorkerTask::Resolved(ResolvedTask::MegaRcr {
                    deliveries: std::mem::take(&mut pending.deliveries),
                })
            }
            task => task,
        };
        vec![RunnableJob {
            job_id,
            template: None,
            task,
            queued_at: Instant::now(),
        }]
    }
}

/// Outcome of one executed task, reported back to the routing loop.
struct Finished {
    job_id: JobId,
    template: Option<String>,
    run_time: f64,
    wait_time: f64,
    save: Option<(CheckpointId, Bytes)>,
    failed: bool,
}

pub struct WorkerRuntime<B: CommandBus> {
    id: WorkerId,
    config: Config,
    serializer: Serializer,
    bus: B,
    kernels: KernelRegistry,
    /// Instance contents, keyed by physical id.
    store: Arc<DashMap<PhysicalDataId, Bytes>>,
    /// Persisted snapshots, keyed by opaque handle.
    snapshots: Arc<DashMap<Bytes, Bytes>>,
    templates: HashMap<String, Arc<Mutex<ExecutionTemplate>>>,
    direct: DirectTable,
}

impl<B: CommandBus + Clone> WorkerRuntime<B> {
    pub fn new(id: WorkerId, config: Config, bus: B, kernels: KernelRegistry) -> Self {
        let serializer = Serializer::from(&config);
        Self {
            id,
            config,
            serializer,
            bus,
            kernels,
            store: Arc::new(DashMap::new()),
            snapshots: Arc::new(DashMap::new()),
            templates: HashMap::new(),
            direct: DirectTable::default(),
        }
    }

    /// Register with the controller and process commands until terminated.
    /// Returns the exit status the controller propagated.
    #[instrument(skip(self), fields(worker = self.id))]
    pub async fn main_loop(mut self) -> Result<ExitStatus> {
        let controller = self.bus.endpoint(&controller_endpoint()).await?;
        let commands = self.bus.endpoint(&worker_endpoint(self.id)).await?;
        let data = self.bus.endpoint(&data_endpoint(self.id)).await?;
        let mut command_stream = commands.stream().await?;
        let mut data_stream = data.stream().await?;

        self.send_handshake(&controller).await?;
        let mut handshake_timer =
            tokio::time::interval(Duration::from_millis(self.config.handshake_interval_ms));
        handshake_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut running: JoinSet<Finished> = JoinSet::new();
        loop {
            tokio::select! {
                frame = command_stream.next() => {
                    let Some(frame) = frame else { break };
                    let command = WorkerCommand::from_frame(&frame, self.serializer)?;
                    if let WorkerCommand::Terminate(terminate) = &command {
                        info!(exit_status = terminate.exit_status, "terminating");
                        running.abort_all();
                        return Ok(terminate.exit_status);
                    }
                    let released = self.handle_command(command, &controller).await?;
                    self.spawn_all(released, &mut running);
                }
                frame = data_stream.next() => {
                    let Some(frame) = frame else { break };
                    let message = DataMessage::from_frame(&frame, self.serializer)?;
                    let released = self.handle_data(message);
                    self.spawn_all(released, &mut running);
                }
                Some(finished) = running.join_next(), if !running.is_empty() => {
                    let finished = finished?;
                    let released = self.handle_finished(finished, &controller).await?;
                    self.spawn_all(released, &mut running);
                }
                _ = handshake_timer.tick() => {
                    self.send_handshake(&controller).await?;
                }
            }
        }
        Ok(0)
    }

    async fn send_handshake(&self, controller: &B::Endpoint) -> Result<()> {
        let handshake = ControllerCommand::Handshake(Handshake {
            worker_id: Some(self.id),
            address: "127.0.0.1".to_string(),
            port: self.config.port,
            capabilities: WorkerCapabilities {
                instance_capacity: self.config.instance_capacity,
                threads: self.config.worker_threads,
            },
        });
        self.publish(controller, handshake).await
    }

    /// Publish upward, retrying through transient backpressure.
    async fn publish(&self, endpoint: &B::Endpoint, command: ControllerCommand) -> Result<()> {
        let frame = command.to_frame(self.serializer)?;
        RetryStrategy::default()
            .retry(|| {
                let frame = frame.clone();
                async move { endpoint.try_publish(frame) }
            })
            .await
            .map_err(|err: NimbusError| anyhow::anyhow!(err))
    }

    fn template(&mut self, name: &str) -> Arc<Mutex<ExecutionTemplate>> {
        self.templates
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ExecutionTemplate::new(name))))
            .clone()
    }

    async fn handle_command(
        &mut self,
        command: WorkerCommand,
        controller: &B::Endpoint,
    ) -> Result<Vec<RunnableJob>> {
        match command {
            WorkerCommand::HandshakeAck(_) => Ok(Vec::new()),

            // Tagged commands record into the execution template being built
            // and still execute directly this generation.
            WorkerCommand::ComputeJob(compute) => {
                if let Some(tag) = &compute.template {
                    let template = self.template(&tag.name);
                    if let Err(err) = template.lock().add_compute_job_template(&compute) {
                        warn!(%err, "could not record compute task");
                    };
                }
                Ok(self.direct.admit(
                    compute.job_id,
                    &compute.before,
                    &[],
                    WorkerTask::Resolved(ResolvedTask::Compute {
                        name: compute.name,
                        read: compute.read,
                        write: compute.write,
                        params: compute.params,
                    }),
                ))
            }
            WorkerCommand::CombineJob(combine) => {
                if let Some(tag) = &combine.template {
                    let template = self.template(&tag.name);
                    if let Err(err) = template.lock().add_combine_job_template(&combine) {
                        warn!(%err, "could not record combine task");
                    };
                }
                Ok(self.direct.admit(
                    combine.job_id,
                    &combine.before,
                    &[],
                    WorkerTask::Resolved(ResolvedTask::Combine {
                        scratch: combine.scratch,
                        reduce: combine.reduce,
                        params: Bytes::new(),
                    }),
                ))
            }
            WorkerCommand::LocalCopy(copy) => {
                if let Some(tag) = &copy.template {
                    let template = self.template(&tag.name);
                    if let Err(err) = template.lock().add_local_copy_job_template(&copy) {
                        warn!(%err, "could not record local copy");
                    };
                }
                Ok(self.direct.admit(
                    copy.job_id,
                    &copy.before,
                    &[],
                    WorkerTask::Resolved(ResolvedTask::LocalCopy {
                        from: copy.from,
                        to: copy.to,
                    }),
                ))
            }
            WorkerCommand::RemoteCopySend(send) => {
                if let Some(tag) = &send.template {
                    let template = self.template(&tag.name);
                    if let Err(err) = template.lock().add_remote_copy_send_job_template(&send) {
                        warn!(%err, "could not record remote copy send");
                    };
                }
                let generation = send.template.as_ref().map(|t| t.generation).unwrap_or(0);
                Ok(self.direct.admit(
                    send.job_id,
                    &send.before,
                    &[],
                    WorkerTask::Resolved(ResolvedTask::RemoteCopySend {
                        from: send.from,
                        to_worker: send.to_worker,
                        receive_job_ids: send.receive_job_ids,
                        generation,
                    }),
                ))
            }
            WorkerCommand::RemoteCopyReceive(receive) => {
                if let Some(tag) = &receive.template {
                    let template = self.template(&tag.name);
                    if let Err(err) =
                        template.lock().add_remote_copy_receive_job_template(&receive)
                    {
                        warn!(%err, "could not record remote copy receive");
                    };
                }
                let RemoteCopyReceive { job_id, to, before, .. } = receive;
                Ok(self.direct.admit(
                    job_id,
                    &before,
                    &[(job_id, to)],
                    WorkerTask::Resolved(ResolvedTask::RemoteCopyReceive {
                        deliveries: Vec::new(),
                    }),
                ))
            }
            WorkerCommand::MegaRcr(mega) => {
                if let Some(tag) = &mega.template {
                    let template = self.template(&tag.name);
                    if let Err(err) = template.lock().add_mega_rcr_job_template(&mega) {
                        warn!(%err, "could not record mega receive");
                    };
                }
                let MegaRcr { job_id, receives, before, .. } = mega;
                Ok(self.direct.admit(
                    job_id,
                    &before,
                    &receives,
                    WorkerTask::Resolved(ResolvedTask::MegaRcr { deliveries: Vec::new() }),
                ))
            }
            WorkerCommand::CreateData(create) => Ok(self.direct.admit(
                create.job_id,
                &create.before,
                &[],
                WorkerTask::Create { pdi: create.pdi },
            )),
            WorkerCommand::SaveData(save) => Ok(self.direct.admit(
                save.job_id,
                &save.before,
                &[],
                WorkerTask::Save {
                    checkpoint: save.checkpoint,
                    from: save.from,
                },
            )),
            WorkerCommand::LoadData(load) => Ok(self.direct.admit(
                load.job_id,
                &load.before,
                &[],
                WorkerTask::Load {
                    to: load.to,
                    handle: load.handle,
                },
            )),

            WorkerCommand::FinalizeTemplate(finalize) => {
                let template = self.template(&finalize.name);
                if let Err(err) = template.lock().finalize() {
                    warn!(%err, template = %finalize.name, "finalize failed");
                } else {
                    debug!(template = %finalize.name, "execution template finalized");
                }
                Ok(Vec::new())
            }
            WorkerCommand::InstantiateTemplate(instantiate) => {
                let template = self.template(&instantiate.name);
                let ready = template.lock().instantiate(
                    &instantiate.inner,
                    &instantiate.outer,
                    &instantiate.extra_dependency,
                    &instantiate.params,
                    &instantiate.physical,
                    Vec::new(),
                    instantiate.generation,
                    &[],
                );
                match ready {
                    Ok(ready) => {
                        Ok(self.adopt_template_jobs(&instantiate.name, ready))
                    }
                    Err(err) => {
                        warn!(%err, template = %instantiate.name, "instantiation failed");
                        Ok(Vec::new())
                    }
                }
            }
            WorkerCommand::PrepareRewind(rewind) => {
                for name in rewind.templates {
                    if let Some(template) = self.templates.get(&name) {
                        template.lock().prepare_rewind();
                    }
                }
                Ok(Vec::new())
            }
            WorkerCommand::JobDoneRelay(relay) => {
                let mut released = self.direct.complete(relay.job_id);
                released.extend(self.notify_templates(relay.job_id, controller).await?);
                Ok(released)
            }
            WorkerCommand::Terminate(_) => unreachable!("handled by the main loop"),
        }
    }

    fn handle_data(&mut self, message: DataMessage) -> Vec<RunnableJob> {
        // Direct receives route by receive id; template deliveries by
        // template routing tables.
        if message.generation == 0 {
            return self.direct.deliver(message);
        }
        let event = ReceiveEvent {
            generation: message.generation,
            receive_job_id: message.receive_job_id,
            to_physical_id: message.to_physical_id,
            data: message.data,
        };
        for (name, template) in &self.templates {
            let mut guard = template.lock();
            if guard.routes_receive(&event) {
                let ready = guard.process_receive_event(event);
                let name = name.clone();
                drop(guard);
                return self.adopt_template_jobs(&name, ready);
            }
        }
        warn!(receive = event.receive_job_id, "delivery matched no receive");
        Vec::new()
    }

    /// Completion fan-in: apply template bookkeeping and report upward.
    async fn handle_finished(
        &mut self,
        finished: Finished,
        controller: &B::Endpoint,
    ) -> Result<Vec<RunnableJob>> {
        let mut released = Vec::new();
        if let Some((checkpoint, handle)) = finished.save {
            self.publish(
                controller,
                ControllerCommand::SaveDataDone(SaveDataDone {
                    job_id: finished.job_id,
                    checkpoint,
                    handle,
                }),
            )
            .await?;
            released.extend(self.direct.complete(finished.job_id));
            return Ok(released);
        }

        match finished.template {
            Some(name) => {
                let template = self.template(&name);
                let outcome = template.lock().notify_job_done(finished.job_id);
                released.extend(self.adopt_template_jobs(&name, outcome.ready));
                // Direct tasks may order after template jobs.
                released.extend(self.direct.complete(finished.job_id));
                if let Some(mega) = outcome.mega_job_done {
                    self.publish(controller, ControllerCommand::MegaJobDone(mega))
                        .await?;
                }
            }
            None => {
                released.extend(self.direct.complete(finished.job_id));
                // Direct completions may also satisfy template dependencies.
                released.extend(self.notify_templates(finished.job_id, controller).await?);
                self.publish(
                    controller,
                    ControllerCommand::JobDone(JobDone {
                        job_id: finished.job_id,
                        after: BTreeSet::new(),
                        params: Bytes::new(),
                        run_time: finished.run_time,
                        wait_time: finished.wait_time,
                        failed: finished.failed,
                    }),
                )
                .await?;
            }
        }
        Ok(released)
    }

    async fn notify_templates(
        &mut self,
        job_id: JobId,
        controller: &B::Endpoint,
    ) -> Result<Vec<RunnableJob>> {
        let mut released = Vec::new();
        let templates: Vec<(String, Arc<Mutex<ExecutionTemplate>>)> = self
            .templates
            .iter()
            .map(|(name, template)| (name.clone(), template.clone()))
            .collect();
        for (name, template) in templates {
            let outcome = template.lock().notify_job_done(job_id);
            released.extend(self.adopt_template_jobs(&name, outcome.ready));
            if let Some(mega) = outcome.mega_job_done {
                self.publish(controller, ControllerCommand::MegaJobDone(mega))
                    .await?;
            }
        }
        Ok(released)
    }

    fn adopt_template_jobs(&self, name: &str, ready: Vec<ReadyJob>) -> Vec<RunnableJob> {
        ready
            .into_iter()
            .map(|job| RunnableJob {
                job_id: job.job_id,
                template: Some(name.to_string()),
                task: WorkerTask::Resolved(job.task),
                queued_at: Instant::now(),
            })
            .collect()
    }

    fn spawn_all(&mut self, jobs: Vec<RunnableJob>, running: &mut JoinSet<Finished>) {
        for job in jobs {
            let store = self.store.clone();
            let snapshots = self.snapshots.clone();
            let kernels = self.kernels.clone();
            let serializer = self.serializer;
            let bus_data = BusHandles {
                bus: self.bus.clone(),
                serializer,
            };
            let worker = self.id;
            running.spawn(async move {
                execute_task(job, worker, store, snapshots, kernels, bus_data).await
            });
        }
    }
}

/// What an executor needs to push data to peer workers.
struct BusHandles<B> {
    bus: B,
    serializer: Serializer,
}

async fn execute_task<B: CommandBus + Clone>(
    job: RunnableJob,
    worker: WorkerId,
    store: Arc<DashMap<PhysicalDataId, Bytes>>,
    snapshots: Arc<DashMap<Bytes, Bytes>>,
    kernels: KernelRegistry,
    bus: BusHandles<B>,
) -> Finished {
    let wait_time = job.queued_at.elapsed().as_secs_f64();
    let started = Instant::now();
    let mut save = None;
    let mut failed = false;

    let result: Result<()> = match job.task {
        WorkerTask::Resolved(ResolvedTask::Compute { name, read, write, params }) => {
            run_kernel(&kernels, &name, &params, &read, &write, &store).await
        }
        WorkerTask::Resolved(ResolvedTask::Combine { scratch, reduce, params }) => {
            run_kernel(&kernels, "combine", &params, &scratch, &reduce, &store).await
        }
        WorkerTask::Resolved(ResolvedTask::LocalCopy { from, to }) => {
            let content = store.get(&from).map(|e| e.value().clone()).unwrap_or_default();
            store.insert(to, content);
            Ok(())
        }
        WorkerTask::Resolved(ResolvedTask::RemoteCopySend {
            from,
            to_worker,
            receive_job_ids,
            generation,
        }) => {
            let content = store.get(&from).map(|e| e.value().clone()).unwrap_or_default();
            send_data(&bus, to_worker, receive_job_ids, generation, content).await
        }
        WorkerTask::Resolved(ResolvedTask::RemoteCopyReceive { deliveries })
        | WorkerTask::Resolved(ResolvedTask::MegaRcr { deliveries }) => {
            for (pdi, data) in deliveries {
                store.insert(pdi, data);
            }
            Ok(())
        }
        WorkerTask::Create { pdi } => {
            store.insert(pdi, Bytes::new());
            Ok(())
        }
        WorkerTask::Save { checkpoint, from } => {
            let content = store.get(&from).map(|e| e.value().clone()).unwrap_or_default();
            let handle = Bytes::from(format!("snap-{worker}-{}", job.job_id));
            snapshots.insert(handle.clone(), content);
            save = Some((checkpoint, handle));
            Ok(())
        }
        WorkerTask::Load { to, handle } => {
            let content = snapshots.get(&handle).map(|e| e.value().clone()).unwrap_or_default();
            store.insert(to, content);
            Ok(())
        }
    };

    if let Err(err) = result {
        warn!(job = job.job_id, %err, "task failed");
        failed = true;
    }

    Finished {
        job_id: job.job_id,
        template: job.template,
        run_time: started.elapsed().as_secs_f64(),
        wait_time,
        save,
        failed,
    }
}

async fn run_kernel(
    kernels: &KernelRegistry,
    name: &str,
    params: &Bytes,
    read: &[PhysicalDataId],
    write: &[PhysicalDataId],
    store: &Arc<DashMap<PhysicalDataId, Bytes>>,
) -> Result<()> {
    let kernel = kernels.get(name)?;
    let inputs: Vec<Bytes> = read
        .iter()
        .map(|pdi| store.get(pdi).map(|e| e.value().clone()).unwrap_or_default())
        .collect();
    let params = params.clone();
    let write_count = write.len();
    // Kernels are compute-heavy and never suspended mid-task.
    let outputs = tokio::task::spawn_blocking(move || {
        kernel.execute(&params, &inputs, write_count)
    })
    .await??;
    for (pdi, output) in write.iter().zip(outputs) {
        store.insert(*pdi, output);
    }
    Ok(())
}

async fn send_data<B: CommandBus>(
    bus: &BusHandles<B>,
    to_worker: WorkerId,
    receive_job_ids: Vec<JobId>,
    generation: u64,
    content: Bytes,
) -> Result<()> {
    let endpoint = bus.bus.endpoint(&data_endpoint(to_worker)).await?;
    for receive_job_id in receive_job_ids {
        let message = DataMessage {
            generation,
            receive_job_id,
            // The receiving side resolves the destination instance from its
            // own routing tables; echo zero when unknown.
            to_physical_id: 0,
            data: content.clone(),
        };
        endpoint.publish(message.to_frame(bus.serializer)?).await?;
    }
    Ok(())
}
