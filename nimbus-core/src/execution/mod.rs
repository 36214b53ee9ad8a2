//! Worker-side execution templates.
//!
//! Rebuilding a task graph for every simulation frame dominates the fast
//! path; an execution template builds it once. During the recording
//! generation the worker turns each tagged command into a job-template node;
//! finalize freezes the structure; every later instantiation is a parameter
//! refresh: the inner-job, outer-job and physical-id slot tables are
//! refilled, counters reset, buffered data events drained, and the seed
//! nodes released.
//!
//! Nodes live in an arena (a vector indexed by node id) and reference each
//! other through indices, never owning pointers: after-set edges fan out
//! completion by decrementing `dependency_counter` on downstream nodes, and
//! a node releases when the counter reaches its static `dependency_num`
//! (before-set size, plus one delivery for a remote-copy receive, plus one
//! per multiplexed transfer for a mega receive).
//!
//! Incoming data is routed by (generation, receive-job-id or physical id).
//! Receive-job routing keys are the recording-time ids, which stay stable
//! across generations; the generation tag disambiguates instantiations.
//! Events for a newer generation, or arriving before instantiation, are
//! buffered; events for an older generation are discarded.

use std::collections::{BTreeSet, HashMap, HashSet};

use bytes::Bytes;
use tracing::warn;

use crate::{
    command::{
        CombineJob, ComputeJob, LocalCopy, MegaJobDone, MegaRcr, RemoteCopyReceive,
        RemoteCopySend, TemplateTag,
    },
    error::{NimbusError, Result},
    ids::{JobId, PhysicalDataId, TemplateGenerationId, WorkerId},
};

/// A data delivery for a remote copy, as seen by the receiving worker.
#[derive(Clone, Debug)]
pub struct ReceiveEvent {
    pub generation: TemplateGenerationId,
    pub receive_job_id: JobId,
    pub to_physical_id: PhysicalDataId,
    pub data: Bytes,
}

/// Marks an inner slot whose task was migrated to another worker for this
/// instantiation; the node is not released locally and completes through a
/// controller-relayed notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateExtension {
    pub inner_slot: usize,
}

/// A task released by the template, with physical ids and parameters
/// resolved for the current generation.
#[derive(Clone, Debug)]
pub struct ReadyJob {
    pub job_id: JobId,
    pub task: ResolvedTask,
}

#[derive(Clone, Debug)]
pub enum ResolvedTask {
    Compute {
        name: String,
        read: Vec<PhysicalDataId>,
        write: Vec<PhysicalDataId>,
        params: Bytes,
    },
    Combine {
        scratch: Vec<PhysicalDataId>,
        reduce: Vec<PhysicalDataId>,
        params: Bytes,
    },
    LocalCopy {
        from: PhysicalDataId,
        to: PhysicalDataId,
    },
    RemoteCopySend {
        from: PhysicalDataId,
        to_worker: WorkerId,
        receive_job_ids: Vec<JobId>,
        generation: TemplateGenerationId,
    },
    /// Deliveries already buffered for the receive, ready to apply.
    RemoteCopyReceive {
        deliveries: Vec<(PhysicalDataId, Bytes)>,
    },
    MegaRcr {
        deliveries: Vec<(PhysicalDataId, Bytes)>,
    },
}

/// Everything produced by one completion notification.
#[derive(Debug, Default)]
pub struct NotifyOutcome {
    pub ready: Vec<ReadyJob>,
    /// Present once per instantiation, when the last inner job completes.
    pub mega_job_done: Option<MegaJobDone>,
}

#[derive(Clone, Debug)]
enum NodeKind {
    Compute {
        name: String,
        read: Vec<usize>,
        write: Vec<usize>,
    },
    Combine {
        scratch: Vec<usize>,
        reduce: Vec<usize>,
    },
    LocalCopy {
        from: usize,
        to: usize,
    },
    RemoteCopySend {
        from: usize,
        to_worker: WorkerId,
        receive_job_ids: Vec<JobId>,
    },
    RemoteCopyReceive {
        to: usize,
    },
    MegaRcr {
        /// (recording-time receive id, destination physical slot).
        receives: Vec<(JobId, usize)>,
    },
}

#[derive(Clone, Debug)]
struct JobNode {
    kind: NodeKind,
    /// Recording-time before-set, resolved into edges at finalize.
    before: BTreeSet<JobId>,
    dependency_num: usize,
    dependency_counter: usize,
    after: Vec<usize>,
    pending_data: Vec<(usize, Bytes)>,
    done: bool,
}

#[derive(Debug)]
struct PendingInstantiate {
    inner: Vec<JobId>,
    outer: Vec<JobId>,
    extra_dependency: BTreeSet<JobId>,
    params: Vec<Bytes>,
    physical: Vec<PhysicalDataId>,
    generation: TemplateGenerationId,
    extensions: Vec<TemplateExtension>,
}

/// A pre-wired, parameter-refreshable task graph for one named template on
/// one worker.
#[derive(Debug)]
pub struct ExecutionTemplate {
    name: String,
    finalized: bool,
    active: bool,
    rewind: bool,
    generation: TemplateGenerationId,

    // Slot tables, mass-refilled at instantiation. A node references slots
    // by index; node index i owns inner slot i.
    inner_slots: Vec<JobId>,
    outer_slots: Vec<JobId>,
    phy_slots: Vec<PhysicalDataId>,

    // Recording-time indices, fixed once finalized.
    build_inner_index: HashMap<JobId, usize>,
    build_outer_index: HashMap<JobId, usize>,
    build_phy_index: HashMap<PhysicalDataId, usize>,
    /// Per outer slot, the nodes depending on it.
    outer_dependents: Vec<Vec<usize>>,
    /// Recording-time receive id -> node. Stable routing key.
    rcr_routing: HashMap<JobId, usize>,

    // Per-generation indices, rebuilt at instantiation.
    runtime_job_index: HashMap<JobId, usize>,
    runtime_outer_index: HashMap<JobId, usize>,
    phy_routing: HashMap<PhysicalDataId, usize>,

    nodes: Vec<JobNode>,
    seed_nodes: Vec<usize>,

    extra_dependency: BTreeSet<JobId>,
    blocked_on_extra: Vec<ReadyJob>,
    parameters: Vec<Bytes>,
    migrated: HashSet<usize>,

    job_done_counter: usize,
    ready_job_counter: usize,
    compute_job_num: usize,
    copy_job_num: usize,

    pending_instantiate: Option<PendingInstantiate>,
    pending_events: Vec<ReceiveEvent>,
}

impl ExecutionTemplate {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            finalized: false,
            active: false,
            rewind: false,
            generation: 0,
            inner_slots: Vec::new(),
            outer_slots: Vec::new(),
            phy_slots: Vec::new(),
            build_inner_index: HashMap::new(),
            build_outer_index: HashMap::new(),
            build_phy_index: HashMap::new(),
            outer_dependents: Vec::new(),
            rcr_routing: HashMap::new(),
            runtime_job_index: HashMap::new(),
            runtime_outer_index: HashMap::new(),
            phy_routing: HashMap::new(),
            nodes: Vec::new(),
            seed_nodes: Vec::new(),
            extra_dependency: BTreeSet::new(),
            blocked_on_extra: Vec::new(),
            parameters: Vec::new(),
            migrated: HashSet::new(),
            job_done_counter: 0,
            ready_job_counter: 0,
            compute_job_num: 0,
            copy_job_num: 0,
            pending_instantiate: None,
            pending_events: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn generation(&self) -> TemplateGenerationId {
        self.generation
    }

    pub fn job_num(&self) -> usize {
        self.nodes.len()
    }

    pub fn compute_job_num(&self) -> usize {
        self.compute_job_num
    }

    pub fn copy_job_num(&self) -> usize {
        self.copy_job_num
    }

    pub fn ready_job_counter(&self) -> usize {
        self.ready_job_counter
    }

    pub fn pending_instantiate(&self) -> bool {
        self.pending_instantiate.is_some()
    }

    /// The static precondition count of node `index`.
    pub fn dependency_num(&self, index: usize) -> Option<usize> {
        self.nodes.get(index).map(|n| n.dependency_num)
    }

    /// Whether a delivery would route to one of this template's receive
    /// nodes.
    pub fn routes_receive(&self, event: &ReceiveEvent) -> bool {
        self.rcr_routing.contains_key(&event.receive_job_id)
            || self.phy_routing.contains_key(&event.to_physical_id)
    }

    // -- construction -------------------------------------------------------

    fn check_mutable(&self) -> Result<()> {
        if self.finalized {
            return Err(NimbusError::Conflict(format!(
                "execution template {} is finalized and cannot be mutated",
                self.name
            )));
        }
        Ok(())
    }

    fn phy_slot(&mut self, id: PhysicalDataId) -> usize {
        match self.build_phy_index.get(&id) {
            Some(&slot) => slot,
            None => {
                let slot = self.phy_slots.len();
                self.build_phy_index.insert(id, slot);
                self.phy_slots.push(id);
                slot
            }
        }
    }

    fn push_node(&mut self, job_id: JobId, kind: NodeKind, before: BTreeSet<JobId>) {
        let index = self.nodes.len();
        self.build_inner_index.insert(job_id, index);
        self.inner_slots.push(job_id);
        self.nodes.push(JobNode {
            kind,
            before,
            dependency_num: 0,
            dependency_counter: 0,
            after: Vec::new(),
            pending_data: Vec::new(),
            done: false,
        });
    }

    pub fn add_compute_job_template(&mut self, command: &ComputeJob) -> Result<()> {
        self.check_mutable()?;
        let read = command.read.iter().map(|&id| self.phy_slot(id)).collect();
        let write = command.write.iter().map(|&id| self.phy_slot(id)).collect();
        self.compute_job_num += 1;
        self.push_node(
            command.job_id,
            NodeKind::Compute {
                name: command.name.clone(),
                read,
                write,
            },
            command.before.clone(),
        );
        Ok(())
    }

    pub fn add_combine_job_template(&mut self, command: &CombineJob) -> Result<()> {
        self.check_mutable()?;
        let scratch = command.scratch.iter().map(|&id| self.phy_slot(id)).collect();
        let reduce = command.reduce.iter().map(|&id| self.phy_slot(id)).collect();
        self.compute_job_num += 1;
        self.push_node(
            command.job_id,
            NodeKind::Combine { scratch, reduce },
            command.before.clone(),
        );
        Ok(())
    }

    pub fn add_local_copy_job_template(&mut self, command: &LocalCopy) -> Result<()> {
        self.check_mutable()?;
        let from = self.phy_slot(command.from);
        let to = self.phy_slot(command.to);
        self.copy_job_num += 1;
        self.push_node(
            command.job_id,
            NodeKind::LocalCopy { from, to },
            command.before.clone(),
        );
        Ok(())
    }

    pub fn add_remote_copy_send_job_template(&mut self, command: &RemoteCopySend) -> Result<()> {
        self.check_mutable()?;
        let from = self.phy_slot(command.from);
        self.copy_job_num += 1;
        self.push_node(
            command.job_id,
            NodeKind::RemoteCopySend {
                from,
                to_worker: command.to_worker,
                receive_job_ids: command.receive_job_ids.clone(),
            },
            command.before.clone(),
        );
        Ok(())
    }

    pub fn add_remote_copy_receive_job_template(
        &mut self,
        command: &RemoteCopyReceive,
    ) -> Result<()> {
        self.check_mutable()?;
        let to = self.phy_slot(command.to);
        let index = self.nodes.len();
        self.rcr_routing.insert(command.job_id, index);
        self.copy_job_num += 1;
        self.push_node(command.job_id, NodeKind::RemoteCopyReceive { to }, command.before.clone());
        Ok(())
    }

    pub fn add_mega_rcr_job_template(&mut self, command: &MegaRcr) -> Result<()> {
        self.check_mutable()?;
        let index = self.nodes.len();
        let mut receives = Vec::with_capacity(command.receives.len());
        for &(receive_id, pdi) in &command.receives {
            let slot = self.phy_slot(pdi);
            self.rcr_routing.insert(receive_id, index);
            receives.push((receive_id, slot));
        }
        self.copy_job_num += 1;
        self.push_node(command.job_id, NodeKind::MegaRcr { receives }, command.before.clone());
        Ok(())
    }

    /// Freeze the structure: wire after-set edges, register outer
    /// dependencies, and compute each node's static precondition count.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(NimbusError::Conflict(format!(
                "execution template {} already finalized",
                self.name
            )));
        }

        for index in 0..self.nodes.len() {
            let before: Vec<JobId> = self.nodes[index].before.iter().copied().collect();
            let mut dependency_num = 0;
            for dep in before {
                if let Some(&producer) = self.build_inner_index.get(&dep) {
                    self.nodes[producer].after.push(index);
                    dependency_num += 1;
                } else {
                    let slot = match self.build_outer_index.get(&dep) {
                        Some(&slot) => slot,
                        None => {
                            let slot = self.outer_slots.len();
                            self.build_outer_index.insert(dep, slot);
                            self.outer_slots.push(dep);
                            self.outer_dependents.push(Vec::new());
                            slot
                        }
                    };
                    self.outer_dependents[slot].push(index);
                    dependency_num += 1;
                }
            }
            // Data deliveries count as preconditions too.
            dependency_num += match &self.nodes[index].kind {
                NodeKind::RemoteCopyReceive { .. } => 1,
                NodeKind::MegaRcr { receives } => receives.len(),
                _ => 0,
            };
            self.nodes[index].dependency_num = dependency_num;
            if dependency_num == 0 {
                self.seed_nodes.push(index);
            }
        }

        self.finalized = true;
        Ok(())
    }

    // -- instantiation ------------------------------------------------------

    /// Refill every slot table for a new generation and seed the ready list.
    ///
    /// When the previous generation is still draining, the request is queued
    /// and served as soon as the last completion lands.
    #[allow(clippy::too_many_arguments)]
    pub fn instantiate(
        &mut self,
        inner: &[JobId],
        outer: &[JobId],
        extra_dependency: &BTreeSet<JobId>,
        params: &[Bytes],
        physical: &[PhysicalDataId],
        pending_events: Vec<ReceiveEvent>,
        generation: TemplateGenerationId,
        extensions: &[TemplateExtension],
    ) -> Result<Vec<ReadyJob>> {
        if !self.finalized {
            return Err(NimbusError::Conflict(format!(
                "execution template {} is mutable and cannot be instantiated",
                self.name
            )));
        }
        self.pending_events.extend(pending_events);
        if self.active {
            if self.pending_instantiate.is_some() {
                warn!(template = %self.name, generation, "replacing queued instantiation");
            }
            self.pending_instantiate = Some(PendingInstantiate {
                inner: inner.to_vec(),
                outer: outer.to_vec(),
                extra_dependency: extra_dependency.clone(),
                params: params.to_vec(),
                physical: physical.to_vec(),
                generation,
                extensions: extensions.to_vec(),
            });
            return Ok(Vec::new());
        }
        self.activate(inner, outer, extra_dependency, params, physical, generation, extensions)
    }

    #[allow(clippy::too_many_arguments)]
    fn activate(
        &mut self,
        inner: &[JobId],
        outer: &[JobId],
        extra_dependency: &BTreeSet<JobId>,
        params: &[Bytes],
        physical: &[PhysicalDataId],
        generation: TemplateGenerationId,
        extensions: &[TemplateExtension],
    ) -> Result<Vec<ReadyJob>> {
        if inner.len() != self.nodes.len() {
            return Err(NimbusError::InvalidSpawn(format!(
                "template {} expects {} inner ids, got {}",
                self.name,
                self.nodes.len(),
                inner.len()
            )));
        }
        if outer.len() != self.outer_slots.len() {
            return Err(NimbusError::InvalidSpawn(format!(
                "template {} expects {} outer ids, got {}",
                self.name,
                self.outer_slots.len(),
                outer.len()
            )));
        }
        if params.len() != self.nodes.len() {
            return Err(NimbusError::InvalidSpawn(format!(
                "template {} expects {} parameter blobs, got {}",
                self.name,
                self.nodes.len(),
                params.len()
            )));
        }
        if physical.len() != self.phy_slots.len() {
            return Err(NimbusError::InvalidSpawn(format!(
                "template {} expects {} physical ids, got {}",
                self.name,
                self.phy_slots.len(),
                physical.len()
            )));
        }

        // Refill the shared slot tables; every node observes the new ids.
        self.inner_slots.clear();
        self.inner_slots.extend_from_slice(inner);
        self.outer_slots.clear();
        self.outer_slots.extend_from_slice(outer);
        self.phy_slots.clear();
        self.phy_slots.extend_from_slice(physical);
        self.parameters = params.to_vec();
        self.generation = generation;
        self.extra_dependency = extra_dependency.clone();
        self.blocked_on_extra.clear();
        self.migrated = extensions.iter().map(|e| e.inner_slot).collect();
        self.job_done_counter = 0;
        self.rewind = false;
        self.active = true;

        self.runtime_job_index.clear();
        for (slot, &id) in self.inner_slots.iter().enumerate() {
            self.runtime_job_index.insert(id, slot);
        }
        self.runtime_outer_index.clear();
        for (slot, &id) in self.outer_slots.iter().enumerate() {
            self.runtime_outer_index.insert(id, slot);
        }
        self.phy_routing.clear();
        for (index, node) in self.nodes.iter().enumerate() {
            match &node.kind {
                NodeKind::RemoteCopyReceive { to } => {
                    self.phy_routing.insert(self.phy_slots[*to], index);
                }
                NodeKind::MegaRcr { receives } => {
                    for &(_, slot) in receives {
                        self.phy_routing.insert(self.phy_slots[slot], index);
                    }
                }
                _ => {}
            }
        }
        for node in self.nodes.iter_mut() {
            node.dependency_counter = 0;
            node.pending_data.clear();
            node.done = false;
        }

        let mut ready = Vec::new();
        for index in self.seed_nodes.clone() {
            self.release_if_ready(index, &mut ready);
        }

        // Drain buffered deliveries belonging to this generation.
        let buffered = std::mem::take(&mut self.pending_events);
        for event in buffered {
            match event.generation.cmp(&generation) {
                std::cmp::Ordering::Less => {
                    warn!(template = %self.name, event_generation = event.generation, "discarding stale buffered delivery");
                }
                std::cmp::Ordering::Greater => self.pending_events.push(event),
                std::cmp::Ordering::Equal => {
                    let mut released = self.apply_receive_event(&event);
                    ready.append(&mut released);
                }
            }
        }

        self.ready_job_counter += ready.len();
        Ok(ready)
    }

    // -- runtime events -----------------------------------------------------

    /// A job of this template (inner or outer) completed.
    pub fn notify_job_done(&mut self, job_id: JobId) -> NotifyOutcome {
        let mut outcome = NotifyOutcome::default();

        // Extra dependencies gate the whole instantiation.
        if self.extra_dependency.remove(&job_id) {
            if self.extra_dependency.is_empty() {
                outcome.ready = std::mem::take(&mut self.blocked_on_extra);
                self.ready_job_counter += outcome.ready.len();
            }
            return outcome;
        }

        if let Some(&slot) = self.runtime_outer_index.get(&job_id) {
            let mut ready = Vec::new();
            for index in self.outer_dependents[slot].clone() {
                self.bump_dependency(index, &mut ready);
            }
            self.ready_job_counter += ready.len();
            outcome.ready = ready;
            return outcome;
        }

        let Some(&index) = self.runtime_job_index.get(&job_id) else {
            return outcome;
        };
        if self.nodes[index].done {
            return outcome;
        }
        self.nodes[index].done = true;
        self.job_done_counter += 1;

        if !self.rewind {
            let mut ready = Vec::new();
            for after in self.nodes[index].after.clone() {
                self.bump_dependency(after, &mut ready);
            }
            self.ready_job_counter += ready.len();
            outcome.ready = ready;
        }

        if self.job_done_counter == self.nodes.len() {
            self.active = false;
            if !self.rewind {
                outcome.mega_job_done = Some(MegaJobDone {
                    job_ids: self.inner_slots.clone(),
                    template: TemplateTag {
                        name: self.name.clone(),
                        generation: self.generation,
                    },
                });
            }
            if let Some(pending) = self.pending_instantiate.take() {
                match self.activate(
                    &pending.inner,
                    &pending.outer,
                    &pending.extra_dependency,
                    &pending.params,
                    &pending.physical,
                    pending.generation,
                    &pending.extensions,
                ) {
                    Ok(mut ready) => outcome.ready.append(&mut ready),
                    Err(err) => {
                        warn!(template = %self.name, %err, "queued instantiation failed")
                    }
                }
            }
        }
        outcome
    }

    /// Flip into rewind mode: record the completion but stop firing
    /// downstream, so the controller can reinstantiate from a checkpoint.
    pub fn mark_inner_job_done(&mut self, shadow_job_id: JobId, prepare_rewind: bool) {
        if prepare_rewind {
            self.rewind = true;
        }
        if let Some(&index) = self.runtime_job_index.get(&shadow_job_id) {
            if !self.nodes[index].done {
                self.nodes[index].done = true;
                self.job_done_counter += 1;
            }
        }
    }

    /// Enter rewind mode without a completion.
    pub fn prepare_rewind(&mut self) {
        self.rewind = true;
    }

    /// Route an incoming data delivery to its receive node.
    pub fn process_receive_event(&mut self, event: ReceiveEvent) -> Vec<ReadyJob> {
        if event.generation < self.generation {
            warn!(
                template = %self.name,
                event_generation = event.generation,
                current = self.generation,
                "discarding delivery for an older generation"
            );
            return Vec::new();
        }
        if !self.active || event.generation > self.generation {
            self.pending_events.push(event);
            return Vec::new();
        }
        let ready = self.apply_receive_event(&event);
        self.ready_job_counter += ready.len();
        ready
    }

    fn apply_receive_event(&mut self, event: &ReceiveEvent) -> Vec<ReadyJob> {
        let index = self
            .rcr_routing
            .get(&event.receive_job_id)
            .or_else(|| self.phy_routing.get(&event.to_physical_id))
            .copied();
        let Some(index) = index else {
            warn!(
                template = %self.name,
                receive_job_id = event.receive_job_id,
                "delivery does not match any receive node"
            );
            return Vec::new();
        };
        let slot = match &self.nodes[index].kind {
            NodeKind::RemoteCopyReceive { to } => *to,
            NodeKind::MegaRcr { receives } => receives
                .iter()
                .find(|(id, _)| *id == event.receive_job_id)
                .map(|(_, slot)| *slot)
                .unwrap_or_else(|| {
                    // Routed by physical id; resolve the slot from the
                    // current table.
                    self.phy_slots
                        .iter()
                        .position(|&p| p == event.to_physical_id)
                        .unwrap_or(0)
                }),
            _ => {
                warn!(template = %self.name, "delivery routed to a non-receive node");
                return Vec::new();
            }
        };
        self.nodes[index].pending_data.push((slot, event.data.clone()));
        let mut ready = Vec::new();
        self.bump_dependency(index, &mut ready);
        ready
    }

    // -- release machinery --------------------------------------------------

    fn bump_dependency(&mut self, index: usize, ready: &mut Vec<ReadyJob>) {
        self.nodes[index].dependency_counter += 1;
        self.release_if_ready(index, ready);
    }

    fn release_if_ready(&mut self, index: usize, ready: &mut Vec<ReadyJob>) {
        let node = &self.nodes[index];
        if node.done || node.dependency_counter < node.dependency_num {
            return;
        }
        if self.migrated.contains(&index) {
            return;
        }
        let job = self.resolve(index);
        if self.extra_dependency.is_empty() {
            ready.push(job);
        } else {
            self.blocked_on_extra.push(job);
        }
    }

    fn resolve(&self, index: usize) -> ReadyJob {
        let node = &self.nodes[index];
        let job_id = self.inner_slots[index];
        let phys = |slots: &[usize]| -> Vec<PhysicalDataId> {
            slots.iter().map(|&s| self.phy_slots[s]).collect()
        };
        let task = match &node.kind {
            NodeKind::Compute { name, read, write } => ResolvedTask::Compute {
                name: name.clone(),
                read: phys(read),
                write: phys(write),
                params: self.parameters.get(index).cloned().unwrap_or_default(),
            },
            NodeKind::Combine { scratch, reduce } => ResolvedTask::Combine {
                scratch: phys(scratch),
                reduce: phys(reduce),
                params: self.parameters.get(index).cloned().unwrap_or_default(),
            },
            NodeKind::LocalCopy { from, to } => ResolvedTask::LocalCopy {
                from: self.phy_slots[*from],
                to: self.phy_slots[*to],
            },
            NodeKind::RemoteCopySend {
                from,
                to_worker,
                receive_job_ids,
            } => ResolvedTask::RemoteCopySend {
                from: self.phy_slots[*from],
                to_worker: *to_worker,
                receive_job_ids: receive_job_ids.clone(),
                generation: self.generation,
            },
            NodeKind::RemoteCopyReceive { .. } => ResolvedTask::RemoteCopyReceive {
                deliveries: node
                    .pending_data
                    .iter()
                    .map(|(slot, data)| (self.phy_slots[*slot], data.clone()))
                    .collect(),
            },
            NodeKind::MegaRcr { .. } => ResolvedTask::MegaRcr {
                deliveries: node
                    .pending_data
                    .iter()
                    .map(|(slot, data)| (self.phy_slots[*slot], data.clone()))
                    .collect(),
            },
        };
        ReadyJob { job_id, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ComputeJob, LocalCopy, MegaRcr, RemoteCopyReceive, RemoteCopySend};

    fn set(ids: &[JobId]) -> BTreeSet<JobId> {
        ids.iter().copied().collect()
    }

    fn compute(job_id: JobId, read: &[PhysicalDataId], write: &[PhysicalDataId], before: &[JobId]) -> ComputeJob {
        ComputeJob {
            name: "advect".into(),
            job_id,
            read: read.to_vec(),
            write: write.to_vec(),
            before: set(before),
            after: BTreeSet::new(),
            params: Bytes::new(),
            template: None,
        }
    }

    /// Recording pass: 10 computes into pdi 100, 11 copies 100 -> 101,
    /// 12 computes from 101. Outer dependency 99 gates node 10.
    fn recorded_template() -> ExecutionTemplate {
        let mut template = ExecutionTemplate::new("frame");
        template
            .add_compute_job_template(&compute(10, &[], &[100], &[99]))
            .unwrap();
        template
            .add_local_copy_job_template(&LocalCopy {
                job_id: 11,
                from: 100,
                to: 101,
                before: set(&[10]),
                after: BTreeSet::new(),
                template: None,
            })
            .unwrap();
        template
            .add_compute_job_template(&compute(12, &[101], &[101], &[11]))
            .unwrap();
        template.finalize().unwrap();
        template
    }

    fn instantiate(
        template: &mut ExecutionTemplate,
        inner: &[JobId],
        outer: &[JobId],
        generation: TemplateGenerationId,
    ) -> Vec<ReadyJob> {
        let params = vec![Bytes::new(); inner.len()];
        template
            .instantiate(
                inner,
                outer,
                &BTreeSet::new(),
                &params,
                &[100, 101],
                Vec::new(),
                generation,
                &[],
            )
            .unwrap()
    }

    #[test]
    fn dependency_num_accounting() {
        let mut template = ExecutionTemplate::new("t");
        template
            .add_compute_job_template(&compute(1, &[], &[100], &[]))
            .unwrap();
        template
            .add_remote_copy_send_job_template(&RemoteCopySend {
                job_id: 2,
                receive_job_ids: vec![3],
                from: 100,
                to_worker: 2,
                before: set(&[1]),
                after: BTreeSet::new(),
                template: None,
            })
            .unwrap();
        template
            .add_remote_copy_receive_job_template(&RemoteCopyReceive {
                job_id: 3,
                to: 101,
                before: set(&[]),
                after: BTreeSet::new(),
                template: None,
            })
            .unwrap();
        template
            .add_mega_rcr_job_template(&MegaRcr {
                job_id: 4,
                receives: vec![(5, 102), (6, 103)],
                before: set(&[1]),
                after: BTreeSet::new(),
                template: None,
            })
            .unwrap();
        template.finalize().unwrap();

        // compute: |before|; send: |before|; rcr: |before| + 1;
        // mega: |before| + transfers.
        assert_eq!(template.dependency_num(0), Some(0));
        assert_eq!(template.dependency_num(1), Some(1));
        assert_eq!(template.dependency_num(2), Some(1));
        assert_eq!(template.dependency_num(3), Some(3));
    }

    #[test]
    fn mutation_after_finalize_is_a_conflict() {
        let mut template = recorded_template();
        let err = template
            .add_compute_job_template(&compute(13, &[], &[], &[]))
            .unwrap_err();
        assert!(matches!(err, NimbusError::Conflict(_)));
        assert!(matches!(
            template.finalize().unwrap_err(),
            NimbusError::Conflict(_)
        ));
    }

    #[test]
    fn instantiation_before_finalize_is_a_conflict() {
        let mut template = ExecutionTemplate::new("t");
        template
            .add_compute_job_template(&compute(1, &[], &[100], &[]))
            .unwrap();
        let err = template
            .instantiate(
                &[40],
                &[],
                &BTreeSet::new(),
                &[Bytes::new()],
                &[100],
                Vec::new(),
                1,
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, NimbusError::Conflict(_)));
    }

    #[test]
    fn parameter_refresh_drives_a_full_generation() {
        let mut template = recorded_template();
        // Nothing seeds: node 0 waits on the outer dependency.
        let ready = instantiate(&mut template, &[40, 41, 42], &[30], 2);
        assert!(ready.is_empty());

        // Outer dependency clears; node 0 releases under its new id.
        let outcome = template.notify_job_done(30);
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.ready[0].job_id, 40);

        let outcome = template.notify_job_done(40);
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.ready[0].job_id, 41);
        assert!(matches!(
            outcome.ready[0].task,
            ResolvedTask::LocalCopy { from: 100, to: 101 }
        ));

        let outcome = template.notify_job_done(41);
        assert_eq!(outcome.ready[0].job_id, 42);

        // Completing the last job emits the roll-up exactly once.
        let outcome = template.notify_job_done(42);
        assert!(outcome.ready.is_empty());
        let mega = outcome.mega_job_done.unwrap();
        assert_eq!(mega.job_ids, vec![40, 41, 42]);
        assert_eq!(mega.template.generation, 2);
        assert!(!template.active());
    }

    #[test]
    fn duplicate_completion_is_a_noop() {
        let mut template = recorded_template();
        instantiate(&mut template, &[40, 41, 42], &[30], 2);
        template.notify_job_done(30);
        let first = template.notify_job_done(40);
        assert_eq!(first.ready.len(), 1);
        let second = template.notify_job_done(40);
        assert!(second.ready.is_empty());
        assert!(second.mega_job_done.is_none());
    }

    #[test]
    fn queued_instantiation_runs_after_the_active_generation_drains() {
        let mut template = recorded_template();
        instantiate(&mut template, &[40, 41, 42], &[30], 2);

        // A second instantiation arrives while generation 2 is in flight.
        let ready = instantiate(&mut template, &[50, 51, 52], &[42], 3);
        assert!(ready.is_empty());
        assert!(template.pending_instantiate());

        template.notify_job_done(30);
        template.notify_job_done(40);
        template.notify_job_done(41);
        let outcome = template.notify_job_done(42);
        assert!(outcome.mega_job_done.is_some());
        assert_eq!(template.generation(), 3);
        assert!(template.active());
        // Generation 3's outer dependency is job 42, already reported done
        // to the controller; its notification now releases the seed.
        let outcome = template.notify_job_done(42);
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.ready[0].job_id, 50);
    }

    fn receive_template() -> ExecutionTemplate {
        let mut template = ExecutionTemplate::new("recv");
        template
            .add_mega_rcr_job_template(&MegaRcr {
                job_id: 5,
                receives: vec![(6, 110), (7, 110)],
                before: set(&[]),
                after: BTreeSet::new(),
                template: None,
            })
            .unwrap();
        template
            .add_compute_job_template(&compute(8, &[110], &[110], &[5]))
            .unwrap();
        template.finalize().unwrap();
        template
    }

    #[test]
    fn mega_rcr_releases_after_every_delivery() {
        let mut template = receive_template();
        let ready = template
            .instantiate(
                &[50, 51],
                &[],
                &BTreeSet::new(),
                &[Bytes::new(), Bytes::new()],
                &[110],
                Vec::new(),
                1,
                &[],
            )
            .unwrap();
        assert!(ready.is_empty());

        let first = template.process_receive_event(ReceiveEvent {
            generation: 1,
            receive_job_id: 6,
            to_physical_id: 110,
            data: Bytes::from_static(b"a"),
        });
        assert!(first.is_empty());

        let second = template.process_receive_event(ReceiveEvent {
            generation: 1,
            receive_job_id: 7,
            to_physical_id: 110,
            data: Bytes::from_static(b"b"),
        });
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].job_id, 50);
        match &second[0].task {
            ResolvedTask::MegaRcr { deliveries } => assert_eq!(deliveries.len(), 2),
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[test]
    fn early_and_stale_deliveries_are_buffered_and_dropped() {
        let mut template = receive_template();
        // Arrives before any instantiation: buffered.
        let ready = template.process_receive_event(ReceiveEvent {
            generation: 1,
            receive_job_id: 6,
            to_physical_id: 110,
            data: Bytes::from_static(b"a"),
        });
        assert!(ready.is_empty());

        let ready = template
            .instantiate(
                &[50, 51],
                &[],
                &BTreeSet::new(),
                &[Bytes::new(), Bytes::new()],
                &[110],
                Vec::new(),
                1,
                &[],
            )
            .unwrap();
        assert!(ready.is_empty());

        // Stale generation: dropped outright.
        let ready = template.process_receive_event(ReceiveEvent {
            generation: 0,
            receive_job_id: 7,
            to_physical_id: 110,
            data: Bytes::from_static(b"stale"),
        });
        assert!(ready.is_empty());

        // The buffered delivery counted; one more completes the node.
        let ready = template.process_receive_event(ReceiveEvent {
            generation: 1,
            receive_job_id: 7,
            to_physical_id: 110,
            data: Bytes::from_static(b"b"),
        });
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn extra_dependencies_gate_the_ready_list() {
        let mut template = recorded_template();
        let params = vec![Bytes::new(); 3];
        let ready = template
            .instantiate(
                &[40, 41, 42],
                &[30],
                &set(&[77]),
                &params,
                &[100, 101],
                Vec::new(),
                2,
                &[],
            )
            .unwrap();
        assert!(ready.is_empty());

        // The outer dependency clears but the release stays gated.
        let outcome = template.notify_job_done(30);
        assert!(outcome.ready.is_empty());

        // Clearing the extra dependency flushes the blocked release.
        let outcome = template.notify_job_done(77);
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.ready[0].job_id, 40);
    }

    #[test]
    fn rewind_mode_stops_downstream_firing() {
        let mut template = recorded_template();
        instantiate(&mut template, &[40, 41, 42], &[30], 2);
        template.notify_job_done(30);

        template.mark_inner_job_done(40, true);
        // 41 would normally release now; rewind holds it back.
        let outcome = template.notify_job_done(41);
        assert!(outcome.ready.is_empty());
        let outcome = template.notify_job_done(42);
        assert!(outcome.ready.is_empty());
        assert!(outcome.mega_job_done.is_none());
        assert!(!template.active());
    }

    #[test]
    fn migrated_slots_are_not_released_locally() {
        let mut template = recorded_template();
        let params = vec![Bytes::new(); 3];
        let ready = template
            .instantiate(
                &[40, 41, 42],
                &[30],
                &BTreeSet::new(),
                &params,
                &[100, 101],
                Vec::new(),
                2,
                &[TemplateExtension { inner_slot: 0 }],
            )
            .unwrap();
        assert!(ready.is_empty());

        // The outer dependency clears; slot 0 is migrated so nothing
        // releases locally.
        let outcome = template.notify_job_done(30);
        assert!(outcome.ready.is_empty());

        // Its completion arrives relayed by the controller and unblocks the
        // local successor.
        let outcome = template.notify_job_done(40);
        assert_eq!(outcome.ready.len(), 1);
        assert_eq!(outcome.ready[0].job_id, 41);
    }
}
