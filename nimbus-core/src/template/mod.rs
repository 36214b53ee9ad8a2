//! Controller-side template memoization.
//!
//! Simulations instantiate the same sub-DAG every frame with different
//! parameters. The template manager records the pattern once: each slot
//! stores the task's name, read/write sets, sterility, region, and its
//! before-set expressed as slot indices rather than concrete job ids. A
//! finalized template also precomputes, per referenced datum, the ordered
//! writer slots, so instantiation never re-traverses the DAG.
//!
//! Per template name the manager runs a small state machine:
//! absent -> detecting -> detecting with a partial recording -> finalized.
//! Re-detecting a partial recording resets it; re-detecting a finalized
//! template is a conflict, as is mutating one.
//!
//! Instantiation binds slot indices to caller-supplied ids and yields
//! ordinary spawn descriptors; the accompanying [`ComplexJob`] placeholder
//! occupies one job id and completes at the expansion boundary, once every
//! inner task has reported done.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::{
    command::{Params, SpawnCompute},
    error::{NimbusError, Result},
    geometry::GeometricRegion,
    ids::{JobId, LogicalDataId, TemplateGenerationId},
};

/// A before-set member, resolved against the template's tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRef {
    /// Another slot of this template.
    Inner(usize),
    /// A dependency from outside the template, bound at instantiation.
    Outer(usize),
}

/// One memoized task of the pattern.
#[derive(Clone, Debug)]
pub struct TemplateSlot {
    pub name: String,
    pub read: BTreeSet<LogicalDataId>,
    pub write: BTreeSet<LogicalDataId>,
    pub before: Vec<SlotRef>,
    pub sterile: bool,
    pub region: Option<GeometricRegion>,
    /// Parent slot when the parent task is itself part of the template.
    pub parent: Option<usize>,
}

/// A recorded (and possibly finalized) template.
#[derive(Debug)]
pub struct TemplateEntry {
    name: String,
    finalized: bool,
    slots: Vec<TemplateSlot>,
    /// Recording-time job id -> slot index.
    job_index: HashMap<JobId, usize>,
    /// Recording-time outer dependency id -> outer table index.
    outer_index: HashMap<JobId, usize>,
    /// Writer slots per datum, in slot order. Computed at finalize.
    ldo_writers: HashMap<LogicalDataId, Vec<usize>>,
}

impl TemplateEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            finalized: false,
            slots: Vec::new(),
            job_index: HashMap::new(),
            outer_index: HashMap::new(),
            ldo_writers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn outer_count(&self) -> usize {
        self.outer_index.len()
    }

    pub fn slots(&self) -> &[TemplateSlot] {
        &self.slots
    }

    fn is_partial(&self) -> bool {
        !self.finalized && !self.slots.is_empty()
    }

    fn clean_partial(&mut self) {
        self.slots.clear();
        self.job_index.clear();
        self.outer_index.clear();
        self.ldo_writers.clear();
    }

    /// Append a slot from a compute spawn observed during detection.
    pub fn add_compute_job(&mut self, spawn: &SpawnCompute) -> Result<()> {
        if self.finalized {
            return Err(NimbusError::Conflict(format!(
                "template {} is finalized and cannot record new tasks",
                self.name
            )));
        }
        let slot_index = self.slots.len();
        let mut before = Vec::with_capacity(spawn.before.len());
        for &dep in &spawn.before {
            match self.job_index.get(&dep) {
                Some(&inner) => before.push(SlotRef::Inner(inner)),
                None => {
                    let next = self.outer_index.len();
                    let outer = *self.outer_index.entry(dep).or_insert(next);
                    before.push(SlotRef::Outer(outer));
                }
            }
        }
        let parent = self.job_index.get(&spawn.parent).copied();
        self.job_index.insert(spawn.job_id, slot_index);
        self.slots.push(TemplateSlot {
            name: spawn.name.clone(),
            read: spawn.read.clone(),
            write: spawn.write.clone(),
            before,
            sterile: spawn.sterile,
            region: spawn.region,
            parent,
        });
        Ok(())
    }

    /// Seal the template and precompute the slot-level lineage.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(NimbusError::Conflict(format!(
                "template {} already finalized",
                self.name
            )));
        }
        self.finalized = true;
        for (index, slot) in self.slots.iter().enumerate() {
            for &ldo in &slot.write {
                self.ldo_writers.entry(ldo).or_default().push(index);
            }
        }
        Ok(())
    }

    /// Writer slots of `ldo` in slot order; empty when the template never
    /// writes it.
    pub fn writer_slots(&self, ldo: LogicalDataId) -> &[usize] {
        self.ldo_writers.get(&ldo).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The slot a recording-time job id occupies, if it was recorded.
    pub fn slot_of_recorded_job(&self, job: JobId) -> Option<usize> {
        self.job_index.get(&job).copied()
    }

    /// The outer-table index of a recording-time outer dependency.
    pub fn outer_slot_of_recorded(&self, job: JobId) -> Option<usize> {
        self.outer_index.get(&job).copied()
    }

    /// Slots whose tasks are non-sterile, i.e. the branching parents of the
    /// pattern.
    pub fn parent_slot_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.sterile)
            .map(|(i, _)| i)
            .collect()
    }

    /// Bind slot indices to real ids and produce ordinary spawn descriptors.
    pub fn instantiate(
        &self,
        inner_ids: &[JobId],
        outer_ids: &[JobId],
        params: &[Params],
        parent: JobId,
    ) -> Result<Vec<SpawnCompute>> {
        if !self.finalized {
            return Err(NimbusError::Conflict(format!(
                "template {} has not been finalized",
                self.name
            )));
        }
        if inner_ids.len() != self.slots.len() {
            return Err(NimbusError::InvalidSpawn(format!(
                "template {} expects {} inner ids, got {}",
                self.name,
                self.slots.len(),
                inner_ids.len()
            )));
        }
        if outer_ids.len() != self.outer_index.len() {
            return Err(NimbusError::InvalidSpawn(format!(
                "template {} expects {} outer ids, got {}",
                self.name,
                self.outer_index.len(),
                outer_ids.len()
            )));
        }
        if params.len() != self.slots.len() {
            return Err(NimbusError::InvalidSpawn(format!(
                "template {} expects {} parameter blobs, got {}",
                self.name,
                self.slots.len(),
                params.len()
            )));
        }

        // Invert the before edges so every spawn carries its after-set too.
        let mut after: Vec<BTreeSet<JobId>> = vec![BTreeSet::new(); self.slots.len()];
        for (index, slot) in self.slots.iter().enumerate() {
            for dep in &slot.before {
                if let SlotRef::Inner(inner) = dep {
                    after[*inner].insert(inner_ids[index]);
                }
            }
        }

        let mut spawns = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let before: BTreeSet<JobId> = slot
                .before
                .iter()
                .map(|dep| match dep {
                    SlotRef::Inner(inner) => inner_ids[*inner],
                    SlotRef::Outer(outer) => outer_ids[*outer],
                })
                .collect();
            spawns.push(SpawnCompute {
                name: slot.name.clone(),
                job_id: inner_ids[index],
                read: slot.read.clone(),
                write: slot.write.clone(),
                before,
                after: std::mem::take(&mut after[index]),
                parent: slot.parent.map(|p| inner_ids[p]).unwrap_or(parent),
                future: None,
                sterile: slot.sterile,
                region: slot.region,
                params: params[index].clone(),
            });
        }
        Ok(spawns)
    }
}

/// The placeholder occupying one job id for a whole instantiation.
#[derive(Clone, Debug)]
pub struct ComplexJob {
    pub job_id: JobId,
    pub template: String,
    pub generation: TemplateGenerationId,
    pub parent: JobId,
    pub inner: BTreeSet<JobId>,
    pending: BTreeSet<JobId>,
}

impl ComplexJob {
    pub fn new(
        job_id: JobId,
        template: &str,
        generation: TemplateGenerationId,
        parent: JobId,
        inner: impl IntoIterator<Item = JobId>,
    ) -> Self {
        let inner: BTreeSet<JobId> = inner.into_iter().collect();
        Self {
            job_id,
            template: template.to_string(),
            generation,
            parent,
            pending: inner.clone(),
            inner,
        }
    }

    /// Track one more inner task (a replayed copy) under this placeholder.
    pub fn add_inner(&mut self, job: JobId) {
        self.inner.insert(job);
        self.pending.insert(job);
    }

    /// Record an inner completion; true once the whole expansion is done.
    /// Duplicate reports are no-ops.
    pub fn mark_inner_done(&mut self, job: JobId) -> bool {
        self.pending.remove(&job);
        self.pending.is_empty()
    }
}

/// Detects, records, finalizes and instantiates templates by name.
#[derive(Debug, Default)]
pub struct TemplateManager {
    templates: HashMap<String, TemplateEntry>,
    generations: BTreeMap<String, TemplateGenerationId>,
}

impl TemplateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&TemplateEntry> {
        self.templates.get(name)
    }

    /// Begin (or restart) detection of `name`.
    pub fn detect_new(&mut self, name: &str) -> Result<()> {
        match self.templates.get_mut(name) {
            None => {
                self.templates.insert(name.to_string(), TemplateEntry::new(name));
                Ok(())
            }
            Some(entry) if entry.finalized() => Err(NimbusError::Conflict(format!(
                "template {name} already detected and finalized"
            ))),
            Some(entry) => {
                if entry.is_partial() {
                    warn!(template = name, "resetting partially recorded template");
                    entry.clean_partial();
                }
                Ok(())
            }
        }
    }

    /// Record one compute task into a template under detection.
    pub fn add_compute_job(&mut self, name: &str, spawn: &SpawnCompute) -> Result<()> {
        let entry = self.templates.get_mut(name).ok_or_else(|| {
            NimbusError::Conflict(format!("template {name} has not been detected"))
        })?;
        entry.add_compute_job(spawn)
    }

    pub fn finalize(&mut self, name: &str) -> Result<()> {
        let entry = self.templates.get_mut(name).ok_or_else(|| {
            NimbusError::Conflict(format!("template {name} has not been detected"))
        })?;
        entry.finalize()
    }

    /// Allocate the next generation id for `name`. Generation 1 is the
    /// recording pass.
    pub fn next_generation(&mut self, name: &str) -> TemplateGenerationId {
        let generation = self.generations.entry(name.to_string()).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn current_generation(&self, name: &str) -> TemplateGenerationId {
        self.generations.get(name).copied().unwrap_or(0)
    }

    /// Expand a finalized template into ordinary spawns.
    pub fn instantiate(
        &self,
        name: &str,
        inner_ids: &[JobId],
        outer_ids: &[JobId],
        params: &[Params],
        parent: JobId,
    ) -> Result<Vec<SpawnCompute>> {
        let entry = self.templates.get(name).ok_or_else(|| {
            NimbusError::Conflict(format!("template {name} has not been detected"))
        })?;
        entry.instantiate(inner_ids, outer_ids, params, parent)
    }
}
