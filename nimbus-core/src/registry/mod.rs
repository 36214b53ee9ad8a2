//! Catalog of logical data objects.
//!
//! Logical data objects (LDOs) are named, partitioned regions of the global
//! simulation domain. The registry is append-only during a run: objects are
//! created by define-data commands and never destroyed in steady state.
//! Lookups are O(1) and lock-free; the registry is owned by the scheduler
//! core and mutated by it alone.

use std::collections::HashMap;

use crate::{
    error::{NimbusError, Result},
    geometry::GeometricRegion,
    ids::{LogicalDataId, PartitionId},
};

/// A named, partitioned region of the global domain, identity-stable for the
/// whole run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalObject {
    pub id: LogicalDataId,
    pub name: String,
    pub region: GeometricRegion,
    pub partition: PartitionId,
    pub neighbors: Vec<PartitionId>,
}

/// The controller's catalog of partitions and logical objects.
#[derive(Debug, Default)]
pub struct DataRegistry {
    objects: HashMap<LogicalDataId, LogicalObject>,
    by_name: HashMap<String, LogicalDataId>,
    partitions: HashMap<PartitionId, GeometricRegion>,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition. Redefinition fails with a conflict.
    pub fn define_partition(
        &mut self,
        partition: PartitionId,
        region: GeometricRegion,
    ) -> Result<()> {
        if self.partitions.contains_key(&partition) {
            return Err(NimbusError::Conflict(format!(
                "partition {partition} already defined"
            )));
        }
        self.partitions.insert(partition, region);
        Ok(())
    }

    /// Register a logical object. The partition must exist; duplicate ids or
    /// names fail with a conflict.
    pub fn define_data(
        &mut self,
        name: &str,
        id: LogicalDataId,
        partition: PartitionId,
        neighbors: Vec<PartitionId>,
    ) -> Result<()> {
        let region = *self.partitions.get(&partition).ok_or_else(|| {
            NimbusError::InvalidSpawn(format!(
                "data {name} references undefined partition {partition}"
            ))
        })?;
        if self.objects.contains_key(&id) {
            return Err(NimbusError::Conflict(format!("data id {id} already defined")));
        }
        if self.by_name.contains_key(name) {
            return Err(NimbusError::Conflict(format!(
                "data name {name:?} already defined"
            )));
        }
        self.by_name.insert(name.to_string(), id);
        self.objects.insert(
            id,
            LogicalObject {
                id,
                name: name.to_string(),
                region,
                partition,
                neighbors,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, id: LogicalDataId) -> Option<&LogicalObject> {
        self.objects.get(&id)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<&LogicalObject> {
        self.by_name.get(name).and_then(|id| self.objects.get(id))
    }

    pub fn partition_region(&self, partition: PartitionId) -> Option<&GeometricRegion> {
        self.partitions.get(&partition)
    }

    pub fn contains(&self, id: LogicalDataId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalObject> {
        self.objects.values()
    }
}
