//! The seam to numerical kernels.
//!
//! Kernels are external collaborators: the runtime selects one by name,
//! hands it the task's parameter blob and the raw contents of its read-set
//! instances, and stores whatever it returns into the write-set instances.
//! The core never interprets the bytes.

use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Result};
use bytes::Bytes;

/// A named computation hosted by a worker.
pub trait Kernel: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run the kernel: one input per read instance, one output per write
    /// instance expected.
    fn execute(&self, params: &[u8], reads: &[Bytes], write_count: usize) -> Result<Vec<Bytes>>;
}

/// The kernels a worker can execute, keyed by compute-task name.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kernel: Arc<dyn Kernel>) {
        self.kernels.insert(kernel.name().to_string(), kernel);
    }

    pub fn with(mut self, kernel: Arc<dyn Kernel>) -> Self {
        self.register(kernel);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Kernel>> {
        match self.kernels.get(name) {
            Some(kernel) => Ok(kernel.clone()),
            None => bail!("no kernel registered under {name:?}"),
        }
    }
}

/// Writes empty output into every write instance. Useful for wiring tests
/// and as the simplest possible application.
pub struct NoopKernel;

impl Kernel for NoopKernel {
    fn name(&self) -> &str {
        "noop"
    }

    fn execute(&self, _params: &[u8], _reads: &[Bytes], write_count: usize) -> Result<Vec<Bytes>> {
        Ok(vec![Bytes::new(); write_count])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_by_name() {
        let registry = KernelRegistry::new().with(Arc::new(NoopKernel));
        let kernel = registry.get("noop").unwrap();
        let outputs = kernel.execute(&[], &[], 2).unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(registry.get("advect").is_err());
    }
}
