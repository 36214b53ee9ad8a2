//! Kernels bundled with the worker binary.
//!
//! Real deployments link numerical solvers here; these stand-ins operate on
//! opaque bytes and exist so a cluster can run end-to-end.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use nimbus_core::kernel::{Kernel, KernelRegistry, NoopKernel};

/// Writes the parameter blob into every output instance.
pub struct FillKernel;

impl Kernel for FillKernel {
    fn name(&self) -> &str {
        "fill"
    }

    fn execute(&self, params: &[u8], _reads: &[Bytes], write_count: usize) -> Result<Vec<Bytes>> {
        Ok(vec![Bytes::copy_from_slice(params); write_count])
    }
}

/// Reduces scratch instances by concatenation.
pub struct CombineKernel;

impl Kernel for CombineKernel {
    fn name(&self) -> &str {
        "combine"
    }

    fn execute(&self, _params: &[u8], reads: &[Bytes], write_count: usize) -> Result<Vec<Bytes>> {
        let mut combined = Vec::new();
        for read in reads {
            combined.extend_from_slice(read);
        }
        Ok(vec![Bytes::from(combined); write_count])
    }
}

pub fn registry() -> KernelRegistry {
    KernelRegistry::new()
        .with(Arc::new(NoopKernel))
        .with(Arc::new(FillKernel))
        .with(Arc::new(CombineKernel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_writes_params_everywhere() {
        let outputs = FillKernel.execute(b"dt", &[], 2).unwrap();
        assert_eq!(outputs, vec![Bytes::from_static(b"dt"); 2]);
    }

    #[test]
    fn combine_concatenates_scratch() {
        let outputs = CombineKernel
            .execute(
                &[],
                &[Bytes::from_static(b"ab"), Bytes::from_static(b"cd")],
                1,
            )
            .unwrap();
        assert_eq!(outputs[0], Bytes::from_static(b"abcd"));
    }
}
