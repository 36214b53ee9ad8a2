//! Distributed runtime for large, iterative data-parallel simulations.
//!
//! Nimbus executes simulations expressed as a dynamic graph of fine-grained
//! tasks over partitioned logical data. A central controller coordinates a
//! fleet of workers: application code spawns tasks upward, the controller
//! tracks per-datum version lineage, binds ready tasks to workers,
//! materializes the physical data instances each task reads and writes, and
//! emits resolved compute and copy commands downward.
//!
//! Simulations repeat the same sub-DAG every frame, so the system memoizes
//! the pattern as a *template*: the controller records it once and
//! instantiates it thereafter by binding fresh ids to precomputed slots,
//! while each worker keeps a pre-wired *execution template* whose
//! instantiation is a parameter refresh rather than graph reconstruction.
//!
//! The crate is organized leaves-first:
//! - [`ids`], [`geometry`], [`error`], [`retry`], [`serializer`], [`config`]
//!   hold the shared vocabulary;
//! - [`command`] is the controller/worker transport contract and
//!   [`transport`] the seam it travels through;
//! - [`registry`], [`lineage`], [`graph`], [`physical`], [`template`],
//!   [`checkpoint`] are the controller's catalogs, with [`binder`]
//!   implementing assignment and [`controller`] the scheduler core;
//! - [`execution`], [`kernel`], [`worker`] form the worker side.

pub mod binder;
pub mod checkpoint;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod geometry;
pub mod graph;
pub mod ids;
pub mod kernel;
pub mod lineage;
pub mod physical;
pub mod registry;
pub mod retry;
pub mod serializer;
pub mod template;
pub mod transport;
pub mod worker;

pub use error::{NimbusError, Result};
