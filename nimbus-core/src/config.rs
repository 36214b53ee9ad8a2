//! Shared runtime configuration.
//!
//! Both the controller and worker binaries embed [`Config`] with
//! `#[command(flatten)]`, so a single flag vocabulary configures the whole
//! cluster. Flags carry defaults suitable for a single-machine run and env
//! fallbacks for deployment.

use clap::{Args, ValueEnum};

const HELP_HEADING: &str = "Nimbus options";

/// Main configuration for controller and worker runtimes.
#[derive(Args, Clone, Debug)]
pub struct Config {
    /// TCP port the controller listens on for admin commands.
    #[arg(long, short, help_heading = HELP_HEADING, env = "NIMBUS_PORT", default_value_t = 5800)]
    pub port: u16,

    /// Number of workers that must register before scheduling starts.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 2)]
    pub min_workers: usize,

    /// Maximum physical data instances a worker hosts before eviction.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 64)]
    pub instance_capacity: usize,

    /// Number of kernel threads per worker.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 4)]
    pub worker_threads: usize,

    /// Serialization format for command payloads.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Upper bound on commands the scheduler core drains per iteration.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 64)]
    pub command_batch_size: usize,

    /// Interval between worker handshakes, in milliseconds.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 1000)]
    pub handshake_interval_ms: u64,

    /// Consecutive missed handshakes before a worker is declared lost.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 5)]
    pub handshake_miss_threshold: u32,

    /// Take a checkpoint every this many template generations (0 disables).
    #[arg(long, help_heading = HELP_HEADING, default_value_t = 10)]
    pub checkpoint_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5800,
            min_workers: 2,
            instance_capacity: 64,
            worker_threads: 4,
            serializer: Serializer::Postcard,
            command_batch_size: 64,
            handshake_interval_ms: 1000,
            handshake_miss_threshold: 5,
            checkpoint_interval: 10,
        }
    }
}

/// Available serialization formats, as a CLI value.
#[derive(Clone, Copy, PartialEq, Eq, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}
