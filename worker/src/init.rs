use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
