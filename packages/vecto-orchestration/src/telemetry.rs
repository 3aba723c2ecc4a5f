//! Tracing setup for binaries embedding the orchestrator

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
///
/// Safe to call more than once; returns `false` when a global subscriber was
/// already installed. Audit lines go to the `vecto::audit` target, so
/// `RUST_LOG=warn,vecto::audit=info` keeps only warnings plus the audit trail.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
