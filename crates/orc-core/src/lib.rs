pub mod collaborators;
pub mod config;
pub mod error;
pub mod retry;
pub mod template;
pub mod vars;
pub mod workflow;

pub use error::{OrcError, Result};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("orchestrator tracing initialised");
}
