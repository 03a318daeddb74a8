pub mod config;
pub mod models;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

pub use pipeline::build_pipeline;
pub use pipeline::coordinator::{PipelineCoordinator, PipelineInput, RunReport};

/// Install the global fmt subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));
    // A subscriber may already be installed by the embedding application.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
