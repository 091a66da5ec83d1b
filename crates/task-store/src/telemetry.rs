//! Tracing initialisation.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::StoreConfig;

/// Installs the global subscriber.
///
/// The filter comes from `RUST_LOG` and falls back to the configured level.
/// Local and test environments get human-readable output, others JSON.
/// Returns false when a subscriber was already installed.
pub fn init_tracing(config: &StoreConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.environment.is_interactive() {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    };

    match installed {
        Ok(()) => {
            tracing::info!(environment = %config.environment, "Tracing initialised");
            true
        }
        Err(_) => false,
    }
}
