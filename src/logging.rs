//! Structured logging via `tracing`.
//!
//! Request handlers log under their instrumented spans. Durable-write failures
//! are additionally emitted under the `alert` target so operators can route them.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error, off. `RUST_LOG` takes precedence.
    pub level: String,
    /// text or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    let res = if config.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    if res.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
