use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "math_expression_extractor=info,tower_http=info";

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// [`DEFAULT_FILTER`]. Call once, before anything logs.
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(env_filter)
        .init();
}
