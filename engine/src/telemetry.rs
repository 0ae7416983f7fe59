//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for structured logging of the build
//! pipeline. Log levels come from config, `RUST_LOG` overrides them, and
//! output switches between pretty (debug) and JSON (release).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the filter directive for a log level
///
/// Dependency crates (the cluster client in particular) stay at `warn`
/// unless the level asks for more detail than that.
fn filter_directive(log_level: &str) -> String {
    let deps = match log_level {
        "debug" | "trace" => log_level,
        _ => "warn",
    };
    format!(
        "{},runway_engine={},sdk={},kube={},hyper={}",
        log_level, log_level, log_level, deps, deps
    )
}

/// Initialize the tracing subscriber with the given log level from config.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info"
///
/// In debug builds: pretty-printed terminal output.
/// In release builds: JSON structured output with spans.
///
/// Only the first successful call installs a subscriber.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }
}
