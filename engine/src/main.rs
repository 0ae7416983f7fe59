// Runway image build control plane
// Main entry point for the runway binary

use clap::Parser;
use runway_engine::cli::{Cli, Command};
use runway_engine::config::Config;
use runway_engine::handlers::{
    handle_build, handle_logs, handle_reap, handle_status, OutputFormat,
};
use runway_engine::telemetry::init_telemetry_with_level;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config; RUST_LOG wins over both
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");
    tracing::info!("Runway v{} ({} - {})", version, commit, timestamp);

    // Handle commands
    match cli.command {
        Command::Build(args) => {
            tracing::info!("Building {} from {}", args.target, args.source);
            handle_build(args, &config, format).await
        }

        Command::Reap {
            caller,
            max_age_hours,
        } => {
            tracing::info!("Reaping jobs (caller '{}')", caller);
            handle_reap(&caller, max_age_hours, &config, format).await
        }

        Command::Status { job } => handle_status(&job, &config, format).await,

        Command::Logs { job, timeout_secs } => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            handle_logs(&job, timeout_secs, &config, format, cancel).await
        }
    }
}
