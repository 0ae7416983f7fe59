//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - build: Validate a request and submit a build job (or dry-run it)
//! - reap: Delete completed jobs past the retention window
//! - status: Show the phase of a build job
//! - logs: Follow the log of a build job's pod

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sdk::errors::{BuildError, RunwayErrorExt};
use sdk::types::{BuildPayload, BuildRequest, JobHandle, RegistryOverrides};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::BuildArgs;
use crate::config::Config;
use crate::gateway::kubernetes::job_manifest;
use crate::gateway::{ClusterResourceGateway, InMemoryGateway, KubeGateway, PollSettings};
use crate::orchestrator::JobOrchestrator;
use crate::reaper::JobReaper;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Attach the user-facing hint to a build error
fn with_hint(err: BuildError) -> anyhow::Error {
    let hint = err.user_hint().to_string();
    anyhow::Error::new(err).context(hint)
}

/// Connect to the cluster described by the config
async fn connect(config: &Config) -> Result<Arc<dyn ClusterResourceGateway>> {
    let gateway = KubeGateway::connect(config.cluster.context.as_deref(), &config.core.namespace)
        .await
        .context("Failed to connect to the cluster")?;
    Ok(Arc::new(gateway))
}

/// Wire payload for the arguments of `runway build`
fn build_payload(args: &BuildArgs) -> Result<BuildPayload> {
    let file = match &args.file {
        Some(path) => {
            let content = std::fs::read(path)
                .with_context(|| format!("Failed to read dependency file {}", path.display()))?;
            Some(STANDARD.encode(content))
        }
        None => None,
    };

    Ok(BuildPayload {
        source: Some(args.source.clone()),
        target: Some(args.target.clone()),
        kind: Some(args.kind.clone()),
        file,
    })
}

/// Flags win over `REGISTRY_HOST` / `REGISTRY_SECRET` in the environment
fn registry_overrides(args: &BuildArgs, env: &HashMap<String, String>) -> RegistryOverrides {
    let from_env = RegistryOverrides::from_env(env);
    RegistryOverrides {
        host: args.registry_host.clone().or(from_env.host),
        secret: args.registry_secret.clone().or(from_env.secret),
    }
}

fn print_handle(handle: &JobHandle, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("✓ Build job submitted");
            println!("  Job:     {}", handle.name);
            println!("  Image:   {}", handle.image);
            println!("  Session: {}", handle.session_id);
        }
        OutputFormat::Json => {
            let output = json!({
                "status": "submitted",
                "job": handle,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Validate a build request and submit it
///
/// With `--dry-run` the whole pipeline runs against an in-memory cluster
/// and the job that would have been submitted is printed.
pub async fn handle_build(args: BuildArgs, config: &Config, format: OutputFormat) -> Result<()> {
    let request = BuildRequest::try_from(build_payload(&args)?)
        .map_err(|e| with_hint(BuildError::from(e)))?;
    if !args.caller.is_empty() {
        request
            .ensure_owned_by(&args.caller)
            .map_err(|e| with_hint(BuildError::from(e)))?;
    }

    let env: HashMap<String, String> = std::env::vars().collect();
    let overrides = registry_overrides(&args, &env);

    let mut config = config.clone();
    if args.demo {
        config.builder.demo_mode = true;
    }

    if args.dry_run {
        return dry_run(&request, &args.caller, &overrides, &config, format).await;
    }

    let orchestrator = JobOrchestrator::new(connect(&config).await?, &config);
    let handle = orchestrator
        .build(&request, &args.caller, &overrides)
        .await
        .map_err(with_hint)?;

    print_handle(&handle, format)
}

async fn dry_run(
    request: &BuildRequest,
    caller: &str,
    overrides: &RegistryOverrides,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let gateway = Arc::new(InMemoryGateway::new());
    let orchestrator = JobOrchestrator::new(gateway.clone(), config);

    let handle = orchestrator
        .build(request, caller, overrides)
        .await
        .map_err(with_hint)?;
    let job = gateway
        .submitted_jobs()
        .into_iter()
        .next()
        .context("Dry run did not submit a job")?;
    let manifest = job_manifest(&job);

    match format {
        OutputFormat::Text => {
            println!("Dry run: {} would build {}", handle.name, handle.image);
            println!();
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        OutputFormat::Json => {
            let output = json!({
                "status": "dry_run",
                "job": handle,
                "manifest": manifest,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Delete a caller's completed jobs older than the retention window
///
/// A failed scan is reported as a count of -1.
pub async fn handle_reap(
    caller: &str,
    max_age_hours: Option<u32>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let max_age_hours = max_age_hours.unwrap_or(config.reaper.max_age_hours);
    let reaper = JobReaper::new(connect(config).await?);

    let outcome = reaper.reap(caller, max_age_hours).await;
    let count = match &outcome {
        Ok(count) => *count as i64,
        Err(e) => {
            tracing::error!("Reap failed: {}", e);
            -1
        }
    };

    match format {
        OutputFormat::Text => match &outcome {
            Ok(_) => println!("Reaped {} jobs older than {}h", count, max_age_hours),
            Err(e) => println!("Reap failed ({}): {}", count, e),
        },
        OutputFormat::Json => {
            let output = json!({
                "caller": caller,
                "max_age_hours": max_age_hours,
                "count": count,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    outcome.map(|_| ()).map_err(with_hint)
}

/// Show the phase of a build job
pub async fn handle_status(job: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let gateway = connect(config).await?;
    let record = gateway
        .get_job_status(job)
        .await
        .with_context(|| format!("Failed to get status of job {}", job))?;

    match format {
        OutputFormat::Text => {
            println!("Job:       {}", record.name);
            println!("Phase:     {:?}", record.phase());
            if let Some(created) = record.creation_time {
                println!("Created:   {}", created.to_rfc3339());
            }
            if let Some(completed) = record.completion_time {
                println!("Completed: {}", completed.to_rfc3339());
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "job": record,
                "phase": record.phase(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Follow a build job's pod log until it ends or `cancel` fires
pub async fn handle_logs(
    job: &str,
    timeout_secs: Option<u64>,
    config: &Config,
    format: OutputFormat,
    cancel: CancellationToken,
) -> Result<()> {
    let gateway = connect(config).await?;
    let poll = PollSettings {
        interval: config.pods.interval(),
        timeout: timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| config.pods.timeout()),
    };

    let pod = gateway
        .get_pod_by_job_label(job, poll, &cancel)
        .await
        .with_context(|| format!("No pod found for job {}", job))?;
    tracing::info!("Streaming log of pod {}", pod);

    let (tx, mut rx) = mpsc::channel::<String>(64);
    let stream = {
        let gateway = gateway.clone();
        let pod = pod.clone();
        tokio::spawn(async move { gateway.stream_pod_logs(&pod, tx).await })
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stream.abort();
                break;
            }
            line = rx.recv() => match line {
                Some(line) => match format {
                    OutputFormat::Text => println!("{}", line),
                    OutputFormat::Json => println!("{}", json!({ "pod": pod, "line": line })),
                },
                None => break,
            },
        }
    }

    if cancel.is_cancelled() {
        tracing::info!("Log streaming cancelled");
        return Ok(());
    }

    let forwarded = stream
        .await
        .context("Log streaming task failed")?
        .context("Failed to stream pod log")?;
    tracing::debug!("Streamed {} lines from {}", forwarded, pod);
    Ok(())
}
