//! CLI interface for Runway
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags of the build control plane.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::MAX_REAP_AGE_HOURS;

/// Runway image build control plane
///
/// Turns a runtime base image plus an optional dependency manifest into a
/// build job on the cluster, and keeps old build jobs in check.
#[derive(Parser, Debug)]
#[command(name = "runway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit a build job
    Build(BuildArgs),

    /// Delete completed build jobs past the retention window
    Reap {
        /// Only reap jobs of this caller
        #[arg(long, default_value = "")]
        caller: String,

        /// Retention window in hours (default: from config)
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_REAP_AGE_HOURS)))]
        max_age_hours: Option<u32>,
    },

    /// Show the state of a build job
    Status {
        /// Job name
        job: String,
    },

    /// Follow the log of a build job's pod
    Logs {
        /// Job name
        job: String,

        /// Give up waiting for the pod after this many seconds (default: from config)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

/// Arguments of `runway build`
#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Base runtime image, e.g. python:3.11
    #[arg(long)]
    pub source: String,

    /// Target image as <namespace>:<name>
    #[arg(long)]
    pub target: String,

    /// Runtime kind (python, nodejs, php, java, go, ruby, dotnet)
    #[arg(long)]
    pub kind: String,

    /// Dependency manifest to install into the image
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Caller the build runs for; must own the target namespace
    #[arg(long, default_value = "")]
    pub caller: String,

    /// Registry host override (falls back to REGISTRY_HOST)
    #[arg(long)]
    pub registry_host: Option<String>,

    /// Existing credential name or user:pass (falls back to REGISTRY_SECRET)
    #[arg(long)]
    pub registry_secret: Option<String>,

    /// Build without pushing the image
    #[arg(long)]
    pub demo: bool,

    /// Run against an in-memory cluster and print the job instead of submitting it
    #[arg(long)]
    pub dry_run: bool,
}
