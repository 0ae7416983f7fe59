//! Runway Engine Library
//!
//! This library provides the build control plane of Runway.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Cluster resource gateway
pub mod gateway;

/// Build session naming
pub mod session;

/// Registry host and credential resolution
pub mod registry;

/// Build context assembly
pub mod context;

/// Stale build job collection
pub mod reaper;

/// Build orchestration
pub mod orchestrator;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
