//! Error types and handling
//!
//! This module provides the error types used throughout the Runway control
//! plane. All errors implement the `RunwayErrorExt` trait which provides
//! user-friendly hints, indicates whether errors are recoverable, and maps
//! each error onto the status code an HTTP front end should answer with.
//!
//! # Error Categories
//!
//! - **Validation**: the request cannot be built as given (4xx, never retried)
//! - **Cluster**: a cluster API call failed while executing a pipeline step (5xx)
//! - **Scratch**: the local scratch area could not be written
//! - **Configuration**: invalid or unreadable configuration
//!
//! Cleanup and reaper failures are deliberately absent: they are logged by the
//! engine and never become the result of a build.
//!
//! # Security
//!
//! Messages never include registry passwords or decoded dependency content.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Trait for Runway error extensions
pub trait RunwayErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// credentials or cluster internals.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors may succeed when the caller issues a new build
    /// request. The engine itself never retries.
    fn is_recoverable(&self) -> bool;

    /// HTTP status code equivalent for this error
    fn status_code(&self) -> u16;
}

/// Request validation failures
///
/// Raised before any cluster resource is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No {0} provided for build")]
    MissingField(&'static str),

    #[error("Unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("Invalid target image reference '{0}': expected <namespace>:<name>")]
    InvalidTarget(String),

    #[error("Invalid source image {0:?}")]
    InvalidSource(String),

    #[error("Invalid registry host {0:?}: expected host[:port]")]
    InvalidRegistryHost(String),

    #[error("Target namespace '{namespace}' does not belong to caller '{caller}'")]
    TargetNamespaceMismatch { caller: String, namespace: String },

    #[error("Invalid dependency file: {0}")]
    InvalidDependencyBlob(String),

    #[error("Invalid caller id '{0}'")]
    InvalidCallerId(String),

    #[error("Invalid registry credential override")]
    InvalidCredentialOverride,

    #[error("Invalid retention window of {0} hours")]
    InvalidMaxAge(u32),

    #[error("Invalid build directory {0:?}: no build descriptor")]
    InvalidBuildDir(PathBuf),
}

/// Cluster API operations exposed by the resource gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOperation {
    GetConfigObject,
    CreateConfigObject,
    DeleteConfigObject,
    GetCredentialObject,
    CreateCredentialObject,
    DeleteCredentialObject,
    CreateJob,
    ListJobs,
    DeleteJob,
    GetJobStatus,
    FindPod,
    StreamPodLogs,
}

impl fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayOperation::GetConfigObject => "get config object",
            GatewayOperation::CreateConfigObject => "create config object",
            GatewayOperation::DeleteConfigObject => "delete config object",
            GatewayOperation::GetCredentialObject => "get credential object",
            GatewayOperation::CreateCredentialObject => "create credential object",
            GatewayOperation::DeleteCredentialObject => "delete credential object",
            GatewayOperation::CreateJob => "create job",
            GatewayOperation::ListJobs => "list jobs",
            GatewayOperation::DeleteJob => "delete job",
            GatewayOperation::GetJobStatus => "get job status",
            GatewayOperation::FindPod => "find pod",
            GatewayOperation::StreamPodLogs => "stream pod logs",
        };
        f.write_str(name)
    }
}

/// Failures at the cluster resource gateway boundary
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{operation} failed: {message}")]
    Api {
        operation: GatewayOperation,
        message: String,
    },

    #[error("{operation} returned an undecodable payload: {message}")]
    Decode {
        operation: GatewayOperation,
        message: String,
    },

    #[error("Cluster connection failed: {0}")]
    Connect(String),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Cancelled while waiting for {0}")]
    Cancelled(String),
}

impl GatewayError {
    /// Shorthand for an API failure of `operation`
    pub fn api(operation: GatewayOperation, message: impl Into<String>) -> Self {
        Self::Api {
            operation,
            message: message.into(),
        }
    }

    /// Operation that failed, when the failure came from an API call
    pub fn operation(&self) -> Option<GatewayOperation> {
        match self {
            Self::Api { operation, .. } | Self::Decode { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

/// Steps of the build pipeline, used to attribute cluster failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    ReapJobs,
    EnsureToolchain,
    CreateCredential,
    CreateContext,
    SubmitJob,
    DeleteContext,
    DeleteCredential,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStep::ReapJobs => "reap jobs",
            BuildStep::EnsureToolchain => "ensure toolchain config",
            BuildStep::CreateCredential => "create credential",
            BuildStep::CreateContext => "create build context",
            BuildStep::SubmitJob => "submit job",
            BuildStep::DeleteContext => "delete build context",
            BuildStep::DeleteCredential => "delete credential",
        };
        f.write_str(name)
    }
}

/// Main build error type
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Build step '{step}' failed: {source}")]
    Cluster {
        step: BuildStep,
        #[source]
        source: GatewayError,
    },

    #[error("Scratch area error: {0}")]
    Scratch(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BuildError {
    /// Attribute a gateway failure to a pipeline step
    pub fn cluster(step: BuildStep, source: GatewayError) -> Self {
        Self::Cluster { step, source }
    }
}

impl RunwayErrorExt for ValidationError {
    fn user_hint(&self) -> &str {
        match self {
            Self::MissingField(_) => "The build request is missing a required field",
            Self::UnsupportedKind(_) => {
                "Use one of: python, nodejs, php, java, go, ruby, dotnet"
            }
            Self::InvalidTarget(_) => {
                "The target must look like <namespace>:<name> using image name characters"
            }
            Self::InvalidSource(_) => "The source image must not contain spaces or control characters",
            Self::InvalidRegistryHost(_) => "REGISTRY_HOST must be a host name with an optional port",
            Self::TargetNamespaceMismatch { .. } => "You can only build images in your namespace",
            Self::InvalidDependencyBlob(_) => "The dependency file must be base64-encoded text",
            Self::InvalidCallerId(_) => "The caller id is not usable as a resource name",
            Self::InvalidCredentialOverride => "REGISTRY_SECRET must be a secret name or user:pass",
            Self::InvalidMaxAge(_) => "Use a smaller max age for reaping jobs",
            Self::InvalidBuildDir(_) => "The build context could not be prepared",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }

    fn status_code(&self) -> u16 {
        400
    }
}

impl RunwayErrorExt for GatewayError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Api { .. } => "The cluster rejected the request. Check cluster permissions",
            Self::Decode { .. } => "The cluster answered with an unexpected payload",
            Self::Connect(_) => "Could not reach the cluster API. Check your kube config",
            Self::Timeout { .. } => "The build pod did not appear in time. Try again later",
            Self::Cancelled(_) => "The operation was cancelled",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Decode { .. })
    }

    fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => 504,
            _ => 500,
        }
    }
}

impl RunwayErrorExt for BuildError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Validation(e) => e.user_hint(),
            Self::Cluster { source, .. } => source.user_hint(),
            Self::Scratch(_) => "Build process failed while preparing the build context",
            Self::Config(_) => "Check your config.toml file for errors",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Config(_) => false,
            Self::Cluster { source, .. } => source.is_recoverable(),
            Self::Scratch(_) => true,
        }
    }

    fn status_code(&self) -> u16 {
        match self {
            Self::Validation(e) => e.status_code(),
            Self::Cluster { source, .. } => source.status_code(),
            _ => 500,
        }
    }
}
