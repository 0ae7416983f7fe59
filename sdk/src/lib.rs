//! Runway SDK
//!
//! Shared library providing the request, job and manifest types of the
//! Runway build control plane, together with its error taxonomy.
//! This crate performs no I/O.

/// Error types and handling
pub mod errors;

/// Build request and job types
pub mod types;

/// Manifest types for cluster resources
pub mod manifest;

// Re-export commonly used types
pub use errors::{
    BuildError, BuildStep, GatewayError, GatewayOperation, RunwayErrorExt, ValidationError,
};
pub use manifest::{ContextSpec, CredentialKind, CredentialSpec, JobSpec};
pub use types::{
    BuildPayload, BuildRequest, JobCondition, JobHandle, JobPhase, JobRecord, RegistryOverrides,
    RuntimeKind, TargetImageRef,
};
