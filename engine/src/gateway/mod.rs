//! Cluster Resource Gateway
//!
//! The only place where the control plane talks to the cluster. The
//! `ClusterResourceGateway` trait covers the four resource kinds a build
//! touches (config objects, credential objects, batch jobs and pods). Every
//! operation is a single request: no retries, no backoff. Callers decide
//! which failures are fatal.
//!
//! Two implementations exist:
//! - [`kubernetes::KubeGateway`] talks to a real API server
//! - [`memory::InMemoryGateway`] keeps everything in process, for tests and
//!   dry runs

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sdk::errors::GatewayError;
use sdk::manifest::{ContextSpec, CredentialSpec, JobSpec};
use sdk::types::JobRecord;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod kubernetes;
pub mod memory;

pub use self::kubernetes::KubeGateway;
pub use self::memory::InMemoryGateway;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// A config object as observed in the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigObject {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
}

/// A credential object as observed in the cluster
///
/// The payload is never read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialObject {
    pub name: String,
    pub type_name: Option<String>,
}

/// Job accepted by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub name: String,
    pub uid: Option<String>,
}

/// Bounds for waiting on a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

/// CRUD surface over the cluster resources used by builds
#[async_trait]
pub trait ClusterResourceGateway: Send + Sync {
    /// Fetch a config object; `Ok(None)` when it does not exist
    async fn get_config_object(&self, name: &str) -> Result<Option<ConfigObject>>;

    async fn create_config_object(&self, spec: &ContextSpec) -> Result<()>;

    async fn delete_config_object(&self, name: &str) -> Result<()>;

    /// Fetch a credential object; `Ok(None)` when it does not exist
    async fn get_credential_object(&self, name: &str) -> Result<Option<CredentialObject>>;

    async fn create_credential_object(&self, spec: &CredentialSpec) -> Result<()>;

    async fn delete_credential_object(&self, name: &str) -> Result<()>;

    async fn create_job(&self, spec: &JobSpec) -> Result<SubmittedJob>;

    /// List jobs whose name starts with `name_prefix`
    async fn list_jobs(&self, name_prefix: &str) -> Result<Vec<JobRecord>>;

    /// Delete a job together with its pods
    async fn delete_job(&self, name: &str) -> Result<()>;

    async fn get_job_status(&self, name: &str) -> Result<JobRecord>;

    /// Single lookup of a pod carrying the job's label
    async fn find_pod_by_job_label(&self, job_name: &str) -> Result<Option<String>>;

    /// Follow a pod's log, forwarding each line to `lines`
    ///
    /// Returns the number of lines forwarded once the log ends or the
    /// receiver is dropped.
    async fn stream_pod_logs(&self, pod_name: &str, lines: mpsc::Sender<String>) -> Result<usize>;

    /// Wait until a pod carrying the job's label exists
    ///
    /// Polls [`find_pod_by_job_label`](Self::find_pod_by_job_label) every
    /// `poll.interval`. Fails with `Timeout` once `poll.timeout` has elapsed
    /// and with `Cancelled` when `cancel` fires. Lookup errors end the wait.
    async fn get_pod_by_job_label(
        &self,
        job_name: &str,
        poll: PollSettings,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let deadline = tokio::time::Instant::now() + poll.timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled(format!("pod of job {}", job_name)));
            }

            if let Some(pod) = self.find_pod_by_job_label(job_name).await? {
                tracing::debug!("Found pod {} for job {}", pod, job_name);
                return Ok(pod);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(GatewayError::Timeout {
                    what: format!("pod of job {}", job_name),
                    after: poll.timeout,
                });
            }

            let wake = std::cmp::min(now + poll.interval, deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GatewayError::Cancelled(format!("pod of job {}", job_name)));
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}
