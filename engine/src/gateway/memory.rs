//! In-process gateway
//!
//! Keeps config objects, credentials, jobs and pods in memory. Used by the
//! test suites and by `build --dry-run`. Individual operations can be made
//! to fail so error paths of the pipeline can be exercised.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sdk::errors::{GatewayError, GatewayOperation};
use sdk::manifest::{ContextSpec, CredentialSpec, JobSpec};
use sdk::types::JobRecord;
use tokio::sync::mpsc;

use super::{ClusterResourceGateway, ConfigObject, CredentialObject, Result, SubmittedJob};

#[derive(Debug, Clone)]
struct StoredPod {
    name: String,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    config_objects: BTreeMap<String, ConfigObject>,
    credentials: BTreeMap<String, CredentialSpec>,
    jobs: BTreeMap<String, JobRecord>,
    submitted: Vec<JobSpec>,
    pods: BTreeMap<String, StoredPod>,
    /// Number of pod lookups to answer with "not found" before a pod shows up
    pod_delay: usize,
    failures: HashSet<GatewayOperation>,
    calls: Vec<GatewayOperation>,
}

/// Gateway backed by process memory
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and fail it when a failure was injected
    fn enter(&self, operation: GatewayOperation) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(operation);
        if state.failures.contains(&operation) {
            return Err(GatewayError::api(operation, "injected failure"));
        }
        Ok(state)
    }

    /// Make every future call of `operation` fail
    pub fn fail(&self, operation: GatewayOperation) {
        self.state().failures.insert(operation);
    }

    /// Stop failing `operation`
    pub fn recover(&self, operation: GatewayOperation) {
        self.state().failures.remove(&operation);
    }

    /// Operations invoked so far, in order
    pub fn calls(&self) -> Vec<GatewayOperation> {
        self.state().calls.clone()
    }

    pub fn insert_config_object(&self, object: ConfigObject) {
        self.state()
            .config_objects
            .insert(object.name.clone(), object);
    }

    pub fn insert_job_record(&self, record: JobRecord) {
        self.state().jobs.insert(record.name.clone(), record);
    }

    /// Attach a pod with a canned log to a job
    pub fn insert_pod(&self, job_name: &str, pod_name: &str, logs: &[&str]) {
        self.state().pods.insert(
            job_name.to_string(),
            StoredPod {
                name: pod_name.to_string(),
                logs: logs.iter().map(|l| l.to_string()).collect(),
            },
        );
    }

    /// Hide pods from the next `lookups` pod lookups
    pub fn delay_pods(&self, lookups: usize) {
        self.state().pod_delay = lookups;
    }

    pub fn config_object(&self, name: &str) -> Option<ConfigObject> {
        self.state().config_objects.get(name).cloned()
    }

    pub fn config_object_names(&self) -> Vec<String> {
        self.state().config_objects.keys().cloned().collect()
    }

    pub fn credential(&self, name: &str) -> Option<CredentialSpec> {
        self.state().credentials.get(name).cloned()
    }

    pub fn credential_names(&self) -> Vec<String> {
        self.state().credentials.keys().cloned().collect()
    }

    pub fn job_names(&self) -> Vec<String> {
        self.state().jobs.keys().cloned().collect()
    }

    /// Job specs accepted by `create_job`, in submission order
    pub fn submitted_jobs(&self) -> Vec<JobSpec> {
        self.state().submitted.clone()
    }
}

fn not_found(operation: GatewayOperation, kind: &str, name: &str) -> GatewayError {
    GatewayError::api(operation, format!("{} \"{}\" not found", kind, name))
}

fn already_exists(operation: GatewayOperation, kind: &str, name: &str) -> GatewayError {
    GatewayError::api(operation, format!("{} \"{}\" already exists", kind, name))
}

#[async_trait]
impl ClusterResourceGateway for InMemoryGateway {
    async fn get_config_object(&self, name: &str) -> Result<Option<ConfigObject>> {
        let state = self.enter(GatewayOperation::GetConfigObject)?;
        Ok(state.config_objects.get(name).cloned())
    }

    async fn create_config_object(&self, spec: &ContextSpec) -> Result<()> {
        let op = GatewayOperation::CreateConfigObject;
        let mut state = self.enter(op)?;
        if state.config_objects.contains_key(&spec.name) {
            return Err(already_exists(op, "configmaps", &spec.name));
        }
        state.config_objects.insert(
            spec.name.clone(),
            ConfigObject {
                name: spec.name.clone(),
                annotations: BTreeMap::new(),
                data: spec.files.clone(),
            },
        );
        Ok(())
    }

    async fn delete_config_object(&self, name: &str) -> Result<()> {
        let op = GatewayOperation::DeleteConfigObject;
        let mut state = self.enter(op)?;
        state
            .config_objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(op, "configmaps", name))
    }

    async fn get_credential_object(&self, name: &str) -> Result<Option<CredentialObject>> {
        let state = self.enter(GatewayOperation::GetCredentialObject)?;
        Ok(state.credentials.get(name).map(|spec| CredentialObject {
            name: spec.name.clone(),
            type_name: Some(spec.kind.type_name().to_string()),
        }))
    }

    async fn create_credential_object(&self, spec: &CredentialSpec) -> Result<()> {
        let op = GatewayOperation::CreateCredentialObject;
        let mut state = self.enter(op)?;
        if state.credentials.contains_key(&spec.name) {
            return Err(already_exists(op, "secrets", &spec.name));
        }
        state.credentials.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_credential_object(&self, name: &str) -> Result<()> {
        let op = GatewayOperation::DeleteCredentialObject;
        let mut state = self.enter(op)?;
        state
            .credentials
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(op, "secrets", name))
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<SubmittedJob> {
        let op = GatewayOperation::CreateJob;
        let mut state = self.enter(op)?;
        if state.jobs.contains_key(&spec.name) {
            return Err(already_exists(op, "jobs", &spec.name));
        }
        state.jobs.insert(
            spec.name.clone(),
            JobRecord {
                name: spec.name.clone(),
                creation_time: Some(Utc::now()),
                completion_time: None,
                conditions: Vec::new(),
            },
        );
        state.submitted.push(spec.clone());

        Ok(SubmittedJob {
            name: spec.name.clone(),
            uid: Some(uuid::Uuid::new_v4().to_string()),
        })
    }

    async fn list_jobs(&self, name_prefix: &str) -> Result<Vec<JobRecord>> {
        let state = self.enter(GatewayOperation::ListJobs)?;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.name.starts_with(name_prefix))
            .cloned()
            .collect())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        let op = GatewayOperation::DeleteJob;
        let mut state = self.enter(op)?;
        state.pods.remove(name);
        state
            .jobs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(op, "jobs", name))
    }

    async fn get_job_status(&self, name: &str) -> Result<JobRecord> {
        let op = GatewayOperation::GetJobStatus;
        let state = self.enter(op)?;
        state
            .jobs
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(op, "jobs", name))
    }

    async fn find_pod_by_job_label(&self, job_name: &str) -> Result<Option<String>> {
        let mut state = self.enter(GatewayOperation::FindPod)?;
        if state.pod_delay > 0 {
            state.pod_delay -= 1;
            return Ok(None);
        }
        Ok(state.pods.get(job_name).map(|pod| pod.name.clone()))
    }

    async fn stream_pod_logs(&self, pod_name: &str, lines: mpsc::Sender<String>) -> Result<usize> {
        let op = GatewayOperation::StreamPodLogs;
        let logs = {
            let state = self.enter(op)?;
            state
                .pods
                .values()
                .find(|pod| pod.name == pod_name)
                .map(|pod| pod.logs.clone())
                .ok_or_else(|| not_found(op, "pods", pod_name))?
        };

        let mut forwarded = 0;
        for line in logs {
            if lines.send(line).await.is_err() {
                break;
            }
            forwarded += 1;
        }
        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::PollSettings;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn fast_poll() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_config_object_lifecycle() {
        let gateway = InMemoryGateway::new();
        let spec = ContextSpec::new("cm-1").with_file("Dockerfile", "FROM x\n");

        gateway.create_config_object(&spec).await.unwrap();
        assert!(gateway.create_config_object(&spec).await.is_err());

        let found = gateway.get_config_object("cm-1").await.unwrap().unwrap();
        assert_eq!(found.data.get("Dockerfile").unwrap(), "FROM x\n");

        gateway.delete_config_object("cm-1").await.unwrap();
        assert!(gateway.get_config_object("cm-1").await.unwrap().is_none());
        assert!(gateway.delete_config_object("cm-1").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let gateway = InMemoryGateway::new();
        gateway.fail(GatewayOperation::ListJobs);

        let err = gateway.list_jobs("build-").await.unwrap_err();
        assert_eq!(err.operation(), Some(GatewayOperation::ListJobs));

        gateway.recover(GatewayOperation::ListJobs);
        assert!(gateway.list_jobs("build-").await.unwrap().is_empty());
        assert_eq!(
            gateway.calls(),
            vec![GatewayOperation::ListJobs, GatewayOperation::ListJobs]
        );
    }

    #[tokio::test]
    async fn test_list_jobs_filters_by_prefix() {
        let gateway = InMemoryGateway::new();
        for name in ["build-alice-1", "build-bob-1", "other"] {
            gateway.insert_job_record(JobRecord {
                name: name.to_string(),
                creation_time: None,
                completion_time: None,
                conditions: vec![],
            });
        }

        let jobs = gateway.list_jobs("build-alice-").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "build-alice-1");
    }

    #[tokio::test]
    async fn test_pod_poll_finds_delayed_pod() {
        let gateway = InMemoryGateway::new();
        gateway.insert_pod("build-1", "build-1-xyz", &["step 1"]);
        gateway.delay_pods(3);

        let pod = gateway
            .get_pod_by_job_label("build-1", fast_poll(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(pod, "build-1-xyz");
        assert_eq!(
            gateway
                .calls()
                .iter()
                .filter(|op| **op == GatewayOperation::FindPod)
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn test_pod_poll_times_out() {
        let gateway = InMemoryGateway::new();

        let err = gateway
            .get_pod_by_job_label("build-1", fast_poll(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_pod_poll_cancelled() {
        let gateway = InMemoryGateway::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gateway
            .get_pod_by_job_label("build-1", fast_poll(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_stream_pod_logs() {
        let gateway = InMemoryGateway::new();
        gateway.insert_pod("build-1", "build-1-xyz", &["one", "two"]);

        let (tx, mut rx) = mpsc::channel(8);
        let count = gateway.stream_pod_logs("build-1-xyz", tx).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        assert!(rx.recv().await.is_none());
    }
}
