//! Kubernetes-backed gateway
//!
//! Translates the statically shaped manifests into Kubernetes wire objects
//! and performs one API call per operation. All objects live in a single
//! namespace chosen at construction time.

use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config as KubeConfig};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use async_trait::async_trait;
use sdk::errors::{GatewayError, GatewayOperation};
use sdk::manifest::{
    ContainerSpec, ContextSpec, CredentialSpec, JobSpec, VolumeSource, VolumeSpec,
};
use sdk::types::{JobCondition, JobRecord};

use super::{ClusterResourceGateway, ConfigObject, CredentialObject, Result, SubmittedJob};

/// Label the job controller puts on every pod it creates
pub const JOB_NAME_LABEL: &str = "job-name";

/// Gateway talking to a Kubernetes API server
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeGateway")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl KubeGateway {
    /// Wrap an existing client
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using an explicit kubeconfig context, or infer the
    /// configuration (in-cluster service account first, then kubeconfig)
    pub async fn connect(context: Option<&str>, namespace: impl Into<String>) -> Result<Self> {
        let config = match context {
            Some(context) => {
                let options = KubeConfigOptions {
                    context: Some(context.to_string()),
                    ..Default::default()
                };
                KubeConfig::from_kubeconfig(&options)
                    .await
                    .map_err(|e| GatewayError::Connect(e.to_string()))?
            }
            None => KubeConfig::infer()
                .await
                .map_err(|e| GatewayError::Connect(e.to_string()))?,
        };

        let client = Client::try_from(config).map_err(|e| GatewayError::Connect(e.to_string()))?;
        let namespace = namespace.into();
        tracing::info!("Connected to cluster (namespace {})", namespace);

        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn api_error(operation: GatewayOperation, err: kube::Error) -> GatewayError {
    GatewayError::api(operation, err.to_string())
}

fn from_wire<T: DeserializeOwned>(operation: GatewayOperation, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| GatewayError::Decode {
        operation,
        message: e.to_string(),
    })
}

#[async_trait]
impl ClusterResourceGateway for KubeGateway {
    async fn get_config_object(&self, name: &str) -> Result<Option<ConfigObject>> {
        tracing::debug!("GET configmap {}/{}", self.namespace, name);
        let found = self
            .config_maps()
            .get_opt(name)
            .await
            .map_err(|e| api_error(GatewayOperation::GetConfigObject, e))?;

        Ok(found.map(|cm| ConfigObject {
            name: cm.metadata.name.unwrap_or_else(|| name.to_string()),
            annotations: cm.metadata.annotations.unwrap_or_default(),
            data: cm.data.unwrap_or_default(),
        }))
    }

    async fn create_config_object(&self, spec: &ContextSpec) -> Result<()> {
        tracing::debug!("POST configmap {}/{}", self.namespace, spec.name);
        let cm: ConfigMap = from_wire(
            GatewayOperation::CreateConfigObject,
            context_manifest(spec),
        )?;
        self.config_maps()
            .create(&PostParams::default(), &cm)
            .await
            .map_err(|e| api_error(GatewayOperation::CreateConfigObject, e))?;
        Ok(())
    }

    async fn delete_config_object(&self, name: &str) -> Result<()> {
        tracing::debug!("DELETE configmap {}/{}", self.namespace, name);
        self.config_maps()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| api_error(GatewayOperation::DeleteConfigObject, e))?;
        Ok(())
    }

    async fn get_credential_object(&self, name: &str) -> Result<Option<CredentialObject>> {
        tracing::debug!("GET secret {}/{}", self.namespace, name);
        let found = self
            .secrets()
            .get_opt(name)
            .await
            .map_err(|e| api_error(GatewayOperation::GetCredentialObject, e))?;

        Ok(found.map(|secret| CredentialObject {
            name: secret.metadata.name.unwrap_or_else(|| name.to_string()),
            type_name: secret.type_,
        }))
    }

    async fn create_credential_object(&self, spec: &CredentialSpec) -> Result<()> {
        tracing::debug!("POST secret {}/{}", self.namespace, spec.name);
        let secret: Secret = from_wire(
            GatewayOperation::CreateCredentialObject,
            credential_manifest(spec),
        )?;
        self.secrets()
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| api_error(GatewayOperation::CreateCredentialObject, e))?;
        Ok(())
    }

    async fn delete_credential_object(&self, name: &str) -> Result<()> {
        tracing::debug!("DELETE secret {}/{}", self.namespace, name);
        self.secrets()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| api_error(GatewayOperation::DeleteCredentialObject, e))?;
        Ok(())
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<SubmittedJob> {
        tracing::debug!("POST job {}/{}", self.namespace, spec.name);
        let job: Job = from_wire(GatewayOperation::CreateJob, job_manifest(spec))?;
        let created = self
            .jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| api_error(GatewayOperation::CreateJob, e))?;

        Ok(SubmittedJob {
            name: created.metadata.name.unwrap_or_else(|| spec.name.clone()),
            uid: created.metadata.uid,
        })
    }

    async fn list_jobs(&self, name_prefix: &str) -> Result<Vec<JobRecord>> {
        tracing::debug!("LIST jobs {}/{}*", self.namespace, name_prefix);
        let jobs = self
            .jobs()
            .list(&ListParams::default())
            .await
            .map_err(|e| api_error(GatewayOperation::ListJobs, e))?;

        Ok(jobs
            .items
            .iter()
            .map(job_record)
            .filter(|record| record.name.starts_with(name_prefix))
            .collect())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        tracing::debug!("DELETE job {}/{}", self.namespace, name);
        self.jobs()
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| api_error(GatewayOperation::DeleteJob, e))?;
        Ok(())
    }

    async fn get_job_status(&self, name: &str) -> Result<JobRecord> {
        tracing::debug!("GET job {}/{}", self.namespace, name);
        let job = self
            .jobs()
            .get(name)
            .await
            .map_err(|e| api_error(GatewayOperation::GetJobStatus, e))?;
        Ok(job_record(&job))
    }

    async fn find_pod_by_job_label(&self, job_name: &str) -> Result<Option<String>> {
        let selector = format!("{}={}", JOB_NAME_LABEL, job_name);
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| api_error(GatewayOperation::FindPod, e))?;

        Ok(pods.items.into_iter().find_map(|pod| pod.metadata.name))
    }

    async fn stream_pod_logs(&self, pod_name: &str, lines: mpsc::Sender<String>) -> Result<usize> {
        let params = LogParams {
            follow: true,
            ..LogParams::default()
        };
        let reader = self
            .pods()
            .log_stream(pod_name, &params)
            .await
            .map_err(|e| api_error(GatewayOperation::StreamPodLogs, e))?;

        let mut stream = std::pin::pin!(reader.lines());
        let mut forwarded = 0;
        while let Some(line) = stream
            .try_next()
            .await
            .map_err(|e| GatewayError::api(GatewayOperation::StreamPodLogs, e.to_string()))?
        {
            if lines.send(line).await.is_err() {
                tracing::debug!("Log receiver for pod {} went away", pod_name);
                break;
            }
            forwarded += 1;
        }

        Ok(forwarded)
    }
}

/// Observed state of a job as the reaper and `status` see it
pub fn job_record(job: &Job) -> JobRecord {
    let status = job.status.as_ref();
    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .map(|c| JobCondition::new(c.type_.as_str(), c.status.as_str()))
                .collect()
        })
        .unwrap_or_default();

    JobRecord {
        name: job.metadata.name.clone().unwrap_or_default(),
        creation_time: job.metadata.creation_timestamp.as_ref().map(|t| t.0),
        completion_time: status.and_then(|s| s.completion_time.as_ref()).map(|t| t.0),
        conditions,
    }
}

/// Wire form of a build context
pub fn context_manifest(spec: &ContextSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": spec.name },
        "data": spec.files,
    })
}

/// Wire form of a credential object
pub fn credential_manifest(spec: &CredentialSpec) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": spec.name },
        "type": spec.kind.type_name(),
        "stringData": spec.payload,
    })
}

/// Wire form of a build job
pub fn job_manifest(spec: &JobSpec) -> Value {
    let volumes: Vec<Value> = spec.volumes.iter().map(volume_manifest).collect();

    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": spec.name,
            "labels": spec.labels,
        },
        "spec": {
            "backoffLimit": spec.backoff_limit,
            "template": {
                "metadata": { "labels": spec.labels },
                "spec": {
                    "restartPolicy": spec.restart_policy.as_str(),
                    "volumes": volumes,
                    "initContainers": [container_manifest(&spec.init_container)],
                    "containers": [container_manifest(&spec.container)],
                },
            },
        },
    })
}

fn volume_manifest(volume: &VolumeSpec) -> Value {
    match &volume.source {
        VolumeSource::ConfigObject { name } => json!({
            "name": volume.name,
            "configMap": { "name": name },
        }),
        VolumeSource::EmptyDir => json!({
            "name": volume.name,
            "emptyDir": {},
        }),
        VolumeSource::Credential { name, items } => {
            let items: Vec<Value> = items
                .iter()
                .map(|item| json!({ "key": item.key, "path": item.path }))
                .collect();
            json!({
                "name": volume.name,
                "secret": { "secretName": name, "items": items },
            })
        }
    }
}

fn container_manifest(container: &ContainerSpec) -> Value {
    let mut out = Map::new();
    out.insert("name".into(), json!(container.name));
    out.insert("image".into(), json!(container.image));

    if !container.command.is_empty() {
        out.insert("command".into(), json!(container.command));
    }
    if !container.args.is_empty() {
        out.insert("args".into(), json!(container.args));
    }
    if !container.env.is_empty() {
        let env: Vec<Value> = container
            .env
            .iter()
            .map(|var| json!({ "name": var.name, "value": var.value }))
            .collect();
        out.insert("env".into(), Value::Array(env));
    }
    if !container.mounts.is_empty() {
        let mounts: Vec<Value> = container
            .mounts
            .iter()
            .map(|m| json!({ "name": m.volume, "mountPath": m.path }))
            .collect();
        out.insert("volumeMounts".into(), Value::Array(mounts));
    }
    if let Some(security) = &container.security {
        let mut ctx = json!({
            "runAsUser": security.run_as_user,
            "runAsGroup": security.run_as_group,
            "allowPrivilegeEscalation": security.allow_privilege_escalation,
            "privileged": security.privileged,
        });
        if security.seccomp_unconfined {
            ctx["seccompProfile"] = json!({ "type": "Unconfined" });
        }
        out.insert("securityContext".into(), ctx);
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::manifest::{
        CredentialKind, EnvVarSpec, KeyPath, MountSpec, RestartPolicy, SecuritySpec,
    };
    use std::collections::BTreeMap;

    fn sample_job() -> JobSpec {
        JobSpec {
            name: "build-alice-1".to_string(),
            labels: BTreeMap::from([("app".to_string(), "runway".to_string())]),
            backoff_limit: 0,
            restart_policy: RestartPolicy::Never,
            volumes: vec![
                VolumeSpec {
                    name: "ctx".to_string(),
                    source: VolumeSource::ConfigObject {
                        name: "cm-alice-1".to_string(),
                    },
                },
                VolumeSpec {
                    name: "workspace".to_string(),
                    source: VolumeSource::EmptyDir,
                },
                VolumeSpec {
                    name: "docker-config".to_string(),
                    source: VolumeSource::Credential {
                        name: "regcred".to_string(),
                        items: vec![KeyPath {
                            key: ".dockerconfigjson".to_string(),
                            path: "config.json".to_string(),
                        }],
                    },
                },
            ],
            init_container: ContainerSpec {
                name: "copy".to_string(),
                image: "busybox:1.36".to_string(),
                command: vec!["sh".to_string(), "-c".to_string(), "cp".to_string()],
                args: vec![],
                env: vec![],
                mounts: vec![MountSpec {
                    volume: "ctx".to_string(),
                    path: "/configmap".to_string(),
                }],
                security: None,
            },
            container: ContainerSpec {
                name: "buildkit".to_string(),
                image: "moby/buildkit:master-rootless".to_string(),
                command: vec!["sh".to_string(), "-c".to_string()],
                args: vec!["buildctl build".to_string()],
                env: vec![EnvVarSpec {
                    name: "BUILDKIT_ROOTLESS".to_string(),
                    value: "1".to_string(),
                }],
                mounts: vec![],
                security: Some(SecuritySpec {
                    run_as_user: 1000,
                    run_as_group: 1000,
                    allow_privilege_escalation: true,
                    privileged: true,
                    seccomp_unconfined: true,
                }),
            },
        }
    }

    #[test]
    fn test_job_manifest_shape() {
        let manifest = job_manifest(&sample_job());

        assert_eq!(manifest["kind"], "Job");
        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        let pod = &manifest["spec"]["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(pod["initContainers"].as_array().unwrap().len(), 1);
        assert_eq!(pod["containers"].as_array().unwrap().len(), 1);
        assert_eq!(pod["volumes"][0]["configMap"]["name"], "cm-alice-1");
        assert_eq!(pod["volumes"][2]["secret"]["secretName"], "regcred");
        assert_eq!(
            pod["containers"][0]["securityContext"]["seccompProfile"]["type"],
            "Unconfined"
        );
        assert!(pod["initContainers"][0].get("args").is_none());
    }

    #[test]
    fn test_job_manifest_decodes_as_job() {
        let job: Job = serde_json::from_value(job_manifest(&sample_job())).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("build-alice-1"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
    }

    #[test]
    fn test_credential_manifest_uses_string_data() {
        let spec = CredentialSpec {
            name: "regcred-x".to_string(),
            kind: CredentialKind::DockerConfigJson,
            payload: BTreeMap::from([(".dockerconfigjson".to_string(), "{}".to_string())]),
        };
        let manifest = credential_manifest(&spec);
        assert_eq!(manifest["type"], "kubernetes.io/dockerconfigjson");
        assert_eq!(manifest["stringData"][".dockerconfigjson"], "{}");

        let secret: Secret = serde_json::from_value(manifest).unwrap();
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
    }

    #[test]
    fn test_context_manifest() {
        let spec = ContextSpec::new("cm-1").with_file("Dockerfile", "FROM python:3.11\n");
        let cm: ConfigMap = serde_json::from_value(context_manifest(&spec)).unwrap();
        assert_eq!(
            cm.data.unwrap().get("Dockerfile").map(String::as_str),
            Some("FROM python:3.11\n")
        );
    }

    #[test]
    fn test_job_record_from_job() {
        let value = json!({
            "metadata": {
                "name": "build-alice-1",
                "creationTimestamp": "2024-05-01T10:00:00Z"
            },
            "status": {
                "completionTime": "2024-05-01T10:05:00Z",
                "conditions": [
                    { "type": "Complete", "status": "True", "lastProbeTime": "2024-05-01T10:05:00Z" }
                ]
            }
        });

        let job: Job = serde_json::from_value(value).unwrap();
        let record = job_record(&job);
        assert_eq!(record.name, "build-alice-1");
        assert!(record.is_completed());
        assert_eq!(
            record.completion_time.unwrap().to_rfc3339(),
            "2024-05-01T10:05:00+00:00"
        );
    }

    #[test]
    fn test_job_record_without_status() {
        let job: Job = serde_json::from_value(json!({ "metadata": { "name": "build-1" } })).unwrap();
        let record = job_record(&job);
        assert!(record.conditions.is_empty());
        assert!(record.completion_time.is_none());
        assert!(!record.is_completed());
    }
}
