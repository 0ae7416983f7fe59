//! Manifest types for the cluster resources a build creates
//!
//! These are statically shaped descriptions of the build context, the
//! registry credential and the build job. Business logic only ever builds
//! these values; conversion to the orchestrator's wire format happens at the
//! gateway boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum length of a DNS-1123 label, which also bounds job names
pub const MAX_LABEL_LENGTH: usize = 63;

static DNS_LABEL: OnceLock<Regex> = OnceLock::new();

fn dns_label_pattern() -> &'static Regex {
    DNS_LABEL.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("Invalid DNS label pattern")
    })
}

/// Check whether `name` is a valid DNS-1123 label
///
/// Jobs, and everything named after a job, must satisfy this.
pub fn is_dns_label(name: &str) -> bool {
    name.len() <= MAX_LABEL_LENGTH && dns_label_pattern().is_match(name)
}

static IMAGE_NAME: OnceLock<Regex> = OnceLock::new();
static REGISTRY_HOST: OnceLock<Regex> = OnceLock::new();

/// Maximum length of an image repository name with its tag
pub const MAX_IMAGE_NAME_LENGTH: usize = 255;

fn image_name_pattern() -> &'static Regex {
    IMAGE_NAME.get_or_init(|| {
        Regex::new(
            r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*(?::[A-Za-z0-9_][A-Za-z0-9._-]{0,127})?$",
        )
        .expect("Invalid image name pattern")
    })
}

fn registry_host_pattern() -> &'static Regex {
    REGISTRY_HOST.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::[0-9]{1,5})?$")
            .expect("Invalid registry host pattern")
    })
}

/// Check whether `name` is an image repository path with an optional tag
///
/// Follows the OCI distribution reference grammar, e.g. `fn`, `team/fn:v2`.
/// The result is interpolated into the build container's command line, so
/// nothing outside the grammar is accepted.
pub fn is_image_name(name: &str) -> bool {
    name.len() <= MAX_IMAGE_NAME_LENGTH && image_name_pattern().is_match(name)
}

/// Check whether `host` is a `host[:port]` registry address
pub fn is_registry_host(host: &str) -> bool {
    host.len() <= MAX_IMAGE_NAME_LENGTH && registry_host_pattern().is_match(host)
}

/// Build context bundle: file name to file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSpec {
    pub name: String,
    pub files: BTreeMap<String, String>,
}

impl ContextSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: BTreeMap::new(),
        }
    }

    /// Add a file to the bundle
    pub fn with_file(mut self, file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(file_name.into(), contents.into());
        self
    }
}

/// Kind of credential object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialKind {
    /// Registry auth in the `.dockerconfigjson` layout
    DockerConfigJson,
    Opaque,
}

impl CredentialKind {
    /// Secret type string understood by the cluster
    pub fn type_name(&self) -> &'static str {
        match self {
            CredentialKind::DockerConfigJson => "kubernetes.io/dockerconfigjson",
            CredentialKind::Opaque => "Opaque",
        }
    }
}

/// Credential object to be created in the cluster
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialSpec {
    pub name: String,
    pub kind: CredentialKind,
    /// Plain-text payload; encoded by the gateway
    pub payload: BTreeMap<String, String>,
}

impl fmt::Debug for CredentialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("payload", &"[REDACTED]")
            .finish()
    }
}

/// Where a volume's content comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    /// Files of a config object
    ConfigObject { name: String },
    /// Scratch space that lives as long as the pod
    EmptyDir,
    /// Selected keys of a credential object, each projected to a path
    Credential {
        name: String,
        items: Vec<KeyPath>,
    },
}

/// Projection of one credential key onto a file path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPath {
    pub key: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub volume: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,
    pub value: String,
}

/// Security settings of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySpec {
    pub run_as_user: i64,
    pub run_as_group: i64,
    pub allow_privilege_escalation: bool,
    pub privileged: bool,
    /// Run without a seccomp profile
    pub seccomp_unconfined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVarSpec>,
    pub mounts: Vec<MountSpec>,
    pub security: Option<SecuritySpec>,
}

impl ContainerSpec {
    /// Command and arguments joined into a single line
    pub fn command_line(&self) -> String {
        self.command
            .iter()
            .chain(self.args.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Pod restart policy of the job template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    Never,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Never => "Never",
            RestartPolicy::OnFailure => "OnFailure",
        }
    }
}

/// One-shot build job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub backoff_limit: i32,
    pub restart_policy: RestartPolicy,
    pub volumes: Vec<VolumeSpec>,
    pub init_container: ContainerSpec,
    pub container: ContainerSpec,
}

impl JobSpec {
    /// Find a volume by name
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_label() {
        assert!(is_dns_label("build-alice-0f8c"));
        assert!(is_dns_label("a"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("Alice"));
        assert!(!is_dns_label("alice_bob"));
        assert!(!is_dns_label("-alice"));
        assert!(!is_dns_label("alice-"));
        assert!(!is_dns_label(&"a".repeat(MAX_LABEL_LENGTH + 1)));
    }

    #[test]
    fn test_image_name() {
        assert!(is_image_name("myfunc"));
        assert!(is_image_name("myfunc:v2"));
        assert!(is_image_name("team/my_func-1:1.0.3"));
        assert!(!is_image_name("x;id"));
        assert!(!is_image_name("x:v1;id"));
        assert!(!is_image_name("x|sh"));
        assert!(!is_image_name("x$(id)"));
        assert!(!is_image_name("x`id`"));
        assert!(!is_image_name("x${IFS}y"));
        assert!(!is_image_name("MyFunc"));
        assert!(!is_image_name("x:"));
        assert!(!is_image_name("x\nRUN id"));
    }

    #[test]
    fn test_registry_host() {
        assert!(is_registry_host("nuvolaris-registry-svc:5000"));
        assert!(is_registry_host("registry.example.com"));
        assert!(is_registry_host("10.0.0.7:443"));
        assert!(!is_registry_host("evil.sh;id"));
        assert!(!is_registry_host("host:port"));
        assert!(!is_registry_host("host/path"));
        assert!(!is_registry_host(""));
    }

    #[test]
    fn test_credential_debug_redacts_payload() {
        let mut payload = BTreeMap::new();
        payload.insert(".dockerconfigjson".to_string(), "hunter2".to_string());
        let spec = CredentialSpec {
            name: "regcred".to_string(),
            kind: CredentialKind::DockerConfigJson,
            payload,
        };
        let debug = format!("{:?}", spec);
        assert!(debug.contains("regcred"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_command_line() {
        let container = ContainerSpec {
            name: "c".to_string(),
            image: "busybox".to_string(),
            command: vec!["sh".to_string(), "-c".to_string()],
            args: vec!["echo hi".to_string()],
            env: vec![],
            mounts: vec![],
            security: None,
        };
        assert_eq!(container.command_line(), "sh -c echo hi");
    }
}
