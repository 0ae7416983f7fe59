//! Build orchestration
//!
//! Runs one build end to end: reap stale jobs, make sure the shared build
//! daemon config exists, resolve the registry, upload the build context,
//! submit the job and clean up everything the session owns except the job.
//!
//! The call returns once the job is accepted; the build itself runs on
//! in the cluster.

pub mod manifest;

pub use manifest::JobManifestBuilder;

use std::sync::Arc;

use sdk::errors::{BuildError, BuildStep};
use sdk::manifest::ContextSpec;
use sdk::types::{BuildRequest, JobHandle, RegistryOverrides};
use tracing::Instrument;

use crate::config::Config;
use crate::context::BuildContextAssembler;
use crate::gateway::ClusterResourceGateway;
use crate::reaper::JobReaper;
use crate::registry::{RegistryResolver, RegistryTarget};
use crate::session::BuildSession;

use self::manifest::TOOLCHAIN_CONFIG_FILE;

/// Build daemon configuration installed when the cluster has none
pub const DEFAULT_TOOLCHAIN_CONFIG: &str = include_str!("../../deploy/buildkitd.toml");

/// Coordinates the resources of a build
pub struct JobOrchestrator {
    gateway: Arc<dyn ClusterResourceGateway>,
    registry: RegistryResolver,
    assembler: BuildContextAssembler,
    manifests: JobManifestBuilder,
    reaper: JobReaper,
    toolchain_config: String,
    demo_mode: bool,
    reap_enabled: bool,
    max_age_hours: u32,
}

impl JobOrchestrator {
    pub fn new(gateway: Arc<dyn ClusterResourceGateway>, config: &Config) -> Self {
        Self {
            registry: RegistryResolver::new(gateway.clone(), config.registry.clone()),
            assembler: BuildContextAssembler::new(config.core.scratch_dir.clone()),
            manifests: JobManifestBuilder::new(config.builder.clone()),
            reaper: JobReaper::new(gateway.clone()),
            toolchain_config: config.builder.toolchain_config.clone(),
            demo_mode: config.builder.demo_mode,
            reap_enabled: config.reaper.enabled,
            max_age_hours: config.reaper.max_age_hours,
            gateway,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ClusterResourceGateway> {
        &self.gateway
    }

    pub fn reaper(&self) -> &JobReaper {
        &self.reaper
    }

    /// Submit a build job for `request` on behalf of `caller_id`
    ///
    /// The build context and any credential created for this call are
    /// deleted before returning, whatever the outcome. Cleanup failures are
    /// logged and do not change the result.
    pub async fn build(
        &self,
        request: &BuildRequest,
        caller_id: &str,
        overrides: &RegistryOverrides,
    ) -> Result<JobHandle, BuildError> {
        let session = BuildSession::new(caller_id, self.demo_mode)?;
        request.validate()?;
        overrides.validate()?;
        let span = tracing::info_span!("build", job = %session.job_name);

        async {
            tracing::info!(
                "Building {} from {} ({})",
                request.target,
                request.source_image,
                request.runtime_kind
            );

            if self.reap_enabled {
                self.reap_stale(&session.caller_id).await;
            }

            self.ensure_toolchain_config().await?;

            let registry = self.registry.resolve(overrides, &session).await?;
            tracing::debug!(
                "Registry {} with credential {}",
                registry.host,
                registry.credential.name()
            );

            let result = self.submit(&session, &registry, request).await;

            if let Err(e) = self.registry.release(&registry.credential).await {
                tracing::warn!(
                    "Step '{}' failed for {}: {}",
                    BuildStep::DeleteCredential,
                    registry.credential.name(),
                    e
                );
            }

            match &result {
                Ok(handle) => tracing::info!("Submitted job {} for {}", handle.name, handle.image),
                Err(e) => tracing::error!("Build failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn reap_stale(&self, caller_id: &str) {
        match self.reaper.reap(caller_id, self.max_age_hours).await {
            Ok(0) => {}
            Ok(count) => tracing::info!("Reaped {} stale jobs", count),
            Err(e) => tracing::warn!("Reaping stale jobs failed: {}", e),
        }
    }

    /// Make sure the shared build daemon config object exists
    ///
    /// Concurrent builds may race to create it, so a failed create is
    /// followed by another lookup before giving up.
    async fn ensure_toolchain_config(&self) -> Result<(), BuildError> {
        let step = BuildStep::EnsureToolchain;
        let name = &self.toolchain_config;

        let existing = self
            .gateway
            .get_config_object(name)
            .await
            .map_err(|e| BuildError::cluster(step, e))?;
        if existing.is_some() {
            return Ok(());
        }

        let spec = ContextSpec::new(name.clone())
            .with_file(TOOLCHAIN_CONFIG_FILE, DEFAULT_TOOLCHAIN_CONFIG);
        match self.gateway.create_config_object(&spec).await {
            Ok(()) => {
                tracing::info!("Installed toolchain config {}", name);
                Ok(())
            }
            Err(create_err) => {
                tracing::debug!("Creating toolchain config {} failed: {}", name, create_err);
                match self.gateway.get_config_object(name).await {
                    Ok(Some(_)) => Ok(()),
                    Ok(None) => Err(BuildError::cluster(step, create_err)),
                    Err(e) => Err(BuildError::cluster(step, e)),
                }
            }
        }
    }

    /// Upload the context, submit the job, then delete the context
    async fn submit(
        &self,
        session: &BuildSession,
        registry: &RegistryTarget,
        request: &BuildRequest,
    ) -> Result<JobHandle, BuildError> {
        let context = self.assembler.prepare(request, &session.context_name)?;

        self.gateway
            .create_config_object(&context)
            .await
            .map_err(|e| BuildError::cluster(BuildStep::CreateContext, e))?;

        let image = registry.image_ref(&request.target);
        let job = self.manifests.build(session, registry, &image);
        let submitted = self.gateway.create_job(&job).await;

        if let Err(e) = self.gateway.delete_config_object(&session.context_name).await {
            tracing::warn!(
                "Step '{}' failed for {}: {}",
                BuildStep::DeleteContext,
                session.context_name,
                e
            );
        }

        let submitted = submitted.map_err(|e| BuildError::cluster(BuildStep::SubmitJob, e))?;

        Ok(JobHandle {
            name: submitted.name,
            session_id: session.id.to_string(),
            image,
            uid: submitted.uid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryGateway;
    use sdk::errors::GatewayOperation;
    use sdk::types::RuntimeKind;

    fn request() -> BuildRequest {
        BuildRequest::new("python:3.11", RuntimeKind::Python, "alice:myfunc".parse().unwrap())
    }

    fn orchestrator(gateway: &Arc<InMemoryGateway>) -> JobOrchestrator {
        JobOrchestrator::new(gateway.clone(), &Config::default())
    }

    #[tokio::test]
    async fn test_toolchain_config_installed_once() {
        let gateway = Arc::new(InMemoryGateway::new());
        let orchestrator = orchestrator(&gateway);

        orchestrator.ensure_toolchain_config().await.unwrap();
        orchestrator.ensure_toolchain_config().await.unwrap();

        let object = gateway.config_object("nuvolaris-buildkitd-conf").unwrap();
        assert_eq!(object.data[TOOLCHAIN_CONFIG_FILE], DEFAULT_TOOLCHAIN_CONFIG);
        let creates = gateway
            .calls()
            .into_iter()
            .filter(|op| *op == GatewayOperation::CreateConfigObject)
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_toolchain_config_create_failure_is_fatal() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.fail(GatewayOperation::CreateConfigObject);

        let err = orchestrator(&gateway)
            .build(&request(), "alice", &RegistryOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Cluster {
                step: BuildStep::EnsureToolchain,
                ..
            }
        ));
        assert!(gateway.submitted_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_reap_failure_does_not_block_build() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.fail(GatewayOperation::ListJobs);

        let handle = orchestrator(&gateway)
            .build(&request(), "alice", &RegistryOverrides::default())
            .await
            .unwrap();
        assert!(handle.name.starts_with("build-alice-"));
    }

    #[tokio::test]
    async fn test_invalid_caller_touches_nothing() {
        let gateway = Arc::new(InMemoryGateway::new());

        let err = orchestrator(&gateway)
            .build(&request(), "Not Valid", &RegistryOverrides::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
        assert!(gateway.calls().is_empty());
    }
}
