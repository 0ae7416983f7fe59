//! Build job manifest
//!
//! The job shape is fixed: one init container copies the context into a
//! workspace, one rootless build daemon container builds and pushes the
//! image. Only names, images and the target image vary between builds.

use std::collections::BTreeMap;

use sdk::manifest::{
    ContainerSpec, EnvVarSpec, JobSpec, KeyPath, MountSpec, RestartPolicy, SecuritySpec,
    VolumeSource, VolumeSpec,
};

use crate::config::BuilderConfig;
use crate::registry::{RegistryTarget, DOCKER_CONFIG_KEY};
use crate::session::BuildSession;

pub const CONTEXT_VOLUME: &str = "build-context-vol";
pub const WORKSPACE_VOLUME: &str = "workspace";
pub const IMAGE_CACHE_VOLUME: &str = "img-cache";
pub const CREDENTIAL_VOLUME: &str = "docker-config";

/// Scratch directories the daemon expects for device injection
const CDI_VOLUMES: [(&str, &str); 3] = [
    ("cdi-etc", "/etc/cdi"),
    ("cdi-run", "/var/run/cdi"),
    ("cdi-buildkit", "/etc/buildkit/cdi"),
];

/// File name of the daemon config inside the toolchain config object
pub const TOOLCHAIN_CONFIG_FILE: &str = "buildkitd.toml";

const INIT_CONTAINER: &str = "copy-build-context";
const BUILD_CONTAINER: &str = "buildkit";
const ROOTLESS_UID: i64 = 1000;

pub const SESSION_LABEL: &str = "runway.io/session";
pub const CALLER_LABEL: &str = "runway.io/caller";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Builds job specs from session and registry state
#[derive(Debug, Clone)]
pub struct JobManifestBuilder {
    config: BuilderConfig,
}

impl JobManifestBuilder {
    pub fn new(config: BuilderConfig) -> Self {
        Self { config }
    }

    /// Build client invocation producing `image`
    pub fn build_command(&self, image: &str, push: bool) -> String {
        format!(
            "rootlesskit buildkitd --config /config/{} & sleep {} && \
             buildctl build --frontend=dockerfile.v0 \
             --local context=/workspace --local dockerfile=/workspace \
             --output=type=image,name={},push={}",
            TOOLCHAIN_CONFIG_FILE, self.config.daemon_startup_secs, image, push
        )
    }

    pub fn build(&self, session: &BuildSession, registry: &RegistryTarget, image: &str) -> JobSpec {
        let mut labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), "runway".to_string()),
            (SESSION_LABEL.to_string(), session.id.to_string()),
        ]);
        if !session.caller_id.is_empty() {
            labels.insert(CALLER_LABEL.to_string(), session.caller_id.clone());
        }

        let mut volumes = vec![
            VolumeSpec {
                name: self.config.toolchain_config.clone(),
                source: VolumeSource::ConfigObject {
                    name: self.config.toolchain_config.clone(),
                },
            },
            VolumeSpec {
                name: CONTEXT_VOLUME.to_string(),
                source: VolumeSource::ConfigObject {
                    name: session.context_name.clone(),
                },
            },
            empty_dir(WORKSPACE_VOLUME),
            empty_dir(IMAGE_CACHE_VOLUME),
        ];
        volumes.extend(CDI_VOLUMES.iter().map(|(name, _)| empty_dir(name)));
        volumes.push(VolumeSpec {
            name: CREDENTIAL_VOLUME.to_string(),
            source: VolumeSource::Credential {
                name: registry.credential.name().to_string(),
                items: vec![KeyPath {
                    key: DOCKER_CONFIG_KEY.to_string(),
                    path: "config.json".to_string(),
                }],
            },
        });

        let init_container = ContainerSpec {
            name: INIT_CONTAINER.to_string(),
            image: self.config.init_image.clone(),
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cp -rvL /configmap/* /workspace/ && cat /workspace/Dockerfile".to_string(),
            ],
            args: vec![],
            env: vec![],
            mounts: vec![mount(CONTEXT_VOLUME, "/configmap"), mount(WORKSPACE_VOLUME, "/workspace")],
            security: None,
        };

        let mut mounts = vec![
            mount(&self.config.toolchain_config, "/config"),
            mount(WORKSPACE_VOLUME, "/workspace"),
            mount(CREDENTIAL_VOLUME, "/home/user/.docker"),
            mount(IMAGE_CACHE_VOLUME, "/tmp"),
        ];
        mounts.extend(CDI_VOLUMES.iter().map(|(name, path)| mount(name, path)));

        let container = ContainerSpec {
            name: BUILD_CONTAINER.to_string(),
            image: self.config.builder_image.clone(),
            command: vec!["sh".to_string(), "-c".to_string()],
            args: vec![self.build_command(image, !session.demo_mode)],
            env: vec![EnvVarSpec {
                name: "BUILDKIT_ROOTLESS".to_string(),
                value: "1".to_string(),
            }],
            mounts,
            security: Some(SecuritySpec {
                run_as_user: ROOTLESS_UID,
                run_as_group: ROOTLESS_UID,
                allow_privilege_escalation: true,
                privileged: true,
                seccomp_unconfined: true,
            }),
        };

        JobSpec {
            name: session.job_name.clone(),
            labels,
            backoff_limit: 0,
            restart_policy: RestartPolicy::Never,
            volumes,
            init_container,
            container,
        }
    }
}

fn empty_dir(name: &str) -> VolumeSpec {
    VolumeSpec {
        name: name.to_string(),
        source: VolumeSource::EmptyDir,
    }
}

fn mount(volume: &str, path: &str) -> MountSpec {
    MountSpec {
        volume: volume.to_string(),
        path: path.to_string(),
    }
}
