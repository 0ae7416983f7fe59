//! Configuration management
//!
//! This module handles loading, validation, and management of the Runway
//! configuration. Configuration is stored in TOML format at
//! ~/.runway/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, cluster namespace, scratch directory
//! - **cluster**: Optional kubeconfig context
//! - **registry**: Default registry host and credential, cluster config lookup
//! - **builder**: Builder and init images, toolchain config object, demo mode
//! - **reaper**: Retention window for completed build jobs
//! - **pods**: Bounded polling of build pods
//!
//! # Examples
//!
//! ```no_run
//! use runway_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Namespace: {}", config.core.namespace);
//! println!("Default registry: {}", config.registry.default_host);
//! # Ok(())
//! # }
//! ```

use sdk::errors::BuildError;
use sdk::manifest::{is_dns_label, is_registry_host};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest retention window the reaper accepts (ten years)
pub const MAX_REAP_AGE_HOURS: u32 = 24 * 365 * 10;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Cluster connection
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Registry resolution defaults
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Build job shape
    #[serde(default)]
    pub builder: BuilderConfig,

    /// Stale job collection
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Pod discovery polling
    #[serde(default)]
    pub pods: PodsConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Namespace holding build resources
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Parent directory for scratch build contexts (supports ~ expansion).
    /// The system temp directory is used when unset.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

/// Cluster connection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// kubeconfig context to use; in-cluster or default inference otherwise
    #[serde(default)]
    pub context: Option<String>,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry used when neither the caller nor the cluster names one
    #[serde(default = "default_registry_host")]
    pub default_host: String,

    /// Credential object mounted when the caller does not override it
    #[serde(default = "default_registry_secret")]
    pub default_secret: String,

    /// Cluster-wide config object carrying the registry annotation
    #[serde(default = "default_config_object")]
    pub config_object: String,

    /// Annotation key holding the registry host
    #[serde(default = "default_host_annotation")]
    pub host_annotation: String,
}

/// Build job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Rootless build daemon image
    #[serde(default = "default_builder_image")]
    pub builder_image: String,

    /// Image of the init step copying the context into the workspace
    #[serde(default = "default_init_image")]
    pub init_image: String,

    /// Shared config object holding the build daemon configuration
    #[serde(default = "default_toolchain_config")]
    pub toolchain_config: String,

    /// Seconds to wait for the build daemon before invoking the client
    #[serde(default = "default_daemon_startup_secs")]
    pub daemon_startup_secs: u64,

    /// Build without pushing the resulting image
    #[serde(default)]
    pub demo_mode: bool,
}

/// Reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Reap stale jobs at the start of every build
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Completed jobs older than this are deleted
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u32,
}

/// Pod polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodsConfig {
    /// Interval between pod lookups (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up waiting for a pod after this many seconds
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

impl PodsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_namespace() -> String {
    "nuvolaris".to_string()
}

fn default_true() -> bool {
    true
}

fn default_registry_host() -> String {
    "nuvolaris-registry-svc:5000".to_string()
}

fn default_registry_secret() -> String {
    "registry-pull-secret".to_string()
}

fn default_config_object() -> String {
    "config".to_string()
}

fn default_host_annotation() -> String {
    "registry_host".to_string()
}

fn default_builder_image() -> String {
    "moby/buildkit:master-rootless".to_string()
}

fn default_init_image() -> String {
    "busybox:1.36".to_string()
}

fn default_toolchain_config() -> String {
    "nuvolaris-buildkitd-conf".to_string()
}

fn default_daemon_startup_secs() -> u64 {
    3
}

fn default_max_age_hours() -> u32 {
    24
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_timeout_secs() -> u64 {
    120
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            namespace: default_namespace(),
            scratch_dir: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_host: default_registry_host(),
            default_secret: default_registry_secret(),
            config_object: default_config_object(),
            host_annotation: default_host_annotation(),
        }
    }
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            builder_image: default_builder_image(),
            init_image: default_init_image(),
            toolchain_config: default_toolchain_config(),
            daemon_startup_secs: default_daemon_startup_secs(),
            demo_mode: false,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age_hours: default_max_age_hours(),
        }
    }
}

impl Default for PodsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            cluster: ClusterConfig::default(),
            registry: RegistryConfig::default(),
            builder: BuilderConfig::default(),
            reaper: ReaperConfig::default(),
            pods: PodsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.runway/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read or written
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, BuildError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from_path(path: &Path) -> Result<Self, BuildError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| BuildError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, BuildError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| BuildError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, BuildError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BuildError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| BuildError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| BuildError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.runway/config.toml)
    fn default_config_path() -> Result<PathBuf, BuildError> {
        let home = dirs::home_dir()
            .ok_or_else(|| BuildError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".runway").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// Checks value ranges and expands ~ in the scratch directory.
    fn validate_and_process(&mut self) -> Result<(), BuildError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(BuildError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !is_dns_label(&self.core.namespace) {
            return Err(BuildError::Config(format!(
                "Invalid namespace '{}'",
                self.core.namespace
            )));
        }

        for (field, value) in [
            ("registry.default_host", &self.registry.default_host),
            ("registry.default_secret", &self.registry.default_secret),
            ("builder.builder_image", &self.builder.builder_image),
            ("builder.init_image", &self.builder.init_image),
            ("builder.toolchain_config", &self.builder.toolchain_config),
        ] {
            if value.trim().is_empty() {
                return Err(BuildError::Config(format!("{} must not be empty", field)));
            }
        }

        if !is_registry_host(&self.registry.default_host) {
            return Err(BuildError::Config(format!(
                "registry.default_host '{}' must be host[:port]",
                self.registry.default_host
            )));
        }

        if self.reaper.max_age_hours == 0 || self.reaper.max_age_hours > MAX_REAP_AGE_HOURS {
            return Err(BuildError::Config(format!(
                "reaper.max_age_hours must be between 1 and {}",
                MAX_REAP_AGE_HOURS
            )));
        }

        if self.pods.poll_interval_ms == 0 {
            return Err(BuildError::Config(
                "pods.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.pods.timeout() < self.pods.interval() {
            return Err(BuildError::Config(
                "pods.poll_timeout_secs must cover at least one poll interval".to_string(),
            ));
        }

        if let Some(dir) = &self.core.scratch_dir {
            self.core.scratch_dir = Some(expand_path(dir)?);
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, BuildError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| BuildError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| BuildError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| BuildError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
