//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deploy::health::HealthCheck;
use crate::deploy::retry::RetryPolicy;
use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::models::artifact::{BuildDescriptor, ImageName};
use crate::models::instance::{RestartPolicy, RunSpec};
use crate::models::target::DeploymentTarget;
use crate::utils::CooldownOptions;

/// Deployer settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily rolling log files under the logs directory
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub target: TargetSettings,

    #[serde(default)]
    pub registry: RegistrySettings,

    #[serde(default)]
    pub image: ImageSettings,

    #[serde(default)]
    pub service: ServiceSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Remote host settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSettings {
    /// Host address, or `local` for the workstation's own runtime
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(default)]
    pub ssh_user: Option<String>,

    /// SSH identity file
    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            ssh_port: default_ssh_port(),
            ssh_user: None,
            identity_file: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Image registry settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Registry host; empty for the runtime's default registry
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub username: Option<String>,

    /// Name of the environment variable holding the registry credential.
    /// Without it the existing `docker login` session is used.
    #[serde(default)]
    pub credential_env: Option<String>,
}

/// Image build settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSettings {
    /// Repository name
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,

    #[serde(default = "default_context")]
    pub context: PathBuf,

    #[serde(default)]
    pub platform: Option<String>,

    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            dockerfile: default_dockerfile(),
            context: default_context(),
            platform: None,
            build_args: BTreeMap::new(),
        }
    }
}

/// Service instance settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Container name on the target
    #[serde(default)]
    pub name: String,

    /// Port mappings, `host:container`
    #[serde(default)]
    pub ports: Vec<String>,

    /// Env file path on the target
    #[serde(default)]
    pub env_file: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Log lines captured from a failed instance
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_log_lines: usize,
}

fn default_diagnostic_lines() -> usize {
    50
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            ports: Vec::new(),
            env_file: None,
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            diagnostic_log_lines: default_diagnostic_lines(),
        }
    }
}

/// Health check settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_health_port")]
    pub port: u16,

    #[serde(default = "default_health_path")]
    pub path: String,

    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_rollback_timeout")]
    pub rollback_timeout_secs: u64,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_health_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    5
}

fn default_rollback_timeout() -> u64 {
    15
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            port: default_health_port(),
            path: default_health_path(),
            timeout_secs: default_health_timeout(),
            poll_interval_secs: default_poll_interval(),
            rollback_timeout_secs: default_rollback_timeout(),
        }
    }
}

/// Retry settings for network-class failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

/// Upper bounds for external commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Any single remote or local runtime command
    #[serde(default = "default_command_timeout")]
    pub command_secs: u64,

    #[serde(default = "default_build_timeout")]
    pub build_secs: u64,

    /// Push locally, pull on the target
    #[serde(default = "default_push_timeout")]
    pub push_secs: u64,
}

fn default_command_timeout() -> u64 {
    60
}

fn default_build_timeout() -> u64 {
    1_800
}

fn default_push_timeout() -> u64 {
    600
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            command_secs: default_command_timeout(),
            build_secs: default_build_timeout(),
            push_secs: default_push_timeout(),
        }
    }
}

impl Settings {
    /// Read `file`, falling back to defaults when it does not exist
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        match file.read_json_opt::<Settings>().await {
            Ok(Some(settings)) => Ok(settings),
            Ok(None) => {
                debug!("No settings file at {}, using defaults", file.path().display());
                Ok(Settings::default())
            }
            Err(e) => Err(DeployError::Config(format!(
                "cannot read {}: {}",
                file.path().display(),
                e
            ))),
        }
    }

    /// Apply `SHIPWRIGHT_*` overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), DeployError> {
        if let Some(v) = lookup("SHIPWRIGHT_HOST") {
            self.target.host = v;
        }
        if let Some(v) = lookup("SHIPWRIGHT_SSH_USER") {
            self.target.ssh_user = Some(v);
        }
        if let Some(v) = lookup("SHIPWRIGHT_SSH_PORT") {
            self.target.ssh_port = parse_env("SHIPWRIGHT_SSH_PORT", &v)?;
        }
        if let Some(v) = lookup("SHIPWRIGHT_SSH_KEY") {
            self.target.identity_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SHIPWRIGHT_REGISTRY") {
            self.registry.host = v;
        }
        if let Some(v) = lookup("SHIPWRIGHT_NAMESPACE") {
            self.registry.namespace = v;
        }
        if let Some(v) = lookup("SHIPWRIGHT_REGISTRY_USER") {
            self.registry.username = Some(v);
        }
        if let Some(v) = lookup("SHIPWRIGHT_REGISTRY_CREDENTIAL_ENV") {
            self.registry.credential_env = Some(v);
        }
        if let Some(v) = lookup("SHIPWRIGHT_IMAGE") {
            self.image.name = v;
        }
        if let Some(v) = lookup("SHIPWRIGHT_SERVICE") {
            self.service.name = v;
        }
        if let Some(v) = lookup("SHIPWRIGHT_HEALTH_PORT") {
            self.health.port = parse_env("SHIPWRIGHT_HEALTH_PORT", &v)?;
        }
        if let Some(v) = lookup("SHIPWRIGHT_LOG") {
            self.log_level = v.parse().map_err(DeployError::Config)?;
        }
        Ok(())
    }

    /// Reject settings no deployment could succeed with
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.target.host.trim().is_empty() {
            return Err(DeployError::Config(
                "target host is not set (settings target.host or SHIPWRIGHT_HOST)".into(),
            ));
        }
        if self.image.name.trim().is_empty() {
            return Err(DeployError::Config(
                "image name is not set (settings image.name or SHIPWRIGHT_IMAGE)".into(),
            ));
        }
        if self.service.name.trim().is_empty() {
            return Err(DeployError::Config(
                "service name is not set (settings service.name or SHIPWRIGHT_SERVICE)".into(),
            ));
        }
        let timeouts = [
            ("health.timeout_secs", self.health.timeout_secs),
            ("health.poll_interval_secs", self.health.poll_interval_secs),
            ("health.rollback_timeout_secs", self.health.rollback_timeout_secs),
            ("timeouts.command_secs", self.timeouts.command_secs),
            ("timeouts.build_secs", self.timeouts.build_secs),
            ("timeouts.push_secs", self.timeouts.push_secs),
            ("target.connect_timeout_secs", self.target.connect_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(DeployError::Config(format!("{} must be greater than zero", name)));
        }
        if self.health.poll_interval_secs > self.health.timeout_secs {
            return Err(DeployError::Config(format!(
                "health poll interval ({}s) exceeds the health timeout ({}s)",
                self.health.poll_interval_secs, self.health.timeout_secs
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(DeployError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Registry credential read from the configured environment variable
    pub fn registry_credential(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<SecretString>, DeployError> {
        let Some(var) = &self.registry.credential_env else {
            return Ok(None);
        };
        match lookup(var) {
            Some(value) if !value.is_empty() => Ok(Some(SecretString::from(value))),
            _ => Err(DeployError::Config(format!(
                "registry credential variable {} is not set",
                var
            ))),
        }
    }

    pub fn image_name(&self) -> ImageName {
        ImageName::new(
            self.registry.host.clone(),
            self.registry.namespace.clone(),
            self.image.name.clone(),
        )
    }

    pub fn deployment_target(&self) -> DeploymentTarget {
        DeploymentTarget {
            host: self.target.host.clone(),
            port: self.target.ssh_port,
            user: self.target.ssh_user.clone(),
            credential_ref: self.target.identity_file.clone(),
        }
    }

    pub fn build_descriptor(&self) -> BuildDescriptor {
        BuildDescriptor {
            dockerfile: self.image.dockerfile.clone(),
            platform: self.image.platform.clone(),
            build_args: self.image.build_args.clone(),
        }
    }

    pub fn run_spec(&self) -> RunSpec {
        RunSpec {
            ports: self.service.ports.clone(),
            env_file: self.service.env_file.clone(),
            env: self.service.env.clone(),
            restart_policy: self.service.restart_policy.clone(),
        }
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck {
            scheme: self.health.scheme.clone(),
            port: self.health.port,
            path: self.health.path.clone(),
            timeout: Duration::from_secs(self.health.timeout_secs),
            poll_interval: Duration::from_secs(self.health.poll_interval_secs),
            rollback_timeout: Duration::from_secs(self.health.rollback_timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            cooldown: CooldownOptions {
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                ..Default::default()
            },
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, DeployError> {
    value
        .trim()
        .parse()
        .map_err(|_| DeployError::Config(format!("{} has an invalid value: '{}'", name, value)))
}
