//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::deploy::orchestrator::OrchestratorOptions;
use crate::deploy::retry::RetryPolicy;
use crate::models::artifact::{BuildDescriptor, ImageName};
use crate::models::target::DeploymentTarget;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug)]
pub struct AppOptions {
    /// Storage configuration
    pub layout: StorageLayout,

    pub target: DeploymentTarget,

    /// Image repository artifacts are published under
    pub image: ImageName,

    /// Build context directory
    pub context: PathBuf,

    pub descriptor: BuildDescriptor,

    pub registry: RegistryOptions,

    /// Retry policy for pushes and pulls
    pub retry: RetryPolicy,

    pub timeouts: CommandTimeouts,

    pub orchestrator: OrchestratorOptions,
}

/// Registry login options
#[derive(Debug, Default)]
pub struct RegistryOptions {
    pub username: Option<String>,

    /// Never logged or persisted
    pub credential: Option<SecretString>,
}

/// Timeouts for external commands
#[derive(Debug, Clone)]
pub struct CommandTimeouts {
    pub connect: Duration,
    pub command: Duration,
    pub build: Duration,
    pub push: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            command: Duration::from_secs(60),
            build: Duration::from_secs(30 * 60),
            push: Duration::from_secs(10 * 60),
        }
    }
}

impl AppOptions {
    /// Assemble options from validated settings
    pub fn from_settings(
        settings: &Settings,
        layout: StorageLayout,
        credential: Option<SecretString>,
    ) -> Self {
        let retry = settings.retry_policy();
        Self {
            layout,
            target: settings.deployment_target(),
            image: settings.image_name(),
            context: settings.image.context.clone(),
            descriptor: settings.build_descriptor(),
            registry: RegistryOptions {
                username: settings.registry.username.clone(),
                credential,
            },
            timeouts: CommandTimeouts {
                connect: Duration::from_secs(settings.target.connect_timeout_secs),
                command: Duration::from_secs(settings.timeouts.command_secs),
                build: Duration::from_secs(settings.timeouts.build_secs),
                push: Duration::from_secs(settings.timeouts.push_secs),
            },
            orchestrator: OrchestratorOptions {
                service: settings.service.name.clone(),
                run_spec: settings.run_spec(),
                health: settings.health_check(),
                pull_retry: retry.clone(),
                diagnostic_log_lines: settings.service.diagnostic_log_lines,
            },
            retry,
        }
    }
}
