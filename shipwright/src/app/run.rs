//! Component wiring and the single-deployment run

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::deploy::builder::DockerBuilder;
use crate::deploy::channel::{CommandChannel, LocalChannel, SshChannel};
use crate::deploy::health::HttpProbe;
use crate::deploy::orchestrator::{Components, DeployRequest, Orchestrator};
use crate::deploy::registry::{DockerRegistry, RetryingRegistry};
use crate::deploy::remote::DockerRemote;
use crate::deploy::report::DeploymentReport;
use crate::errors::DeployError;

/// Wire the docker/ssh backed components for `options`
pub fn build_orchestrator(options: &AppOptions) -> Result<Orchestrator, DeployError> {
    let timeouts = &options.timeouts;

    let channel: Arc<dyn CommandChannel> = if options.target.is_local() {
        Arc::new(LocalChannel)
    } else {
        Arc::new(SshChannel::new(options.target.clone(), timeouts.connect))
    };
    info!("Deploying to {} via {}", options.target, channel.describe());

    let remote = DockerRemote::new(channel, options.target.clone(), timeouts.command, timeouts.push);
    let builder = DockerBuilder::new(options.image.clone(), timeouts.build, timeouts.command);

    let mut registry = DockerRegistry::new(options.image.clone(), timeouts.push, timeouts.command);
    match (&options.registry.username, &options.registry.credential) {
        (Some(username), Some(credential)) => {
            registry = registry.with_credential(username.clone(), credential.clone());
        }
        (None, Some(_)) => warn!("Registry credential configured without a username; ignoring it"),
        _ => {}
    }
    let registry = RetryingRegistry::new(registry, options.retry.clone());

    let components = Components {
        builder: Arc::new(builder),
        registry: Arc::new(registry),
        remote: Arc::new(remote),
        probe: Arc::new(HttpProbe::new()?),
    };
    Ok(Orchestrator::new(components, options.orchestrator.clone()).with_storage(options.layout.clone()))
}

/// Run one deployment to completion.
///
/// When `shutdown_signal` resolves the attempt is cancelled if it is still
/// building or pushing; after that the signal is logged and the attempt runs
/// to a terminal phase.
pub async fn run(
    orchestrator: &Orchestrator,
    request: DeployRequest,
    shutdown_signal: impl Future<Output = ()>,
) -> Result<DeploymentReport, DeployError> {
    let deployment = orchestrator.begin(request)?;
    let handle = deployment.handle();

    let attempt = deployment.run();
    tokio::pin!(attempt);
    tokio::pin!(shutdown_signal);
    let mut signalled = false;

    loop {
        tokio::select! {
            report = &mut attempt => return Ok(report),
            _ = &mut shutdown_signal, if !signalled => {
                signalled = true;
                match handle.cancel() {
                    Ok(()) => info!("Shutdown signal received, cancelling the deployment..."),
                    Err(e) => warn!("Shutdown signal received and ignored: {}", e),
                }
            }
        }
    }
}
