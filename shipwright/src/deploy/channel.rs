//! Command channels to a deployment target
//!
//! A channel runs one argv on the target and returns its exit status and
//! output. Every call carries a timeout; a command that overruns it is
//! killed and reported as a network-class failure.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::{DeployError, RemoteStep};
use crate::models::target::DeploymentTarget;

/// ssh's own exit status for connection and authentication failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stderr if non-empty, stdout otherwise
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// Runs commands on one target
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run `argv` with a hard timeout
    async fn exec(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, DeployError>;

    /// Human readable destination, for logs
    fn describe(&self) -> String;
}

/// Spawn a local process, optionally feeding `stdin`, bounded by `timeout`
pub async fn run_process(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> Result<CommandOutput, DeployError> {
    debug!("exec: {} {}", program, shell_words::join(args));

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| DeployError::RemoteExec {
        step: RemoteStep::Connect,
        message: format!("failed to spawn {}: {}", program, e),
    })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        drop(pipe);
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => {
            return Err(DeployError::Network(format!(
                "{} timed out after {:?}",
                program, timeout
            )));
        }
    };

    Ok(CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs commands over `ssh` in batch mode
#[derive(Debug, Clone)]
pub struct SshChannel {
    target: DeploymentTarget,
    connect_timeout: Duration,
}

impl SshChannel {
    pub fn new(target: DeploymentTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
        }
    }

    /// Arguments passed to the ssh client for `argv`
    pub fn ssh_args(&self, argv: &[String]) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.target.port.to_string(),
        ];
        if let Some(identity) = &self.target.credential_ref {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(self.target.destination());
        args.push("--".to_string());
        // The remote side hands the command to a shell; quote it as one string
        args.push(shell_words::join(argv));
        args
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn exec(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, DeployError> {
        let output = run_process("ssh", &self.ssh_args(argv), None, timeout).await?;
        if output.status == Some(SSH_TRANSPORT_FAILURE) {
            return Err(DeployError::Network(format!(
                "ssh to {} failed: {}",
                self.target,
                output.diagnostic()
            )));
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        format!("ssh://{}", self.target)
    }
}

/// Runs commands directly on this machine
#[derive(Debug, Clone, Default)]
pub struct LocalChannel;

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn exec(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, DeployError> {
        let (program, args) = argv.split_first().ok_or_else(|| DeployError::RemoteExec {
            step: RemoteStep::Connect,
            message: "empty command".to_string(),
        })?;
        run_process(program, args, None, timeout).await
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
