//! Bounded exponential backoff for transient failures

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::DeployError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Retry policy for one error class
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay schedule between attempts
    pub cooldown: CooldownOptions,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: CooldownOptions::default(),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retriable error, or the
/// attempt budget is spent. Returns the last error in the latter two cases.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, DeployError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeployError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt + 1 < max_attempts => {
                let delay: Duration = calc_exp_backoff(&policy.cooldown, attempt);
                attempt += 1;
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    op_name, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
