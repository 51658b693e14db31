//! Retry-with-backoff for transient collaborator failures.
//!
//! Checkpoint writes, offset commits and metadata lookups go through
//! [`retry_transient`]; an error becomes final only once the policy's ceiling
//! is reached or the error is not recoverable.

use std::thread;

use tracing::warn;

use crate::jobs::RetryPolicy;

/// Run `op` until it succeeds, fails with a non-recoverable error, or the
/// policy's retry budget is spent.
pub fn retry_transient<T, E, F>(
    policy: &RetryPolicy,
    operation: &str,
    is_recoverable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: core::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_recoverable(&e) && policy.should_retry(retries) => {
                retries += 1;
                let delay = policy.delay_for_attempt(retries);
                warn!(
                    operation,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure; retrying"
                );
                thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
