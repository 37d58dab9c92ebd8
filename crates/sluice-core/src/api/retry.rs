use std::time::Duration;

use tracing::warn;

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::{Result, SluiceError};

/// Retry a closure on transient errors with exponential backoff + jitter.
///
/// Classification comes from [`SluiceError::is_retryable`]; cancellation
/// always short-circuits, including while a backoff sleep is pending.
pub fn retry_transient<T>(
    config: &RetryConfig,
    op_name: &str,
    cancel: &CancelToken,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            cancel.check()?;
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
            cancel.check()?;
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap())
}
