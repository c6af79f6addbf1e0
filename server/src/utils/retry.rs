//! Async retry with exponential backoff

use std::future::Future;
use std::time::Duration;

/// Default base delay in milliseconds for exponential backoff
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Upper bound for a single backoff sleep
const MAX_BACKOFF_MS: u64 = 5_000;

/// Run `operation` up to `1 + retries` times, sleeping with exponential backoff
/// between failures. Returns the first success or the last error.
pub async fn retry_async<F, Fut, T, E>(retries: u32, base_delay_ms: u64, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= retries {
                    return Err(e);
                }
                let factor = 2_u64.saturating_pow(attempt);
                let delay = Duration::from_millis(base_delay_ms.saturating_mul(factor).min(MAX_BACKOFF_MS));
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
