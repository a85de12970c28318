//! Retrying fallible async operations.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

/// Runs `op` up to `attempts` times, sleeping `interval` between failures.
///
/// Returns the first success or the error from the final attempt. An
/// `attempts` of zero still runs the operation once.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use peerwire::retry::retry;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut calls = 0;
/// let result: Result<u32, &str> = retry(3, Duration::from_millis(1), || {
///     calls += 1;
///     let n = calls;
///     async move { if n < 3 { Err("busy") } else { Ok(n) } }
/// })
/// .await;
/// assert_eq!(result, Ok(3));
/// # }
/// ```
pub async fn retry<T, E, F, Fut>(attempts: u32, interval: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(_) => {
                trace!(attempt, attempts, "operation failed, retrying");
                attempt += 1;
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let mut calls = 0u32;
        let result: Result<(), u32> = retry(3, Duration::from_millis(1), || {
            calls += 1;
            let n = calls;
            async move { Err(n) }
        })
        .await;
        assert_eq!(result, Err(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_retry_zero_attempts_runs_once() {
        let mut calls = 0u32;
        let result: Result<u32, ()> = retry(0, Duration::from_millis(1), || {
            calls += 1;
            async { Ok(7) }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 1);
    }
}
