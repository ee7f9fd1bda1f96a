use std::{future::Future, time::Duration};

use crate::error::FetchError;

/// Bounds applied to every provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Run `op` with a per-attempt timeout, retrying transient failures with
/// linear backoff. Auth failures and the last transient failure are returned.
pub async fn fetch_with_retry<T, F, Fut>(policy: &FetchPolicy, what: &str, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let res = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(res) => res,
            Err(_) => Err(FetchError::Timeout(policy.timeout)),
        };

        match res {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                tracing::warn!(error = %e, attempt, what, "provider fetch failed, retrying with backoff");
                metrics::counter!("fetch_retry_total").increment(1);
                tokio::time::sleep(policy.retry_backoff * attempt).await;
            }
            Err(e) => {
                metrics::counter!("fetch_failures_total").increment(1);
                return Err(e);
            }
        }
    }
}
