//! HTTP fetch with automatic retry.
//!
//! Two flavours cover the proxy's upstream traffic: [`execute_retryable_request`]
//! hands the caller the raw [`Response`] (manifest and segment requests),
//! while [`execute_retry_clip_request`] drains the body and retries read
//! failures too (background clip prefetches). Both treat any 2xx as success
//! and sleep a fixed delay between attempts.

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::warn;

use crate::config::Config;
use crate::error::{RelayrError, Result};

/// Attempt count and inter-attempt delay for one retry path.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub attempts: u32,
    /// Sleep duration between consecutive attempts.
    pub delay: Duration,
}

impl RetryConfig {
    /// Retry policy for client-facing manifest and segment fetches.
    pub fn request(config: &Config) -> Self {
        Self {
            attempts: config.attempts,
            delay: config.retry_request_delay,
        }
    }

    /// Retry policy for background clip prefetches.
    pub fn clip(config: &Config) -> Self {
        Self {
            attempts: config.attempts,
            delay: config.retry_clip_delay,
        }
    }
}

/// Fetch a URL via HTTP GET, retrying until a 2xx response arrives or the
/// attempts are exhausted.
///
/// # Errors
///
/// Returns the last network error or non-2xx status once all attempts fail.
pub async fn execute_retryable_request(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    retry: &RetryConfig,
) -> Result<Response> {
    let attempts = retry.attempts.max(1);

    for attempt in 1..=attempts {
        let is_last = attempt == attempts;

        match client.get(url).headers(headers.clone()).send().await {
            Ok(response) if response.status().is_success() => return Ok(response),

            Ok(response) => {
                warn!(
                    "upstream returned {} for {} (attempt {}/{})",
                    response.status(),
                    url,
                    attempt,
                    attempts
                );
                if is_last {
                    return Err(RelayrError::UpstreamStatus(response.status()));
                }
            }

            Err(e) => {
                warn!(
                    "upstream fetch failed for {} (attempt {}/{}): {}",
                    url, attempt, attempts, e
                );
                if is_last {
                    return Err(RelayrError::Upstream(e));
                }
            }
        }

        tokio::time::sleep(retry.delay).await;
    }

    unreachable!("retry loop exhausted {attempts} attempt(s) without returning")
}

/// Fetch a URL via HTTP GET and read the full body, retrying on network
/// errors, non-2xx statuses, and body read failures alike.
///
/// # Errors
///
/// Returns the last failure once all attempts are exhausted.
pub async fn execute_retry_clip_request(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    retry: &RetryConfig,
) -> Result<Bytes> {
    let attempts = retry.attempts.max(1);

    for attempt in 1..=attempts {
        let is_last = attempt == attempts;

        let outcome: std::result::Result<(), RelayrError> = match client
            .get(url)
            .headers(headers.clone())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                match response.bytes().await {
                    Ok(bytes) => return Ok(bytes),
                    Err(e) => Err(RelayrError::Upstream(e)),
                }
            }
            Ok(response) => Err(RelayrError::UpstreamStatus(response.status())),
            Err(e) => Err(RelayrError::Upstream(e)),
        };

        if let Err(e) = outcome {
            warn!(
                "clip fetch failed for {} (attempt {}/{}): {}",
                url, attempt, attempts, e
            );
            if is_last {
                return Err(e);
            }
        }

        tokio::time::sleep(retry.delay).await;
    }

    unreachable!("retry loop exhausted {attempts} attempt(s) without returning")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config() -> Config {
        Config::try_parse_from([
            "relayr",
            "--attempts",
            "4",
            "--retry-request-delay",
            "10ms",
            "--retry-clip-delay",
            "20ms",
        ])
        .unwrap()
    }

    #[test]
    fn request_policy_uses_request_delay() {
        let retry = RetryConfig::request(&test_config());
        assert_eq!(retry.attempts, 4);
        assert_eq!(retry.delay, Duration::from_millis(10));
    }

    #[test]
    fn clip_policy_uses_clip_delay() {
        let retry = RetryConfig::clip(&test_config());
        assert_eq!(retry.attempts, 4);
        assert_eq!(retry.delay, Duration::from_millis(20));
    }

    #[test]
    fn zero_attempts_treated_as_one() {
        let retry = RetryConfig {
            attempts: 0,
            delay: Duration::from_millis(1),
        };
        assert_eq!(retry.attempts.max(1), 1);
    }

    #[tokio::test]
    async fn connection_error_surfaces_after_retries() {
        let client = Client::new();
        let retry = RetryConfig {
            attempts: 2,
            delay: Duration::from_millis(1),
        };
        // Nothing listens on this port.
        let result =
            execute_retryable_request(&client, "http://127.0.0.1:1/x.ts", HeaderMap::new(), &retry)
                .await;
        assert!(matches!(result, Err(RelayrError::Upstream(_))));
    }
}
