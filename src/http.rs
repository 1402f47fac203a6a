//! Outbound HTTP plumbing shared by the model and storage clients.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::warn;

use crate::constants::{DEFAULT_HTTP_MAX_RETRIES, DEFAULT_HTTP_TIMEOUT_SECS, RETRY_BASE_DELAY_MS};
use crate::error::MobsmithError;

/// Transport settings for every outbound call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HttpSettings {
    /// Per-call timeout
    pub timeout: Duration,
    /// How many times a connection error, 429 or 5xx is retried
    pub max_retries: u32,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            max_retries: DEFAULT_HTTP_MAX_RETRIES,
        }
    }
}

impl HttpSettings {
    /// Builds a client honouring the timeout.
    pub fn build_client(&self) -> Result<reqwest::Client, MobsmithError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| MobsmithError::Configuration(format!("HTTP client: {err}")))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(1 << attempt.min(6)))
}

/// Sends the request, retrying connection failures, 429 and 5xx up to `max_retries` times.
///
/// The final response is returned whatever its status, callers decide what a failure is.
pub(crate) async fn send_with_retries(
    request: RequestBuilder,
    max_retries: u32,
) -> Result<Response, reqwest::Error> {
    let mut attempt = 0;
    loop {
        let Some(this_try) = request.try_clone() else {
            // streaming bodies can't be replayed
            return request.send().await;
        };
        match this_try.send().await {
            Ok(response) if attempt < max_retries && is_retryable(response.status()) => {
                warn!(
                    "Attempt {} got {}, retrying",
                    attempt + 1,
                    response.status()
                );
            }
            Ok(response) => return Ok(response),
            Err(err) if attempt < max_retries && (err.is_connect() || err.is_timeout()) => {
                warn!("Attempt {} failed: {}, retrying", attempt + 1, err);
            }
            Err(err) => return Err(err),
        }
        tokio::time::sleep(retry_delay(attempt)).await;
        attempt += 1;
    }
}

/// Keeps remote error bodies readable in logs and messages.
pub(crate) fn body_snippet(bytes: &[u8]) -> String {
    const LIMIT: usize = 512;
    let text = String::from_utf8_lossy(bytes);
    if text.chars().count() > LIMIT {
        let cut: String = text.chars().take(LIMIT).collect();
        format!("{cut}...")
    } else {
        text.into_owned()
    }
}
