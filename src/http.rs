//! HTTP retry policy with anti-bot signal detection.
//!
//! Every network call in the pipeline goes through [`get_with_retries`]. The
//! policy paces each attempt with a jittered delay, backs off exponentially
//! on failures, and escalates patterns that look like active blocking
//! (distinct status codes, repeated connection drops) as [`FetchError::AntiBot`]
//! so the caller can enter a cooldown instead of burning retries.

use std::time::Duration;

use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote service appears to be blocking us. Callers treat this as a
    /// first-class signal, distinct from an ordinary request failure.
    #[error("anti-bot triggered: {0}")]
    AntiBot(String),
    /// All attempts failed at the connection level.
    #[error("request failed after {attempts} attempts: {url}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
}

/// Retry/pacing policy for a single logical GET.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Politeness pacing applied before every attempt, not just retries.
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to `base_delay`.
    pub jitter: Duration,
    /// Base of the exponential backoff applied after failures.
    pub backoff_base: f64,
    pub antibot_statuses: Vec<StatusCode>,
    /// Raise `AntiBot` immediately instead of backing off on blocked statuses.
    pub fail_fast: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            jitter: Duration::from_millis(600),
            backoff_base: 3.0,
            antibot_statuses: vec![
                StatusCode::FORBIDDEN,
                StatusCode::IM_A_TEAPOT,
                StatusCode::TOO_MANY_REQUESTS,
            ],
            fail_fast: true,
        }
    }
}

impl RetryPolicy {
    fn pacing_delay(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=1.0) * self.jitter.as_secs_f64();
        self.base_delay + Duration::from_secs_f64(jitter)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_base * f64::from(2_u32.saturating_pow(attempt.saturating_sub(1)))
            + rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(backoff)
    }
}

/// Some blocks manifest as abrupt connection/TLS resets rather than a status
/// code. Retrying those with full force only wastes time against the block.
fn looks_like_abrupt_reset(err: &reqwest::Error) -> bool {
    let chain = format!("{err:#?}").to_lowercase();
    chain.contains("connection reset")
        || chain.contains("unexpectedeof")
        || chain.contains("unexpected eof")
        || chain.contains("close_notify")
}

/// Perform one logical GET with pacing, backoff, and anti-bot detection.
///
/// Returns the response on HTTP 200 immediately. A non-200 outside the
/// anti-bot set is retried up to the attempt budget and then returned as-is,
/// leaving the interpretation of its body to the caller. Holds no state
/// across calls.
///
/// # Errors
///
/// `FetchError::AntiBot` on a blocked status (when `fail_fast`), a second
/// consecutive connection failure, or one resembling an abrupt TLS reset.
/// `FetchError::RetriesExhausted` when every attempt failed at the
/// connection level.
pub async fn get_with_retries(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    policy: &RetryPolicy,
) -> Result<Response, FetchError> {
    let mut last_err: Option<reqwest::Error> = None;
    let mut consecutive_connect_failures = 0_u32;

    for attempt in 1..=policy.max_attempts {
        tokio::time::sleep(policy.pacing_delay()).await;

        let result = client.get(url).headers(headers.clone()).send().await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                consecutive_connect_failures += 1;
                let abrupt = looks_like_abrupt_reset(&e);
                if policy.fail_fast && (abrupt || consecutive_connect_failures >= 2) {
                    return Err(FetchError::AntiBot(format!(
                        "connect failure url={url} attempt={attempt} abrupt_reset={abrupt} err={e}"
                    )));
                }
                warn!(url, attempt, error = %e, "connection failure, backing off");
                last_err = Some(e);
                tokio::time::sleep(policy.backoff_delay(attempt)).await;
                continue;
            }
        };
        consecutive_connect_failures = 0;

        let status = resp.status();
        if policy.antibot_statuses.contains(&status) {
            if policy.fail_fast {
                return Err(FetchError::AntiBot(format!("status={status} url={url}")));
            }
            warn!(url, %status, attempt, "anti-bot status, backing off");
            tokio::time::sleep(policy.backoff_delay(attempt)).await;
            continue;
        }

        if status == StatusCode::OK {
            return Ok(resp);
        }

        // Ordinary non-200: a short retry, then hand the last response back.
        if attempt < policy.max_attempts {
            debug!(url, %status, attempt, "non-200 response, retrying");
            let short = Duration::from_secs_f64(1.0 + rand::thread_rng().gen_range(0.0..1.0));
            tokio::time::sleep(short).await;
            continue;
        }
        return Ok(resp);
    }

    match last_err {
        Some(source) => Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts: policy.max_attempts,
            source,
        }),
        // No connection error means every attempt hit a blocked status with
        // fail_fast disabled.
        None => Err(FetchError::AntiBot(format!(
            "blocked on every attempt: {url}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            jitter: Duration::from_millis(1),
            backoff_base: 0.01,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn returns_immediately_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let resp = get_with_retries(
            &client,
            &format!("{}/page", server.uri()),
            &HeaderMap::new(),
            &fast_policy(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn antibot_status_fails_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocked"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let err = get_with_retries(
            &client,
            &format!("{}/blocked", server.uri()),
            &HeaderMap::new(),
            &fast_policy(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::AntiBot(_)));
    }

    #[tokio::test]
    async fn antibot_status_backs_off_when_not_fail_fast() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = Client::new();
        let policy = RetryPolicy {
            fail_fast: false,
            ..fast_policy()
        };
        // All attempts exhausted on 429s; the call reports the retry loop end
        // rather than a success.
        let result = get_with_retries(
            &client,
            &format!("{}/flaky", server.uri()),
            &HeaderMap::new(),
            &policy,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_200_returned_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let client = Client::new();
        let resp = get_with_retries(
            &client,
            &format!("{}/missing", server.uri()),
            &HeaderMap::new(),
            &fast_policy(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn second_connect_failure_escalates() {
        // Nothing listens on this port; connects fail immediately.
        let client = Client::new();
        let err = get_with_retries(
            &client,
            "http://127.0.0.1:9/never",
            &HeaderMap::new(),
            &fast_policy(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::AntiBot(_)));
    }
}
