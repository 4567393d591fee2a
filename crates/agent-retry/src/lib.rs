// SPDX-License-Identifier: MIT OR Apache-2.0
//! Controller callback emitter: URL resolution, idempotency keys, and a
//! linear-backoff delivery loop.
//!
//! Callback delivery is always best-effort — a job's outcome is never
//! altered by a failed callback POST. The only thing this crate
//! guarantees is that every terminal callback is *attempted* at least
//! once, and that retries back off linearly rather than exponentially.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use reqwest::Url;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while resolving a callback target into a final URL.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    /// The target could not be turned into a valid URL.
    #[error("invalid callback target: {0}")]
    InvalidTarget(String),
    /// A relative target was given with no base URL configured.
    #[error("relative callback target with no base URL configured")]
    NoBaseUrl,
}

/// Resolve a callback `target` against an optional configured `base`.
///
/// - An absolute target (`http://`/`https://`) with no base is used verbatim.
/// - An absolute target *with* a base has its scheme and host replaced by
///   the base's, preserving the target's path, query, and fragment.
/// - A relative target is joined onto the base.
/// - A relative target with no base is a [`CallbackError::NoBaseUrl`].
pub fn resolve_url(target: &str, base: Option<&str>) -> Result<String, CallbackError> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(CallbackError::InvalidTarget("target is empty".to_string()));
    }
    let is_absolute = trimmed.starts_with("http://") || trimmed.starts_with("https://");

    match (is_absolute, base) {
        (true, None) => Ok(trimmed.to_string()),
        (true, Some(base)) => {
            let mut target_url =
                Url::parse(trimmed).map_err(|e| CallbackError::InvalidTarget(e.to_string()))?;
            let base_url =
                Url::parse(base).map_err(|e| CallbackError::InvalidTarget(e.to_string()))?;
            target_url
                .set_scheme(base_url.scheme())
                .map_err(|_| CallbackError::InvalidTarget("cannot set scheme".to_string()))?;
            target_url
                .set_host(base_url.host_str())
                .map_err(|e| CallbackError::InvalidTarget(e.to_string()))?;
            target_url
                .set_port(base_url.port())
                .map_err(|_| CallbackError::InvalidTarget("cannot set port".to_string()))?;
            Ok(target_url.to_string())
        }
        (false, Some(base)) => {
            let base_url =
                Url::parse(base).map_err(|e| CallbackError::InvalidTarget(e.to_string()))?;
            let joined = base_url
                .join(trimmed)
                .map_err(|e| CallbackError::InvalidTarget(e.to_string()))?;
            Ok(joined.to_string())
        }
        (false, None) => Err(CallbackError::NoBaseUrl),
    }
}

/// Idempotency key for a non-terminal status callback: unique per
/// `(job_id, state, heartbeat_seq)`.
pub fn status_idempotency_key(job_id: &str, state: &str, heartbeat_seq: u64) -> String {
    format!("{job_id}-{state}-{heartbeat_seq}")
}

/// Idempotency key for a terminal (completion/failure/cancel) callback:
/// unique per `(job_id, terminal_state)`.
pub fn terminal_idempotency_key(job_id: &str, terminal_state: &str) -> String {
    format!("{job_id}-{terminal_state}")
}

/// Linear backoff delay before retry attempt `i` (1-indexed): `base * i`.
pub fn linear_backoff(retry_backoff_seconds: f64, attempt: u32) -> Duration {
    Duration::from_secs_f64((retry_backoff_seconds * attempt as f64).max(0.0))
}

/// Transport settings for posting callbacks.
#[derive(Debug, Clone)]
pub struct CallbackTransportConfig {
    /// Configured base URL, if any.
    pub base_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Maximum POST attempts per callback (the first attempt plus retries).
    pub max_retries: u32,
    /// Linear backoff unit between attempts.
    pub retry_backoff_seconds: f64,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

/// Posts JSON callback bodies to a controller with idempotency keys and a
/// linear-backoff retry loop. Never propagates a delivery failure; callers
/// get back a `bool` indicating whether any attempt succeeded.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    http: reqwest::Client,
    config: CallbackTransportConfig,
}

impl CallbackClient {
    /// Build a client from the given transport settings.
    ///
    /// # Panics
    ///
    /// Panics if the underlying `reqwest::Client` cannot be constructed
    /// (e.g. the TLS backend failed to initialise) — this mirrors
    /// `reqwest::Client::new`'s own panicking constructor and only ever
    /// happens at process startup.
    #[must_use]
    pub fn new(config: CallbackTransportConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .expect("failed to build callback HTTP client");
        Self { http, config }
    }

    /// Resolve `target` against the configured base URL.
    pub fn resolve(&self, target: &str) -> Result<String, CallbackError> {
        resolve_url(target, self.config.base_url.as_deref())
    }

    /// POST `body` to `target` with the given idempotency key, retrying
    /// on transport failure with linear backoff. Returns `true` if any
    /// attempt received a successful (2xx) response.
    pub async fn post(
        &self,
        target: &str,
        idempotency_key: &str,
        body: &impl Serialize,
    ) -> bool {
        let url = match self.resolve(target) {
            Ok(url) => url,
            Err(err) => {
                warn!(target: "agent.callback", error = %err, callback_target = target, "skipping callback: unresolvable target");
                return false;
            }
        };

        let attempts = self.config.max_retries.max(1);
        for attempt in 1..=attempts {
            let result = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .header("Idempotency-Key", idempotency_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(target: "agent.callback", url, idempotency_key, attempt, "callback delivered");
                    return true;
                }
                Ok(response) => {
                    warn!(target: "agent.callback", url, idempotency_key, attempt, status = %response.status(), "callback rejected");
                }
                Err(err) => {
                    warn!(target: "agent.callback", url, idempotency_key, attempt, error = %err, "callback transport error");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(linear_backoff(self.config.retry_backoff_seconds, attempt)).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_target_without_base_is_used_verbatim() {
        let resolved = resolve_url("https://controller.example/status", None).unwrap();
        assert_eq!(resolved, "https://controller.example/status");
    }

    #[test]
    fn relative_target_without_base_errors() {
        assert_eq!(resolve_url("/status", None), Err(CallbackError::NoBaseUrl));
    }

    #[test]
    fn relative_target_joins_base() {
        let resolved = resolve_url("/status", Some("http://controller.local:8080/api")).unwrap();
        assert_eq!(resolved, "http://controller.local:8080/status");
    }

    #[test]
    fn absolute_target_with_base_replaces_host_preserves_path() {
        let resolved = resolve_url(
            "https://old-host.example/jobs/1/status?x=1",
            Some("http://controller.local:9090"),
        )
        .unwrap();
        assert_eq!(resolved, "http://controller.local:9090/jobs/1/status?x=1");
    }

    #[test]
    fn empty_target_is_invalid() {
        assert!(matches!(
            resolve_url("   ", Some("http://base")),
            Err(CallbackError::InvalidTarget(_))
        ));
    }

    #[test]
    fn status_key_includes_heartbeat_seq() {
        assert_eq!(status_idempotency_key("J1", "RUNNING", 3), "J1-RUNNING-3");
    }

    #[test]
    fn terminal_key_has_no_heartbeat_seq() {
        assert_eq!(terminal_idempotency_key("J1", "SUCCESS"), "J1-SUCCESS");
    }

    #[test]
    fn linear_backoff_scales_with_attempt_number() {
        assert_eq!(linear_backoff(1.0, 1), Duration::from_secs(1));
        assert_eq!(linear_backoff(1.0, 2), Duration::from_secs(2));
        assert_eq!(linear_backoff(2.5, 3), Duration::from_secs_f64(7.5));
    }

    #[tokio::test]
    async fn post_returns_false_for_unresolvable_target() {
        let client = CallbackClient::new(CallbackTransportConfig {
            base_url: None,
            timeout: Duration::from_secs(1),
            max_retries: 1,
            retry_backoff_seconds: 0.0,
            verify_tls: true,
        });
        let ok = client
            .post("/relative/with/no/base", "J1-QUEUED-1", &serde_json::json!({}))
            .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn post_returns_false_when_nothing_listens() {
        let client = CallbackClient::new(CallbackTransportConfig {
            base_url: None,
            timeout: Duration::from_millis(200),
            max_retries: 1,
            retry_backoff_seconds: 0.0,
            verify_tls: true,
        });
        let ok = client
            .post(
                "http://127.0.0.1:1",
                "J1-FAILED",
                &serde_json::json!({"job_id": "J1"}),
            )
            .await;
        assert!(!ok);
    }
}
