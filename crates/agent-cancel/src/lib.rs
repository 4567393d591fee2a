// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cooperative cancellation primitives for in-flight render jobs.
//!
//! A job that wants to be cancellable registers a [`CancellationToken`]
//! under its job id and the secret token the controller supplied on the
//! dispatch envelope. [`CancellationRegistry::request_cancel`] is the
//! single entry point the dispatch endpoint's cancel route calls; it is
//! deliberately the only way to flip a token.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A cloneable, cheaply-shareable signal used to observe cancellation.
///
/// All clones share the same underlying state; cancelling one
/// immediately makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent — calling more than once is harmless.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a future that completes when the token is cancelled.
    ///
    /// If the token is already cancelled the future resolves immediately.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// The record a job registers so a later cancel request can find and
/// authenticate against it.
#[derive(Clone)]
struct CancellationHandle {
    expected_token: String,
    signal: CancellationToken,
}

/// Registry of in-flight jobs that accept cooperative cancellation.
///
/// The agent only ever runs one job at a time, but the registry is keyed
/// by `job_id` (rather than being a single slot) so a cancel request that
/// arrives after a job has already finished is simply a no-op lookup miss
/// instead of racing the admission gate.
#[derive(Debug, Default, Clone)]
pub struct CancellationRegistry {
    handles: Arc<Mutex<BTreeMap<String, CancellationHandleDebug>>>,
}

// `CancellationHandle` holds a `CancellationToken`, which only derives
// `Clone`; wrap it so the registry's inner map can still derive `Debug`.
#[derive(Clone)]
struct CancellationHandleDebug(CancellationHandle);

impl std::fmt::Debug for CancellationHandleDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("cancelled", &self.0.signal.is_cancelled())
            .finish()
    }
}

impl CancellationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job's cancellation signal under `job_id`, authenticated
    /// by `expected_token`. Returns the [`CancellationToken`] the job's
    /// own poll loop should observe.
    pub fn register(&self, job_id: impl Into<String>, expected_token: impl Into<String>) -> CancellationToken {
        let signal = CancellationToken::new();
        let handle = CancellationHandle {
            expected_token: expected_token.into(),
            signal: signal.clone(),
        };
        self.handles
            .lock()
            .expect("cancellation registry lock poisoned")
            .insert(job_id.into(), CancellationHandleDebug(handle));
        signal
    }

    /// Remove a job's registration once it reaches a terminal state.
    pub fn unregister(&self, job_id: &str) {
        self.handles
            .lock()
            .expect("cancellation registry lock poisoned")
            .remove(job_id);
    }

    /// Request cancellation of `job_id`, authenticated by `token`.
    ///
    /// Returns `false` (a no-op) if `token` is empty, if no job is
    /// registered under `job_id`, or if `token` does not match the token
    /// the job was registered with. Returns `true` once the signal has
    /// been flipped.
    pub fn request_cancel(&self, job_id: &str, token: &str) -> bool {
        if token.trim().is_empty() {
            return false;
        }
        let handles = self
            .handles
            .lock()
            .expect("cancellation registry lock poisoned");
        match handles.get(job_id) {
            Some(handle) if handle.0.expected_token == token => {
                handle.0.signal.cancel();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let a = CancellationToken::new();
        let b = a.clone();
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn multiple_cancels_are_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn registry_cancels_on_matching_token() {
        let registry = CancellationRegistry::new();
        let signal = registry.register("J1", "secret");
        assert!(registry.request_cancel("J1", "secret"));
        assert!(signal.is_cancelled());
    }

    #[test]
    fn registry_rejects_wrong_token() {
        let registry = CancellationRegistry::new();
        let signal = registry.register("J1", "secret");
        assert!(!registry.request_cancel("J1", "wrong"));
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn registry_rejects_empty_token() {
        let registry = CancellationRegistry::new();
        registry.register("J1", "secret");
        assert!(!registry.request_cancel("J1", ""));
        assert!(!registry.request_cancel("J1", "   "));
    }

    #[test]
    fn registry_rejects_unknown_job() {
        let registry = CancellationRegistry::new();
        assert!(!registry.request_cancel("unknown", "secret"));
    }

    #[test]
    fn unregister_makes_future_cancels_no_ops() {
        let registry = CancellationRegistry::new();
        let signal = registry.register("J1", "secret");
        registry.unregister("J1");
        assert!(!registry.request_cancel("J1", "secret"));
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_if_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }

    #[tokio::test]
    async fn cancelled_future_wakes_on_cancel() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("task should complete")
            .expect("task should not panic");
    }
}
