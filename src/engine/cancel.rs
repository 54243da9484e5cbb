//! Cooperative cancellation of an in-flight generation.
//!
//! `stop()` only raises a flag. The decode loop polls it at the top of
//! every iteration, so cancellation lands within one token and never splits
//! a decode step. Hosts that must reload wait for the idle signal first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Result of waiting for a generation to wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    Idle,
    Timeout,
}

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    generating: AtomicBool,
    idle: Notify,
}

/// Cloneable, thread-safe handle onto a session's stop flag.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running generation to stop. No-op when idle.
    pub fn request(&self) {
        if self.is_generating() {
            tracing::debug!("stop requested");
        }
        self.inner.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub fn is_generating(&self) -> bool {
        self.inner.generating.load(Ordering::SeqCst)
    }

    /// Mark a generation as started. None if one is already running.
    pub(crate) fn begin(&self) -> Option<GenerationGuard> {
        if self
            .inner
            .generating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        self.inner.requested.store(false, Ordering::SeqCst);
        Some(GenerationGuard {
            inner: self.inner.clone(),
        })
    }

    /// Wait until no generation is in flight.
    pub async fn wait_idle(&self, timeout: Duration) -> StopResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.inner.idle.notified();
            if !self.is_generating() {
                return StopResult::Idle;
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return StopResult::Timeout;
            }

            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(remaining) => {
                    if self.is_generating() {
                        return StopResult::Timeout;
                    }
                    return StopResult::Idle;
                }
            }
        }
    }

    /// Request a stop and wait for the loop to exit.
    pub async fn stop_and_wait(&self, timeout: Duration) -> StopResult {
        self.request();
        self.wait_idle(timeout).await
    }
}

/// Held by a running generation; clears the in-flight mark on drop.
#[derive(Debug)]
pub struct GenerationGuard {
    inner: Arc<StopInner>,
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.inner.generating.store(false, Ordering::SeqCst);
        self.inner.idle.notify_waiters();
        self.inner.idle.notify_one();
    }
}
