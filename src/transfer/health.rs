//! Backend health tracking.
//!
//! Individual transfer failures are tolerated by policy, but a backend that
//! keeps failing is reported as degraded instead of being swallowed silently.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tracing::{info, warn};

/// Health of one backend, shared between the transfer path and observers.
#[derive(Debug)]
pub struct BackendHealth {
    backend: String,
    threshold: u32,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    degraded: AtomicBool,
}

/// Point-in-time view of [`BackendHealth`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub backend: String,
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
}

impl BackendHealth {
    pub fn new(backend: impl Into<String>, threshold: u32) -> Self {
        Self {
            backend: backend.into(),
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(backend = %self.backend, "Backend recovered");
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if consecutive >= self.threshold && !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                backend = %self.backend,
                consecutive_failures = consecutive,
                "Backend degraded"
            );
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            backend: self.backend.clone(),
            degraded: self.is_degraded(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_after_threshold_and_recovers() {
        let health = BackendHealth::new("disk", 3);
        health.record_failure();
        health.record_failure();
        assert!(!health.is_degraded());
        health.record_failure();
        assert!(health.is_degraded());

        health.record_success();
        let snap = health.snapshot();
        assert!(!snap.degraded);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.total_failures, 3);
        assert_eq!(snap.total_successes, 1);
    }

    #[test]
    fn test_interleaved_success_resets_streak() {
        let health = BackendHealth::new("mem", 2);
        health.record_failure();
        health.record_success();
        health.record_failure();
        assert!(!health.is_degraded());
    }
}
