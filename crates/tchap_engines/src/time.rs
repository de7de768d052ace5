#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tchap_kernel_contracts::UnixTimeMs;

pub trait TimeProvider: Send + Sync {
    fn now_ms(&self) -> UnixTimeMs;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_ms(&self) -> UnixTimeMs {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        UnixTimeMs(ms)
    }
}

/// Settable clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualTimeProvider {
    now_ms: Arc<AtomicU64>,
}

impl ManualTimeProvider {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: Arc::new(AtomicU64::new(start.0)),
        }
    }

    pub fn set(&self, now: UnixTimeMs) {
        self.now_ms.store(now.0, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by_ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.advance_ms(by_ms);
    }

    pub fn advance_ms(&self, by_ms: u64) {
        let _ = self
            .now_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_add(by_ms))
            });
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_ms(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}
