#![forbid(unsafe_code)]

use tchap_engines::time::{SystemTimeProvider, TimeProvider};
use tchap_kernel_contracts::UnixTimeMs;
use tokio::time::Instant;

/// Wall-clock time anchored once and then advanced by the tokio clock, so the
/// tracker and its sweep interval observe the same (possibly paused) time.
#[derive(Debug, Clone, Copy)]
pub struct TokioAnchoredClock {
    anchor_wall: UnixTimeMs,
    anchor_instant: Instant,
}

impl TokioAnchoredClock {
    pub fn anchored_now() -> Self {
        Self::anchored_at(SystemTimeProvider.now_ms())
    }

    pub fn anchored_at(anchor_wall: UnixTimeMs) -> Self {
        Self {
            anchor_wall,
            anchor_instant: Instant::now(),
        }
    }
}

impl TimeProvider for TokioAnchoredClock {
    fn now_ms(&self) -> UnixTimeMs {
        let elapsed = Instant::now().saturating_duration_since(self.anchor_instant);
        self.anchor_wall
            .saturating_add_ms(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}
