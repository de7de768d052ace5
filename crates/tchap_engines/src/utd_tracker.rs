#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tchap_kernel_contracts::utd::{
    DecryptionFailedSignal, DecryptionFailure, DecryptionFailureReason, EventId, RoomMembership,
};
use tchap_kernel_contracts::ContractViolation;
use tracing::{debug, info, warn};

use crate::analytics::E2eAnalytics;
use crate::time::TimeProvider;

pub const UTD_GRACE_PERIOD_MS: u64 = 4_000;
pub const UTD_CHECK_INTERVAL_MS: u64 = 15_000;
pub const UTD_MAX_WAIT_FOR_LATE_DECRYPTION_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptionFailureTrackerConfig {
    /// Failures that decrypt within this window are never reported.
    pub grace_period_ms: u64,
    /// Period of the sweep timer while failures are pending.
    pub check_interval_ms: u64,
    /// Pending failures older than this are reported as permanent UTDs.
    pub max_wait_for_late_decryption_ms: u64,
}

impl DecryptionFailureTrackerConfig {
    pub fn standard() -> Self {
        Self {
            grace_period_ms: UTD_GRACE_PERIOD_MS,
            check_interval_ms: UTD_CHECK_INTERVAL_MS,
            max_wait_for_late_decryption_ms: UTD_MAX_WAIT_FOR_LATE_DECRYPTION_MS,
        }
    }

    pub fn new(
        grace_period_ms: u64,
        check_interval_ms: u64,
        max_wait_for_late_decryption_ms: u64,
    ) -> Result<Self, ContractViolation> {
        if grace_period_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_failure_tracker_config.grace_period_ms",
                reason: "must be > 0",
            });
        }
        if check_interval_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_failure_tracker_config.check_interval_ms",
                reason: "must be > 0",
            });
        }
        if max_wait_for_late_decryption_ms <= grace_period_ms {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_failure_tracker_config.max_wait_for_late_decryption_ms",
                reason: "must be > grace_period_ms",
            });
        }
        Ok(Self {
            grace_period_ms,
            check_interval_ms,
            max_wait_for_late_decryption_ms,
        })
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for DecryptionFailureTrackerConfig {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    Pending,
    AlreadyPending,
    AlreadyTracked,
    MembershipNotJoined,
    MissingErrorDetail,
    InvalidFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptedDisposition {
    NotPending,
    Graced { elapsed_ms: u64 },
    ReportedLate { time_to_decrypt_ms: u64 },
    /// Decrypted late while no analytics sink was attached.
    LateUnreported { time_to_decrypt_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    NoAnalytics { pending: usize },
    Swept { reported: usize, still_pending: usize },
}

/// Buffers undecryptable events and reports each one at most once, either as
/// a late decryption or, after the max wait, as a permanent UTD.
pub struct DecryptionFailureTracker {
    config: DecryptionFailureTrackerConfig,
    time_provider: Box<dyn TimeProvider>,
    analytics: Option<Box<dyn E2eAnalytics>>,
    reported_failures: BTreeMap<EventId, DecryptionFailure>,
    tracked_events: BTreeSet<EventId>,
    sweep_timer_running: bool,
}

impl std::fmt::Debug for DecryptionFailureTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionFailureTracker")
            .field("config", &self.config)
            .field("analytics_attached", &self.analytics.is_some())
            .field("pending", &self.reported_failures.len())
            .field("tracked", &self.tracked_events.len())
            .field("sweep_timer_running", &self.sweep_timer_running)
            .finish()
    }
}

impl DecryptionFailureTracker {
    pub fn new(config: DecryptionFailureTrackerConfig, time_provider: Box<dyn TimeProvider>) -> Self {
        Self {
            config,
            time_provider,
            analytics: None,
            reported_failures: BTreeMap::new(),
            tracked_events: BTreeSet::new(),
            sweep_timer_running: false,
        }
    }

    pub fn config(&self) -> &DecryptionFailureTrackerConfig {
        &self.config
    }

    pub fn attach_analytics(&mut self, analytics: Box<dyn E2eAnalytics>) {
        self.analytics = Some(analytics);
    }

    pub fn detach_analytics(&mut self) -> Option<Box<dyn E2eAnalytics>> {
        self.analytics.take()
    }

    pub fn has_analytics(&self) -> bool {
        self.analytics.is_some()
    }

    pub fn report_unable_to_decrypt(&mut self, signal: &DecryptionFailedSignal) -> ReportDisposition {
        let event_id = &signal.event_id;
        if self.reported_failures.contains_key(event_id) {
            return ReportDisposition::AlreadyPending;
        }
        if self.tracked_events.contains(event_id) {
            return ReportDisposition::AlreadyTracked;
        }

        // Events sent before we joined cannot be decrypted; those are expected.
        match signal.membership {
            Some(membership) if membership.is_joined() => {}
            _ => {
                debug!(
                    event_id = %event_id,
                    membership = signal.membership.map_or("none", RoomMembership::as_str),
                    "utd ignored: user not joined"
                );
                return ReportDisposition::MembershipNotJoined;
            }
        }

        let Some(error) = signal.error.as_ref() else {
            return ReportDisposition::MissingErrorDetail;
        };

        let reason = DecryptionFailureReason::from_error_code(error.error_code());
        let failure = match DecryptionFailure::v1(
            event_id.clone(),
            reason,
            error.failure_context(),
            self.time_provider.now_ms(),
        ) {
            Ok(failure) => failure,
            Err(err) => {
                warn!(event_id = %event_id, error = %err, "utd ignored: invalid failure record");
                return ReportDisposition::InvalidFailure;
            }
        };

        debug!(
            event_id = %event_id,
            reason = reason.as_str(),
            pending = self.reported_failures.len() + 1,
            "utd pending"
        );
        self.reported_failures.insert(event_id.clone(), failure);

        if !self.sweep_timer_running {
            self.sweep_timer_running = true;
        }
        ReportDisposition::Pending
    }

    pub fn event_decrypted(&mut self, event_id: &EventId) -> DecryptedDisposition {
        let Some(mut failure) = self.reported_failures.remove(event_id) else {
            return DecryptedDisposition::NotPending;
        };

        let elapsed_ms = self
            .time_provider
            .now_ms()
            .saturating_elapsed_since(failure.ts);

        let disposition = if elapsed_ms < self.config.grace_period_ms {
            debug!(event_id = %event_id, elapsed_ms, "utd graced");
            DecryptedDisposition::Graced { elapsed_ms }
        } else {
            failure.time_to_decrypt_ms = Some(elapsed_ms);
            match self.analytics.as_mut() {
                Some(analytics) => {
                    info!(
                        event_id = %event_id,
                        reason = failure.reason.as_str(),
                        time_to_decrypt_ms = elapsed_ms,
                        "utd reported as late decryption"
                    );
                    analytics.track_e2ee_error(&failure);
                    DecryptedDisposition::ReportedLate {
                        time_to_decrypt_ms: elapsed_ms,
                    }
                }
                None => {
                    warn!(
                        event_id = %event_id,
                        time_to_decrypt_ms = elapsed_ms,
                        "late decryption not reported: no analytics attached"
                    );
                    DecryptedDisposition::LateUnreported {
                        time_to_decrypt_ms: elapsed_ms,
                    }
                }
            }
        };

        self.tracked_events.insert(event_id.clone());
        self.stop_timer_if_idle();
        disposition
    }

    /// Reports every pending failure older than the max wait as a permanent
    /// UTD. Leaves all state untouched when no analytics sink is attached.
    pub fn check_failures(&mut self) -> SweepOutcome {
        let Some(analytics) = self.analytics.as_mut() else {
            debug!(
                pending = self.reported_failures.len(),
                "utd sweep skipped: no analytics attached"
            );
            return SweepOutcome::NoAnalytics {
                pending: self.reported_failures.len(),
            };
        };

        let now = self.time_provider.now_ms();
        let max_wait_ms = self.config.max_wait_for_late_decryption_ms;
        let expired: Vec<EventId> = self
            .reported_failures
            .iter()
            .filter(|(_, failure)| now.saturating_elapsed_since(failure.ts) > max_wait_ms)
            .map(|(event_id, _)| event_id.clone())
            .collect();

        let mut failures_to_report = Vec::with_capacity(expired.len());
        for event_id in expired {
            if let Some(mut failure) = self.reported_failures.remove(&event_id) {
                failure.time_to_decrypt_ms = None;
                self.tracked_events.insert(event_id);
                failures_to_report.push(failure);
            }
        }

        for failure in &failures_to_report {
            info!(
                event_id = %failure.failed_event_id,
                reason = failure.reason.as_str(),
                "utd reported as permanent"
            );
            analytics.track_e2ee_error(failure);
        }

        self.stop_timer_if_idle();
        SweepOutcome::Swept {
            reported: failures_to_report.len(),
            still_pending: self.reported_failures.len(),
        }
    }

    /// On-demand sweep, e.g. when the app comes to the foreground.
    pub fn dispatch(&mut self) -> SweepOutcome {
        self.check_failures()
    }

    /// Drops pending failures without reporting them and stops the timer,
    /// e.g. on logout. Tracked ids are kept: a reported event stays blocked
    /// for the lifetime of the tracker.
    pub fn clear(&mut self) {
        self.reported_failures.clear();
        self.sweep_timer_running = false;
    }

    pub fn sweep_timer_running(&self) -> bool {
        self.sweep_timer_running
    }

    pub fn pending_count(&self) -> usize {
        self.reported_failures.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked_events.len()
    }

    pub fn is_pending(&self, event_id: &EventId) -> bool {
        self.reported_failures.contains_key(event_id)
    }

    pub fn is_tracked(&self, event_id: &EventId) -> bool {
        self.tracked_events.contains(event_id)
    }

    pub fn pending_failure(&self, event_id: &EventId) -> Option<&DecryptionFailure> {
        self.reported_failures.get(event_id)
    }

    fn stop_timer_if_idle(&mut self) {
        if self.reported_failures.is_empty() && self.sweep_timer_running {
            debug!("utd sweep timer stopped: nothing pending");
            self.sweep_timer_running = false;
        }
    }
}
