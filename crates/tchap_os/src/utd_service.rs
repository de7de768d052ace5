#![forbid(unsafe_code)]

use std::future;

use tchap_engines::analytics::E2eAnalytics;
use tchap_engines::utd_tracker::{DecryptionFailureTracker, SweepOutcome};
use tchap_kernel_contracts::utd::{DecryptionFailedSignal, EventId};
use tchap_kernel_contracts::ContractViolation;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const UTD_SIGNAL_QUEUE_CAPACITY_DEFAULT: usize = 1_024;
pub const UTD_SIGNAL_QUEUE_CAPACITY_MIN: usize = 64;
pub const UTD_SIGNAL_QUEUE_CAPACITY_MAX: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtdServiceConfig {
    pub tracking_enabled: bool,
    pub signal_queue_capacity: usize,
}

impl UtdServiceConfig {
    pub fn mvp_v1(tracking_enabled: bool) -> Self {
        Self {
            tracking_enabled,
            signal_queue_capacity: UTD_SIGNAL_QUEUE_CAPACITY_DEFAULT,
        }
    }

    pub fn validate(&self) -> Result<(), ContractViolation> {
        if !(UTD_SIGNAL_QUEUE_CAPACITY_MIN..=UTD_SIGNAL_QUEUE_CAPACITY_MAX)
            .contains(&self.signal_queue_capacity)
        {
            return Err(ContractViolation::InvalidRange {
                field: "utd_service_config.signal_queue_capacity",
                min: UTD_SIGNAL_QUEUE_CAPACITY_MIN as f64,
                max: UTD_SIGNAL_QUEUE_CAPACITY_MAX as f64,
                got: self.signal_queue_capacity as f64,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid utd service config: {0}")]
    InvalidConfig(#[from] ContractViolation),
    #[error("utd service is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAck {
    Queued,
    NotInvokedDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerSnapshot {
    pub pending: usize,
    pub tracked: usize,
    pub sweep_timer_running: bool,
    pub analytics_attached: bool,
    pub sweep_ticks: u64,
}

/// Typed signals delivered to the tracker task.
pub enum DecryptionSignal {
    DecryptionFailed(DecryptionFailedSignal),
    EventDecrypted(EventId),
    Dispatch,
    AttachAnalytics(Box<dyn E2eAnalytics>),
    DetachAnalytics,
    Clear,
    Snapshot(oneshot::Sender<TrackerSnapshot>),
}

impl std::fmt::Debug for DecryptionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecryptionSignal::DecryptionFailed(signal) => {
                f.debug_tuple("DecryptionFailed").field(signal).finish()
            }
            DecryptionSignal::EventDecrypted(event_id) => {
                f.debug_tuple("EventDecrypted").field(event_id).finish()
            }
            DecryptionSignal::Dispatch => f.write_str("Dispatch"),
            DecryptionSignal::AttachAnalytics(_) => f.write_str("AttachAnalytics"),
            DecryptionSignal::DetachAnalytics => f.write_str("DetachAnalytics"),
            DecryptionSignal::Clear => f.write_str("Clear"),
            DecryptionSignal::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecryptionFailureHandle {
    tx: mpsc::Sender<DecryptionSignal>,
    tracking_enabled: bool,
}

impl DecryptionFailureHandle {
    pub async fn report_unable_to_decrypt(
        &self,
        signal: DecryptionFailedSignal,
    ) -> Result<SignalAck, ServiceError> {
        if !self.tracking_enabled {
            return Ok(SignalAck::NotInvokedDisabled);
        }
        self.send(DecryptionSignal::DecryptionFailed(signal)).await
    }

    pub async fn event_decrypted(&self, event_id: EventId) -> Result<SignalAck, ServiceError> {
        if !self.tracking_enabled {
            return Ok(SignalAck::NotInvokedDisabled);
        }
        self.send(DecryptionSignal::EventDecrypted(event_id)).await
    }

    /// Requests an immediate sweep outside the periodic timer.
    pub async fn dispatch(&self) -> Result<SignalAck, ServiceError> {
        if !self.tracking_enabled {
            return Ok(SignalAck::NotInvokedDisabled);
        }
        self.send(DecryptionSignal::Dispatch).await
    }

    pub async fn attach_analytics(
        &self,
        analytics: Box<dyn E2eAnalytics>,
    ) -> Result<SignalAck, ServiceError> {
        self.send(DecryptionSignal::AttachAnalytics(analytics)).await
    }

    pub async fn detach_analytics(&self) -> Result<SignalAck, ServiceError> {
        self.send(DecryptionSignal::DetachAnalytics).await
    }

    pub async fn clear(&self) -> Result<SignalAck, ServiceError> {
        self.send(DecryptionSignal::Clear).await
    }

    /// Round-trips through the task, so every signal sent before it has been
    /// applied when this returns.
    pub async fn snapshot(&self) -> Result<TrackerSnapshot, ServiceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(DecryptionSignal::Snapshot(reply_tx)).await?;
        reply_rx.await.map_err(|_| ServiceError::Closed)
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    async fn send(&self, signal: DecryptionSignal) -> Result<SignalAck, ServiceError> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| ServiceError::Closed)?;
        Ok(SignalAck::Queued)
    }
}

pub struct DecryptionFailureService;

impl DecryptionFailureService {
    /// Moves `tracker` into a dedicated task. All signals are applied in
    /// arrival order by that task alone. The task ends when `shutdown` is
    /// cancelled or every handle is dropped, returning a final snapshot.
    pub fn spawn(
        config: UtdServiceConfig,
        tracker: DecryptionFailureTracker,
        shutdown: CancellationToken,
    ) -> Result<(DecryptionFailureHandle, JoinHandle<TrackerSnapshot>), ServiceError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.signal_queue_capacity);
        let handle = DecryptionFailureHandle {
            tx,
            tracking_enabled: config.tracking_enabled,
        };
        let join = tokio::spawn(run_tracker_loop(tracker, rx, shutdown));
        Ok((handle, join))
    }
}

async fn run_tracker_loop(
    mut tracker: DecryptionFailureTracker,
    mut rx: mpsc::Receiver<DecryptionSignal>,
    shutdown: CancellationToken,
) -> TrackerSnapshot {
    let mut sweep_timer: Option<Interval> = None;
    let mut sweep_ticks: u64 = 0;

    loop {
        sync_sweep_timer(&tracker, &mut sweep_timer);

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(pending = tracker.pending_count(), "utd service shutdown requested");
                break;
            }

            _ = next_sweep_tick(&mut sweep_timer) => {
                sweep_ticks += 1;
                log_sweep(tracker.check_failures());
            }

            signal = rx.recv() => match signal {
                Some(signal) => apply_signal(&mut tracker, signal, sweep_ticks),
                None => {
                    debug!("utd service handles dropped");
                    break;
                }
            },
        }
    }

    snapshot(&tracker, sweep_ticks)
}

fn apply_signal(tracker: &mut DecryptionFailureTracker, signal: DecryptionSignal, sweep_ticks: u64) {
    match signal {
        DecryptionSignal::DecryptionFailed(signal) => {
            let disposition = tracker.report_unable_to_decrypt(&signal);
            debug!(event_id = %signal.event_id, ?disposition, "utd failure signal applied");
        }
        DecryptionSignal::EventDecrypted(event_id) => {
            let disposition = tracker.event_decrypted(&event_id);
            debug!(event_id = %event_id, ?disposition, "utd decrypted signal applied");
        }
        DecryptionSignal::Dispatch => log_sweep(tracker.dispatch()),
        DecryptionSignal::AttachAnalytics(analytics) => {
            tracker.attach_analytics(analytics);
            info!(pending = tracker.pending_count(), "utd analytics attached");
        }
        DecryptionSignal::DetachAnalytics => {
            let _ = tracker.detach_analytics();
            info!(pending = tracker.pending_count(), "utd analytics detached");
        }
        DecryptionSignal::Clear => {
            let dropped = tracker.pending_count();
            tracker.clear();
            info!(
                dropped,
                tracked = tracker.tracked_count(),
                "utd pending failures cleared"
            );
        }
        DecryptionSignal::Snapshot(reply) => {
            // The requester may have given up waiting.
            let _ = reply.send(snapshot(tracker, sweep_ticks));
        }
    }
}

fn sync_sweep_timer(tracker: &DecryptionFailureTracker, sweep_timer: &mut Option<Interval>) {
    match (tracker.sweep_timer_running(), sweep_timer.is_some()) {
        (true, false) => {
            let period = tracker.config().check_interval();
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *sweep_timer = Some(timer);
            debug!(period_ms = tracker.config().check_interval_ms, "utd sweep timer armed");
        }
        (false, true) => {
            *sweep_timer = None;
            debug!("utd sweep timer disarmed");
        }
        _ => {}
    }
}

async fn next_sweep_tick(sweep_timer: &mut Option<Interval>) {
    match sweep_timer.as_mut() {
        Some(timer) => {
            timer.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

fn log_sweep(outcome: SweepOutcome) {
    match outcome {
        SweepOutcome::NoAnalytics { pending } => {
            warn!(pending, "utd sweep deferred: no analytics attached");
        }
        SweepOutcome::Swept {
            reported,
            still_pending,
        } => {
            debug!(reported, still_pending, "utd sweep complete");
        }
    }
}

fn snapshot(tracker: &DecryptionFailureTracker, sweep_ticks: u64) -> TrackerSnapshot {
    TrackerSnapshot {
        pending: tracker.pending_count(),
        tracked: tracker.tracked_count(),
        sweep_timer_running: tracker.sweep_timer_running(),
        analytics_attached: tracker.has_analytics(),
        sweep_ticks,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tchap_engines::analytics::RecordingAnalytics;
    use tchap_engines::utd_tracker::DecryptionFailureTrackerConfig;
    use tchap_kernel_contracts::utd::{DecryptionErrorDetail, RoomMembership};
    use tchap_kernel_contracts::UnixTimeMs;

    use super::*;
    use crate::clock::TokioAnchoredClock;

    const UNKNOWN_INBOUND_SESSION_ID: i64 = 4;
    const GENERIC: i64 = 2;

    fn event_id(id: &str) -> EventId {
        EventId::new(id).unwrap()
    }

    fn failed(id: &str, membership: RoomMembership, code: i64) -> DecryptionFailedSignal {
        DecryptionFailedSignal::v1(
            event_id(id),
            Some(membership),
            Some(DecryptionErrorDetail::v1(code, "decryption failed").unwrap()),
        )
        .unwrap()
    }

    fn spawn_service(
        tracking_enabled: bool,
    ) -> (
        DecryptionFailureHandle,
        JoinHandle<TrackerSnapshot>,
        RecordingAnalytics,
        CancellationToken,
    ) {
        let mut tracker = DecryptionFailureTracker::new(
            DecryptionFailureTrackerConfig::standard(),
            Box::new(TokioAnchoredClock::anchored_at(UnixTimeMs(1_700_000_000_000))),
        );
        let analytics = RecordingAnalytics::new();
        tracker.attach_analytics(Box::new(analytics.clone()));
        let shutdown = CancellationToken::new();
        let (handle, join) = DecryptionFailureService::spawn(
            UtdServiceConfig::mvp_v1(tracking_enabled),
            tracker,
            shutdown.clone(),
        )
        .unwrap();
        (handle, join, analytics, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_01_grace_period_decrypt_is_suppressed() {
        let (handle, _join, analytics, _shutdown) = spawn_service(true);
        handle
            .report_unable_to_decrypt(failed(
                "$evt1",
                RoomMembership::Join,
                UNKNOWN_INBOUND_SESSION_ID,
            ))
            .await
            .unwrap();
        assert!(handle.snapshot().await.unwrap().sweep_timer_running);

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.event_decrypted(event_id("$evt1")).await.unwrap();
        handle
            .report_unable_to_decrypt(failed(
                "$evt1",
                RoomMembership::Join,
                UNKNOWN_INBOUND_SESSION_ID,
            ))
            .await
            .unwrap();

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.tracked, 1);
        assert!(!snapshot.sweep_timer_running);
        assert!(analytics.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_02_late_decrypt_reports_elapsed_time() {
        let (handle, _join, analytics, _shutdown) = spawn_service(true);
        handle
            .report_unable_to_decrypt(failed("$evt2", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.event_decrypted(event_id("$evt2")).await.unwrap();
        handle.snapshot().await.unwrap();

        let recorded = analytics.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].failed_event_id, event_id("$evt2"));
        assert_eq!(recorded[0].time_to_decrypt_ms, Some(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_03_periodic_sweep_reports_permanent_utd() {
        let (handle, _join, analytics, _shutdown) = spawn_service(true);
        handle
            .report_unable_to_decrypt(failed("$evt3", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        // Ticks at 15s..60s find nothing past the 60s max wait; the 75s tick does.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(analytics.is_empty());
        assert!(handle.snapshot().await.unwrap().sweep_timer_running);

        tokio::time::sleep(Duration::from_secs(15)).await;
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.sweep_ticks, 5);
        assert_eq!(snapshot.pending, 0);
        assert!(!snapshot.sweep_timer_running);

        let recorded = analytics.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].time_to_decrypt_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_04_timer_stops_when_idle_and_restarts_on_new_failure() {
        let (handle, _join, _analytics, _shutdown) = spawn_service(true);
        handle
            .report_unable_to_decrypt(failed("$a", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.event_decrypted(event_id("$a")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(100)).await;
        let idle = handle.snapshot().await.unwrap();
        assert_eq!(idle.sweep_ticks, 0);
        assert!(!idle.sweep_timer_running);

        handle
            .report_unable_to_decrypt(failed("$b", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        let busy = handle.snapshot().await.unwrap();
        assert_eq!(busy.sweep_ticks, 2);
        assert!(busy.sweep_timer_running);
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_05_non_joined_member_is_never_reported() {
        let (handle, _join, analytics, _shutdown) = spawn_service(true);
        handle
            .report_unable_to_decrypt(failed("$evt4", RoomMembership::Invite, GENERIC))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.event_decrypted(event_id("$evt4")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.tracked, 0);
        assert!(analytics.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_06_detached_analytics_defers_until_reattached() {
        let (handle, _join, analytics, _shutdown) = spawn_service(true);
        handle.detach_analytics().await.unwrap();
        handle
            .report_unable_to_decrypt(failed("$evt5", RoomMembership::Join, GENERIC))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(90)).await;
        let deferred = handle.snapshot().await.unwrap();
        assert_eq!(deferred.pending, 1);
        assert!(!deferred.analytics_attached);
        assert!(analytics.is_empty());

        handle
            .attach_analytics(Box::new(analytics.clone()))
            .await
            .unwrap();
        handle.dispatch().await.unwrap();
        let flushed = handle.snapshot().await.unwrap();
        assert_eq!(flushed.pending, 0);
        assert_eq!(flushed.tracked, 1);
        assert_eq!(analytics.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_07_disabled_tracking_does_not_invoke_tracker() {
        let (handle, _join, analytics, _shutdown) = spawn_service(false);
        let ack = handle
            .report_unable_to_decrypt(failed("$evt6", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        assert_eq!(ack, SignalAck::NotInvokedDisabled);
        assert_eq!(
            handle.dispatch().await.unwrap(),
            SignalAck::NotInvokedDisabled
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(handle.snapshot().await.unwrap().pending, 0);
        assert!(analytics.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_08_shutdown_returns_final_snapshot() {
        let (handle, join, _analytics, shutdown) = spawn_service(true);
        handle
            .report_unable_to_decrypt(failed("$evt7", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        shutdown.cancel();
        let last = join.await.unwrap();
        assert_eq!(last.pending, 1);
        assert!(matches!(
            handle.event_decrypted(event_id("$evt7")).await,
            Err(ServiceError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_09_dropping_handles_ends_task() {
        let (handle, join, _analytics, _shutdown) = spawn_service(true);
        drop(handle);
        let last = join.await.unwrap();
        assert_eq!(
            last,
            TrackerSnapshot {
                analytics_attached: true,
                ..TrackerSnapshot::default()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_10_config_bounds_queue_capacity() {
        let mut config = UtdServiceConfig::mvp_v1(true);
        assert!(config.validate().is_ok());
        config.signal_queue_capacity = 1;
        assert_eq!(
            config.validate(),
            Err(ContractViolation::InvalidRange {
                field: "utd_service_config.signal_queue_capacity",
                min: 64.0,
                max: 65_536.0,
                got: 1.0,
            })
        );
        config.signal_queue_capacity = UTD_SIGNAL_QUEUE_CAPACITY_MAX + 1;
        assert!(matches!(
            config.validate(),
            Err(ContractViolation::InvalidRange { got, .. }) if got == 65_537.0
        ));
        assert!(matches!(
            DecryptionFailureService::spawn(
                config,
                DecryptionFailureTracker::new(
                    DecryptionFailureTrackerConfig::standard(),
                    Box::new(TokioAnchoredClock::anchored_at(UnixTimeMs(0))),
                ),
                CancellationToken::new(),
            ),
            Err(ServiceError::InvalidConfig(ContractViolation::InvalidRange { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn at_utd_svc_11_clear_never_re_reports_a_reported_event() {
        let (handle, _join, analytics, _shutdown) = spawn_service(true);
        handle
            .report_unable_to_decrypt(failed("$evt3", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();
        tokio::time::sleep(Duration::from_secs(76)).await;
        assert_eq!(analytics.len(), 1);

        handle.clear().await.unwrap();
        handle
            .report_unable_to_decrypt(failed("$evt3", RoomMembership::Join, GENERIC))
            .await
            .unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, 0);
        assert_eq!(snapshot.tracked, 1);
        assert!(!snapshot.sweep_timer_running);

        tokio::time::sleep(Duration::from_secs(76)).await;
        handle.dispatch().await.unwrap();
        assert_eq!(analytics.len(), 1);
    }
}
