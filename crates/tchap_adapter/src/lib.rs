#![forbid(unsafe_code)]

pub mod analytics_sink;

use std::net::SocketAddr;
use std::path::PathBuf;

use tchap_engines::analytics::E2eAnalytics;
use tchap_engines::utd_tracker::{DecryptionFailureTracker, DecryptionFailureTrackerConfig};
use tchap_kernel_contracts::utd::{
    DecryptionErrorDetail, DecryptionFailedSignal, EventId, RoomMembership,
};
use tchap_kernel_contracts::ContractViolation;
use tchap_os::clock::TokioAnchoredClock;
use tchap_os::utd_service::{
    DecryptionFailureHandle, DecryptionFailureService, ServiceError, SignalAck, TrackerSnapshot,
    UtdServiceConfig, UTD_SIGNAL_QUEUE_CAPACITY_DEFAULT, UTD_SIGNAL_QUEUE_CAPACITY_MAX,
    UTD_SIGNAL_QUEUE_CAPACITY_MIN,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::analytics_sink::{JsonLinesAnalyticsSink, TracingAnalyticsSink};

pub const ENV_HTTP_BIND: &str = "TCHAP_UTD_HTTP_BIND";
pub const ENV_TRACKING_ENABLED: &str = "TCHAP_UTD_TRACKING_ENABLED";
pub const ENV_ANALYTICS_PATH: &str = "TCHAP_UTD_ANALYTICS_PATH";
pub const ENV_SIGNAL_QUEUE_CAPACITY: &str = "TCHAP_UTD_SIGNAL_QUEUE_CAPACITY";
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8090";

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("failed to open analytics sink: {0}")]
    AnalyticsSink(#[from] std::io::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("request rejected: {0}")]
    InvalidRequest(ContractViolation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    pub tracking_enabled: bool,
    pub analytics_path: Option<PathBuf>,
    pub signal_queue_capacity: usize,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, AdapterError> {
        Self::from_env_var_map(|key| std::env::var(key).ok())
    }

    pub fn from_env_var_map<F>(lookup: F) -> Result<Self, AdapterError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_raw = lookup(ENV_HTTP_BIND).unwrap_or_else(|| DEFAULT_HTTP_BIND.to_string());
        let bind = bind_raw
            .trim()
            .parse::<SocketAddr>()
            .map_err(|_| AdapterError::InvalidEnv {
                key: ENV_HTTP_BIND,
                value: bind_raw.clone(),
            })?;

        let tracking_enabled = parse_enabled_flag(lookup(ENV_TRACKING_ENABLED));

        let analytics_path = lookup(ENV_ANALYTICS_PATH)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let signal_queue_capacity = parse_signal_queue_capacity(lookup(ENV_SIGNAL_QUEUE_CAPACITY))?;

        Ok(Self {
            bind,
            tracking_enabled,
            analytics_path,
            signal_queue_capacity,
        })
    }

    pub fn service_config(&self) -> UtdServiceConfig {
        UtdServiceConfig {
            tracking_enabled: self.tracking_enabled,
            signal_queue_capacity: self.signal_queue_capacity,
        }
    }
}

fn parse_signal_queue_capacity(raw: Option<String>) -> Result<usize, AdapterError> {
    let Some(raw) = raw else {
        return Ok(UTD_SIGNAL_QUEUE_CAPACITY_DEFAULT);
    };
    let parsed = raw
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|v| (UTD_SIGNAL_QUEUE_CAPACITY_MIN..=UTD_SIGNAL_QUEUE_CAPACITY_MAX).contains(v));
    match parsed {
        Some(capacity) => Ok(capacity),
        None => Err(AdapterError::InvalidEnv {
            key: ENV_SIGNAL_QUEUE_CAPACITY,
            value: raw,
        }),
    }
}

fn parse_enabled_flag(raw: Option<String>) -> bool {
    match raw {
        Some(v) => !matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        None => true,
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DecryptionFailedAdapterRequest {
    pub event_id: String,
    /// Membership of the current user; absent when the user has no member
    /// record in the room state.
    pub membership: Option<String>,
    pub error_code: Option<i64>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EventDecryptedAdapterRequest {
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
}

impl AdapterResponse {
    pub fn from_ack(ack: SignalAck) -> Self {
        let outcome = match ack {
            SignalAck::Queued => "QUEUED",
            SignalAck::NotInvokedDisabled => "NOT_INVOKED_DISABLED",
        };
        Self {
            status: "ok".to_string(),
            outcome: outcome.to_string(),
            reason: None,
        }
    }

    pub fn rejected(reason: String) -> Self {
        Self {
            status: "error".to_string(),
            outcome: "REJECTED".to_string(),
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct AdapterTrackerHealth {
    pub pending: usize,
    pub tracked: usize,
    pub sweep_timer_running: bool,
    pub analytics_attached: bool,
    pub sweep_ticks: u64,
    pub tracking_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub tracker: AdapterTrackerHealth,
}

#[derive(Debug, Clone)]
pub struct AdapterRuntime {
    handle: DecryptionFailureHandle,
}

impl AdapterRuntime {
    /// Builds the tracker with the standard windows, attaches the configured
    /// analytics sink and spawns the tracker task.
    pub fn start(
        config: &AdapterConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<TrackerSnapshot>), AdapterError> {
        let analytics: Box<dyn E2eAnalytics> = match &config.analytics_path {
            Some(path) => {
                let sink = JsonLinesAnalyticsSink::open(path)?;
                info!(path = %sink.path().display(), "utd analytics written as json lines");
                Box::new(sink)
            }
            None => Box::new(TracingAnalyticsSink),
        };
        let mut tracker = DecryptionFailureTracker::new(
            DecryptionFailureTrackerConfig::standard(),
            Box::new(TokioAnchoredClock::anchored_now()),
        );
        tracker.attach_analytics(analytics);
        Self::start_with_tracker(config, tracker, shutdown)
    }

    pub fn start_with_tracker(
        config: &AdapterConfig,
        tracker: DecryptionFailureTracker,
        shutdown: CancellationToken,
    ) -> Result<(Self, JoinHandle<TrackerSnapshot>), AdapterError> {
        let (handle, join) =
            DecryptionFailureService::spawn(config.service_config(), tracker, shutdown)?;
        Ok((Self { handle }, join))
    }

    pub fn handle(&self) -> &DecryptionFailureHandle {
        &self.handle
    }

    pub async fn run_decryption_failed(
        &self,
        request: DecryptionFailedAdapterRequest,
    ) -> Result<AdapterResponse, AdapterError> {
        let event_id = EventId::new(request.event_id).map_err(AdapterError::InvalidRequest)?;
        let membership = request.membership.as_deref().map(RoomMembership::parse);
        let error = match request.error_code {
            Some(code) => Some(
                DecryptionErrorDetail::v1(code, request.error_description.unwrap_or_default())
                    .map_err(AdapterError::InvalidRequest)?,
            ),
            None => None,
        };
        let signal = DecryptionFailedSignal::v1(event_id, membership, error)
            .map_err(AdapterError::InvalidRequest)?;
        let ack = self.handle.report_unable_to_decrypt(signal).await?;
        Ok(AdapterResponse::from_ack(ack))
    }

    pub async fn run_event_decrypted(
        &self,
        request: EventDecryptedAdapterRequest,
    ) -> Result<AdapterResponse, AdapterError> {
        let event_id = EventId::new(request.event_id).map_err(AdapterError::InvalidRequest)?;
        let ack = self.handle.event_decrypted(event_id).await?;
        Ok(AdapterResponse::from_ack(ack))
    }

    pub async fn flush(&self) -> Result<AdapterResponse, AdapterError> {
        let ack = self.handle.dispatch().await?;
        Ok(AdapterResponse::from_ack(ack))
    }

    pub async fn health_report(&self) -> Result<AdapterHealthResponse, AdapterError> {
        let snapshot = self.handle.snapshot().await?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            reason: None,
            tracker: AdapterTrackerHealth {
                pending: snapshot.pending,
                tracked: snapshot.tracked,
                sweep_timer_running: snapshot.sweep_timer_running,
                analytics_attached: snapshot.analytics_attached,
                sweep_ticks: snapshot.sweep_ticks,
                tracking_enabled: self.handle.tracking_enabled(),
            },
        })
    }
}
