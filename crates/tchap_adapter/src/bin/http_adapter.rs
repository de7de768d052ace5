#![forbid(unsafe_code)]

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tchap_adapter::{
    AdapterConfig, AdapterError, AdapterHealthResponse, AdapterResponse, AdapterRuntime,
    AdapterTrackerHealth, DecryptionFailedAdapterRequest, EventDecryptedAdapterRequest,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AdapterConfig::from_env()?;
    let shutdown = CancellationToken::new();
    let (runtime, tracker_task) = AdapterRuntime::start(&config, shutdown.clone())?;

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/utd/failed", post(run_decryption_failed))
        .route("/v1/utd/decrypted", post(run_event_decrypted))
        .route("/v1/utd/dispatch", post(run_dispatch))
        .with_state(runtime.clone());

    info!(
        bind = %config.bind,
        tracking_enabled = config.tracking_enabled,
        analytics_path = ?config.analytics_path,
        "tchap_utd_http listening"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let runtime_for_flush = runtime.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Report anything already past the max wait before the tracker stops.
            if let Err(err) = runtime_for_flush.flush().await {
                warn!(error = %err, "final utd flush failed");
            }
        })
        .await?;

    shutdown.cancel();
    let last = tracker_task.await?;
    info!(
        pending = last.pending,
        tracked = last.tracked,
        "tchap_utd_http stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "signal received"),
        _ = terminate => info!(signal = "SIGTERM", "signal received"),
    }
}

async fn healthz(
    State(runtime): State<AdapterRuntime>,
) -> (StatusCode, Json<AdapterHealthResponse>) {
    match runtime.health_report().await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: Some(err.to_string()),
                tracker: AdapterTrackerHealth::default(),
            }),
        ),
    }
}

async fn run_decryption_failed(
    State(runtime): State<AdapterRuntime>,
    Json(request): Json<DecryptionFailedAdapterRequest>,
) -> (StatusCode, Json<AdapterResponse>) {
    respond(runtime.run_decryption_failed(request).await)
}

async fn run_event_decrypted(
    State(runtime): State<AdapterRuntime>,
    Json(request): Json<EventDecryptedAdapterRequest>,
) -> (StatusCode, Json<AdapterResponse>) {
    respond(runtime.run_event_decrypted(request).await)
}

async fn run_dispatch(State(runtime): State<AdapterRuntime>) -> (StatusCode, Json<AdapterResponse>) {
    respond(runtime.flush().await)
}

fn respond(result: Result<AdapterResponse, AdapterError>) -> (StatusCode, Json<AdapterResponse>) {
    match result {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err @ AdapterError::InvalidRequest(_)) => (
            StatusCode::BAD_REQUEST,
            Json(AdapterResponse::rejected(err.to_string())),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(AdapterResponse::rejected(err.to_string())),
        ),
    }
}
