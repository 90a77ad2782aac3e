/**
 * STATUS API - read-only HTTP view of the daemon
 *
 * ROLE : lets operators inspect what the loop sees without reading the
 * SQLite file: scheduler state, targets, host-health episodes, recent
 * measurements and failure audit rows.
 *
 * SECURITY :
 * - x-api-key header required on every route except /health
 * - key from DFSTAT_API_KEY; when unset every protected route answers 401
 */

use crate::error::StorageError;
use crate::health::{HostHealthRecord, HostHealthTracker};
use crate::models::{pair_count, FailureRecord, Measurement, Targets};
use crate::state::{CycleSummary, DaemonStatus, SchedulerState, Shared};
use crate::store::MeasurementStore;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const API_KEY_ENV: &str = "DFSTAT_API_KEY";
const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MeasurementStore>,
    pub tracker: HostHealthTracker,
    pub status: Shared<DaemonStatus>,
    pub api_key: Option<String>,
}

fn key_matches(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) => !expected.is_empty() && expected == provided,
        _ => false,
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    if app.api_key.as_deref().map_or(true, str::is_empty) {
        warn!("{} not set, status API access denied", API_KEY_ENV);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !key_matches(app.api_key.as_deref(), provided) {
        warn!(path = %req.uri().path(), "rejected request with bad api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(get_status))
        .route("/targets", get(get_targets))
        .route("/hosts/health", get(get_host_health))
        .route("/measurements", get(get_measurements))
        .route("/errors", get(get_errors))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

/// Serve the status API until `shutdown` fires.
pub async fn serve(addr: SocketAddr, app_state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind status API on {addr}"))?;
    info!(%addr, "status API listening");
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("status API server failed")
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub state: SchedulerState,
    pub uptime_seconds: i64,
    pub cycles: u64,
    pub reloads: u64,
    pub hosts: usize,
    pub partitions: usize,
    pub failing_hosts: Vec<String>,
    pub last_cycle: Option<CycleSummary>,
}

fn internal(e: StorageError) -> StatusCode {
    error!(error = %e, "status API query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

// GET /status
async fn get_status(State(app): State<AppState>) -> Result<Json<StatusView>, StatusCode> {
    let status = app.status.lock().clone();
    let targets = app.store.targets().map_err(internal)?;
    Ok(Json(StatusView {
        state: status.state,
        uptime_seconds: status.uptime_seconds(),
        cycles: status.cycles,
        reloads: status.reloads,
        hosts: targets.len(),
        partitions: pair_count(&targets),
        failing_hosts: app.tracker.snapshot().into_iter().map(|r| r.host).collect(),
        last_cycle: status.last_cycle,
    }))
}

// GET /targets
async fn get_targets(State(app): State<AppState>) -> Result<Json<Targets>, StatusCode> {
    app.store.targets().map(Json).map_err(internal)
}

// GET /hosts/health
async fn get_host_health(State(app): State<AppState>) -> Json<Vec<HostHealthRecord>> {
    Json(app.tracker.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct MeasurementQuery {
    pub host: String,
    pub partition: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorQuery {
    pub host: String,
    pub limit: Option<usize>,
}

fn clamp(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

// GET /measurements?host=&partition=&limit=
async fn get_measurements(
    State(app): State<AppState>,
    Query(q): Query<MeasurementQuery>,
) -> Result<Json<Vec<Measurement>>, StatusCode> {
    app.store
        .recent(&q.host, &q.partition, clamp(q.limit))
        .map(Json)
        .map_err(internal)
}

// GET /errors?host=&limit=
async fn get_errors(
    State(app): State<AppState>,
    Query(q): Query<ErrorQuery>,
) -> Result<Json<Vec<FailureRecord>>, StatusCode> {
    app.store.recent_errors(&q.host, clamp(q.limit)).map(Json).map_err(internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::EscalationPolicy;
    use crate::state::new_state;

    fn app() -> AppState {
        let store = Arc::new(MeasurementStore::open_in_memory().unwrap());
        for used in [100, 200, 300] {
            store.record("alpha", "/home", 1000, used, 1000 - used).unwrap();
        }
        store.record_error("beta", 124).unwrap();

        let tracker = HostHealthTracker::new(EscalationPolicy {
            threshold: 3,
            repeat_interval: time::Duration::hours(1),
        });
        tracker.on_failure("beta", 124);

        let mut targets = Targets::new();
        targets.insert("alpha".into(), ["/home".to_string()].into());
        targets.insert("beta".into(), ["/".to_string()].into());
        store.sync_targets(&targets).unwrap();

        AppState {
            store,
            tracker,
            status: new_state(DaemonStatus::new()),
            api_key: Some("secret".into()),
        }
    }

    #[test]
    fn test_key_matching() {
        assert!(key_matches(Some("secret"), Some("secret")));
        assert!(!key_matches(Some("secret"), Some("guess")));
        assert!(!key_matches(Some("secret"), None));
        assert!(!key_matches(None, Some("secret")));
        assert!(!key_matches(Some(""), Some("")));
    }

    #[tokio::test]
    async fn test_status_view() {
        let Json(view) = get_status(State(app())).await.unwrap();
        assert_eq!(view.state, SchedulerState::Starting);
        assert_eq!(view.hosts, 2);
        assert_eq!(view.partitions, 2);
        assert_eq!(view.failing_hosts, vec!["beta"]);
        assert!(view.last_cycle.is_none());
    }

    #[tokio::test]
    async fn test_measurements_are_limited_and_ordered() {
        let Json(rows) = get_measurements(
            State(app()),
            Query(MeasurementQuery {
                host: "alpha".into(),
                partition: "/home".into(),
                limit: Some(2),
            }),
        )
        .await
        .unwrap();
        assert_eq!(rows.iter().map(|m| m.used).collect::<Vec<_>>(), vec![200, 300]);
    }

    #[tokio::test]
    async fn test_errors_and_health_routes() {
        let app = app();
        let Json(errors) = get_errors(
            State(app.clone()),
            Query(ErrorQuery {
                host: "beta".into(),
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_code, 124);

        let Json(health) = get_host_health(State(app.clone())).await;
        assert_eq!(health[0].consecutive_failures, 1);

        let Json(targets) = get_targets(State(app)).await.unwrap();
        assert!(targets["beta"].contains("/"));
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(clamp(None), DEFAULT_LIMIT);
        assert_eq!(clamp(Some(5)), 5);
        assert_eq!(clamp(Some(1_000_000)), MAX_LIMIT);
    }
}
