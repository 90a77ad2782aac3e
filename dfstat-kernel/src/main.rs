/**
 * DFSTAT KERNEL - fleet disk-space monitor
 *
 * ROLE : bootstrap. Load configuration, open the measurement store, restore
 * host health, wire signals and the optional status API, then hand control
 * to the scheduler until shutdown.
 *
 * EXIT : 0 clean shutdown, 78 unusable configuration or inventory,
 * 74 storage failure, 71 signal handlers unavailable.
 */

mod analysis;
mod collector;
mod config;
mod error;
mod health;
mod http;
mod inventory;
mod models;
mod notifier;
mod parser;
mod remote;
mod scheduler;
mod signals;
mod state;
mod store;

use crate::config::Settings;
use crate::error::DaemonError;
use crate::health::HostHealthTracker;
use crate::http::{AppState, API_KEY_ENV};
use crate::scheduler::{Environment, Scheduler, SystemEnvironment};
use crate::store::MeasurementStore;

use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dfstat_kernel=info")),
        )
        .init();

    match run().await {
        Ok(()) => {
            info!("dfstat-kernel stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "dfstat-kernel stopped");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), DaemonError> {
    let config_path = Settings::default_path();
    let env = Arc::new(SystemEnvironment::new(&config_path));
    let settings = env.load_settings()?;
    info!(path = %config_path.display(), "configuration loaded");

    let store = Arc::new(MeasurementStore::open(&settings.store.path)?);
    let tracker = HostHealthTracker::new(settings.alerts.escalation_policy());
    if let Some(path) = &settings.store.health_state_path {
        tracker.load_from(path).await;
    }

    let http_bind = settings.http.bind;
    let scheduler = Scheduler::start(env, settings, store.clone(), tracker.clone())?;

    let shutdown = CancellationToken::new();
    let (control_tx, control_rx) = mpsc::channel(8);
    signals::spawn_listener(control_tx, shutdown.clone()).map_err(DaemonError::Signals)?;

    if let Some(addr) = http_bind {
        let app_state = AppState {
            store,
            tracker,
            status: scheduler.status(),
            api_key: std::env::var(API_KEY_ENV).ok(),
        };
        let token = shutdown.clone();
        tokio::spawn(async move {
            // the monitor keeps running without its status API
            if let Err(e) = http::serve(addr, app_state, token).await {
                error!(error = ?e, "status API stopped");
            }
        });
    }

    info!(pid = std::process::id(), "dfstat-kernel running");
    let outcome = scheduler.run(control_rx, shutdown.clone()).await;
    shutdown.cancel();
    outcome.map_err(DaemonError::from)
}
