/**
 * DFSTAT RELAY - turns `$destination#subject[#body]$` frames into mail
 *
 * ROLE : standalone TCP service. Each connection carries one frame; the
 * configured mail command delivers it.
 *
 * EXIT : 0 after SIGTERM/SIGINT, 78 bad configuration, 69 cannot listen.
 */

mod config;
mod frame;
mod mailer;
mod server;

use crate::config::RelaySettings;
use crate::mailer::CommandMailer;
use crate::server::ConnectionLimits;

use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 78;
const EXIT_UNAVAILABLE: u8 = 69;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dfstat_relay=info")))
        .init();

    let path = RelaySettings::default_path();
    let settings = match RelaySettings::load(&path) {
        Ok(settings) => settings,
        Err(e) => {
            error!(path = %path.display(), error = %e, "unusable relay configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let mailer = match CommandMailer::new(&settings.mail_command, settings.mail_timeout()) {
        Ok(mailer) => mailer,
        Err(e) => {
            error!(error = %e, "unusable mail command");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let listener = match TcpListener::bind(settings.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(bind = %settings.bind, error = %e, "cannot listen");
            return ExitCode::from(EXIT_UNAVAILABLE);
        }
    };

    let limits = ConnectionLimits {
        max_frame_bytes: settings.max_frame_bytes,
        read_timeout: settings.read_timeout(),
    };
    server::serve(listener, Arc::new(mailer), limits, shutdown_signal()).await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut term), Ok(mut int)) => {
            tokio::select! {
                _ = term.recv() => info!("SIGTERM received"),
                _ = int.recv() => info!("SIGINT received"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "signal handlers unavailable, falling back to ctrl-c");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot wait for ctrl-c");
        std::future::pending::<()>().await;
    }
}
