//! OS signals to scheduler control messages.
//!
//! SIGUSR1 polls now, SIGHUP reloads, SIGTERM/SIGINT/SIGQUIT shut down.
//! Shutdown also cancels the token so an in-flight cycle starts its grace
//! period right away. Every other signal keeps its default disposition.

use crate::scheduler::Control;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
pub fn control_for(kind: tokio::signal::unix::SignalKind) -> Option<Control> {
    use tokio::signal::unix::SignalKind;

    if kind == SignalKind::user_defined1() {
        Some(Control::PollNow)
    } else if kind == SignalKind::hangup() {
        Some(Control::Reload)
    } else if kind == SignalKind::terminate() || kind == SignalKind::interrupt() || kind == SignalKind::quit() {
        Some(Control::Shutdown)
    } else {
        None
    }
}

async fn forward(control: &mpsc::Sender<Control>, shutdown: &CancellationToken, msg: Control) -> bool {
    info!(?msg, "signal received");
    if msg == Control::Shutdown {
        shutdown.cancel();
    }
    if control.send(msg).await.is_err() {
        warn!("scheduler gone, signal listener stopping");
        return false;
    }
    msg != Control::Shutdown
}

#[cfg(unix)]
pub fn spawn_listener(control: mpsc::Sender<Control>, shutdown: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            let kind = tokio::select! {
                _ = usr1.recv() => SignalKind::user_defined1(),
                _ = hup.recv() => SignalKind::hangup(),
                _ = term.recv() => SignalKind::terminate(),
                _ = int.recv() => SignalKind::interrupt(),
                _ = quit.recv() => SignalKind::quit(),
            };
            let Some(msg) = control_for(kind) else { continue };
            if !forward(&control, &shutdown, msg).await {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_listener(control: mpsc::Sender<Control>, shutdown: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            forward(&control, &shutdown, Control::Shutdown).await;
        }
    }))
}
