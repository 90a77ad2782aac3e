/**
 * RELAY SERVER - one frame per TCP connection, handed to the mailer
 *
 * ROLE : accept loop plus per-connection task. A bad or slow connection is
 * logged and dropped; it never stops the loop.
 */

use crate::frame::{parse_frame, Frame, FrameError};
use crate::mailer::{MailError, Mailer};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_frame_bytes: usize,
    pub read_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("no EOF within {0:?}")]
    ReadTimeout(Duration),
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("delivery failed: {0}")]
    Mail(#[from] MailError),
}

/// Read until the peer closes its side, refusing anything over the limit.
pub async fn read_frame<S>(stream: &mut S, limits: ConnectionLimits) -> Result<Vec<u8>, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let cap = limits.max_frame_bytes as u64 + 1;
    tokio::time::timeout(limits.read_timeout, stream.take(cap).read_to_end(&mut buf))
        .await
        .map_err(|_| ConnectionError::ReadTimeout(limits.read_timeout))??;
    if buf.len() > limits.max_frame_bytes {
        return Err(ConnectionError::TooLarge(limits.max_frame_bytes));
    }
    Ok(buf)
}

pub async fn handle_connection<S>(
    mut stream: S,
    mailer: Arc<dyn Mailer>,
    limits: ConnectionLimits,
) -> Result<Frame, ConnectionError>
where
    S: AsyncRead + Unpin,
{
    let bytes = read_frame(&mut stream, limits).await?;
    drop(stream);
    let frame = parse_frame(&bytes)?;
    mailer.send(&frame).await?;
    Ok(frame)
}

/// Serve until `shutdown` resolves, then wait for in-flight deliveries.
pub async fn serve<F>(listener: TcpListener, mailer: Arc<dyn Mailer>, limits: ConnectionLimits, shutdown: F)
where
    F: Future<Output = ()>,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "relay listening");
    }
    tokio::pin!(shutdown);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let mailer = Arc::clone(&mailer);
                    connections.spawn(async move {
                        log_outcome(peer, handle_connection(socket, mailer, limits).await);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "connection task panicked");
                }
            }
        }
    }

    if !connections.is_empty() {
        info!(pending = connections.len(), "waiting for in-flight deliveries");
    }
    while connections.join_next().await.is_some() {}
    info!("relay stopped");
}

fn log_outcome(peer: SocketAddr, outcome: Result<Frame, ConnectionError>) {
    match outcome {
        Ok(frame) => info!(%peer, destination = %frame.destination, subject = %frame.subject, "mail sent"),
        Err(ConnectionError::Frame(FrameError::Empty)) => debug!(%peer, "no message"),
        Err(e @ ConnectionError::Mail(_)) => error!(%peer, error = %e, "mail not sent"),
        Err(e) => warn!(%peer, error = %e, "dropping connection"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<Frame>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, frame: &Frame) -> Result<(), MailError> {
            if self.fail {
                return Err(MailError::Failed {
                    code: Some(1),
                    stderr: "refused".into(),
                });
            }
            self.sent.lock().push(frame.clone());
            Ok(())
        }
    }

    fn limits() -> ConnectionLimits {
        ConnectionLimits {
            max_frame_bytes: 64,
            read_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_handle_connection_delivers() {
        let mailer = Arc::new(RecordingMailer::default());
        let frame = handle_connection(&b"$ops@example.org#beta is unreachable$"[..], mailer.clone(), limits())
            .await
            .unwrap();
        assert_eq!(frame.subject, "beta is unreachable");
        assert_eq!(mailer.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_connection_rejects() {
        let mailer = Arc::new(RecordingMailer::default());
        let err = handle_connection(&b"ops#no delimiters"[..], mailer.clone(), limits()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Frame(FrameError::MissingDelimiter)));

        let oversized = format!("$ops#{}$", "x".repeat(100));
        let err = handle_connection(oversized.as_bytes(), mailer.clone(), limits()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::TooLarge(64)));
        assert!(mailer.sent.lock().is_empty());

        let failing: Arc<dyn Mailer> = Arc::new(RecordingMailer {
            fail: true,
            ..Default::default()
        });
        let err = handle_connection(&b"$ops#subject$"[..], failing, limits()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Mail(_)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mailer = Arc::new(RecordingMailer::default());
        let err = handle_connection(server, mailer, limits()).await.unwrap_err();
        assert!(matches!(err, ConnectionError::ReadTimeout(_)));
    }

    #[tokio::test]
    async fn test_serve_keeps_going_after_bad_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, mailer.clone(), limits(), async {
            let _ = stop_rx.await;
        }));

        let frames: [&[u8]; 4] = [b"garbage", b"$ops@example.org#first$", b"", b"$ops@example.org#second#body$"];
        for frame in frames {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(frame).await.unwrap();
            stream.shutdown().await.unwrap();
        }

        for _ in 0..50 {
            if mailer.sent.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stop_tx.send(()).unwrap();
        server.await.unwrap();

        let mut subjects: Vec<String> = mailer.sent.lock().iter().map(|f| f.subject.clone()).collect();
        subjects.sort();
        assert_eq!(subjects, vec!["first", "second"]);
    }
}
