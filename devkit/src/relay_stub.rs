/*!
Mock notification relay for development without a mail setup

Listens on a real loopback TCP port and records every frame a client
writes, so notifier code can be tested end to end without `dfstat-relay`
or a mail command.
*/

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A frame as received by the mock, split when it is well formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub raw: String,
    pub destination: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
}

impl RelayFrame {
    fn from_raw(raw: String) -> Self {
        let inner = raw
            .strip_prefix('$')
            .and_then(|s| s.strip_suffix('$'))
            .map(|s| s.split('#').map(str::to_string).collect::<Vec<_>>());

        match inner.as_deref() {
            Some([destination, subject]) => Self {
                destination: Some(destination.clone()),
                subject: Some(subject.clone()),
                body: None,
                raw,
            },
            Some([destination, subject, body]) => Self {
                destination: Some(destination.clone()),
                subject: Some(subject.clone()),
                body: Some(body.clone()),
                raw,
            },
            _ => Self {
                raw,
                destination: None,
                subject: None,
                body: None,
            },
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.destination.is_some()
    }
}

/// Loopback relay that records frames instead of mailing them.
pub struct MockRelay {
    addr: SocketAddr,
    frames: Arc<Mutex<Vec<RelayFrame>>>,
    accept_task: JoinHandle<()>,
}

impl MockRelay {
    /// Bind on an ephemeral loopback port and start accepting.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let frames = Arc::new(Mutex::new(Vec::new()));

        let sink = frames.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, peer)) = listener.accept().await else {
                    break;
                };
                let sink = sink.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    if let Err(e) = socket.read_to_end(&mut buf).await {
                        log::warn!("[MOCK relay] read error from {}: {}", peer, e);
                        return;
                    }
                    let raw = String::from_utf8_lossy(&buf).into_owned();
                    log::info!("[MOCK relay] frame from {}: {} bytes", peer, raw.len());
                    sink.lock().unwrap().push(RelayFrame::from_raw(raw));
                });
            }
        });

        log::info!("[MOCK relay] listening on {}", addr);
        Ok(Self {
            addr,
            frames,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Every frame received so far.
    pub fn frames(&self) -> Vec<RelayFrame> {
        self.frames.lock().unwrap().clone()
    }

    /// Frames addressed to one destination.
    pub fn frames_for(&self, destination: &str) -> Vec<RelayFrame> {
        self.frames()
            .into_iter()
            .filter(|f| f.destination.as_deref() == Some(destination))
            .collect()
    }

    /// Poll until at least `count` frames arrived or the timeout expires.
    pub async fn wait_for_frames(&self, count: usize, timeout_ms: u64) -> Vec<RelayFrame> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let frames = self.frames();
            if frames.len() >= count || tokio::time::Instant::now() >= deadline {
                if frames.len() < count {
                    log::warn!("[MOCK relay] timeout: {} of {} frames", frames.len(), count);
                }
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn send(addr: SocketAddr, payload: &str) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_relay_records_frames() {
        let relay = MockRelay::start().await.unwrap();

        send(relay.addr(), "$ops@example.org#Check /home on alpha$").await;
        send(relay.addr(), "$ops@example.org#subject#some body$").await;

        let frames = relay.wait_for_frames(2, 2000).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(relay.frames_for("ops@example.org").len(), 2);
        assert!(frames.iter().any(|f| f.body.as_deref() == Some("some body")));

        relay.clear();
        assert!(relay.frames().is_empty());
        send(relay.addr(), "$dev@example.org#after clear$").await;
        let frames = relay.wait_for_frames(1, 2000).await;
        assert_eq!(frames.len(), 1);
        assert!(relay.frames_for("ops@example.org").is_empty());
    }

    #[test]
    fn test_malformed_frame_is_kept_raw() {
        let frame = RelayFrame::from_raw("no delimiters".to_string());
        assert!(!frame.is_well_formed());
        assert_eq!(frame.raw, "no delimiters");

        let frame = RelayFrame::from_raw("$a#b#c#d$".to_string());
        assert!(!frame.is_well_formed());
    }
}
