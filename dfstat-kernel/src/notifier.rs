/**
 * NOTIFIER - hands alerts to the dfstat-relay service
 *
 * ROLE : `Notifier` is the outbound seam; `RelayNotifier` writes one
 * `$destination#subject#body$` frame per TCP connection.
 * `AlertDispatcher` fans a message out to every recipient in detached,
 * tracked tasks so the scheduler never waits on the relay and shutdown
 * can still drain what is in flight.
 */

use crate::error::NotificationError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotificationError>;
}

/// Frame delimiters cannot be escaped, so they are dropped from the fields.
fn clean(field: &str) -> String {
    field.chars().filter(|c| *c != '$' && *c != '#').collect()
}

pub fn encode_frame(destination: &str, subject: &str, body: &str) -> String {
    if body.is_empty() {
        format!("${}#{}$", clean(destination), clean(subject))
    } else {
        format!("${}#{}#{}$", clean(destination), clean(subject), clean(body))
    }
}

#[derive(Debug, Clone)]
pub struct RelayNotifier {
    addr: String,
    timeout: Duration,
}

impl RelayNotifier {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }

    async fn deliver(&self, frame: &str) -> Result<(), NotificationError> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| NotificationError::Connect {
                addr: self.addr.clone(),
                source,
            })?;
        stream.write_all(frame.as_bytes()).await.map_err(NotificationError::Write)?;
        stream.shutdown().await.map_err(NotificationError::Write)?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send_alert(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotificationError> {
        let frame = encode_frame(recipient, subject, body);
        tokio::time::timeout(self.timeout, self.deliver(&frame))
            .await
            .map_err(|_| NotificationError::Timeout(self.timeout))?
    }
}

#[derive(Clone)]
pub struct AlertDispatcher {
    notifier: Arc<dyn Notifier>,
    recipients: Arc<Vec<String>>,
    tasks: TaskTracker,
}

impl AlertDispatcher {
    /// `tasks` is shared across reloads so shutdown drains every dispatcher's sends.
    pub fn new(notifier: Arc<dyn Notifier>, recipients: Vec<String>, tasks: TaskTracker) -> Self {
        Self {
            notifier,
            recipients: Arc::new(recipients),
            tasks,
        }
    }

    /// Fire and forget one alert per recipient. Returns how many sends were started.
    pub fn dispatch(&self, subject: &str, body: &str) -> usize {
        if self.recipients.is_empty() {
            warn!(%subject, "no alert recipients configured, alert only logged");
            return 0;
        }
        info!(%subject, recipients = self.recipients.len(), "dispatching alert");

        for recipient in self.recipients.iter() {
            let notifier = self.notifier.clone();
            let recipient = recipient.clone();
            let subject = subject.to_string();
            let body = body.to_string();
            self.tasks.spawn(async move {
                match notifier.send_alert(&recipient, &subject, &body).await {
                    Ok(()) => debug!(%recipient, %subject, "alert delivered to relay"),
                    Err(e) => warn!(%recipient, %subject, error = %e, "alert not delivered"),
                }
            });
        }
        self.recipients.len()
    }

    /// Wait for in-flight sends, giving up after `grace`. Returns true if all finished.
    pub async fn drain(tasks: &TaskTracker, grace: Duration) -> bool {
        tasks.close();
        let done = tokio::time::timeout(grace, tasks.wait()).await.is_ok();
        if !done {
            warn!(pending = tasks.len(), "alert sends still pending at shutdown");
        }
        done
    }

    /// Wait for everything dispatched so far, then accept new sends again.
    #[cfg(test)]
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}
