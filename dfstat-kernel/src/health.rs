/**
 * HOST HEALTH - consecutive-failure accrual with alert backoff
 *
 * ROLE : decide when an unreachable host deserves a notification.
 * A record exists only while the host has unresolved failures; the first
 * success ends the episode and drops it.
 *
 * Escalation: nothing below `threshold`, one alert when it is reached,
 * then at most one more every `repeat_interval` until the host recovers.
 */

use crate::error::StorageError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostHealthRecord {
    pub host: String,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub first_failure_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_failure_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_alert_sent_at: Option<OffsetDateTime>,
    pub last_error_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub threshold: u32,
    pub repeat_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    /// Failure counted, threshold not reached yet.
    BelowThreshold,
    /// Over threshold but an alert went out less than `repeat_interval` ago.
    Suppressed,
    /// Send an alert; carries the record as of now.
    Notify(HostHealthRecord),
}

#[derive(Clone)]
pub struct HostHealthTracker {
    policy: Arc<Mutex<EscalationPolicy>>,
    records: Arc<Mutex<HashMap<String, HostHealthRecord>>>,
}

impl HostHealthTracker {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self {
            policy: Arc::new(Mutex::new(policy)),
            records: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Swap thresholds after a reload; open episodes keep their counters.
    pub fn set_policy(&self, policy: EscalationPolicy) {
        *self.policy.lock() = policy;
    }

    pub fn policy(&self) -> EscalationPolicy {
        *self.policy.lock()
    }

    pub fn on_failure(&self, host: &str, error_code: i32) -> Escalation {
        self.on_failure_at(host, error_code, OffsetDateTime::now_utc())
    }

    pub fn on_failure_at(&self, host: &str, error_code: i32, now: OffsetDateTime) -> Escalation {
        let policy = self.policy();
        let mut records = self.records.lock();
        let record = records.entry(host.to_string()).or_insert_with(|| HostHealthRecord {
            host: host.to_string(),
            consecutive_failures: 0,
            first_failure_at: now,
            last_failure_at: now,
            last_alert_sent_at: None,
            last_error_code: error_code,
        });

        record.consecutive_failures += 1;
        record.last_failure_at = now;
        record.last_error_code = error_code;

        if record.consecutive_failures < policy.threshold {
            return Escalation::BelowThreshold;
        }

        let due = match record.last_alert_sent_at {
            None => true,
            Some(sent) => now - sent > policy.repeat_interval,
        };
        if !due {
            return Escalation::Suppressed;
        }

        record.last_alert_sent_at = Some(now);
        Escalation::Notify(record.clone())
    }

    /// End the host's failure episode. Returns the closed record, if any.
    pub fn on_success(&self, host: &str) -> Option<HostHealthRecord> {
        self.records.lock().remove(host)
    }

    #[cfg(test)]
    pub fn get(&self, host: &str) -> Option<HostHealthRecord> {
        self.records.lock().get(host).cloned()
    }

    /// Records sorted by host name.
    pub fn snapshot(&self) -> Vec<HostHealthRecord> {
        let mut out: Vec<_> = self.records.lock().values().cloned().collect();
        out.sort_by(|a, b| a.host.cmp(&b.host));
        out
    }

    pub fn restore(&self, records: Vec<HostHealthRecord>) {
        let mut map = self.records.lock();
        map.clear();
        for record in records {
            map.insert(record.host.clone(), record);
        }
    }

    pub async fn save_to(&self, path: &Path) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), "host health saved");
        Ok(())
    }

    /// Load a snapshot; a missing or unreadable file starts with no episodes.
    pub async fn load_from(&self, path: &Path) {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read host health state");
                return;
            }
        };
        match serde_json::from_str::<Vec<HostHealthRecord>>(&content) {
            Ok(records) => {
                info!(count = records.len(), "host health restored");
                self.restore(records);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "ignoring corrupt host health state"),
        }
    }
}
