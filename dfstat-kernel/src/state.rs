use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Starting,
    Polling,
    Sleeping,
    ShuttingDown,
}

/// Outcome of one poll + analysis cycle, as exposed by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration_ms: u64,
    pub hosts_polled: usize,
    pub measurements: usize,
    pub failed_hosts: Vec<String>,
    pub trend_alerts: usize,
    pub host_alerts: usize,
    pub pruned: usize,
}

/// What the scheduler publishes for readers outside its task.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub state: SchedulerState,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub cycles: u64,
    pub reloads: u64,
    pub last_cycle: Option<CycleSummary>,
}

impl DaemonStatus {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Starting,
            started_at: OffsetDateTime::now_utc(),
            cycles: 0,
            reloads: 0,
            last_cycle: None,
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (OffsetDateTime::now_utc() - self.started_at).whole_seconds()
    }
}

impl Default for DaemonStatus {
    fn default() -> Self {
        Self::new()
    }
}
