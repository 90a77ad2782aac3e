use crate::error::ConfigError;
use crate::health::EscalationPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "DFSTAT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "dfstat.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub store: StoreSettings,
    pub poll: PollSettings,
    pub analysis: AnalysisSettings,
    pub alerts: AlertSettings,
    pub inventory: InventorySettings,
    pub http: HttpSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub retention_hours: u64,
    /// JSON snapshot of host-health records kept across restarts.
    pub health_state_path: Option<PathBuf>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dfstat.db"),
            retention_hours: 24,
            health_state_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub remote_timeout_secs: u64,
    pub max_concurrent_hosts: usize,
    pub shutdown_grace_secs: u64,
    pub remote_shell: String,
    pub command: String,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            remote_timeout_secs: 30,
            max_concurrent_hosts: 8,
            shutdown_grace_secs: 10,
            remote_shell: "ssh -o BatchMode=yes -o ConnectTimeout=10".into(),
            command: "df -P".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisSettings {
    pub window_size: usize,
    pub min_points: usize,
    pub drop_threshold: f64,
    pub confirm_stationarity: bool,
    pub occupancy_check: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            window_size: 5,
            min_points: 5,
            drop_threshold: 0.5,
            confirm_stationarity: false,
            occupancy_check: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertSettings {
    pub recipients: Vec<String>,
    pub failure_threshold: u32,
    pub repeat_interval_secs: u64,
    pub relay_addr: String,
    pub relay_timeout_secs: u64,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            recipients: Vec::new(),
            failure_threshold: 3,
            repeat_interval_secs: 3600,
            relay_addr: "127.0.0.1:33333".into(),
            relay_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InventorySettings {
    pub path: PathBuf,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hosts.toml"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    /// Status API listen address; the API is off when unset.
    pub bind: Option<SocketAddr>,
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Ten years of history.
pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;

impl StoreSettings {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

impl AlertSettings {
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            threshold: self.failure_threshold,
            repeat_interval: time::Duration::seconds(self.repeat_interval_secs as i64),
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

impl Settings {
    /// Path from `DFSTAT_CONFIG`, else `dfstat.toml` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml(&text).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;

        // relative paths are taken from the config file's directory
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Ok(settings.rebased(base))
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn rebased(mut self, base: &Path) -> Self {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        rebase(&mut self.store.path);
        rebase(&mut self.inventory.path);
        if let Some(p) = self.store.health_state_path.as_mut() {
            rebase(p);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let poll = &self.poll;
        if poll.interval_secs == 0 {
            return Err(invalid("poll.interval_secs must be > 0"));
        }
        if poll.remote_timeout_secs == 0 {
            return Err(invalid("poll.remote_timeout_secs must be > 0"));
        }
        if poll.max_concurrent_hosts == 0 {
            return Err(invalid("poll.max_concurrent_hosts must be > 0"));
        }
        if poll.command.trim().is_empty() {
            return Err(invalid("poll.command is empty"));
        }
        match shell_words::split(&poll.remote_shell) {
            Ok(argv) if !argv.is_empty() => {}
            Ok(_) => return Err(invalid("poll.remote_shell is empty")),
            Err(e) => return Err(invalid(format!("poll.remote_shell: {e}"))),
        }

        let analysis = &self.analysis;
        if analysis.window_size < 2 {
            return Err(invalid("analysis.window_size must be >= 2"));
        }
        if analysis.min_points < 2 || analysis.min_points > analysis.window_size {
            return Err(invalid(format!(
                "analysis.min_points must be between 2 and window_size ({})",
                analysis.window_size
            )));
        }
        if !(analysis.drop_threshold > 0.0 && analysis.drop_threshold < 1.0) {
            return Err(invalid("analysis.drop_threshold must be in (0, 1)"));
        }

        if self.alerts.failure_threshold == 0 {
            return Err(invalid("alerts.failure_threshold must be >= 1"));
        }
        if self.alerts.relay_addr.trim().is_empty() {
            return Err(invalid("alerts.relay_addr is empty"));
        }
        if self.alerts.recipients.iter().any(|r| r.contains(['$', '#']) || r.trim().is_empty()) {
            return Err(invalid("alerts.recipients entries must be non-empty and free of '$' and '#'"));
        }
        if self.store.retention_hours == 0 || self.store.retention_hours > MAX_RETENTION_HOURS {
            return Err(invalid(format!(
                "store.retention_hours must be between 1 and {MAX_RETENTION_HOURS}"
            )));
        }
        Ok(())
    }
}
