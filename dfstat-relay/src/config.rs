use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const CONFIG_ENV: &str = "DFSTAT_RELAY_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySettings {
    pub bind: SocketAddr,
    /// argv template; `{subject}` and `{destination}` are substituted per word.
    pub mail_command: String,
    pub max_frame_bytes: usize,
    pub read_timeout_secs: u64,
    pub mail_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 33333)),
            mail_command: "mailx -s {subject} {destination}".into(),
            max_frame_bytes: 65536,
            read_timeout_secs: 10,
            mail_timeout_secs: 30,
        }
    }
}

impl RelaySettings {
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("dfstat-relay.toml"))
    }

    /// A missing file means defaults; an unreadable or invalid one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no relay config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let settings: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let argv = shell_words::split(&self.mail_command)
            .map_err(|e| ConfigError::Invalid(format!("mail_command: {e}")))?;
        if argv.is_empty() {
            return Err(ConfigError::Invalid("mail_command is empty".into()));
        }
        if !argv.iter().any(|w| w.contains("{destination}")) {
            return Err(ConfigError::Invalid("mail_command must reference {destination}".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be > 0".into()));
        }
        if self.read_timeout_secs == 0 || self.mail_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".into()));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn mail_timeout(&self) -> Duration {
        Duration::from_secs(self.mail_timeout_secs)
    }
}
