/**
 * ERRORS - dfstat kernel error taxonomy
 *
 * ROLE : one enum per failure family, so every caller knows from the type
 * alone whether the loop keeps going (transport, parse, notification) or
 * the daemon stops (storage, config at startup).
 */

use std::path::PathBuf;
use std::time::Duration;

/// Exit status when configuration or inventory is unusable at startup (EX_CONFIG).
pub const EXIT_CONFIG: u8 = 78;
/// Exit status when the measurement store fails (EX_IOERR).
pub const EXIT_STORAGE: u8 = 74;
/// Exit status when signal handlers cannot be installed (EX_OSERR).
pub const EXIT_OS: u8 = 71;

/// Exit code recorded when the remote command outlives its timeout.
pub const CODE_TIMEOUT: i32 = 124;
/// Exit code recorded when the local remote-shell client cannot be started.
pub const CODE_SPAWN: i32 = 127;
/// Exit code recorded when the remote-shell client dies from a signal.
pub const CODE_SIGNALED: i32 = -1;

/// Remote execution failed; recorded and fed to host health, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot start remote shell for {host}: {source}")]
    Spawn {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("remote command on {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
    #[error("remote command on {host} exited with status {code}: {stderr}")]
    NonZeroExit {
        host: String,
        code: i32,
        stderr: String,
    },
    #[error("remote shell for {host} was killed by a signal")]
    Signaled { host: String },
}

impl TransportError {
    /// Value stored in the `error_code` column of the audit row.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Spawn { .. } => CODE_SPAWN,
            TransportError::Timeout { .. } => CODE_TIMEOUT,
            TransportError::NonZeroExit { code, .. } => *code,
            TransportError::Signaled { .. } => CODE_SIGNALED,
        }
    }
}

/// One `df -P` line could not be read; the line is skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected 6 fields, found {found} in {line:?}")]
    FieldCount { found: usize, line: String },
    #[error("invalid {field} value {value:?}")]
    Number { field: &'static str, value: String },
}

/// The persistent store is unusable; fatal to the daemon.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Configuration or inventory unreadable or invalid.
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

/// Alert could not be handed to the relay; logged, never retried.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("cannot connect to relay {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write frame to relay: {0}")]
    Write(#[source] std::io::Error),
    #[error("relay did not accept the frame within {0:?}")]
    Timeout(Duration),
}

/// Errors that end the daemon, with the process status they map to.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

impl DaemonError {
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Config(_) => EXIT_CONFIG,
            DaemonError::Storage(_) => EXIT_STORAGE,
            DaemonError::Signals(_) => EXIT_OS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_codes() {
        let timeout = TransportError::Timeout {
            host: "alpha".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.code(), CODE_TIMEOUT);

        let exit = TransportError::NonZeroExit {
            host: "alpha".into(),
            code: 255,
            stderr: "Permission denied".into(),
        };
        assert_eq!(exit.code(), 255);
        assert!(exit.to_string().contains("Permission denied"));
    }

    #[test]
    fn test_daemon_exit_codes_are_distinct() {
        let config: DaemonError = ConfigError::Invalid("window_size".into()).into();
        let storage: DaemonError = StorageError::Corrupt("row".into()).into();
        assert_eq!(config.exit_code(), EXIT_CONFIG);
        assert_eq!(storage.exit_code(), EXIT_STORAGE);
        assert_ne!(config.exit_code(), 0);
    }
}
