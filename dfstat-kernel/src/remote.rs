/**
 * REMOTE EXEC - run the disk report on a fleet host
 *
 * ROLE : `RemoteExec` is the seam between the collector and the network.
 * `SshExec` spawns the configured remote-shell client as
 * `<remote_shell...> <host> <command>`; the child is killed when the future
 * is dropped, so the caller's timeout also reaps the process.
 */

use crate::error::{ConfigError, TransportError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// `Err` only when the command could not be run at all; a remote
    /// non-zero exit is an `Ok` with that code.
    async fn exec(&self, host: &str, command: &str) -> Result<ExecOutput, TransportError>;
}

#[derive(Debug, Clone)]
pub struct SshExec {
    program: String,
    args: Vec<String>,
}

impl SshExec {
    /// Build from a shell-style client line such as `ssh -o BatchMode=yes`.
    pub fn from_shell_line(remote_shell: &str) -> Result<Self, ConfigError> {
        let mut argv = shell_words::split(remote_shell)
            .map_err(|e| ConfigError::Invalid(format!("poll.remote_shell: {e}")))?;
        if argv.is_empty() {
            return Err(ConfigError::Invalid("poll.remote_shell is empty".into()));
        }
        let program = argv.remove(0);
        Ok(Self { program, args: argv })
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn exec(&self, host: &str, command: &str) -> Result<ExecOutput, TransportError> {
        debug!(%host, program = %self.program, "spawning remote shell");
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(host)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TransportError::Spawn {
                host: host.to_string(),
                source,
            })?;

        let Some(exit_code) = output.status.code() else {
            return Err(TransportError::Signaled { host: host.to_string() });
        };

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A "remote shell" that drops the host argument and evals the command locally.
    fn local_shell() -> SshExec {
        SshExec::from_shell_line(r#"sh -c 'shift; eval "$1"' sh"#).unwrap()
    }

    #[tokio::test]
    async fn test_exec_captures_stdout() {
        let out = local_shell().exec("alpha", "echo hello; echo world").await.unwrap();
        assert!(out.ok());
        assert_eq!(out.stdout, "hello\nworld\n");
    }

    #[tokio::test]
    async fn test_remote_non_zero_exit_is_reported() {
        let out = local_shell().exec("alpha", "echo denied >&2; exit 255").await.unwrap();
        assert!(!out.ok());
        assert_eq!(out.exit_code, 255);
        assert_eq!(out.stderr.trim(), "denied");
    }

    #[tokio::test]
    async fn test_missing_client_is_spawn_error() {
        let exec = SshExec::from_shell_line("/nonexistent/dfstat-ssh -q").unwrap();
        let err = exec.exec("alpha", "df -P").await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
        assert_eq!(err.code(), crate::error::CODE_SPAWN);
    }

    #[tokio::test]
    async fn test_signal_death_is_reported() {
        let err = local_shell().exec("alpha", "kill -9 $$").await.unwrap_err();
        assert!(matches!(err, TransportError::Signaled { .. }));
    }

    #[test]
    fn test_shell_line_validation() {
        assert!(SshExec::from_shell_line("").is_err());
        assert!(SshExec::from_shell_line("ssh 'unterminated").is_err());
        let exec = SshExec::from_shell_line("ssh -o BatchMode=yes -o ConnectTimeout=10").unwrap();
        assert_eq!(exec.program, "ssh");
        assert_eq!(exec.args.len(), 4);
    }
}
