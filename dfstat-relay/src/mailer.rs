//! Delivery of decoded frames.
//!
//! `CommandMailer` runs the configured mail command directly (no shell):
//! the template is split into argv once, `{subject}` and `{destination}`
//! are substituted per word, and the body goes to stdin.

use crate::config::ConfigError;
use crate::frame::Frame;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("mail command i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("mail command still running after {0:?}")]
    Timeout(Duration),
    #[error("mail command exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, frame: &Frame) -> Result<(), MailError>;
}

#[derive(Debug, Clone)]
pub struct CommandMailer {
    template: Vec<String>,
    timeout: Duration,
}

impl CommandMailer {
    pub fn new(template: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let template = shell_words::split(template).map_err(|e| ConfigError::Invalid(format!("mail_command: {e}")))?;
        if template.is_empty() {
            return Err(ConfigError::Invalid("mail_command is empty".into()));
        }
        Ok(Self { template, timeout })
    }

    pub fn argv(&self, frame: &Frame) -> Vec<String> {
        self.template
            .iter()
            .map(|word| {
                word.replace("{subject}", &frame.subject)
                    .replace("{destination}", &frame.destination)
            })
            .collect()
    }

    async fn run(&self, argv: &[String], body: &[u8]) -> Result<(), MailError> {
        let (program, args) = argv.split_first().ok_or_else(|| MailError::Failed {
            code: None,
            stderr: "empty command".into(),
        })?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MailError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(MailError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl Mailer for CommandMailer {
    async fn send(&self, frame: &Frame) -> Result<(), MailError> {
        let argv = self.argv(frame);
        let body = frame.body.as_deref().unwrap_or_default().as_bytes();
        tokio::time::timeout(self.timeout, self.run(&argv, body))
            .await
            .map_err(|_| MailError::Timeout(self.timeout))?
    }
}
