pub mod http;
pub mod pool;
pub mod ssh;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpAuth, HttpConfig, HttpTransport};
pub use pool::{ConnectionPool, PoolConfig, PoolMetricsSnapshot};
pub use ssh::{SshAuth, SshConfig, SshTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionFailed,
    Timeout,
    Auth,
    CommandFailed,
    FileNotFound,
    PermissionDenied,
    InvalidTarget,
    NotConnected,
    PoolExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Auth => "auth",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::FileNotFound => "file_not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::InvalidTarget => "invalid_target",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::PoolExhausted => "pool_exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<i32>,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(kind: ErrorKind, message: impl Into<String>, code: i32) -> Self {
        Self {
            kind,
            message: message.into(),
            code: Some(code),
        }
    }

    /// Only connection failures and timeouts are worth retrying; everything
    /// else reflects a condition a retry will not fix.
    pub fn retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::ConnectionFailed | ErrorKind::Timeout)
    }
}

mod duration_string {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::config::{format_duration, parse_duration};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.map(|s| parse_duration(&s)))
    }
}

/// A command to run on a remote node. This is also the wire payload POSTed
/// to `/api/v1/execute` by the HTTP transport; `timeout` travels as a
/// duration string (`30s`, `5m`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, with = "duration_string", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub capture_output: bool,
}

impl Command {
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            cmd: vec!["sh".into(), "-c".into(), command.into()],
            capture_output: true,
            ..Default::default()
        }
    }

    /// Render the command line actually sent to the remote shell: working
    /// directory becomes a `cd` prefix, env vars become inline assignments.
    pub fn render(&self) -> String {
        let mut line = String::new();
        if let Some(env) = &self.env {
            let mut keys: Vec<&String> = env.keys().collect();
            keys.sort();
            for key in keys {
                line.push_str(&format!("{}='{}' ", key, env[key].replace('\'', "'\\''")));
            }
        }
        line.push_str(&self.cmd.join(" "));
        match &self.working_dir {
            Some(dir) => format!("cd {dir} && {line}"),
            None => line,
        }
    }
}

/// Outcome of a remote command. Exit codes are surfaced verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportInfo {
    pub protocol: &'static str,
    pub target: String,
    pub connected: bool,
}

/// Protocol-agnostic remote-execution primitive. Implementations use
/// interior mutability so a connection can be shared behind `Arc`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: &str) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    async fn execute(&self, command: &Command) -> Result<ExecResult, TransportError>;
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), TransportError>;
    async fn download(&self, remote: &str, local: &Path) -> Result<(), TransportError>;
    fn info(&self) -> TransportInfo;
}
