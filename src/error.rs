//! Error types for device sessions, captures and snapshot persistence.
//!
//! Every failure a Task can hit is surfaced as a [`BackupError`] whose
//! [`ErrorKind`] drives the retry decision. Details are human readable and
//! never contain decrypted secrets.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Classification of a failure, recorded on the Task for the history view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailed,
    ConnectTimeout,
    ConnectRefused,
    CommandTimeout,
    SessionTimeout,
    UnsupportedCommand,
    ProtocolError,
    StorageError,
    DeviceBusy,
    Cancelled,
    JobNotFound,
    InvalidConfig,
}

impl ErrorKind {
    /// Transient kinds consume retry budget; everything else ends the Task.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectTimeout
                | ErrorKind::ConnectRefused
                | ErrorKind::CommandTimeout
                | ErrorKind::SessionTimeout
                | ErrorKind::ProtocolError
                | ErrorKind::StorageError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::ConnectTimeout => "connect_timeout",
            ErrorKind::ConnectRefused => "connect_refused",
            ErrorKind::CommandTimeout => "command_timeout",
            ErrorKind::SessionTimeout => "session_timeout",
            ErrorKind::UnsupportedCommand => "unsupported_command",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::DeviceBusy => "device_busy",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::JobNotFound => "job_not_found",
            ErrorKind::InvalidConfig => "invalid_config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while backing up a device or running a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    /// Credentials were rejected, or could not be decrypted.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The transport could not be established within the connect timeout.
    #[error("connect timeout: {0}")]
    ConnectTimeout(String),

    /// The remote end refused or reset the connection.
    #[error("connection refused: {0}")]
    ConnectRefused(String),

    /// A single command did not return to the prompt in time.
    ///
    /// Contains the partial output received before the timeout.
    #[error("command timeout: {0}")]
    CommandTimeout(String),

    /// The whole attempt exceeded the session timeout.
    #[error("session timeout: {0}")]
    SessionTimeout(String),

    /// The device rejected a command, or no driver exists for the vendor tag.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Unexpected prompt, closed channel or malformed transport data.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Snapshot persistence failed.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Another Task already holds the device lease.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// The JobRun was cancelled before this work could run.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The job definition could not be read; the run never expands.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Configuration or reference data is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::AuthFailed(_) => ErrorKind::AuthFailed,
            BackupError::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            BackupError::ConnectRefused(_) => ErrorKind::ConnectRefused,
            BackupError::CommandTimeout(_) => ErrorKind::CommandTimeout,
            BackupError::SessionTimeout(_) => ErrorKind::SessionTimeout,
            BackupError::UnsupportedCommand(_) => ErrorKind::UnsupportedCommand,
            BackupError::ProtocolError(_) => ErrorKind::ProtocolError,
            BackupError::StorageError(_) => ErrorKind::StorageError,
            BackupError::DeviceBusy(_) => ErrorKind::DeviceBusy,
            BackupError::Cancelled(_) => ErrorKind::Cancelled,
            BackupError::JobNotFound(_) => ErrorKind::JobNotFound,
            BackupError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    /// Human-readable detail without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            BackupError::AuthFailed(d)
            | BackupError::ConnectTimeout(d)
            | BackupError::ConnectRefused(d)
            | BackupError::CommandTimeout(d)
            | BackupError::SessionTimeout(d)
            | BackupError::UnsupportedCommand(d)
            | BackupError::ProtocolError(d)
            | BackupError::StorageError(d)
            | BackupError::DeviceBusy(d)
            | BackupError::Cancelled(d)
            | BackupError::JobNotFound(d)
            | BackupError::InvalidConfig(d) => d,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    /// Builds an error of the given kind. Used when replaying recorded failures.
    pub fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::AuthFailed => BackupError::AuthFailed(detail),
            ErrorKind::ConnectTimeout => BackupError::ConnectTimeout(detail),
            ErrorKind::ConnectRefused => BackupError::ConnectRefused(detail),
            ErrorKind::CommandTimeout => BackupError::CommandTimeout(detail),
            ErrorKind::SessionTimeout => BackupError::SessionTimeout(detail),
            ErrorKind::UnsupportedCommand => BackupError::UnsupportedCommand(detail),
            ErrorKind::ProtocolError => BackupError::ProtocolError(detail),
            ErrorKind::StorageError => BackupError::StorageError(detail),
            ErrorKind::DeviceBusy => BackupError::DeviceBusy(detail),
            ErrorKind::Cancelled => BackupError::Cancelled(detail),
            ErrorKind::JobNotFound => BackupError::JobNotFound(detail),
            ErrorKind::InvalidConfig => BackupError::InvalidConfig(detail),
        }
    }
}

impl From<async_ssh2_tokio::Error> for BackupError {
    fn from(err: async_ssh2_tokio::Error) -> Self {
        match err {
            async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
                BackupError::AuthFailed("credentials rejected by device".to_string())
            }
            other => classify_transport_message(other.to_string()),
        }
    }
}

impl From<russh::Error> for BackupError {
    fn from(err: russh::Error) -> Self {
        classify_transport_message(err.to_string())
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match err.kind() {
            Io::ConnectionRefused | Io::ConnectionReset | Io::ConnectionAborted => {
                BackupError::ConnectRefused(err.to_string())
            }
            Io::TimedOut => BackupError::ConnectTimeout(err.to_string()),
            _ => BackupError::ProtocolError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::StorageError(format!("json: {err}"))
    }
}

// Transport libraries wrap io errors in their own types; the message is the
// only stable signal for refused/timed-out connects.
fn classify_transport_message(message: String) -> BackupError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("refused") || lower.contains("reset by peer") {
        BackupError::ConnectRefused(message)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        BackupError::ConnectTimeout(message)
    } else if lower.contains("auth") {
        BackupError::AuthFailed(message)
    } else {
        BackupError::ProtocolError(message)
    }
}
