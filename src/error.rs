use std::fmt;
use std::sync::Arc;

use crate::types::Command;

/// Errors surfaced to callers. Cloneable so a single in-flight operation can
/// hand the same outcome to every waiter.
#[derive(Debug, Clone)]
pub enum Error {
    Http(Arc<reqwest::Error>),
    Authentication { reason: String },
    InvalidCredentials,
    ServiceUnavailable { attempts: u32, last_status: Option<u16> },
    Permanent { status: u16, message: String },
    DeviceNotFound(String),
    AccountNotFound(String),
    CommandNotAllowed { device_id: String, command: Command },
    CommandFailed { device_id: String, command: Command, reason: String },
    ConfirmationTimeout { device_id: String, expected: String },
    Sync { account_id: String, reason: String },
    Protocol(String),
    /// A builder setting that cannot be used.
    Config(String),
    Io(Arc<std::io::Error>),
    /// A background operation ended without producing a result.
    Aborted(String),
}

impl Error {
    /// True when the host should prompt the user for new credentials.
    pub fn is_credentials_problem(&self) -> bool {
        matches!(self, Error::Authentication { .. } | Error::InvalidCredentials)
    }

    /// True for "the command may have worked, the cloud just hasn't said so".
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self, Error::ConfirmationTimeout { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Http(e) => write!(f, "HTTP error: {e}"),
            Error::Authentication { reason } => write!(f, "authentication failed: {reason}"),
            Error::InvalidCredentials => {
                write!(f, "credentials rejected; update username/password to retry")
            }
            Error::ServiceUnavailable { attempts, last_status } => match last_status {
                Some(status) => {
                    write!(f, "service unavailable after {attempts} attempts (HTTP {status})")
                }
                None => write!(f, "service unavailable after {attempts} attempts"),
            },
            Error::Permanent { status, message } => write!(f, "request rejected (HTTP {status}): {message}"),
            Error::DeviceNotFound(id) => write!(f, "device not found: {id}"),
            Error::AccountNotFound(id) => write!(f, "account not found: {id}"),
            Error::CommandNotAllowed { device_id, command } => {
                write!(f, "command {command} not allowed on device {device_id}")
            }
            Error::CommandFailed { device_id, command, reason } => {
                write!(f, "command {command} on device {device_id} failed: {reason}")
            }
            Error::ConfirmationTimeout { device_id, expected } => {
                write!(f, "device {device_id} did not report state {expected} in time")
            }
            Error::Sync { account_id, reason } => {
                write!(f, "state refresh for account {account_id} failed: {reason}")
            }
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
            Error::Aborted(msg) => write!(f, "operation aborted: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(e) => Some(e.as_ref()),
            Error::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
