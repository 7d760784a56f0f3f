//! Error types for the tunnel engine

use std::fmt;
use std::io;
use thiserror::Error;

/// Stage of the session lifecycle an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Provisioning,
    Tunneling,
    Routing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Provisioning => write!(f, "provisioning"),
            Stage::Tunneling => write!(f, "tunneling"),
            Stage::Routing => write!(f, "routing"),
        }
    }
}

/// Discriminant of [`Error`], stable across stage wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProvisionTimeout,
    ConflictingShadow,
    PortUnavailable,
    TunnelLost,
    NoRoutableRange,
    Cancelled,
    SessionAlreadyActive,
    GatewayFailure,
    Io,
    Config,
    System,
    Process,
    Internal,
}

/// Failure reported by the cluster control plane
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct GatewayError {
    /// Whether the same call may succeed if repeated
    pub retryable: bool,
    /// Object already exists (create conflict)
    pub already_exists: bool,
    pub message: String,
}

impl GatewayError {
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        GatewayError {
            retryable: true,
            already_exists: false,
            message: msg.into(),
        }
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        GatewayError {
            retryable: false,
            already_exists: false,
            message: msg.into(),
        }
    }

    pub fn already_exists<S: Into<String>>(msg: S) -> Self {
        GatewayError {
            retryable: false,
            already_exists: true,
            message: msg.into(),
        }
    }
}

impl From<kube::Error> for GatewayError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) => match resp.code {
                409 => GatewayError::already_exists(resp.message.clone()),
                401 | 403 | 422 => GatewayError::fatal(format!(
                    "{} ({})",
                    resp.message, resp.reason
                )),
                _ => GatewayError::transient(resp.message.clone()),
            },
            kube::Error::Auth(_) | kube::Error::InferConfig(_) => {
                GatewayError::fatal(e.to_string())
            }
            _ => GatewayError::transient(e.to_string()),
        }
    }
}

/// Tunnel engine error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("shadow not ready before deadline: {0}")]
    ProvisionTimeout(String),

    #[error("conflicting shadow: {0}")]
    ConflictingShadow(String),

    #[error("local port {0} is unavailable")]
    PortUnavailable(u16),

    #[error("tunnel lost: {0}")]
    TunnelLost(String),

    #[error("no routable cluster range could be determined")]
    NoRoutableRange,

    #[error("operation cancelled")]
    Cancelled,

    #[error("another session is already active in this process")]
    SessionAlreadyActive,

    #[error("cluster gateway failure: {0}")]
    Gateway(#[from] GatewayError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("System state error: {0}")]
    System(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn system<S: Into<String>>(msg: S) -> Self {
        Error::System(msg.into())
    }

    pub fn process<S: Into<String>>(msg: S) -> Self {
        Error::Process(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    pub fn tunnel_lost<S: Into<String>>(msg: S) -> Self {
        Error::TunnelLost(msg.into())
    }

    /// Annotate with the session stage, keeping an existing annotation
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            Error::Stage { .. } => self,
            other => Error::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProvisionTimeout(_) => ErrorKind::ProvisionTimeout,
            Error::ConflictingShadow(_) => ErrorKind::ConflictingShadow,
            Error::PortUnavailable(_) => ErrorKind::PortUnavailable,
            Error::TunnelLost(_) => ErrorKind::TunnelLost,
            Error::NoRoutableRange => ErrorKind::NoRoutableRange,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::SessionAlreadyActive => ErrorKind::SessionAlreadyActive,
            Error::Gateway(_) => ErrorKind::GatewayFailure,
            Error::Io(_) => ErrorKind::Io,
            Error::Config(_) => ErrorKind::Config,
            Error::System(_) => ErrorKind::System,
            Error::Process(_) => ErrorKind::Process,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Stage { source, .. } => source.kind(),
        }
    }

    /// Transient gateway and IO failures may be retried by the caller
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Gateway(e) => e.retryable,
            Error::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
            ),
            Error::Stage { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Gateway(GatewayError::from(e))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Internal(format!("deadline elapsed: {}", e))
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::PortUnavailable(2223);
        assert_eq!(e.to_string(), "local port 2223 is unavailable");
    }

    #[test]
    fn test_stage_wrapping_keeps_kind() {
        let e = Error::Cancelled.at_stage(Stage::Provisioning);
        assert_eq!(e.kind(), ErrorKind::Cancelled);
        assert_eq!(e.stage(), Some(Stage::Provisioning));
        assert_eq!(e.to_string(), "provisioning: operation cancelled");

        // a second annotation does not hide the original stage
        let e = e.at_stage(Stage::Routing);
        assert_eq!(e.stage(), Some(Stage::Provisioning));
    }

    #[test]
    fn test_gateway_retryable() {
        assert!(Error::from(GatewayError::transient("timeout")).is_retryable());
        assert!(!Error::from(GatewayError::fatal("forbidden")).is_retryable());
        assert!(!Error::NoRoutableRange.is_retryable());
    }
}
