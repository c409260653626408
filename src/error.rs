//! Error types for engine operations.
//!
//! Every failure carries a human-readable message next to a stable
//! [`ErrorKind`], so callers (REST layer, CLI) can render both.

use std::fmt;

use serde::Serialize;

/// Stable classification of an [`OrchestratorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Configuration,
    Provisioning,
    PortConflict,
    StartupTimeout,
    ProcessExited,
    Handshake,
    NotRunning,
    Upstream,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Configuration => "configuration",
            Self::Provisioning => "provisioning",
            Self::PortConflict => "port_conflict",
            Self::StartupTimeout => "startup_timeout",
            Self::ProcessExited => "process_exited",
            Self::Handshake => "handshake",
            Self::NotRunning => "not_running",
            Self::Upstream => "upstream",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while provisioning, starting or invoking a service.
#[derive(Debug, Clone)]
pub enum OrchestratorError {
    /// Unknown service, descriptor, entry point or route.
    NotFound(String),

    /// The descriptor is missing something the engine needs (e.g. `PORT`).
    Configuration(String),

    /// Runtime creation or dependency installation/verification failed.
    Provisioning(String),

    /// The declared port is occupied and could not be freed.
    PortConflict { port: u16, message: String },

    /// The process never became reachable within the startup budget.
    StartupTimeout(String),

    /// The child exited before it became reachable.
    ProcessExited {
        code: Option<i32>,
        /// Tail of the service log file
        log_tail: String,
    },

    /// The `/init` endpoint was unreachable or rejected the descriptor.
    Handshake(String),

    /// No running instance is registered for the service.
    NotRunning(String),

    /// A running service answered an invocation with a non-2xx status.
    Upstream { status: u16, body: String },

    /// Unexpected I/O or transport failure.
    Internal(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::PortConflict { .. } => ErrorKind::PortConflict,
            Self::StartupTimeout(_) => ErrorKind::StartupTimeout,
            Self::ProcessExited { .. } => ErrorKind::ProcessExited,
            Self::Handshake(_) => ErrorKind::Handshake,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::Upstream { .. } => ErrorKind::Upstream,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status the REST layer should answer with for this error.
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;

        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Configuration => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotRunning | ErrorKind::PortConflict => StatusCode::CONFLICT,
            ErrorKind::StartupTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Upstream | ErrorKind::Handshake | ErrorKind::ProcessExited => {
                StatusCode::BAD_GATEWAY
            }
            ErrorKind::Provisioning | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "Not found: {}", msg),
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Provisioning(msg) => write!(f, "Provisioning failed: {}", msg),
            Self::PortConflict { port, message } => {
                write!(f, "Port {} is occupied: {}", port, message)
            }
            Self::StartupTimeout(msg) => write!(f, "Startup timed out: {}", msg),
            Self::ProcessExited { code, log_tail } => {
                match code {
                    Some(code) => write!(f, "Service process exited with code {}", code)?,
                    None => write!(f, "Service process exited")?,
                }
                if !log_tail.is_empty() {
                    write!(f, ": {}", log_tail)?;
                }
                Ok(())
            }
            Self::Handshake(msg) => write!(f, "Initialization handshake failed: {}", msg),
            Self::NotRunning(name) => write!(f, "Service `{}` is not running", name),
            Self::Upstream { status, body } => {
                write!(f, "Service answered with status {}: {}", status, body)
            }
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

/// Result type for engine operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl From<anyhow::Error> for OrchestratorError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{:#}", err))
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            OrchestratorError::NotRunning("calc".into()).kind(),
            ErrorKind::NotRunning
        );
        assert_eq!(
            OrchestratorError::Upstream { status: 500, body: "boom".into() }.kind(),
            ErrorKind::Upstream
        );
        assert_eq!(ErrorKind::PortConflict.as_str(), "port_conflict");
    }

    #[test]
    fn test_upstream_body_is_verbatim() {
        let err = OrchestratorError::Upstream {
            status: 422,
            body: "{\"detail\":\"a must be a number\"}".into(),
        };
        assert_eq!(
            err.to_string(),
            "Service answered with status 422: {\"detail\":\"a must be a number\"}"
        );
        assert_eq!(err.http_status(), http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_process_exited_display() {
        let err = OrchestratorError::ProcessExited {
            code: Some(1),
            log_tail: "ModuleNotFoundError: No module named 'fastapi'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Service process exited with code 1: ModuleNotFoundError: No module named 'fastapi'"
        );

        let err = OrchestratorError::ProcessExited { code: None, log_tail: String::new() };
        assert_eq!(err.to_string(), "Service process exited");
    }

    #[test]
    fn test_from_anyhow_is_internal() {
        let err: OrchestratorError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("disk full"));
    }
}
