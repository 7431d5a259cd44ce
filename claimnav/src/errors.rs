use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// How a failure should be treated by the supervisor.
///
/// Every [`AutomationError`] variant maps to exactly one kind, so retry policy
/// is a function of where the error was raised rather than of its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Element waits, session interruptions, transport hiccups.
    Transient,
    /// A newer handoff owns the target tab. Not an error from the user's view.
    Stale,
    /// The host application ignored a correct interaction.
    HostAnomaly,
    /// Source data is missing; only the user can fix it.
    UnrecoverableInput,
    Fatal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::HostAnomaly)
    }
}

#[derive(Error, Debug, Clone)]
pub enum AutomationError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    #[error("Request {request_id} was superseded")]
    Superseded { request_id: String },

    #[error("Host application anomaly: {0}")]
    HostAnomaly(String),

    #[error("Required input missing: {0}")]
    MissingInput(String),

    #[error("Attempt exceeded watchdog of {0:?}")]
    Watchdog(Duration),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Message delivery failed: {0}")]
    Delivery(String),

    #[error("Extension bridge error: {0}")]
    Bridge(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<AutomationError>,
    },
}

impl AutomationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutomationError::ElementNotFound(_)
            | AutomationError::Timeout(_)
            | AutomationError::SessionInvalid(_)
            | AutomationError::Watchdog(_)
            | AutomationError::Storage(_)
            | AutomationError::Delivery(_)
            | AutomationError::Bridge(_) => ErrorKind::Transient,
            AutomationError::Superseded { .. } => ErrorKind::Stale,
            AutomationError::HostAnomaly(_) => ErrorKind::HostAnomaly,
            AutomationError::MissingInput(_) => ErrorKind::UnrecoverableInput,
            AutomationError::InvalidArgument(_)
            | AutomationError::Internal(_)
            | AutomationError::Exhausted { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn is_stale(&self) -> bool {
        self.kind() == ErrorKind::Stale
    }
}

impl From<serde_json::Error> for AutomationError {
    fn from(e: serde_json::Error) -> Self {
        AutomationError::Internal(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_kind_not_text() {
        // Message text that would have matched the old "timeout|session" pattern.
        let missing = AutomationError::MissingInput("session timeout text".into());
        assert_eq!(missing.kind(), ErrorKind::UnrecoverableInput);
        assert!(!missing.is_retryable());

        let anomaly = AutomationError::HostAnomaly("first click swallowed".into());
        assert!(anomaly.is_retryable());

        let stale = AutomationError::Superseded {
            request_id: "1-abc".into(),
        };
        assert!(stale.is_stale());
        assert!(!stale.is_retryable());

        let exhausted = AutomationError::Exhausted {
            attempts: 3,
            last: Box::new(AutomationError::Timeout("row".into())),
        };
        assert_eq!(exhausted.kind(), ErrorKind::Fatal);
    }
}
