use codehub_types::ErrorReason;

/// Failure surfaced by an actuator call, already classified into the
/// row-level error taxonomy. `retryable` may narrow what the reason alone
/// implies (DISK_FULL is an ActionFailed that retrying cannot fix).
#[derive(Debug, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct ActuatorError {
    pub reason: ErrorReason,
    pub message: String,
    pub retryable: bool,
}

impl ActuatorError {
    pub fn new(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            retryable: reason.retryable(),
        }
    }

    pub fn non_retryable(reason: ErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::Unreachable, message)
    }

    pub fn action_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::ActionFailed, message)
    }

    pub fn data_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorReason::DataLost, message)
    }
}

pub type ActuatorResult<T> = Result<T, ActuatorError>;

/// Container-start failure codes required by the instance contract.
pub mod start_failure {
    pub const IMAGE_PULL_FAILED: &str = "IMAGE_PULL_FAILED";
    pub const HEALTH_CHECK_FAILED: &str = "HEALTH_CHECK_FAILED";
    pub const CONTAINER_CREATE_FAILED: &str = "CONTAINER_CREATE_FAILED";
}
