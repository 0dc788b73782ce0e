use crate::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed error taxonomy recorded on the workspace row.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    /// Observed state contradicts the attempted transition.
    Mismatch,
    /// Transient infra/API failure.
    Unreachable,
    /// An actuator returned non-zero.
    ActionFailed,
    /// The operation exceeded its deadline.
    Timeout,
    /// The retry budget was exhausted.
    RetryExceeded,
    /// Checksum mismatch, missing archive, corrupt meta.
    DataLost,
}

impl ErrorReason {
    /// Whether the controller may retry an attempt that failed with this
    /// reason. Timeout and DataLost are terminal immediately; RetryExceeded
    /// is only ever written, never attempted against.
    pub fn retryable(self) -> bool {
        match self {
            ErrorReason::Mismatch | ErrorReason::Unreachable | ErrorReason::ActionFailed => true,
            ErrorReason::Timeout | ErrorReason::RetryExceeded | ErrorReason::DataLost => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReason::Mismatch => "Mismatch",
            ErrorReason::Unreachable => "Unreachable",
            ErrorReason::ActionFailed => "ActionFailed",
            ErrorReason::Timeout => "Timeout",
            ErrorReason::RetryExceeded => "RetryExceeded",
            ErrorReason::DataLost => "DataLost",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error record persisted as JSONB in the `error_info` column.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ErrorInfo {
    pub reason: ErrorReason,
    pub message: String,
    pub is_terminal: bool,
    /// The operation that was in flight when the error occurred.
    pub operation: Operation,
    pub retry_count: u32,
    #[serde(default)]
    pub context: serde_json::Value,
    /// Unix ms.
    pub occurred_at: i64,
}

impl ErrorInfo {
    pub fn terminal(
        reason: ErrorReason,
        message: impl Into<String>,
        operation: Operation,
        retry_count: u32,
        occurred_at: i64,
    ) -> Self {
        Self {
            reason,
            message: message.into(),
            is_terminal: true,
            operation,
            retry_count,
            context: serde_json::Value::Null,
            occurred_at,
        }
    }

    pub fn transient(
        reason: ErrorReason,
        message: impl Into<String>,
        operation: Operation,
        retry_count: u32,
        occurred_at: i64,
    ) -> Self {
        Self {
            reason,
            message: message.into(),
            is_terminal: false,
            operation,
            retry_count,
            context: serde_json::Value::Null,
            occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_reasons_are_not_retryable() {
        assert!(ErrorReason::Mismatch.retryable());
        assert!(ErrorReason::Unreachable.retryable());
        assert!(ErrorReason::ActionFailed.retryable());
        assert!(!ErrorReason::Timeout.retryable());
        assert!(!ErrorReason::RetryExceeded.retryable());
        assert!(!ErrorReason::DataLost.retryable());
    }

    #[test]
    fn error_info_round_trips_through_json() {
        let info = ErrorInfo::terminal(
            ErrorReason::DataLost,
            "checksum mismatch on home.tar.zst",
            Operation::Restoring,
            0,
            1_234,
        );
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["reason"], "DataLost");
        assert_eq!(json["is_terminal"], true);
        let back: ErrorInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }
}
