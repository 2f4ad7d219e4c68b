//! Reconciliation error types.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use hvres_bridge::{BridgeError, EntityKind};
use hvres_model::ConfigError;
use hvres_native::NativeError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("virtual machine not found: {0}")]
    VmNotFound(String),

    #[error("{kind} not found for virtual machine {vm}")]
    SettingsNotFound { vm: String, kind: EntityKind },

    #[error("modification rejected with return code {code}")]
    SynchronousFailure { code: u32 },

    #[error("job ended in state {state}: {description}")]
    JobFailed { state: u16, description: String },

    #[error("job still pending after {elapsed:?} (last state {last_state})")]
    JobTimedOut { elapsed: Duration, last_state: u16 },

    #[error("native call failed with status 0x{status:08X}: {payload}")]
    NativeCallFailed { status: i32, payload: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

impl From<BridgeError> for ReconcileError {
    fn from(e: BridgeError) -> Self {
        ReconcileError::Unexpected(e.to_string())
    }
}

impl From<NativeError> for ReconcileError {
    fn from(e: NativeError) -> Self {
        match e {
            NativeError::CallFailed { status, payload } => {
                ReconcileError::NativeCallFailed { status, payload }
            }
            other => ReconcileError::Unexpected(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ReconcileError {
    fn from(e: tokio::task::JoinError) -> Self {
        ReconcileError::Unexpected(format!("worker did not finish: {e}"))
    }
}

/// The `(ok, message)` shape handed to callers that only display results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
}

impl OperationOutcome {
    pub fn from_result<T>(result: &ReconcileResult<T>, success_message: &str) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                message: success_message.to_string(),
            },
            Err(e) => Self {
                success: false,
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_failure_keeps_status_and_payload() {
        let err: ReconcileError = NativeError::CallFailed {
            status: 0x8007_0490_u32 as i32,
            payload: "{\"Error\":1}".into(),
        }
        .into();
        assert!(matches!(
            err,
            ReconcileError::NativeCallFailed { status, .. } if status == 0x8007_0490_u32 as i32
        ));
        assert!(err.to_string().contains("0x80070490"));
    }

    #[test]
    fn bridge_errors_are_unexpected() {
        let err: ReconcileError = BridgeError::Backend("connection lost".into()).into();
        assert!(matches!(err, ReconcileError::Unexpected(ref m) if m.contains("connection lost")));
    }

    #[test]
    fn outcome_carries_message() {
        let ok: ReconcileResult<()> = Ok(());
        assert_eq!(
            OperationOutcome::from_result(&ok, "memory settings applied"),
            OperationOutcome {
                success: true,
                message: "memory settings applied".into()
            }
        );

        let failed: ReconcileResult<()> = Err(ReconcileError::SynchronousFailure { code: 32773 });
        let outcome = OperationOutcome::from_result(&failed, "unused");
        assert!(!outcome.success);
        assert_eq!(outcome.message, "modification rejected with return code 32773");
    }
}
