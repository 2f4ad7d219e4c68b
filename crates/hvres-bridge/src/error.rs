//! Error types for the management object bridge.

use thiserror::Error;

use crate::types::CimType;

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors raised while reading or mutating management objects.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The property is not part of this host's schema for the object.
    #[error("property not present on this host: {0}")]
    PropertyAbsent(String),

    #[error("property {name} is {expected}, cannot assign {found}")]
    TypeMismatch {
        name: String,
        expected: CimType,
        found: CimType,
    },

    #[error("value {value:?} is not a valid {cim_type} for property {name}")]
    InvalidValue {
        name: String,
        cim_type: CimType,
        value: String,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("malformed settings document: {0}")]
    Document(String),

    #[error("management backend error: {0}")]
    Backend(String),
}
