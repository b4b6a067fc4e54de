//! Error taxonomy shared by the service layer and the HTTP surface.

use std::error::Error;
use std::fmt;

/// Classified failure of a fleet operation. The web layer maps each variant
/// onto an HTTP status; provider failures are logged and never abort the
/// mutation that triggered them.
#[derive(Debug)]
pub enum FleetError {
    /// Malformed input, unknown enum value, missing field, or a state
    /// transition not allowed from the entity's current state.
    Validation(String),
    /// Missing, invalid, or expired credentials.
    Auth(String),
    /// Authenticated but the role gate rejects the caller.
    Forbidden(String),
    /// Referenced entity absent or already terminal.
    NotFound(String),
    /// The operation contradicts existing state (duplicate assignment,
    /// unique-key collision).
    Conflict(String),
    /// An external collaborator (push, snap, geocode) failed.
    External {
        provider: &'static str,
        detail: String,
    },
    /// Store or other infrastructure failure; surfaced opaquely.
    Internal(String),
}

impl FleetError {
    pub fn validation(msg: impl Into<String>) -> Self {
        FleetError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        FleetError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        FleetError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        FleetError::Internal(msg.into())
    }

    pub fn invalid_transition(entity: &str, from: &str, event: &str) -> Self {
        FleetError::Validation(format!(
            "{} cannot {} from status {}",
            entity, event, from
        ))
    }
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FleetError::Validation(msg) => write!(f, "validation failed: {}", msg),
            FleetError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            FleetError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            FleetError::NotFound(msg) => write!(f, "not found: {}", msg),
            FleetError::Conflict(msg) => write!(f, "conflict: {}", msg),
            FleetError::External { provider, detail } => {
                write!(f, "{} provider error: {}", provider, detail)
            }
            FleetError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for FleetError {}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Validation(format!("invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(err: reqwest::Error) -> Self {
        FleetError::External {
            provider: "http",
            detail: err.to_string(),
        }
    }
}

impl From<bcrypt::BcryptError> for FleetError {
    fn from(err: bcrypt::BcryptError) -> Self {
        FleetError::Internal(format!("password hashing failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
