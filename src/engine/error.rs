use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Unknown resource or booking id.
    NotFound(Ulid),
    /// Request is malformed or outside what the catalog allows.
    Validation(String),
    /// One or more requested units are taken for the window. Retryable with other units/times.
    Conflict { units: Vec<String> },
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Durable log failure. Never retried by the engine.
    Storage(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::Conflict { units } => {
                write!(f, "conflict: already occupied: {}", units.join(", "))
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
