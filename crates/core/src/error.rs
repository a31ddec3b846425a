use std::fmt::Display;

/// Error kinds surfaced by every component of the GPO engine.
///
/// Sub-components return these unchanged; the lifecycle facade never
/// coarsens them, so a transport layer can map [`CoreError::code`] directly.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Inconsistent state for GPO {gpo}: {detail}")]
    Inconsistent { gpo: String, detail: String },

    #[error("Timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: String, waited_ms: u64 },
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Wrap a backend failure (I/O, subprocess, parse of store output).
    pub fn unavailable(context: &str, err: impl Display) -> Self {
        Self::StoreUnavailable(format!("{context}: {err}"))
    }

    pub fn inconsistent(gpo: impl Display, detail: impl Into<String>) -> Self {
        Self::Inconsistent {
            gpo: gpo.to_string(),
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::SigningFailed(_) => "SIGNING_FAILED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Inconsistent { .. } => "INCONSISTENT",
            Self::Timeout { .. } => "TIMEOUT",
        }
    }
}
