/// Domain errors shared by the resolver, gateway and REST surface.
/// Classifies errors as client mistakes, authorization failures, or
/// transient infrastructure failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    // Rejected before any persistence call
    #[error("{0}")]
    Validation(String),
    #[error("invalid intent: {0}")]
    InvalidIntent(String),

    // Authorization
    #[error("Access denied")]
    AccessDenied,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    // Transient
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl ChatError {
    pub fn not_found(entity: &'static str, id: impl Into<i64>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Machine-readable code carried on `error` envelopes and REST bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvalidIntent(_) => "invalid_intent",
            Self::AccessDenied => "access_denied",
            Self::NotFound { .. } => "not_found",
            Self::Persistence(_) => "persistence_failure",
        }
    }
}

/// Why a connection's credential was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("missing credential")]
    Missing,
    #[error("invalid credential")]
    Invalid,
    #[error("expired credential")]
    Expired,
}

impl AuthFailure {
    pub const CLOSE_MISSING: u16 = 4401;
    pub const CLOSE_INVALID: u16 = 4403;

    /// WebSocket close code; expiry shares the "invalid" code.
    pub fn close_code(self) -> u16 {
        match self {
            Self::Missing => Self::CLOSE_MISSING,
            Self::Invalid | Self::Expired => Self::CLOSE_INVALID,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Missing => "missing_credential",
            Self::Invalid => "invalid_credential",
            Self::Expired => "expired_credential",
        }
    }

    /// Reverse of `close_code`/`reason`, used by clients reading a close frame.
    pub fn from_close(code: u16, reason: &str) -> Option<Self> {
        match (code, reason) {
            (Self::CLOSE_MISSING, _) => Some(Self::Missing),
            (Self::CLOSE_INVALID, "expired_credential") => Some(Self::Expired),
            (Self::CLOSE_INVALID, _) => Some(Self::Invalid),
            _ => None,
        }
    }
}
