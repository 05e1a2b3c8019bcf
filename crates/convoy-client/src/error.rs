use convoy_core::model::MessageKind;
use convoy_core::AuthFailure;

/// Failures of the realtime link.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("credential rejected: {0}")]
    Auth(AuthFailure),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
}

/// Failures of the REST client.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ApiClientError {
    #[error("unauthorized ({code})")]
    Unauthorized { code: String },
    #[error("{status} {code}: {message}")]
    Rejected { status: u16, code: String, message: String },
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("credential refresh failed: {0}")]
    Refresh(String),
}

impl ApiClientError {
    /// Network and 5xx failures; rejections by the server are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ApiClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

/// A message the caller tried to send, returned intact when the send fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: String,
    pub kind: MessageKind,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not initialized")]
    NotInitialized,
    #[error("session is closed")]
    Closed,
    #[error("failed to initialize conversation: {0}")]
    Initialization(#[source] Box<SessionError>),
    #[error(transparent)]
    Api(#[from] ApiClientError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("credential rejected after refresh: {0}")]
    AuthRejected(AuthFailure),
    #[error("join refused: {message}")]
    JoinRejected { code: Option<String>, message: String },
    #[error("message not sent: {source}")]
    SendFailed {
        payload: OutgoingMessage,
        #[source]
        source: TransportError,
    },
}

impl SessionError {
    /// Transient failures the user may retry; terminal ones need a new
    /// credential or an explicit reconnect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SendFailed { .. } | Self::Initialization(_) => true,
            Self::Transport(e) => !matches!(e, TransportError::Auth(_)),
            Self::Api(e) => e.is_retryable(),
            Self::NotInitialized | Self::Closed | Self::AuthRejected(_) | Self::JoinRejected { .. } => false,
        }
    }

    /// The unsent message, when this error came from `send`.
    pub fn payload(&self) -> Option<&OutgoingMessage> {
        match self {
            Self::SendFailed { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_failure_keeps_payload_and_is_retryable() {
        let err = SessionError::SendFailed {
            payload: OutgoingMessage {
                content: "hi".into(),
                kind: MessageKind::Text,
            },
            source: TransportError::Closed,
        };
        assert!(err.is_retryable());
        assert_eq!(err.payload().map(|p| p.content.as_str()), Some("hi"));
    }

    #[test]
    fn auth_rejection_is_terminal() {
        assert!(!SessionError::AuthRejected(AuthFailure::Expired).is_retryable());
        assert!(!SessionError::Transport(TransportError::Auth(AuthFailure::Invalid)).is_retryable());
    }

    #[test]
    fn api_retry_classification() {
        assert!(ApiClientError::Http("reset".into()).is_retryable());
        let server = ApiClientError::Rejected {
            status: 500,
            code: "persistence_failure".into(),
            message: "locked".into(),
        };
        assert!(server.is_retryable());
        let denied = ApiClientError::Rejected {
            status: 403,
            code: "access_denied".into(),
            message: "Access denied".into(),
        };
        assert!(!denied.is_retryable());
    }
}
