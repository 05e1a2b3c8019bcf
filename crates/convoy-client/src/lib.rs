pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod log;
pub mod notify;
pub mod resource;
pub mod session;
pub mod transport;

pub mod mock;

pub use api::{ChatApi, HttpChatApi};
pub use config::SessionConfig;
pub use credentials::{CredentialProvider, StaticCredentials};
pub use error::{ApiClientError, OutgoingMessage, SessionError, TransportError};
pub use session::{DisconnectReason, SessionController, SessionEvent, SessionState, TypingState};
pub use transport::{Transport, WsTransport};
