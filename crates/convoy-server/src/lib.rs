pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod gateway;
pub mod registry;
pub mod resolver;
pub mod server;

pub use auth::{CredentialVerifier, JwtVerifier};
pub use config::ServerConfig;
pub use gateway::Gateway;
pub use registry::ConnectionRegistry;
pub use resolver::ConversationResolver;
pub use server::{start, ServerHandle};
