use async_trait::async_trait;
use parking_lot::RwLock;
use secrecy::SecretString;

use crate::error::ApiClientError;

/// Source of the bearer credential presented to the server.
///
/// `refresh` is called at most once per rejected connect; what it does
/// (re-login, token exchange) is up to the host application.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current(&self) -> Result<SecretString, ApiClientError>;
    async fn refresh(&self) -> Result<SecretString, ApiClientError>;
}

/// A fixed credential that can be replaced by the host application.
/// Refreshing returns whatever was last stored.
pub struct StaticCredentials {
    token: RwLock<SecretString>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(SecretString::from(token.into())),
        }
    }

    pub fn replace(&self, token: impl Into<String>) {
        *self.token.write() = SecretString::from(token.into());
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current(&self) -> Result<SecretString, ApiClientError> {
        Ok(self.token.read().clone())
    }

    async fn refresh(&self) -> Result<SecretString, ApiClientError> {
        Ok(self.token.read().clone())
    }
}
