//! REST client for conversation resolution and history.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use convoy_core::ids::ConversationId;
use convoy_core::model::{ChatIntent, ConversationSummary, HistoryPage, Resolution};

use crate::config::SessionConfig;
use crate::credentials::CredentialProvider;
use crate::error::ApiClientError;

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn resolve(&self, intent: &ChatIntent) -> Result<Resolution, ApiClientError>;
    async fn history(&self, conversation: ConversationId, page: u32, limit: u32) -> Result<HistoryPage, ApiClientError>;
    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiClientError>;
}

pub struct HttpChatApi {
    client: Client,
    config: SessionConfig,
    credentials: Arc<dyn CredentialProvider>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Deserialize)]
struct ConversationList {
    conversations: Vec<ConversationSummary>,
}

impl HttpChatApi {
    pub fn new(config: SessionConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self, ApiClientError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            config,
            credentials,
        })
    }

    /// Send with the current credential; on 401 refresh once and resend.
    async fn execute<T, F>(&self, build: F) -> Result<T, ApiClientError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.credentials.current().await?;
        let response = authorized(build(&self.client), &token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return decode(response).await;
        }

        tracing::debug!("REST request unauthorized, refreshing credential");
        let token = self.credentials.refresh().await?;
        let response = authorized(build(&self.client), &token).send().await?;
        decode(response).await
    }
}

fn authorized(request: RequestBuilder, token: &SecretString) -> RequestBuilder {
    request.bearer_auth(token.expose_secret())
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiClientError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|e| ApiClientError::Decode(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&body).ok().map(|b| b.error);
    let (code, message) = match detail {
        Some(d) => (d.code, d.message),
        None => (status.as_str().to_string(), body),
    };
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiClientError::Unauthorized { code });
    }
    Err(ApiClientError::Rejected {
        status: status.as_u16(),
        code,
        message,
    })
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn resolve(&self, intent: &ChatIntent) -> Result<Resolution, ApiClientError> {
        let url = self.config.api_url("/api/conversations/resolve");
        self.execute(|c| c.post(&url).json(intent)).await
    }

    async fn history(&self, conversation: ConversationId, page: u32, limit: u32) -> Result<HistoryPage, ApiClientError> {
        let url = self.config.api_url(&format!("/api/conversations/{conversation}/messages"));
        self.execute(|c| c.get(&url).query(&[("page", page), ("limit", limit)])).await
    }

    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiClientError> {
        let url = self.config.api_url("/api/conversations");
        let list: ConversationList = self.execute(|c| c.get(&url)).await?;
        Ok(list.conversations)
    }
}
