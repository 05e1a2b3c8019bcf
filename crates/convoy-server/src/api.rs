//! REST surface: conversation resolution, listing and history paging.
//!
//! Every route except `/health` requires a bearer credential. Errors are
//! returned as `{ "error": { "code", "message" } }`.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use convoy_core::ids::{ConversationId, UserId};
use convoy_core::model::{ChatIntent, ConversationSummary, HistoryPage, Principal, Resolution};
use convoy_core::{AuthFailure, ChatError};
use convoy_store::messages::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

use crate::auth;
use crate::server::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(AuthFailure),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Chat(e) => match e {
                ChatError::Validation(_) | ChatError::InvalidIntent(_) => StatusCode::BAD_REQUEST,
                ChatError::AccessDenied => StatusCode::FORBIDDEN,
                ChatError::NotFound { .. } => StatusCode::NOT_FOUND,
                ChatError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(failure) => failure.reason(),
            Self::Chat(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = json!({ "error": { "code": self.code(), "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The authenticated caller of a REST request.
pub struct AuthPrincipal(pub Principal);

impl FromRequestParts<AppState> for AuthPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let query_token = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token);
        let credential = auth::presented_credential(&parts.headers, query_token.as_deref());
        auth::authenticate(state.verifier.as_ref(), credential.as_deref())
            .map(AuthPrincipal)
            .map_err(ApiError::Unauthorized)
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/conversations", get(list_conversations).post(create_conversation))
        .route("/api/conversations/resolve", post(resolve_conversation))
        .route("/api/conversations/{id}/messages", get(conversation_messages))
}

#[derive(Serialize)]
struct ConversationList {
    conversations: Vec<ConversationSummary>,
}

async fn list_conversations(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<AppState>,
) -> Result<Json<ConversationList>, ApiError> {
    let conversations = state.resolver.list(principal.user_id).await?;
    Ok(Json(ConversationList { conversations }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversation {
    participant_id: UserId,
}

async fn create_conversation(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<AppState>,
    body: Result<Json<CreateConversation>, JsonRejection>,
) -> Result<(StatusCode, Json<Resolution>), ApiError> {
    let Json(body) = body.map_err(|e| ChatError::InvalidIntent(e.body_text()))?;
    let intent = ChatIntent::DirectParticipant {
        participant_id: body.participant_id,
    };
    respond_resolution(state.resolver.resolve(principal.user_id, intent).await?)
}

async fn resolve_conversation(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<AppState>,
    body: Result<Json<ChatIntent>, JsonRejection>,
) -> Result<(StatusCode, Json<Resolution>), ApiError> {
    let Json(intent) = body.map_err(|e| ChatError::InvalidIntent(e.body_text()))?;
    respond_resolution(state.resolver.resolve(principal.user_id, intent).await?)
}

fn respond_resolution(resolution: Resolution) -> Result<(StatusCode, Json<Resolution>), ApiError> {
    let status = if resolution.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(resolution)))
}

#[derive(Deserialize)]
struct HistoryQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

async fn conversation_messages(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<AppState>,
    id: Result<Path<ConversationId>, PathRejection>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ApiError> {
    let Path(id) = id.map_err(|e| ChatError::Validation(e.body_text()))?;
    let conversation = state.resolver.membership(principal.user_id, id).await?;

    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let messages = state
        .store
        .messages_page(conversation.id, page, limit)
        .await
        .map_err(ChatError::from)?;
    let total = state.store.message_count(conversation.id).await.map_err(ChatError::from)?;
    Ok(Json(HistoryPage {
        messages,
        page,
        limit,
        total,
    }))
}
