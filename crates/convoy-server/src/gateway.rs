//! Message gateway: the per-connection operations of an authenticated
//! connection (join, send, typing, disconnect).
//!
//! Every operation checks membership against the store. A send is persisted
//! before anything is pushed to the counterpart; the sender is acknowledged
//! with `message_sent` carrying its correlation id.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::instrument;

use convoy_core::ids::{ClientMessageId, ConnectionId, ConversationId, UserId};
use convoy_core::model::{Conversation, MessageKind, NewMessage, Principal};
use convoy_core::{ChatError, ClientEnvelope, EnvelopeError, ServerEnvelope};
use convoy_store::{ChatStore, StoredMessage};

use crate::registry::ConnectionRegistry;
use crate::resolver::ConversationResolver;

/// Identity and outbound handle of one authenticated connection.
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub principal: Principal,
    /// Shown to the counterpart as `senderName`.
    pub display_name: String,
    outbound: mpsc::WeakSender<String>,
}

impl ConnectionContext {
    pub fn user_id(&self) -> UserId {
        self.principal.user_id
    }

    /// Queue an envelope for this connection only. Fails once the connection
    /// has been superseded or closed.
    pub fn reply(&self, envelope: &ServerEnvelope) -> bool {
        let Some(tx) = self.outbound.upgrade() else {
            return false;
        };
        match envelope.encode() {
            Ok(json) => tx.try_send(json).is_ok(),
            Err(e) => {
                tracing::error!(connection_id = %self.connection_id, error = %e, "Failed to encode reply");
                false
            }
        }
    }
}

/// A validated `send_message` request.
#[derive(Clone, Debug)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub message_type: String,
    pub client_message_id: Option<ClientMessageId>,
}

pub struct Gateway {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    resolver: ConversationResolver,
}

impl Gateway {
    pub fn new(store: Arc<dyn ChatStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            resolver: ConversationResolver::new(Arc::clone(&store)),
            store,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Register an authenticated principal, superseding its previous
    /// connection. The receiver feeds the connection's writer.
    #[instrument(skip(self, principal), fields(user_id = %principal.user_id))]
    pub async fn connect(&self, principal: Principal) -> (ConnectionContext, mpsc::Receiver<String>) {
        let display_name = match self.store.user(principal.user_id).await {
            Ok(Some(user)) => user.name,
            Ok(None) => principal.email.clone(),
            Err(e) => {
                tracing::warn!(error = %e, "Display name lookup failed");
                principal.email.clone()
            }
        };
        let (connection_id, rx) = self.registry.register(principal.user_id);
        let outbound = self
            .registry
            .sender_for(principal.user_id, &connection_id)
            .unwrap_or_else(closed_sender);
        tracing::info!(connection_id = %connection_id, "Connection authenticated");
        (
            ConnectionContext {
                connection_id,
                principal,
                display_name,
                outbound,
            },
            rx,
        )
    }

    /// Process one inbound text frame. Returns the reply for the sender, if any.
    pub async fn handle_text(&self, ctx: &ConnectionContext, raw: &str) -> Option<ServerEnvelope> {
        let envelope = match ClientEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnknownType(kind)) => {
                tracing::debug!(connection_id = %ctx.connection_id, kind = %kind, "Unknown envelope type");
                return Some(ServerEnvelope::error(EnvelopeError::UnknownType(kind).to_string()));
            }
            Err(e) => {
                return Some(ServerEnvelope::error_with_code("validation_error", e.to_string()));
            }
        };

        match envelope {
            ClientEnvelope::JoinConversation { conversation_id } => match self.join(ctx, conversation_id).await {
                Ok(_) => Some(ServerEnvelope::ConversationJoined { conversation_id }),
                Err(e) => Some(error_envelope(&e, None)),
            },
            ClientEnvelope::SendMessage {
                conversation_id,
                content,
                message_type,
                client_message_id,
            } => {
                let request = SendRequest {
                    conversation_id,
                    content,
                    message_type,
                    client_message_id: client_message_id.clone(),
                };
                match self.send(ctx, request).await {
                    Ok(stored) => Some(ServerEnvelope::message_sent(&stored.message)),
                    Err(e) => Some(error_envelope(&e, client_message_id)),
                }
            }
            ClientEnvelope::Typing {
                conversation_id,
                is_typing,
            } => match self.typing(ctx, conversation_id, is_typing).await {
                Ok(()) => None,
                Err(e) => Some(error_envelope(&e, None)),
            },
        }
    }

    #[instrument(skip(self, ctx), fields(user_id = %ctx.user_id(), conversation_id = %conversation_id))]
    pub async fn join(&self, ctx: &ConnectionContext, conversation_id: ConversationId) -> Result<Conversation, ChatError> {
        self.resolver.membership(ctx.user_id(), conversation_id).await
    }

    /// Validate, authorize, persist, then push to the counterpart.
    #[instrument(skip(self, ctx, request), fields(user_id = %ctx.user_id(), conversation_id = %request.conversation_id))]
    pub async fn send(&self, ctx: &ConnectionContext, request: SendRequest) -> Result<StoredMessage, ChatError> {
        if request.content.trim().is_empty() {
            return Err(ChatError::Validation("Message content cannot be empty".into()));
        }
        let kind: MessageKind = request
            .message_type
            .parse()
            .map_err(|_| ChatError::Validation(format!("Invalid message type: {}", request.message_type)))?;

        let conversation = self.resolver.membership(ctx.user_id(), request.conversation_id).await?;

        let stored = self
            .store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: ctx.user_id(),
                content: request.content,
                kind,
                client_message_id: request.client_message_id,
            })
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Message persistence failed");
                ChatError::from(e)
            })?;

        if stored.replayed {
            tracing::debug!(message_id = %stored.message.id, "Replayed send, not rebroadcast");
            return Ok(stored);
        }

        if let Some(counterpart) = conversation.counterpart_of(ctx.user_id()) {
            let pushed = self
                .registry
                .send_to(counterpart, &ServerEnvelope::new_message(&stored.message, &ctx.display_name));
            tracing::debug!(message_id = %stored.message.id, counterpart = %counterpart, pushed, "Message stored");
        }
        Ok(stored)
    }

    /// Forward a typing indicator to a connected counterpart. Nothing is stored.
    #[instrument(skip(self, ctx), fields(user_id = %ctx.user_id(), conversation_id = %conversation_id))]
    pub async fn typing(
        &self,
        ctx: &ConnectionContext,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<(), ChatError> {
        let conversation = self.resolver.membership(ctx.user_id(), conversation_id).await?;
        if let Some(counterpart) = conversation.counterpart_of(ctx.user_id()) {
            self.registry.send_to(
                counterpart,
                &ServerEnvelope::TypingIndicator {
                    conversation_id,
                    user_id: ctx.user_id(),
                    is_typing,
                },
            );
        }
        Ok(())
    }

    /// Drop the registry entry if it still belongs to this connection.
    pub fn disconnect(&self, ctx: &ConnectionContext) -> bool {
        let removed = self.registry.unregister_if(ctx.user_id(), &ctx.connection_id);
        tracing::info!(user_id = %ctx.user_id(), connection_id = %ctx.connection_id, removed, "Connection closed");
        removed
    }
}

fn error_envelope(error: &ChatError, client_message_id: Option<ClientMessageId>) -> ServerEnvelope {
    ServerEnvelope::Error {
        message: error.to_string(),
        code: Some(error.code().to_string()),
        client_message_id,
    }
}

fn closed_sender() -> mpsc::WeakSender<String> {
    let (tx, _rx) = mpsc::channel(1);
    tx.downgrade()
}
