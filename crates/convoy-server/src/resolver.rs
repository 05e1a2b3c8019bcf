use std::sync::Arc;

use tracing::instrument;

use convoy_core::ids::{ConversationId, UserId};
use convoy_core::model::{
    ChatIntent, Conversation, ConversationContext, ConversationSummary, Counterpart, Resolution, UserRecord,
    VehicleSummary,
};
use convoy_core::ChatError;
use convoy_store::ChatStore;

/// Turns "who do I want to talk to" into the pair's single conversation.
pub struct ConversationResolver {
    store: Arc<dyn ChatStore>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, intent), fields(user_id = %caller))]
    pub async fn resolve(&self, caller: UserId, intent: ChatIntent) -> Result<Resolution, ChatError> {
        match intent {
            ChatIntent::DirectParticipant { participant_id } => {
                reject_self(caller, participant_id)?;
                let participant = self.user(participant_id).await?;
                self.open(caller, participant, ConversationContext::default()).await
            }
            ChatIntent::HostAndVehicle { host_id, vehicle_id } => {
                reject_self(caller, host_id)?;
                let vehicle = self
                    .store
                    .vehicle(vehicle_id)
                    .await?
                    .ok_or_else(|| ChatError::not_found("vehicle", vehicle_id.get()))?;
                let host = self.user(host_id).await?;
                let context = ConversationContext {
                    vehicle: Some(VehicleSummary {
                        id: vehicle.id,
                        title: vehicle.title(),
                    }),
                    host_name: Some(host.name.clone()),
                    booking_id: None,
                };
                self.open(caller, host, context).await
            }
            ChatIntent::Booking { booking_id } => {
                let booking = self
                    .store
                    .booking(booking_id)
                    .await?
                    .ok_or_else(|| ChatError::not_found("booking", booking_id.get()))?;
                let vehicle = self
                    .store
                    .vehicle(booking.vehicle_id)
                    .await?
                    .ok_or_else(|| ChatError::not_found("vehicle", booking.vehicle_id.get()))?;
                // The owner opening a booking chat talks to the renter
                let counterpart_id = if caller == vehicle.owner_id {
                    booking.renter_id
                } else {
                    vehicle.owner_id
                };
                reject_self(caller, counterpart_id)?;
                let counterpart = self.user(counterpart_id).await?;
                let host_name = if counterpart.id == vehicle.owner_id {
                    Some(counterpart.name.clone())
                } else {
                    self.store.user(vehicle.owner_id).await?.map(|u| u.name)
                };
                let context = ConversationContext {
                    vehicle: Some(VehicleSummary {
                        id: vehicle.id,
                        title: vehicle.title(),
                    }),
                    host_name,
                    booking_id: Some(booking.id),
                };
                self.open(caller, counterpart, context).await
            }
        }
    }

    /// Conversations the caller takes part in, newest first.
    #[instrument(skip(self), fields(user_id = %caller))]
    pub async fn list(&self, caller: UserId) -> Result<Vec<ConversationSummary>, ChatError> {
        let conversations = self.store.conversations_for(caller).await?;
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let Some(other) = conversation.counterpart_of(caller) else {
                continue;
            };
            let name = self
                .store
                .user(other)
                .await?
                .map(|u| u.name)
                .unwrap_or_default();
            summaries.push(ConversationSummary {
                id: conversation.id,
                counterpart: Counterpart { id: other, name },
                created_at: conversation.created_at,
            });
        }
        Ok(summaries)
    }

    /// The conversation if `caller` is one of its participants. Missing and
    /// foreign conversations are indistinguishable to the caller.
    pub async fn membership(&self, caller: UserId, id: ConversationId) -> Result<Conversation, ChatError> {
        match self.store.conversation(id).await? {
            Some(conversation) if conversation.is_participant(caller) => Ok(conversation),
            _ => Err(ChatError::AccessDenied),
        }
    }

    async fn user(&self, id: UserId) -> Result<UserRecord, ChatError> {
        self.store
            .user(id)
            .await?
            .ok_or_else(|| ChatError::not_found("user", id.get()))
    }

    async fn open(
        &self,
        caller: UserId,
        counterpart: UserRecord,
        context: ConversationContext,
    ) -> Result<Resolution, ChatError> {
        let (conversation, created) = self.store.find_or_create_conversation(caller, counterpart.id).await?;
        if created {
            tracing::info!(conversation_id = %conversation.id, counterpart = %counterpart.id, "Conversation created");
        }
        Ok(Resolution {
            conversation_id: conversation.id,
            counterpart: Counterpart {
                id: counterpart.id,
                name: counterpart.name,
            },
            context,
            created,
        })
    }
}

fn reject_self(caller: UserId, other: UserId) -> Result<(), ChatError> {
    if caller == other {
        return Err(ChatError::InvalidIntent("cannot start a conversation with yourself".into()));
    }
    Ok(())
}
