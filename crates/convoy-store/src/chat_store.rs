use async_trait::async_trait;

use convoy_core::ids::{BookingId, ConversationId, UserId, VehicleId};
use convoy_core::model::{BookingRecord, Conversation, Message, NewMessage, UserRecord, VehicleRecord};

use crate::conversations::ConversationRepo;
use crate::database::Database;
use crate::directory::DirectoryRepo;
use crate::error::StoreError;
use crate::messages::{MessageRepo, StoredMessage};

/// Persistence contract consumed by the resolver, the gateway and the REST
/// handlers. Every method is a suspension point.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn user(&self, id: UserId) -> Result<Option<UserRecord>, StoreError>;
    async fn vehicle(&self, id: VehicleId) -> Result<Option<VehicleRecord>, StoreError>;
    async fn booking(&self, id: BookingId) -> Result<Option<BookingRecord>, StoreError>;

    /// Order-invariant lookup of the pair's conversation, created on first contact.
    async fn find_or_create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<(Conversation, bool), StoreError>;
    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError>;
    async fn conversations_for(&self, user: UserId) -> Result<Vec<Conversation>, StoreError>;

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;
    async fn messages_page(
        &self,
        conversation: ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;
    async fn message_count(&self, conversation: ConversationId) -> Result<u64, StoreError>;
}

/// `ChatStore` backed by the SQLite repositories. Blocking calls run on the
/// blocking pool so the connection mutex is never held on a runtime worker.
#[derive(Clone)]
pub struct SqliteChatStore {
    db: Database,
}

impl SqliteChatStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db)).await?
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn user(&self, id: UserId) -> Result<Option<UserRecord>, StoreError> {
        self.blocking(move |db| DirectoryRepo::new(db).find_user(id)).await
    }

    async fn vehicle(&self, id: VehicleId) -> Result<Option<VehicleRecord>, StoreError> {
        self.blocking(move |db| DirectoryRepo::new(db).find_vehicle(id)).await
    }

    async fn booking(&self, id: BookingId) -> Result<Option<BookingRecord>, StoreError> {
        self.blocking(move |db| DirectoryRepo::new(db).find_booking(id)).await
    }

    async fn find_or_create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<(Conversation, bool), StoreError> {
        self.blocking(move |db| ConversationRepo::new(db).find_or_create(a, b)).await
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.blocking(move |db| ConversationRepo::new(db).find(id)).await
    }

    async fn conversations_for(&self, user: UserId) -> Result<Vec<Conversation>, StoreError> {
        self.blocking(move |db| ConversationRepo::new(db).list_for_user(user)).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        self.blocking(move |db| MessageRepo::new(db).insert(&message)).await
    }

    async fn messages_page(
        &self,
        conversation: ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.blocking(move |db| MessageRepo::new(db).page(conversation, page, limit)).await
    }

    async fn message_count(&self, conversation: ConversationId) -> Result<u64, StoreError> {
        self.blocking(move |db| MessageRepo::new(db).count(conversation)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::model::{MessageKind, Role};

    #[tokio::test]
    async fn sqlite_store_end_to_end() {
        let db = Database::in_memory().unwrap();
        let dir = DirectoryRepo::new(db.clone());
        let u1 = dir.create_user("One", "one@example.com", Role::Renter).unwrap().id;
        let u2 = dir.create_user("Two", "two@example.com", Role::Host).unwrap().id;
        let store = SqliteChatStore::new(db);

        let (conv, created) = store.find_or_create_conversation(u1, u2).await.unwrap();
        assert!(created);
        assert_eq!(store.conversation(conv.id).await.unwrap(), Some(conv.clone()));

        let stored = store
            .insert_message(NewMessage {
                conversation_id: conv.id,
                sender_id: u1,
                content: "Hello".into(),
                kind: MessageKind::Text,
                client_message_id: None,
            })
            .await
            .unwrap();
        let page = store.messages_page(conv.id, 1, 50).await.unwrap();
        assert_eq!(page, vec![stored.message]);
        assert_eq!(store.message_count(conv.id).await.unwrap(), 1);
        assert_eq!(store.conversations_for(u2).await.unwrap().len(), 1);
        assert!(store.user(UserId(99)).await.unwrap().is_none());
    }
}
