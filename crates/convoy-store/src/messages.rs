use tracing::instrument;

use convoy_core::ids::{ClientMessageId, ConversationId, MessageId, UserId};
use convoy_core::model::{Message, NewMessage};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_timestamp};

const SELECT_COLUMNS: &str =
    "SELECT id, conversation_id, sender_id, content, kind, client_message_id, created_at FROM messages";

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Result of an insert. `replayed` is set when the sender already stored
/// this correlation id in the same conversation and that row is returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: Message,
    pub replayed: bool,
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message. The store assigns id and timestamp.
    #[instrument(skip(self, new), fields(conversation_id = %new.conversation_id, sender_id = %new.sender_id))]
    pub fn insert(&self, new: &NewMessage) -> Result<StoredMessage, StoreError> {
        let (_, now) = now_timestamp();
        let client_id = new.client_message_id.as_ref().map(|c| c.as_str().to_string());
        self.db.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT INTO messages (conversation_id, sender_id, content, kind, client_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT DO NOTHING",
                rusqlite::params![
                    new.conversation_id.get(),
                    new.sender_id.get(),
                    new.content,
                    new.kind.as_str(),
                    client_id,
                    now,
                ],
            )?;

            let message = if inserted == 1 {
                let id = tx.last_insert_rowid();
                let mut stmt = tx.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
                let mut rows = stmt.query([id])?;
                match rows.next()? {
                    Some(row) => row_to_message(row)?,
                    None => return Err(StoreError::NotFound(format!("message {id}"))),
                }
            } else {
                // Only the correlation index can make the insert a no-op
                let mut stmt = tx.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE conversation_id = ?1 AND sender_id = ?2 AND client_message_id = ?3"
                ))?;
                let mut rows = stmt.query(rusqlite::params![
                    new.conversation_id.get(),
                    new.sender_id.get(),
                    client_id
                ])?;
                match rows.next()? {
                    Some(row) => row_to_message(row)?,
                    None => {
                        return Err(StoreError::Conflict(format!(
                            "message insert ignored for conversation {}",
                            new.conversation_id
                        )))
                    }
                }
            };

            Ok(StoredMessage {
                message,
                replayed: inserted == 0,
            })
        })
    }

    /// One page of a conversation's history, oldest first. `page` is 1-based.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub fn page(&self, conversation_id: ConversationId, page: u32, limit: u32) -> Result<Vec<Message>, StoreError> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let offset = page.saturating_sub(1).saturating_mul(limit);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE conversation_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![conversation_id.get(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    pub fn count(&self, conversation_id: ConversationId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id.get()],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let kind: String = row_helpers::get(row, 4, "messages", "kind")?;
    let client_id: Option<String> = row_helpers::get(row, 5, "messages", "client_message_id")?;
    let created_at: String = row_helpers::get(row, 6, "messages", "created_at")?;
    Ok(Message {
        id: MessageId(row_helpers::get(row, 0, "messages", "id")?),
        conversation_id: ConversationId(row_helpers::get(row, 1, "messages", "conversation_id")?),
        sender_id: UserId(row_helpers::get(row, 2, "messages", "sender_id")?),
        content: row_helpers::get(row, 3, "messages", "content")?,
        kind: row_helpers::parse_enum(&kind, "messages", "kind")?,
        client_message_id: client_id.map(ClientMessageId::from_raw),
        created_at: row_helpers::parse_timestamp(&created_at, "messages", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationRepo;
    use crate::directory::DirectoryRepo;
    use convoy_core::model::{MessageKind, Role};

    struct Fixture {
        repo: MessageRepo,
        conversation: ConversationId,
        u1: UserId,
        u2: UserId,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let dir = DirectoryRepo::new(db.clone());
        let u1 = dir.create_user("One", "one@example.com", Role::Renter).unwrap().id;
        let u2 = dir.create_user("Two", "two@example.com", Role::Host).unwrap().id;
        let (conv, _) = ConversationRepo::new(db.clone()).find_or_create(u1, u2).unwrap();
        Fixture {
            repo: MessageRepo::new(db),
            conversation: conv.id,
            u1,
            u2,
        }
    }

    fn text(f: &Fixture, sender: UserId, content: &str, client: Option<&str>) -> NewMessage {
        NewMessage {
            conversation_id: f.conversation,
            sender_id: sender,
            content: content.into(),
            kind: MessageKind::Text,
            client_message_id: client.map(ClientMessageId::from_raw),
        }
    }

    #[test]
    fn insert_assigns_increasing_ids() {
        let f = fixture();
        let a = f.repo.insert(&text(&f, f.u1, "Hello", None)).unwrap();
        let b = f.repo.insert(&text(&f, f.u2, "Hi", None)).unwrap();
        assert!(!a.replayed);
        assert!(b.message.id > a.message.id);
        assert!(b.message.created_at >= a.message.created_at);
        assert_eq!(f.repo.count(f.conversation).unwrap(), 2);
    }

    #[test]
    fn replayed_correlation_id_returns_existing_row() {
        let f = fixture();
        let first = f.repo.insert(&text(&f, f.u1, "Hello", Some("cmsg_1"))).unwrap();
        let again = f.repo.insert(&text(&f, f.u1, "Hello", Some("cmsg_1"))).unwrap();
        assert!(again.replayed);
        assert_eq!(again.message.id, first.message.id);
        assert_eq!(f.repo.count(f.conversation).unwrap(), 1);
    }

    #[test]
    fn same_correlation_id_from_other_sender_is_distinct() {
        let f = fixture();
        f.repo.insert(&text(&f, f.u1, "a", Some("cmsg_1"))).unwrap();
        let other = f.repo.insert(&text(&f, f.u2, "b", Some("cmsg_1"))).unwrap();
        assert!(!other.replayed);
        assert_eq!(f.repo.count(f.conversation).unwrap(), 2);
    }

    #[test]
    fn same_correlation_id_in_other_conversation_is_distinct() {
        let f = fixture();
        let db = f.repo.db.clone();
        let u3 = DirectoryRepo::new(db.clone())
            .create_user("Three", "three@example.com", Role::Renter)
            .unwrap()
            .id;
        let (other, _) = ConversationRepo::new(db).find_or_create(f.u1, u3).unwrap();

        f.repo.insert(&text(&f, f.u1, "first", Some("cmsg_1"))).unwrap();
        let mut elsewhere = text(&f, f.u1, "second", Some("cmsg_1"));
        elsewhere.conversation_id = other.id;
        let stored = f.repo.insert(&elsewhere).unwrap();

        assert!(!stored.replayed);
        assert_eq!(stored.message.conversation_id, other.id);
        assert_eq!(stored.message.content, "second");
        assert_eq!(f.repo.count(other.id).unwrap(), 1);
        assert_eq!(f.repo.count(f.conversation).unwrap(), 1);
    }

    #[test]
    fn pages_are_oldest_first() {
        let f = fixture();
        for i in 0..5 {
            f.repo.insert(&text(&f, f.u1, &format!("m{i}"), None)).unwrap();
        }
        let first = f.repo.page(f.conversation, 1, 2).unwrap();
        let second = f.repo.page(f.conversation, 2, 2).unwrap();
        let third = f.repo.page(f.conversation, 3, 2).unwrap();
        assert_eq!(first.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["m0", "m1"]);
        assert_eq!(second.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), ["m2", "m3"]);
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn page_zero_behaves_like_first_page() {
        let f = fixture();
        f.repo.insert(&text(&f, f.u1, "only", None)).unwrap();
        assert_eq!(f.repo.page(f.conversation, 0, 10).unwrap().len(), 1);
    }

    #[test]
    fn insert_into_missing_conversation_fails() {
        let f = fixture();
        let mut msg = text(&f, f.u1, "x", None);
        msg.conversation_id = ConversationId(999);
        assert!(f.repo.insert(&msg).is_err());
    }
}
