use tracing::instrument;

use convoy_core::ids::{ConversationId, UserId};
use convoy_core::model::Conversation;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, now_timestamp};

const SELECT_COLUMNS: &str = "SELECT id, participant_a, participant_b, created_at FROM conversations";

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Find the conversation for the unordered pair `{a, b}`, creating it on
    /// first contact. Returns the row and whether this call created it.
    ///
    /// The unique index over `(min, max)` of the pair makes concurrent first
    /// contact from both sides converge on one row: the losing insert is a
    /// no-op and the follow-up select returns the winner.
    #[instrument(skip(self), fields(a = %a, b = %b))]
    pub fn find_or_create(&self, a: UserId, b: UserId) -> Result<(Conversation, bool), StoreError> {
        if a == b {
            return Err(StoreError::Conflict(format!("conversation with self ({a})")));
        }
        let (_, now) = now_timestamp();
        self.db.with_tx(|tx| {
            let inserted = tx.execute(
                "INSERT INTO conversations (participant_a, participant_b, created_at)
                 VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
                rusqlite::params![a.get(), b.get(), now],
            )?;

            let mut stmt = tx.prepare(&format!(
                "{SELECT_COLUMNS}
                 WHERE (participant_a = ?1 AND participant_b = ?2)
                    OR (participant_a = ?2 AND participant_b = ?1)"
            ))?;
            let mut rows = stmt.query([a.get(), b.get()])?;
            match rows.next()? {
                Some(row) => Ok((row_to_conversation(row)?, inserted == 1)),
                None => Err(StoreError::Database(format!("conversation {a}/{b} vanished after insert"))),
            }
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn find(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.get()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_conversation(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Conversations the user participates in, newest first.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_for_user(&self, user: UserId) -> Result<Vec<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE participant_a = ?1 OR participant_b = ?1 ORDER BY id DESC"
            ))?;
            let mut rows = stmt.query([user.get()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_conversation(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> Result<Conversation, StoreError> {
    let created_at: String = row_helpers::get(row, 3, "conversations", "created_at")?;
    Ok(Conversation {
        id: ConversationId(row_helpers::get(row, 0, "conversations", "id")?),
        participant_a: UserId(row_helpers::get(row, 1, "conversations", "participant_a")?),
        participant_b: UserId(row_helpers::get(row, 2, "conversations", "participant_b")?),
        created_at: row_helpers::parse_timestamp(&created_at, "conversations", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryRepo;
    use convoy_core::model::Role;

    fn setup() -> (ConversationRepo, UserId, UserId, UserId) {
        let db = Database::in_memory().unwrap();
        let dir = DirectoryRepo::new(db.clone());
        let u1 = dir.create_user("One", "one@example.com", Role::Renter).unwrap().id;
        let u2 = dir.create_user("Two", "two@example.com", Role::Host).unwrap().id;
        let u3 = dir.create_user("Three", "three@example.com", Role::Host).unwrap().id;
        (ConversationRepo::new(db), u1, u2, u3)
    }

    #[test]
    fn first_contact_creates() {
        let (repo, u1, u2, _) = setup();
        let (conv, created) = repo.find_or_create(u1, u2).unwrap();
        assert!(created);
        assert_eq!(conv.participant_a, u1);
        assert_eq!(conv.participant_b, u2);
    }

    #[test]
    fn pair_is_order_invariant() {
        let (repo, u1, u2, _) = setup();
        let (first, _) = repo.find_or_create(u1, u2).unwrap();
        let (second, created) = repo.find_or_create(u2, u1).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn distinct_pairs_get_distinct_conversations() {
        let (repo, u1, u2, u3) = setup();
        let (a, _) = repo.find_or_create(u1, u2).unwrap();
        let (b, _) = repo.find_or_create(u1, u3).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(repo.list_for_user(u1).unwrap().len(), 2);
        assert_eq!(repo.list_for_user(u2).unwrap().len(), 1);
    }

    #[test]
    fn self_pair_rejected() {
        let (repo, u1, _, _) = setup();
        assert!(matches!(repo.find_or_create(u1, u1), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn unique_index_blocks_reversed_duplicate() {
        let (repo, u1, u2, _) = setup();
        repo.find_or_create(u1, u2).unwrap();
        let result = repo.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO conversations (participant_a, participant_b, created_at) VALUES (?1, ?2, 'x')",
                [u2.get(), u1.get()],
            )?)
        });
        assert!(result.is_err());
    }

    #[test]
    fn concurrent_first_contact_converges() {
        let (repo, u1, u2, _) = setup();
        let repo = std::sync::Arc::new(repo);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = repo.clone();
                std::thread::spawn(move || {
                    let (a, b) = if i % 2 == 0 { (u1, u2) } else { (u2, u1) };
                    repo.find_or_create(a, b).unwrap().0.id
                })
            })
            .collect();
        let ids: Vec<ConversationId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(repo.list_for_user(u1).unwrap().len(), 1);
    }

    #[test]
    fn find_missing_returns_none() {
        let (repo, _, _, _) = setup();
        assert!(repo.find(ConversationId(404)).unwrap().is_none());
    }
}
