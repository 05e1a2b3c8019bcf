use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use convoy_core::ids::{ConnectionId, UserId};
use convoy_core::ServerEnvelope;

/// The live connection held for one user.
struct Entry {
    connection_id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
}

/// Snapshot of a registry entry.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

/// Directory of live connections, at most one per user.
///
/// Registering a user that already has an entry replaces it. The replaced
/// entry's sender is dropped, so its writer drains and closes.
pub struct ConnectionRegistry {
    entries: DashMap<UserId, Entry>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a connection for `user_id`, superseding any previous one.
    pub fn register(&self, user_id: UserId) -> (ConnectionId, mpsc::Receiver<String>) {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let entry = Entry {
            connection_id: connection_id.clone(),
            tx,
            connected_at: Utc::now(),
        };
        if let Some(previous) = self.entries.insert(user_id, entry) {
            tracing::info!(
                user_id = %user_id,
                superseded = %previous.connection_id,
                connection_id = %connection_id,
                "Connection superseded"
            );
        }
        (connection_id, rx)
    }

    /// Remove the user's entry only if it still belongs to `connection_id`.
    pub fn unregister_if(&self, user_id: UserId, connection_id: &ConnectionId) -> bool {
        self.entries
            .remove_if(&user_id, |_, entry| &entry.connection_id == connection_id)
            .is_some()
    }

    /// Outbound handle for the user's current connection, if it is the given one.
    pub fn sender_for(&self, user_id: UserId, connection_id: &ConnectionId) -> Option<mpsc::WeakSender<String>> {
        self.entries
            .get(&user_id)
            .filter(|entry| &entry.connection_id == connection_id)
            .map(|entry| entry.tx.downgrade())
    }

    /// Push an envelope to the user's connection. Never waits: a full queue
    /// or a missing entry drops the envelope and returns `false`.
    pub fn send_to(&self, user_id: UserId, envelope: &ServerEnvelope) -> bool {
        let Some(entry) = self.entries.get(&user_id) else {
            return false;
        };
        let json = match envelope.encode() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Failed to encode envelope");
                return false;
            }
        };
        match entry.tx.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    user_id = %user_id,
                    connection_id = %entry.connection_id,
                    msg_len = msg.len(),
                    "Send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.entries.get(&user_id).is_some_and(|entry| !entry.tx.is_closed())
    }

    pub fn info(&self, user_id: UserId) -> Option<ConnectionInfo> {
        self.entries.get(&user_id).map(|entry| ConnectionInfo {
            user_id,
            connection_id: entry.connection_id.clone(),
            connected_at: entry.connected_at,
        })
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry. Each writer observes its channel closing.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove entries whose receiving side has gone away.
    pub fn sweep_closed(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|user_id, entry| {
            let alive = !entry.tx.is_closed();
            if !alive {
                tracing::info!(user_id = %user_id, connection_id = %entry.connection_id, "Swept closed connection");
            }
            alive
        });
        before.saturating_sub(self.entries.len())
    }
}

/// Periodically sweep closed entries until `cancel` fires.
pub fn start_sweep_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.sweep_closed();
                    if removed > 0 {
                        tracing::info!(removed, "Registry sweep");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ids::ConversationId;

    fn typing(user: i64) -> ServerEnvelope {
        ServerEnvelope::TypingIndicator {
            conversation_id: ConversationId(7),
            user_id: UserId(user),
            is_typing: true,
        }
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new(32);
        let (c1, _rx1) = registry.register(UserId(1));
        let (_c2, _rx2) = registry.register(UserId(2));
        assert_eq!(registry.count(), 2);

        assert!(registry.unregister_if(UserId(1), &c1));
        assert_eq!(registry.count(), 1);
        assert!(!registry.is_connected(UserId(1)));
    }

    #[tokio::test]
    async fn newer_connection_supersedes_older() {
        let registry = ConnectionRegistry::new(32);
        let (old, mut old_rx) = registry.register(UserId(1));
        let (new, mut new_rx) = registry.register(UserId(1));
        assert_eq!(registry.count(), 1);

        // The old channel is closed once its sender is dropped
        assert!(old_rx.recv().await.is_none());

        assert!(registry.send_to(UserId(1), &typing(2)));
        assert!(new_rx.recv().await.is_some());

        // A late disconnect from the old connection must not evict the new one
        assert!(!registry.unregister_if(UserId(1), &old));
        assert_eq!(registry.info(UserId(1)).unwrap().connection_id, new);
    }

    #[test]
    fn send_to_absent_user_is_dropped() {
        let registry = ConnectionRegistry::new(32);
        assert!(!registry.send_to(UserId(9), &typing(1)));
    }

    #[test]
    fn full_queue_drops() {
        let registry = ConnectionRegistry::new(2);
        let (_c, _rx) = registry.register(UserId(1));
        assert!(registry.send_to(UserId(1), &typing(2)));
        assert!(registry.send_to(UserId(1), &typing(2)));
        assert!(!registry.send_to(UserId(1), &typing(2)));
    }

    #[test]
    fn sweep_removes_closed_entries() {
        let registry = ConnectionRegistry::new(8);
        let (_c1, rx1) = registry.register(UserId(1));
        let (_c2, _rx2) = registry.register(UserId(2));
        drop(rx1);
        assert_eq!(registry.sweep_closed(), 1);
        assert!(registry.info(UserId(1)).is_none());
        assert!(registry.is_connected(UserId(2)));
    }

    #[tokio::test]
    async fn clear_closes_every_channel() {
        let registry = ConnectionRegistry::new(8);
        let (_c, mut rx) = registry.register(UserId(1));
        registry.clear();
        assert_eq!(registry.count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn sender_for_matches_connection() {
        let registry = ConnectionRegistry::new(8);
        let (old, _rx_old) = registry.register(UserId(1));
        let (new, _rx_new) = registry.register(UserId(1));
        assert!(registry.sender_for(UserId(1), &old).is_none());
        assert!(registry.sender_for(UserId(1), &new).is_some());
    }
}
