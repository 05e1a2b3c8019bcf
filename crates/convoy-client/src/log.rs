//! Ordered local message log.
//!
//! One task owns the entries; everything else talks to it through a command
//! queue, so optimistic appends, confirmations, rollbacks and incoming
//! messages are applied strictly in arrival order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use convoy_core::ids::{ClientMessageId, ConversationId, MessageId, UserId};
use convoy_core::model::{Message, MessageKind};

use crate::error::OutgoingMessage;

const COMMAND_QUEUE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Shown locally, not yet acknowledged by the server.
    Pending,
    Sent,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: Option<MessageId>,
    pub client_message_id: Option<ClientMessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl LogEntry {
    pub fn from_message(message: Message, sender_name: Option<String>) -> Self {
        Self {
            id: Some(message.id),
            client_message_id: message.client_message_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            sender_name,
            content: message.content,
            kind: message.kind,
            timestamp: message.created_at,
            status: DeliveryStatus::Sent,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }
}

enum Command {
    Load {
        history: Vec<Message>,
        reply: oneshot::Sender<Vec<(ClientMessageId, MessageId)>>,
    },
    AppendPending(LogEntry),
    AppendIncoming {
        entry: LogEntry,
        reply: oneshot::Sender<bool>,
    },
    Confirm {
        client_message_id: ClientMessageId,
        id: MessageId,
        timestamp: DateTime<Utc>,
        reply: oneshot::Sender<bool>,
    },
    Rollback {
        client_message_id: ClientMessageId,
        reply: oneshot::Sender<Option<OutgoingMessage>>,
    },
    Snapshot(oneshot::Sender<Vec<LogEntry>>),
    NewestId(oneshot::Sender<Option<MessageId>>),
    PendingIds(oneshot::Sender<Vec<ClientMessageId>>),
    Clear,
}

/// Handle to the log task. The task exits when the last handle is dropped.
#[derive(Clone)]
pub struct MessageLog {
    tx: mpsc::Sender<Command>,
}

impl MessageLog {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Merge fetched history. Entries already present are skipped; a stored
    /// message carrying a pending entry's correlation id confirms it in place.
    /// Returns the entries confirmed that way.
    pub async fn load(&self, history: Vec<Message>) -> Vec<(ClientMessageId, MessageId)> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Load { history, reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn append_pending(&self, entry: LogEntry) {
        let _ = self.tx.send(Command::AppendPending(entry)).await;
    }

    /// Append a server message unless its id is already in the log.
    pub async fn append_incoming(&self, entry: LogEntry) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::AppendIncoming { entry, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Mark a pending entry as persisted under its server id.
    pub async fn confirm(&self, client_message_id: ClientMessageId, id: MessageId, timestamp: DateTime<Utc>) -> bool {
        let (reply, rx) = oneshot::channel();
        let command = Command::Confirm {
            client_message_id,
            id,
            timestamp,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Remove a pending entry and hand back what it carried.
    pub async fn rollback(&self, client_message_id: ClientMessageId) -> Option<OutgoingMessage> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Rollback {
            client_message_id,
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Drop every entry, e.g. when the session switches conversation.
    pub async fn clear(&self) {
        let _ = self.tx.send(Command::Clear).await;
    }

    pub async fn snapshot(&self) -> Vec<LogEntry> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Highest server id held, ignoring pending entries.
    pub async fn newest_id(&self) -> Option<MessageId> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::NewestId(reply)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn pending_ids(&self) -> Vec<ClientMessageId> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::PendingIds(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut entries: Vec<LogEntry> = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::Load { history, reply } => {
                let mut confirmed = Vec::new();
                for message in history {
                    if contains_id(&entries, message.id) {
                        continue;
                    }
                    let pending = message
                        .client_message_id
                        .as_ref()
                        .and_then(|cid| pending_position(&entries, cid));
                    match pending {
                        Some(i) => {
                            let entry = &mut entries[i];
                            entry.id = Some(message.id);
                            entry.timestamp = message.created_at;
                            entry.status = DeliveryStatus::Sent;
                            if let Some(cid) = entry.client_message_id.clone() {
                                confirmed.push((cid, message.id));
                            }
                        }
                        None => entries.push(LogEntry::from_message(message, None)),
                    }
                }
                entries.sort_by_key(|e| (e.is_pending(), e.id));
                let _ = reply.send(confirmed);
            }
            Command::AppendPending(entry) => entries.push(entry),
            Command::AppendIncoming { entry, reply } => {
                let fresh = !matches!(entry.id, Some(id) if contains_id(&entries, id));
                if fresh {
                    entries.push(entry);
                }
                let _ = reply.send(fresh);
            }
            Command::Confirm {
                client_message_id,
                id,
                timestamp,
                reply,
            } => {
                let found = pending_position(&entries, &client_message_id).map(|i| {
                    let entry = &mut entries[i];
                    entry.id = Some(id);
                    entry.timestamp = timestamp;
                    entry.status = DeliveryStatus::Sent;
                });
                let _ = reply.send(found.is_some());
            }
            Command::Rollback {
                client_message_id,
                reply,
            } => {
                let removed = pending_position(&entries, &client_message_id).map(|i| {
                    let entry = entries.remove(i);
                    OutgoingMessage {
                        content: entry.content,
                        kind: entry.kind,
                    }
                });
                let _ = reply.send(removed);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(entries.clone());
            }
            Command::NewestId(reply) => {
                let _ = reply.send(entries.iter().filter_map(|e| e.id).max());
            }
            Command::PendingIds(reply) => {
                let ids = entries
                    .iter()
                    .filter(|e| e.is_pending())
                    .filter_map(|e| e.client_message_id.clone())
                    .collect();
                let _ = reply.send(ids);
            }
            Command::Clear => entries.clear(),
        }
    }
}

fn contains_id(entries: &[LogEntry], id: MessageId) -> bool {
    entries.iter().any(|e| e.id == Some(id))
}

fn pending_position(entries: &[LogEntry], client_message_id: &ClientMessageId) -> Option<usize> {
    entries
        .iter()
        .position(|e| e.is_pending() && e.client_message_id.as_ref() == Some(client_message_id))
}
