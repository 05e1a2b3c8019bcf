//! Scripted stand-ins for the REST API, the transport and the host
//! application hooks, for deterministic session tests without a server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use convoy_core::ids::{ConversationId, MessageId, UserId};
use convoy_core::model::{
    ChatIntent, ConversationContext, ConversationSummary, Counterpart, HistoryPage, Message, MessageKind, Resolution,
};
use convoy_core::{ClientEnvelope, ServerEnvelope};

use crate::api::ChatApi;
use crate::credentials::CredentialProvider;
use crate::error::{ApiClientError, TransportError};
use crate::log::LogEntry;
use crate::notify::Notifier;
use crate::resource::SessionResource;
use crate::transport::{link_pair, CloseReason, LinkDriver, Outbound, Transport, TransportEvent, TransportLink};

/// REST API that always resolves to one conversation with one counterpart.
pub struct MockApi {
    conversation_id: ConversationId,
    counterpart: UserId,
    history: Mutex<Vec<Message>>,
    fail_resolves: AtomicUsize,
    resolve_calls: AtomicUsize,
}

impl MockApi {
    pub fn new(conversation_id: ConversationId, counterpart: UserId) -> Self {
        Self {
            conversation_id,
            counterpart,
            history: Mutex::new(Vec::new()),
            fail_resolves: AtomicUsize::new(0),
            resolve_calls: AtomicUsize::new(0),
        }
    }

    pub fn message(id: i64, sender: UserId, content: &str) -> Message {
        Message {
            id: MessageId(id),
            conversation_id: ConversationId(0),
            sender_id: sender,
            content: content.into(),
            kind: MessageKind::Text,
            created_at: Utc::now(),
            client_message_id: None,
        }
    }

    /// Messages served by `history`; their conversation id is overwritten.
    pub fn set_history(&self, messages: Vec<Message>) {
        *self.history.lock() = messages
            .into_iter()
            .map(|m| Message {
                conversation_id: self.conversation_id,
                ..m
            })
            .collect();
    }

    pub fn fail_next_resolve(&self) {
        self.fail_resolves.fetch_add(1, Ordering::SeqCst);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for MockApi {
    async fn resolve(&self, _intent: &ChatIntent) -> Result<Resolution, ApiClientError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_resolves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ApiClientError::Http("mock: connection refused".into()));
        }
        Ok(Resolution {
            conversation_id: self.conversation_id,
            counterpart: Counterpart {
                id: self.counterpart,
                name: "Ben".into(),
            },
            context: ConversationContext::default(),
            created: false,
        })
    }

    async fn history(&self, conversation: ConversationId, page: u32, limit: u32) -> Result<HistoryPage, ApiClientError> {
        let all = self.history.lock().clone();
        let total = all.len() as u64;
        let start = (page.max(1) as usize - 1) * limit as usize;
        let messages = all
            .into_iter()
            .filter(|m| m.conversation_id == conversation)
            .skip(start)
            .take(limit as usize)
            .collect();
        Ok(HistoryPage {
            messages,
            page,
            limit,
            total,
        })
    }

    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiClientError> {
        Ok(vec![ConversationSummary {
            id: self.conversation_id,
            counterpart: Counterpart {
                id: self.counterpart,
                name: "Ben".into(),
            },
            created_at: Utc::now(),
        }])
    }
}

/// Outcome of one `connect` call.
#[derive(Clone, Debug)]
pub enum MockConnect {
    Accept,
    Fail(TransportError),
}

/// Transport that pops scripted outcomes, then falls back to a default.
pub struct MockTransport {
    user_id: UserId,
    script: Mutex<VecDeque<MockConnect>>,
    default: Mutex<MockConnect>,
    peers: Mutex<Vec<MockPeer>>,
    credentials: Mutex<Vec<String>>,
    join_refusal: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(MockConnect::Accept),
            peers: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            join_refusal: Mutex::new(None),
        }
    }

    pub fn script(&self, outcomes: Vec<MockConnect>) {
        self.script.lock().extend(outcomes);
    }

    pub fn set_default(&self, outcome: MockConnect) {
        *self.default.lock() = outcome;
    }

    /// Answer every later `join_conversation` with an error carrying `code`.
    pub fn refuse_joins(&self, code: &str) {
        *self.join_refusal.lock() = Some(code.to_string());
    }

    pub fn connect_count(&self) -> usize {
        self.credentials.lock().len()
    }

    /// Credentials presented to `connect`, in call order.
    pub fn credentials_seen(&self) -> Vec<String> {
        self.credentials.lock().clone()
    }

    /// The `index`th accepted link, counting from zero.
    pub fn peer(&self, index: usize) -> MockPeer {
        self.peers.lock()[index].clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _url: &str, credential: &SecretString) -> Result<TransportLink, TransportError> {
        self.credentials.lock().push(credential.expose_secret().to_string());
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());
        match outcome {
            MockConnect::Accept => {
                let (link, driver) = link_pair(self.user_id);
                let refusal = self.join_refusal.lock().clone();
                self.peers.lock().push(MockPeer::spawn(driver, refusal));
                Ok(link)
            }
            MockConnect::Fail(e) => Err(e),
        }
    }
}

/// Server side of an accepted mock link. Joins are answered with
/// `conversation_joined` unless the transport was told to refuse them.
#[derive(Clone)]
pub struct MockPeer {
    events: mpsc::Sender<TransportEvent>,
    close: CancellationToken,
    sent: Arc<Mutex<Vec<ClientEnvelope>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockPeer {
    fn spawn(driver: LinkDriver, join_refusal: Option<String>) -> Self {
        let LinkDriver {
            mut outbound,
            events,
            close,
        } = driver;
        let peer = Self {
            events,
            close: close.clone(),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_writes: Arc::new(AtomicBool::new(false)),
        };

        let sent = Arc::clone(&peer.sent);
        let fail_writes = Arc::clone(&peer.fail_writes);
        let replies = peer.events.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = close.cancelled() => break,
                    item = outbound.recv() => item,
                };
                let Some(Outbound { envelope, ack }) = item else {
                    break;
                };
                if fail_writes.load(Ordering::SeqCst) {
                    let _ = ack.send(Err(TransportError::Send("mock write failure".into())));
                    continue;
                }
                sent.lock().push(envelope.clone());
                let _ = ack.send(Ok(()));

                if let ClientEnvelope::JoinConversation { conversation_id } = envelope {
                    let reply = match &join_refusal {
                        Some(code) => ServerEnvelope::Error {
                            message: "Access denied".into(),
                            code: Some(code.clone()),
                            client_message_id: None,
                        },
                        None => ServerEnvelope::ConversationJoined { conversation_id },
                    };
                    let _ = replies.send(TransportEvent::Envelope(reply)).await;
                }
            }
        });
        peer
    }

    pub async fn push(&self, envelope: ServerEnvelope) {
        let _ = self.events.send(TransportEvent::Envelope(envelope)).await;
    }

    /// Simulate the connection dropping under the client.
    pub async fn drop_connection(&self) {
        self.close.cancel();
        let _ = self
            .events
            .send(TransportEvent::Closed(CloseReason::Lost("mock: connection dropped".into())))
            .await;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientEnvelope> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Hands out `token-N`, where N counts successful refreshes.
#[derive(Default)]
pub struct MockCredentials {
    refreshes: AtomicUsize,
    refresh_fails: AtomicBool,
}

impl MockCredentials {
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.refresh_fails.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CredentialProvider for MockCredentials {
    async fn current(&self) -> Result<SecretString, ApiClientError> {
        Ok(SecretString::from(format!("token-{}", self.refresh_count())))
    }

    async fn refresh(&self) -> Result<SecretString, ApiClientError> {
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(ApiClientError::Refresh("mock: refresh token revoked".into()));
        }
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SecretString::from(format!("token-{n}")))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notified: Mutex<Vec<LogEntry>>,
}

impl RecordingNotifier {
    pub fn notified(&self) -> Vec<LogEntry> {
        self.notified.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, entry: &LogEntry) -> Result<(), String> {
        self.notified.lock().push(entry.clone());
        Ok(())
    }
}

/// Resource that counts how often it was released.
#[derive(Clone)]
pub struct CountingResource {
    name: String,
    releases: Arc<AtomicUsize>,
}

impl CountingResource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl SessionResource for CountingResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
