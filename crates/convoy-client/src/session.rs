//! Client session controller: one conversation, one realtime link.
//!
//! States move `Disconnected → Connecting → Connected`; a lost link enters
//! `Reconnecting { attempt }` and either returns to `Connected` or ends in a
//! terminal `Disconnected` that only `reconnect()` or `retry_initialize()`
//! leaves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use convoy_core::ids::{ClientMessageId, ConversationId, MessageId, UserId};
use convoy_core::model::{ChatIntent, Message, MessageKind, Resolution};
use convoy_core::{AuthFailure, ClientEnvelope, ServerEnvelope};

use crate::api::{ChatApi, HttpChatApi};
use crate::config::SessionConfig;
use crate::credentials::CredentialProvider;
use crate::error::{ApiClientError, OutgoingMessage, SessionError, TransportError};
use crate::log::{DeliveryStatus, LogEntry, MessageLog};
use crate::notify::{LogNotifier, Notifier};
use crate::resource::{ResourceSet, SessionResource};
use crate::transport::{CloseReason, LinkSender, Transport, TransportEvent, TransportLink, WsTransport};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Whether the counterpart is typing. Never written to the message log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TypingState {
    pub user_id: Option<UserId>,
    pub is_typing: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthRejected(AuthFailure),
    AttemptsExhausted(u32),
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    Joined(ConversationId),
    MessageReceived(LogEntry),
    MessageConfirmed {
        client_message_id: ClientMessageId,
        id: MessageId,
    },
    SendRejected {
        client_message_id: ClientMessageId,
        payload: Option<OutgoingMessage>,
        code: Option<String>,
        message: String,
    },
    ServerError {
        code: Option<String>,
        message: String,
    },
    InitializationFailed(String),
    Reconnected,
    Disconnected(DisconnectReason),
}

pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    api: Arc<dyn ChatApi>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    notifier: Arc<dyn Notifier>,
    log: MessageLog,
    resources: ResourceSet,
    state: watch::Sender<SessionState>,
    typing: watch::Sender<TypingState>,
    events: broadcast::Sender<SessionEvent>,
    active: Mutex<Active>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

#[derive(Default)]
struct Active {
    intent: Option<ChatIntent>,
    resolution: Option<Resolution>,
    user_id: Option<UserId>,
    sender: Option<LinkSender>,
    driver: Option<CancellationToken>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        api: Arc<dyn ChatApi>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (typing, _) = watch::channel(TypingState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                api,
                transport,
                credentials,
                notifier: Arc::new(LogNotifier),
                log: MessageLog::spawn(),
                resources: ResourceSet::default(),
                state,
                typing,
                events,
                active: Mutex::new(Active::default()),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A session talking to a real server over HTTP and WebSocket.
    pub fn connect_http(config: SessionConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self, SessionError> {
        let api = Arc::new(HttpChatApi::new(config.clone(), Arc::clone(&credentials))?);
        let transport = Arc::new(WsTransport::new(config.handshake_timeout));
        Ok(Self::new(config, api, transport, credentials))
    }

    /// Replace the notifier. Only valid before the session is shared.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.notifier = notifier;
        }
        self
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn watch_typing(&self) -> watch::Receiver<TypingState> {
        self.inner.typing.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn conversation(&self) -> Option<Resolution> {
        self.inner.active.lock().resolution.clone()
    }

    pub async fn messages(&self) -> Vec<LogEntry> {
        self.inner.log.snapshot().await
    }

    /// Resolve the conversation, load its first history page and join it
    /// over a fresh link. Any failure is reported once, as `Initialization`.
    pub async fn initialize(&self, intent: ChatIntent) -> Result<Resolution, SessionError> {
        self.ensure_open()?;
        self.inner.active.lock().intent = Some(intent.clone());

        match Arc::clone(&self.inner).start(intent).await {
            Ok(resolution) => Ok(resolution),
            Err(e) => {
                tracing::warn!(error = %e, "Conversation initialization failed");
                self.inner.set_state(SessionState::Disconnected);
                self.inner.emit(SessionEvent::InitializationFailed(e.to_string()));
                Err(SessionError::Initialization(Box::new(e)))
            }
        }
    }

    /// Run `initialize` again with the last intent.
    pub async fn retry_initialize(&self) -> Result<Resolution, SessionError> {
        let intent = self.inner.active.lock().intent.clone();
        match intent {
            Some(intent) => self.initialize(intent).await,
            None => Err(SessionError::NotInitialized),
        }
    }

    /// Leave a terminal `Disconnected` state. No-op while a link is up or
    /// being re-established.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state() != SessionState::Disconnected {
            return Ok(());
        }
        let conversation_id = self.conversation_id()?;
        let in_flight = self.inner.log.pending_ids().await;

        self.inner.set_state(SessionState::Connecting);
        let link = match self.inner.join(conversation_id).await {
            Ok(link) => link,
            Err(e) => {
                self.inner.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };
        if !Arc::clone(&self.inner).attach(link) {
            return Err(SessionError::Closed);
        }
        self.inner.catch_up(conversation_id, in_flight).await;
        tracing::info!(conversation_id = %conversation_id, "Chat session reconnected by user");
        Ok(())
    }

    /// Show the message locally, then transmit it. If the link cannot take
    /// it, the local entry is removed and the payload comes back in the error.
    pub async fn send(&self, content: impl Into<String>, kind: MessageKind) -> Result<ClientMessageId, SessionError> {
        self.ensure_open()?;
        let content = content.into();
        let (conversation_id, user_id, sender) = {
            let active = self.inner.active.lock();
            let (Some(resolution), Some(user_id)) = (active.resolution.as_ref(), active.user_id) else {
                return Err(SessionError::NotInitialized);
            };
            (resolution.conversation_id, user_id, active.sender.clone())
        };

        let client_message_id = ClientMessageId::new();
        self.inner
            .log
            .append_pending(LogEntry {
                id: None,
                client_message_id: Some(client_message_id.clone()),
                conversation_id,
                sender_id: user_id,
                sender_name: None,
                content: content.clone(),
                kind,
                timestamp: Utc::now(),
                status: DeliveryStatus::Pending,
            })
            .await;

        let envelope = ClientEnvelope::SendMessage {
            conversation_id,
            content: content.clone(),
            message_type: kind.as_str().to_string(),
            client_message_id: Some(client_message_id.clone()),
        };
        let written = match sender {
            Some(sender) => sender.send(envelope).await,
            None => Err(TransportError::NotConnected),
        };

        if let Err(source) = written {
            tracing::warn!(error = %source, client_message_id = %client_message_id, "Send failed, rolling back");
            let payload = self
                .inner
                .log
                .rollback(client_message_id)
                .await
                .unwrap_or(OutgoingMessage { content, kind });
            return Err(SessionError::SendFailed { payload, source });
        }
        Ok(client_message_id)
    }

    pub async fn set_typing(&self, is_typing: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        let conversation_id = self.conversation_id()?;
        let sender = self.inner.active.lock().sender.clone();
        let sender = sender.ok_or(TransportError::NotConnected)?;
        sender
            .send(ClientEnvelope::Typing {
                conversation_id,
                is_typing,
            })
            .await?;
        Ok(())
    }

    /// Keep `resource` until the session closes. After close it is
    /// released immediately.
    pub fn attach_resource(&self, resource: Box<dyn SessionResource>) -> Result<(), SessionError> {
        match self.inner.resources.attach(resource) {
            Ok(()) => Ok(()),
            Err(resource) => {
                resource.release();
                Err(SessionError::Closed)
            }
        }
    }

    /// Close the link, stop reconnecting and release attached resources.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.detach();
        let released = self.inner.resources.release_all();
        self.inner.set_state(SessionState::Disconnected);
        tracing::info!(released, "Chat session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn conversation_id(&self) -> Result<ConversationId, SessionError> {
        self.inner
            .active
            .lock()
            .resolution
            .as_ref()
            .map(|r| r.conversation_id)
            .ok_or(SessionError::NotInitialized)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, current = ?state, "Session state changed");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn conversation_id(&self) -> Option<ConversationId> {
        self.active.lock().resolution.as_ref().map(|r| r.conversation_id)
    }

    fn local_user(&self) -> Option<UserId> {
        self.active.lock().user_id
    }

    async fn start(self: Arc<Self>, intent: ChatIntent) -> Result<Resolution, SessionError> {
        self.detach();
        self.set_state(SessionState::Connecting);

        let resolution = self.api.resolve(&intent).await?;
        let conversation_id = resolution.conversation_id;
        let history = self
            .api
            .history(conversation_id, 1, self.config.history_page_size)
            .await?;

        if self.conversation_id() != Some(conversation_id) {
            self.log.clear().await;
        }
        self.log.load(history.messages).await;

        let mut events = self.events.subscribe();
        let link = self.join(conversation_id).await?;
        self.active.lock().resolution = Some(resolution.clone());
        if !Arc::clone(&self).attach(link) {
            return Err(SessionError::Closed);
        }
        if let Err(e) = self.await_joined(&mut events, conversation_id).await {
            self.detach();
            self.active.lock().resolution = None;
            return Err(e);
        }
        tracing::info!(
            conversation_id = %conversation_id,
            counterpart = %resolution.counterpart.id,
            "Chat session initialized"
        );
        Ok(resolution)
    }

    /// Connect and send `join_conversation`. A credential rejection gets one
    /// refresh and one retry. If the refresh or the retry fails, the
    /// rejection is final.
    async fn join(&self, conversation_id: ConversationId) -> Result<TransportLink, SessionError> {
        let credential = self.credentials.current().await?;
        let failure = match self.open(conversation_id, &credential).await {
            Err(SessionError::Transport(TransportError::Auth(failure))) => failure,
            other => return other,
        };

        tracing::info!(%failure, "Credential rejected, refreshing");
        let refreshed = match self.credentials.refresh().await {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(error = %e, "Credential refresh failed");
                return Err(SessionError::AuthRejected(failure));
            }
        };
        match self.open(conversation_id, &refreshed).await {
            Ok(link) => Ok(link),
            Err(SessionError::Transport(TransportError::Auth(failure))) => Err(SessionError::AuthRejected(failure)),
            Err(e) => {
                tracing::warn!(error = %e, "Retry with refreshed credential failed");
                Err(SessionError::AuthRejected(failure))
            }
        }
    }

    async fn open(&self, conversation_id: ConversationId, credential: &SecretString) -> Result<TransportLink, SessionError> {
        let link = self.transport.connect(&self.config.ws_url(), credential).await?;
        if let Err(e) = link.sender.send(ClientEnvelope::JoinConversation { conversation_id }).await {
            link.sender.close();
            return Err(e.into());
        }
        Ok(link)
    }

    /// Wait for the server to accept the join sent by `open`.
    async fn await_joined(
        &self,
        events: &mut broadcast::Receiver<SessionEvent>,
        conversation_id: ConversationId,
    ) -> Result<(), SessionError> {
        let reply = async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Joined(id)) if id == conversation_id => return Ok(()),
                    Ok(SessionEvent::ServerError { code, message }) => {
                        return Err(SessionError::JoinRejected { code, message })
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Err(SessionError::Transport(TransportError::Closed)),
                }
            }
        };
        match tokio::time::timeout(self.config.handshake_timeout, reply).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Handshake("no reply to join_conversation".into()).into()),
        }
    }

    /// Install `link` as the live link and start its event loop. Returns
    /// false, closing the link, if the session was closed meanwhile.
    fn attach(self: Arc<Self>, link: TransportLink) -> bool {
        let TransportLink {
            user_id,
            sender,
            events,
        } = link;
        let cancel = self.shutdown.child_token();
        {
            let mut active = self.active.lock();
            if cancel.is_cancelled() {
                sender.close();
                return false;
            }
            active.user_id = Some(user_id);
            if let Some(previous) = active.sender.replace(sender) {
                previous.close();
            }
            if let Some(previous) = active.driver.replace(cancel.clone()) {
                previous.cancel();
            }
        }
        self.set_state(SessionState::Connected);
        tokio::spawn(self.drive(events, cancel));
        true
    }

    /// Stop the event loop and close the live link, if any.
    fn detach(&self) {
        let mut active = self.active.lock();
        if let Some(driver) = active.driver.take() {
            driver.cancel();
        }
        if let Some(sender) = active.sender.take() {
            sender.close();
        }
    }

    async fn drive(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>, cancel: CancellationToken) {
        loop {
            let Some(reason) = self.pump(&mut events, &cancel).await else {
                return;
            };
            if cancel.is_cancelled() {
                return;
            }
            tracing::warn!(?reason, "Chat link lost");
            if let Some(sender) = self.active.lock().sender.take() {
                sender.close();
            }
            let in_flight = self.log.pending_ids().await;

            let Some(link) = self.reconnect(&cancel).await else {
                return;
            };
            let Some(next) = self.install(link, &cancel) else {
                return;
            };
            events = next;
            self.emit(SessionEvent::Reconnected);
            if let Some(conversation_id) = self.conversation_id() {
                self.catch_up(conversation_id, in_flight).await;
            }
        }
    }

    /// Swap in a re-established link, unless the session was closed while
    /// it was being opened.
    fn install(&self, link: TransportLink, cancel: &CancellationToken) -> Option<mpsc::Receiver<TransportEvent>> {
        let TransportLink {
            user_id,
            sender,
            events,
        } = link;
        let mut active = self.active.lock();
        if cancel.is_cancelled() {
            sender.close();
            return None;
        }
        active.user_id = Some(user_id);
        active.sender = Some(sender);
        self.set_state(SessionState::Connected);
        Some(events)
    }

    /// Handle events until the link closes. `None` means the loop was cancelled.
    async fn pump(&self, events: &mut mpsc::Receiver<TransportEvent>, cancel: &CancellationToken) -> Option<CloseReason> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                event = events.recv() => event,
            };
            match event {
                Some(TransportEvent::Envelope(envelope)) => self.handle(envelope).await,
                Some(TransportEvent::Closed(reason)) => return Some(reason),
                None => return Some(CloseReason::Lost("link dropped".into())),
            }
        }
    }

    /// Bounded reconnect with a fixed delay. Returns the new joined link, or
    /// `None` after moving to terminal `Disconnected` or on cancellation.
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<TransportLink> {
        let conversation_id = self.conversation_id()?;
        let max = self.config.max_reconnect_attempts;

        for attempt in 1..=max {
            self.set_state(SessionState::Reconnecting { attempt });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = self.join(conversation_id) => result,
            };
            match result {
                Ok(link) => {
                    tracing::info!(attempt, "Chat link re-established");
                    return Some(link);
                }
                Err(SessionError::AuthRejected(failure)) => {
                    self.disconnect(DisconnectReason::AuthRejected(failure));
                    return None;
                }
                Err(e) => tracing::warn!(attempt, max, error = %e, "Reconnect attempt failed"),
            }
        }

        self.disconnect(DisconnectReason::AttemptsExhausted(max));
        None
    }

    fn disconnect(&self, reason: DisconnectReason) {
        tracing::warn!(?reason, "Chat session disconnected");
        self.active.lock().driver = None;
        self.set_state(SessionState::Disconnected);
        self.emit(SessionEvent::Disconnected(reason));
    }

    /// Load what was stored while the link was down, then settle the sends
    /// that were in flight on the lost link: a stored copy confirms one, the
    /// rest are rolled back. Nothing is rolled back if history is unavailable.
    async fn catch_up(&self, conversation_id: ConversationId, in_flight: Vec<ClientMessageId>) {
        let missed = match self.missed_messages(conversation_id).await {
            Ok(missed) => missed,
            Err(e) => {
                tracing::warn!(error = %e, "History catch-up failed");
                return;
            }
        };
        for (client_message_id, id) in self.log.load(missed).await {
            self.emit(SessionEvent::MessageConfirmed { client_message_id, id });
        }

        let pending = self.log.pending_ids().await;
        for client_message_id in in_flight.into_iter().filter(|id| pending.contains(id)) {
            let payload = self.log.rollback(client_message_id.clone()).await;
            tracing::warn!(client_message_id = %client_message_id, "Message lost with the link");
            self.emit(SessionEvent::SendRejected {
                client_message_id,
                payload,
                code: None,
                message: "message was not delivered before the connection dropped".into(),
            });
        }
    }

    /// Walk history backward from the last page until reaching a message
    /// the log already holds, or the first page.
    async fn missed_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>, ApiClientError> {
        let limit = self.config.history_page_size.max(1);
        let known = self.log.newest_id().await;
        let first = self.api.history(conversation_id, 1, limit).await?;
        let last = first.total.div_ceil(u64::from(limit)).max(1) as u32;

        let mut missed = Vec::new();
        let mut page = last;
        while page > 1 {
            let fetched = self.api.history(conversation_id, page, limit).await?;
            let reached = fetched.messages.iter().any(|m| matches!(known, Some(k) if m.id <= k));
            missed.extend(fetched.messages);
            if reached {
                return Ok(missed);
            }
            page -= 1;
        }
        missed.extend(first.messages);
        Ok(missed)
    }

    async fn handle(&self, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::ConnectionEstablished { .. } => {}
            ServerEnvelope::ConversationJoined { conversation_id } => {
                self.emit(SessionEvent::Joined(conversation_id));
            }
            ServerEnvelope::NewMessage {
                id,
                conversation_id,
                sender_id,
                sender_name,
                content,
                message_type,
                timestamp,
            } => {
                if self.conversation_id() != Some(conversation_id) {
                    tracing::debug!(conversation_id = %conversation_id, "Ignoring message for another conversation");
                    return;
                }
                let entry = LogEntry {
                    id: Some(id),
                    client_message_id: None,
                    conversation_id,
                    sender_id,
                    sender_name: Some(sender_name),
                    content,
                    kind: message_type,
                    timestamp,
                    status: DeliveryStatus::Sent,
                };
                if !self.log.append_incoming(entry.clone()).await {
                    return;
                }
                if self.local_user() != Some(sender_id) {
                    if let Err(e) = self.notifier.notify(&entry) {
                        tracing::warn!(error = %e, "Notification failed");
                    }
                }
                self.emit(SessionEvent::MessageReceived(entry));
            }
            ServerEnvelope::TypingIndicator {
                conversation_id,
                user_id,
                is_typing,
            } => {
                if self.conversation_id() == Some(conversation_id) && self.local_user() != Some(user_id) {
                    self.typing.send_replace(TypingState {
                        user_id: Some(user_id),
                        is_typing,
                    });
                }
            }
            ServerEnvelope::MessageSent {
                client_message_id: Some(client_message_id),
                id,
                timestamp,
                ..
            } => {
                if self.log.confirm(client_message_id.clone(), id, timestamp).await {
                    self.emit(SessionEvent::MessageConfirmed { client_message_id, id });
                }
            }
            ServerEnvelope::MessageSent { .. } => {}
            ServerEnvelope::Error {
                message,
                code,
                client_message_id: Some(client_message_id),
            } => {
                let payload = self.log.rollback(client_message_id.clone()).await;
                tracing::warn!(client_message_id = %client_message_id, %message, "Server rejected message");
                self.emit(SessionEvent::SendRejected {
                    client_message_id,
                    payload,
                    code,
                    message,
                });
            }
            ServerEnvelope::Error { message, code, .. } => {
                tracing::warn!(?code, %message, "Server error");
                self.emit(SessionEvent::ServerError { code, message });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::mock::{CountingResource, MockApi, MockConnect, MockCredentials, MockTransport, RecordingNotifier};
    use crate::transport::link_pair;

    const LOCAL: UserId = UserId(1);
    const REMOTE: UserId = UserId(2);
    const CONVERSATION: ConversationId = ConversationId(7);
    const WAIT: Duration = Duration::from_secs(60);

    struct Harness {
        session: SessionController,
        api: Arc<MockApi>,
        transport: Arc<MockTransport>,
        credentials: Arc<MockCredentials>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        harness_with(SessionConfig::default())
    }

    fn harness_with(config: SessionConfig) -> Harness {
        let api = Arc::new(MockApi::new(CONVERSATION, REMOTE));
        let transport = Arc::new(MockTransport::new(LOCAL));
        let credentials = Arc::new(MockCredentials::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let session = SessionController::new(
            config,
            api.clone(),
            transport.clone(),
            credentials.clone(),
        )
        .with_notifier(notifier.clone());
        Harness {
            session,
            api,
            transport,
            credentials,
            notifier,
        }
    }

    fn direct() -> ChatIntent {
        ChatIntent::DirectParticipant { participant_id: REMOTE }
    }

    fn incoming(id: i64, sender: UserId, content: &str) -> ServerEnvelope {
        ServerEnvelope::NewMessage {
            id: MessageId(id),
            conversation_id: CONVERSATION,
            sender_id: sender,
            sender_name: "Ben".into(),
            content: content.into(),
            message_type: MessageKind::Text,
            timestamp: Utc::now(),
        }
    }

    async fn wait_state(session: &SessionController, want: SessionState) {
        let mut rx = session.watch_state();
        timeout(WAIT, rx.wait_for(|s| *s == want)).await.unwrap().unwrap();
    }

    async fn next_event<F: Fn(&SessionEvent) -> bool>(rx: &mut broadcast::Receiver<SessionEvent>, want: F) -> SessionEvent {
        timeout(WAIT, async {
            loop {
                let event = rx.recv().await.unwrap();
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn wait_log_len(session: &SessionController, len: usize) {
        timeout(WAIT, async {
            while session.messages().await.len() != len {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn initialize_resolves_loads_history_and_joins() {
        let h = harness();
        h.api.set_history(vec![MockApi::message(100, REMOTE, "earlier")]);

        let resolution = h.session.initialize(direct()).await.unwrap();
        assert_eq!(resolution.conversation_id, CONVERSATION);
        assert_eq!(h.session.state(), SessionState::Connected);

        let messages = h.session.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "earlier");

        let sent = h.transport.peer(0).sent();
        assert_eq!(
            sent,
            vec![ClientEnvelope::JoinConversation {
                conversation_id: CONVERSATION
            }]
        );
    }

    #[tokio::test]
    async fn initialization_failure_is_consolidated_and_retryable() {
        let h = harness();
        h.api.fail_next_resolve();
        let mut events = h.session.subscribe();

        let err = h.session.initialize(direct()).await.unwrap_err();
        assert!(matches!(err, SessionError::Initialization(_)));
        assert!(err.is_retryable());
        assert_eq!(h.session.state(), SessionState::Disconnected);
        next_event(&mut events, |e| matches!(e, SessionEvent::InitializationFailed(_))).await;

        let resolution = h.session.retry_initialize().await.unwrap();
        assert_eq!(resolution.conversation_id, CONVERSATION);
        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.api.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn refused_join_fails_initialization() {
        let h = harness();
        h.transport.refuse_joins("access_denied");

        let err = h.session.initialize(direct()).await.unwrap_err();
        match err {
            SessionError::Initialization(inner) => match *inner {
                SessionError::JoinRejected { code, .. } => assert_eq!(code.as_deref(), Some("access_denied")),
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(h.session.conversation().is_none());
        assert!(h.transport.peer(0).is_closed());
    }

    #[tokio::test]
    async fn retry_without_intent_is_rejected() {
        let h = harness();
        assert!(matches!(h.session.retry_initialize().await, Err(SessionError::NotInitialized)));
    }

    #[tokio::test]
    async fn send_is_confirmed_by_message_sent() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let mut events = h.session.subscribe();

        let client_id = h.session.send("Hello", MessageKind::Text).await.unwrap();
        let pending = h.session.messages().await;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_pending());

        let peer = h.transport.peer(0);
        assert!(matches!(
            peer.sent().last(),
            Some(ClientEnvelope::SendMessage { client_message_id: Some(id), .. }) if *id == client_id
        ));

        peer.push(ServerEnvelope::MessageSent {
            client_message_id: Some(client_id.clone()),
            id: MessageId(101),
            conversation_id: CONVERSATION,
            timestamp: Utc::now(),
        })
        .await;
        next_event(&mut events, |e| matches!(e, SessionEvent::MessageConfirmed { .. })).await;

        let messages = h.session.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, Some(MessageId(101)));
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn transport_failure_rolls_back_and_returns_payload() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.transport.peer(0).fail_writes(true);

        let err = h.session.send("Keep me", MessageKind::Text).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            err.payload(),
            Some(&OutgoingMessage {
                content: "Keep me".into(),
                kind: MessageKind::Text
            })
        );
        assert!(h.session.messages().await.is_empty());
    }

    #[tokio::test]
    async fn server_error_with_client_id_rolls_back() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let mut events = h.session.subscribe();

        let client_id = h.session.send("Nope", MessageKind::Text).await.unwrap();
        h.transport
            .peer(0)
            .push(ServerEnvelope::Error {
                message: "Access denied".into(),
                code: Some("access_denied".into()),
                client_message_id: Some(client_id),
            })
            .await;

        let event = next_event(&mut events, |e| matches!(e, SessionEvent::SendRejected { .. })).await;
        match event {
            SessionEvent::SendRejected { payload, code, .. } => {
                assert_eq!(payload.unwrap().content, "Nope");
                assert_eq!(code.as_deref(), Some("access_denied"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(h.session.messages().await.is_empty());
    }

    #[tokio::test]
    async fn incoming_messages_are_deduplicated_and_notified() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let mut events = h.session.subscribe();
        let peer = h.transport.peer(0);

        peer.push(incoming(200, REMOTE, "Hi there")).await;
        peer.push(incoming(200, REMOTE, "Hi there")).await;
        peer.push(incoming(201, LOCAL, "from my other device")).await;
        next_event(&mut events, |e| {
            matches!(e, SessionEvent::MessageReceived(entry) if entry.id == Some(MessageId(201)))
        })
        .await;

        assert_eq!(h.session.messages().await.len(), 2);
        let notified = h.notifier.notified();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].sender_id, REMOTE);
    }

    #[tokio::test]
    async fn typing_updates_state_but_not_log() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let mut typing = h.session.watch_typing();

        h.transport
            .peer(0)
            .push(ServerEnvelope::TypingIndicator {
                conversation_id: CONVERSATION,
                user_id: REMOTE,
                is_typing: true,
            })
            .await;

        timeout(WAIT, typing.wait_for(|t| t.is_typing)).await.unwrap().unwrap();
        assert_eq!(h.session.watch_typing().borrow().user_id, Some(REMOTE));
        assert!(h.session.messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_bounded_attempts() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.transport
            .set_default(MockConnect::Fail(TransportError::Connect("refused".into())));
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        let event = next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(_))).await;
        assert!(matches!(
            event,
            SessionEvent::Disconnected(DisconnectReason::AttemptsExhausted(5))
        ));
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert_eq!(h.transport.connect_count(), 1 + 5);

        // Terminal: nothing else is attempted
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.connect_count(), 1 + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_recovers_and_rejoins() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.transport.script(vec![MockConnect::Fail(TransportError::Connect("refused".into()))]);
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        next_event(&mut events, |e| matches!(e, SessionEvent::Reconnected)).await;

        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.transport.connect_count(), 3);
        let rejoined = h.transport.peer(1).sent();
        assert_eq!(
            rejoined.first(),
            Some(&ClientEnvelope::JoinConversation {
                conversation_id: CONVERSATION
            })
        );

        h.session.send("back", MessageKind::Text).await.unwrap();
        assert_eq!(h.transport.peer(1).sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_refreshes_once_then_succeeds() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.transport
            .script(vec![MockConnect::Fail(TransportError::Auth(AuthFailure::Expired))]);
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        next_event(&mut events, |e| matches!(e, SessionEvent::Reconnected)).await;

        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.transport.connect_count(), 3);
        assert_eq!(h.credentials.refresh_count(), 1);
        assert_eq!(h.transport.credentials_seen().last().map(String::as_str), Some("token-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_auth_rejection_is_terminal() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.transport.script(vec![
            MockConnect::Fail(TransportError::Auth(AuthFailure::Expired)),
            MockConnect::Fail(TransportError::Auth(AuthFailure::Invalid)),
        ]);
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        let event = next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(_))).await;
        assert!(matches!(
            event,
            SessionEvent::Disconnected(DisconnectReason::AuthRejected(AuthFailure::Invalid))
        ));
        assert_eq!(h.credentials.refresh_count(), 1);
        assert_eq!(h.transport.connect_count(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_after_refresh_is_terminal() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.transport.script(vec![
            MockConnect::Fail(TransportError::Auth(AuthFailure::Expired)),
            MockConnect::Fail(TransportError::Connect("refused".into())),
            MockConnect::Fail(TransportError::Auth(AuthFailure::Expired)),
        ]);
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        let event = next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(_))).await;
        assert!(matches!(
            event,
            SessionEvent::Disconnected(DisconnectReason::AuthRejected(AuthFailure::Expired))
        ));
        assert_eq!(h.credentials.refresh_count(), 1);
        assert_eq!(h.transport.connect_count(), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.connect_count(), 3);
        assert_eq!(h.credentials.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_is_terminal() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.credentials.fail_refresh(true);
        h.transport
            .script(vec![MockConnect::Fail(TransportError::Auth(AuthFailure::Expired))]);
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        let event = next_event(&mut events, |e| matches!(e, SessionEvent::Disconnected(_))).await;
        assert!(matches!(
            event,
            SessionEvent::Disconnected(DisconnectReason::AuthRejected(AuthFailure::Expired))
        ));
        assert_eq!(h.transport.connect_count(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_send_stored_before_link_loss_is_confirmed_once() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let client_id = h.session.send("Hello", MessageKind::Text).await.unwrap();

        let mut stored = MockApi::message(101, LOCAL, "Hello");
        stored.client_message_id = Some(client_id.clone());
        h.api.set_history(vec![stored]);
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        let event = next_event(&mut events, |e| matches!(e, SessionEvent::MessageConfirmed { .. })).await;
        assert!(matches!(
            event,
            SessionEvent::MessageConfirmed { client_message_id, id } if client_message_id == client_id && id == MessageId(101)
        ));

        let messages = h.session.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, Some(MessageId(101)));
        assert_eq!(messages[0].status, DeliveryStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_send_lost_with_link_is_rolled_back() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let client_id = h.session.send("Lost", MessageKind::Text).await.unwrap();
        let mut events = h.session.subscribe();

        h.transport.peer(0).drop_connection().await;
        let event = next_event(&mut events, |e| matches!(e, SessionEvent::SendRejected { .. })).await;
        match event {
            SessionEvent::SendRejected {
                client_message_id,
                payload,
                ..
            } => {
                assert_eq!(client_message_id, client_id);
                assert_eq!(payload.map(|p| p.content), Some("Lost".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(h.session.messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_fills_every_page_missed_offline() {
        let h = harness_with(SessionConfig {
            history_page_size: 2,
            ..Default::default()
        });
        h.api.set_history(vec![MockApi::message(1, REMOTE, "m1"), MockApi::message(2, REMOTE, "m2")]);
        h.session.initialize(direct()).await.unwrap();
        assert_eq!(h.session.messages().await.len(), 2);

        h.api.set_history((1..=7).map(|i| MockApi::message(i, REMOTE, &format!("m{i}"))).collect());
        let mut events = h.session.subscribe();
        h.transport.peer(0).drop_connection().await;
        next_event(&mut events, |e| matches!(e, SessionEvent::Reconnected)).await;

        wait_log_len(&h.session, 7).await;
        let ids: Vec<i64> = h.session.messages().await.iter().filter_map(|e| e.id).map(|id| id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn link_opened_after_close_is_discarded() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let cancel = h.session.inner.shutdown.child_token();
        h.session.close();

        let (link, driver) = link_pair(LOCAL);
        assert!(h.session.inner.install(link, &cancel).is_none());
        assert!(driver.close.is_cancelled());
        assert!(h.session.inner.active.lock().sender.is_none());
        assert_eq!(h.session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_after_terminal_disconnect() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.transport
            .set_default(MockConnect::Fail(TransportError::Connect("refused".into())));
        h.transport.peer(0).drop_connection().await;
        wait_state(&h.session, SessionState::Disconnected).await;

        h.transport.set_default(MockConnect::Accept);
        h.session.reconnect().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn send_while_disconnected_returns_payload() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        h.session.inner.detach();

        let err = h.session.send("later", MessageKind::Audio).await.unwrap_err();
        match err {
            SessionError::SendFailed { payload, source } => {
                assert_eq!(payload.kind, MessageKind::Audio);
                assert_eq!(source, TransportError::NotConnected);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_releases_resources_once() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let recorder = CountingResource::new("recorder");
        let upload = CountingResource::new("upload");
        h.session.attach_resource(Box::new(recorder.clone())).unwrap();
        h.session.attach_resource(Box::new(upload.clone())).unwrap();

        h.session.close();
        h.session.close();
        assert_eq!(recorder.releases(), 1);
        assert_eq!(upload.releases(), 1);
        assert!(h.transport.peer(0).is_closed());
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(matches!(h.session.send("x", MessageKind::Text).await, Err(SessionError::Closed)));

        let late = CountingResource::new("late");
        assert!(h.session.attach_resource(Box::new(late.clone())).is_err());
        assert_eq!(late.releases(), 1);
    }

    #[tokio::test]
    async fn drop_releases_resources() {
        let h = harness();
        h.session.initialize(direct()).await.unwrap();
        let recorder = CountingResource::new("recorder");
        h.session.attach_resource(Box::new(recorder.clone())).unwrap();
        let peer = h.transport.peer(0);

        drop(h.session);
        assert_eq!(recorder.releases(), 1);
        assert!(peer.is_closed());
    }
}
