//! Two client sessions talking through a real server.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use convoy_client::{SessionConfig, SessionController, SessionError, SessionEvent, SessionState, StaticCredentials};
use convoy_core::ids::UserId;
use convoy_core::model::{ChatIntent, MessageKind, Principal, Role};
use convoy_server::{start, JwtVerifier, ServerConfig, ServerHandle};
use convoy_store::directory::DirectoryRepo;
use convoy_store::{Database, SqliteChatStore};

const WAIT: Duration = Duration::from_secs(5);
const SECRET: &[u8] = b"client-e2e-secret";

/// Users 1 (Ana) and 2 (Ben).
async fn boot() -> ServerHandle {
    let db = Database::in_memory().unwrap();
    let dir = DirectoryRepo::new(db.clone());
    dir.create_user("Ana", "ana@example.com", Role::Renter).unwrap();
    dir.create_user("Ben", "ben@example.com", Role::Host).unwrap();

    let config = ServerConfig {
        port: 0,
        ..Default::default()
    };
    start(config, Arc::new(SqliteChatStore::new(db)), Arc::new(JwtVerifier::new(SECRET)))
        .await
        .unwrap()
}

fn token(user: i64) -> String {
    let principal = Principal {
        user_id: UserId(user),
        email: format!("user{user}@example.com"),
        role: Role::Renter,
    };
    JwtVerifier::new(SECRET).issue(&principal, Duration::from_secs(600)).unwrap()
}

fn session(handle: &ServerHandle, token: String) -> SessionController {
    let config = SessionConfig::with_server_url(format!("http://127.0.0.1:{}", handle.port));
    SessionController::connect_http(config, Arc::new(StaticCredentials::new(token))).unwrap()
}

async fn wait_for<F: Fn(&SessionEvent) -> bool>(rx: &mut broadcast::Receiver<SessionEvent>, want: F) -> SessionEvent {
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

#[tokio::test]
async fn message_flows_between_two_sessions() {
    let handle = boot().await;
    let ana = session(&handle, token(1));
    let ben = session(&handle, token(2));

    let mut ben_events = ben.subscribe();
    let from_ana = ana
        .initialize(ChatIntent::DirectParticipant { participant_id: UserId(2) })
        .await
        .unwrap();
    let from_ben = ben
        .initialize(ChatIntent::DirectParticipant { participant_id: UserId(1) })
        .await
        .unwrap();
    assert_eq!(from_ana.conversation_id, from_ben.conversation_id);
    wait_for(&mut ben_events, |e| matches!(e, SessionEvent::Joined(_))).await;

    let mut ana_events = ana.subscribe();
    ana.send("Hello", MessageKind::Text).await.unwrap();
    wait_for(&mut ana_events, |e| matches!(e, SessionEvent::MessageConfirmed { .. })).await;

    let received = wait_for(&mut ben_events, |e| matches!(e, SessionEvent::MessageReceived(_))).await;
    match received {
        SessionEvent::MessageReceived(entry) => {
            assert_eq!(entry.content, "Hello");
            assert_eq!(entry.sender_id, UserId(1));
            assert_eq!(entry.sender_name.as_deref(), Some("Ana"));
        }
        other => panic!("unexpected: {other:?}"),
    }

    let ana_log = ana.messages().await;
    assert_eq!(ana_log.len(), 1);
    assert!(!ana_log[0].is_pending());

    ana.close();
    ben.close();
    handle.shutdown().await;
}

#[tokio::test]
async fn history_is_loaded_for_late_joiner() {
    let handle = boot().await;
    let ana = session(&handle, token(1));
    ana.initialize(ChatIntent::DirectParticipant { participant_id: UserId(2) })
        .await
        .unwrap();
    let mut events = ana.subscribe();
    ana.send("While you were away", MessageKind::Text).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::MessageConfirmed { .. })).await;

    let ben = session(&handle, token(2));
    ben.initialize(ChatIntent::DirectParticipant { participant_id: UserId(1) })
        .await
        .unwrap();
    let log = ben.messages().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].content, "While you were away");

    ana.close();
    ben.close();
    handle.shutdown().await;
}

#[tokio::test]
async fn bad_credential_fails_initialization() {
    let handle = boot().await;
    let session = session(&handle, "not-a-jwt".into());

    let err = session
        .initialize(ChatIntent::DirectParticipant { participant_id: UserId(2) })
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Initialization(_)));
    assert_eq!(session.state(), SessionState::Disconnected);

    session.close();
    handle.shutdown().await;
}
