use super::*;
use axum::{
    extract::Path as UrlPath,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared::domain::MessageId;
use std::time::Duration;
use tokio::net::TcpListener;

struct RecordingNotifier {
    messages: std::sync::Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.messages.lock().expect("notifier lock").len()
    }
}

impl Notifier for RecordingNotifier {
    fn error(&self, message: &str) {
        self.messages
            .lock()
            .expect("notifier lock")
            .push(message.to_string());
    }
}

struct TestPushSession {
    tx: broadcast::Sender<ServerEvent>,
}

impl TestPushSession {
    fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(16);
        Arc::new(Self { tx })
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

impl PushSession for TestPushSession {
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

async fn spawn_server(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn user(id: i64, username: &str) -> UserSummary {
    UserSummary {
        user_id: UserId(id),
        username: username.to_string(),
        display_name: username.to_string(),
        avatar_url: None,
    }
}

fn message(id: i64, from: i64, to: i64, text: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        sender_id: UserId(from),
        recipient_id: UserId(to),
        text: Some(text.to_string()),
        image_url: None,
        sent_at: Utc::now(),
    }
}

fn store_with(
    server_url: &str,
    notifier: Arc<RecordingNotifier>,
    state_store: Arc<dyn StateStore>,
) -> ChatStore {
    ChatStore::new(server_url.to_string(), UserId(1), notifier, state_store)
}

async fn wait_until(store: &ChatStore, check: impl Fn(&ChatState) -> bool) {
    for _ in 0..200 {
        if check(&store.state().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("store never reached the expected state");
}

#[tokio::test]
async fn get_users_replaces_the_user_list_and_resets_loading() {
    let router = Router::new().route(
        "/messages/users",
        get(|| async { Json(vec![user(2, "bob"), user(3, "carol")]) }),
    );
    let server_url = spawn_server(router).await;
    let store = store_with(
        &server_url,
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );

    store.get_users().await.expect("get_users");

    let state = store.state().await;
    assert_eq!(state.users.len(), 2);
    assert!(!state.is_users_loading);
}

#[tokio::test]
async fn failed_get_users_notifies_and_resets_loading() {
    let router = Router::new().route(
        "/messages/users",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let server_url = spawn_server(router).await;
    let notifier = RecordingNotifier::new();
    let store = store_with(
        &server_url,
        Arc::clone(&notifier),
        Arc::new(MemoryStateStore::default()),
    );

    store.get_users().await.expect_err("should fail");

    let state = store.state().await;
    assert!(state.users.is_empty());
    assert!(!state.is_users_loading);
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn get_messages_replaces_only_the_requested_bucket() {
    // Seed an unrelated bucket through persistence so the store starts with
    // history for user 9.
    let state_store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::default());
    let seeded = PersistedChatState {
        messages_by_user: HashMap::from([
            (UserId(9), vec![message(1, 9, 1, "old from 9")]),
            (UserId(2), vec![message(2, 2, 1, "stale from 2")]),
        ]),
        selected_user: None,
    };
    state_store
        .save(
            CHAT_STORAGE_KEY,
            &serde_json::to_string(&seeded).expect("seed"),
        )
        .expect("seed save");

    let router = Router::new().route(
        "/messages/:user_id",
        get(|UrlPath(user_id): UrlPath<i64>| async move {
            Json(vec![
                message(10, user_id, 1, "fresh one"),
                message(11, 1, user_id, "fresh two"),
            ])
        }),
    );
    let server_url = spawn_server(router).await;
    let store = store_with(&server_url, RecordingNotifier::new(), state_store);

    store.get_messages(UserId(2)).await.expect("get_messages");

    let state = store.state().await;
    let bucket = state.messages_by_user.get(&UserId(2)).expect("bucket 2");
    assert_eq!(bucket.len(), 2);
    assert_eq!(bucket[0].text.as_deref(), Some("fresh one"));
    let untouched = state.messages_by_user.get(&UserId(9)).expect("bucket 9");
    assert_eq!(untouched.len(), 1);
    assert_eq!(untouched[0].text.as_deref(), Some("old from 9"));
    assert!(!state.is_messages_loading);
}

#[tokio::test]
async fn send_message_appends_the_confirmed_echo() {
    let router = Router::new().route(
        "/messages/send/:user_id",
        post(
            |UrlPath(recipient): UrlPath<i64>, Json(draft): Json<MessageDraft>| async move {
                Json(MessagePayload {
                    message_id: MessageId(77),
                    sender_id: UserId(1),
                    recipient_id: UserId(recipient),
                    text: draft.text,
                    image_url: draft.image_url,
                    sent_at: Utc::now(),
                })
            },
        ),
    );
    let server_url = spawn_server(router).await;
    let store = store_with(
        &server_url,
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );
    store.set_selected_user(Some(user(2, "bob"))).await;

    let draft = MessageDraft {
        text: Some("hello bob".into()),
        image_url: None,
    };
    store.send_message(&draft).await.expect("send");

    let state = store.state().await;
    let bucket = state.messages_by_user.get(&UserId(2)).expect("bucket");
    assert_eq!(bucket.len(), 1);
    assert_eq!(bucket[0].message_id, MessageId(77));
    assert_eq!(bucket[0].text.as_deref(), Some("hello bob"));
}

#[tokio::test]
async fn failed_send_leaves_state_unchanged() {
    let router = Router::new().route(
        "/messages/send/:user_id",
        post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let server_url = spawn_server(router).await;
    let notifier = RecordingNotifier::new();
    let store = store_with(
        &server_url,
        Arc::clone(&notifier),
        Arc::new(MemoryStateStore::default()),
    );
    store.set_selected_user(Some(user(2, "bob"))).await;

    let draft = MessageDraft {
        text: Some("hello".into()),
        image_url: None,
    };
    store.send_message(&draft).await.expect_err("should fail");

    let state = store.state().await;
    assert!(state.messages_by_user.get(&UserId(2)).is_none());
    assert_eq!(notifier.count(), 1);
}

#[tokio::test]
async fn send_without_selected_user_is_an_error() {
    let store = store_with(
        "http://127.0.0.1:9",
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );
    let draft = MessageDraft {
        text: Some("hello".into()),
        image_url: None,
    };
    store.send_message(&draft).await.expect_err("precondition");
}

#[tokio::test]
async fn push_event_from_the_selected_counterpart_appends_its_payload() {
    let store = store_with(
        "http://127.0.0.1:9",
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );
    let session = TestPushSession::new();
    store.attach_session(session.clone()).await;
    store.set_selected_user(Some(user(2, "U2"))).await;
    store.subscribe_to_messages().await;

    let pushed = message(5, 2, 1, "hi");
    session.emit(ServerEvent::NewMessage(pushed.clone()));

    wait_until(&store, |state| {
        state
            .messages_by_user
            .get(&UserId(2))
            .is_some_and(|bucket| bucket.len() == 1)
    })
    .await;
    let state = store.state().await;
    assert_eq!(state.messages_by_user[&UserId(2)][0], pushed);
}

#[tokio::test]
async fn push_events_from_other_senders_are_dropped() {
    let store = store_with(
        "http://127.0.0.1:9",
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );
    let session = TestPushSession::new();
    store.attach_session(session.clone()).await;
    store.set_selected_user(Some(user(2, "U2"))).await;
    store.subscribe_to_messages().await;

    session.emit(ServerEvent::NewMessage(message(5, 3, 1, "from someone else")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = store.state().await;
    assert!(state.messages_by_user.is_empty());
}

#[tokio::test]
async fn resubscribing_does_not_stack_handlers() {
    let store = store_with(
        "http://127.0.0.1:9",
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );
    let session = TestPushSession::new();
    store.attach_session(session.clone()).await;
    store.set_selected_user(Some(user(2, "U2"))).await;
    store.subscribe_to_messages().await;
    store.subscribe_to_messages().await;

    session.emit(ServerEvent::NewMessage(message(5, 2, 1, "hi")));

    wait_until(&store, |state| {
        state.messages_by_user.contains_key(&UserId(2))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = store.state().await;
    assert_eq!(state.messages_by_user[&UserId(2)].len(), 1);
}

#[tokio::test]
async fn subscribe_without_selected_user_or_session_is_a_noop() {
    let store = store_with(
        "http://127.0.0.1:9",
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );
    // No session, no selected user.
    store.subscribe_to_messages().await;
    store.unsubscribe_from_messages().await;
    store.unsubscribe_from_messages().await;

    let session = TestPushSession::new();
    store.attach_session(session.clone()).await;
    // Session but still no selected user.
    store.subscribe_to_messages().await;
    session.emit(ServerEvent::NewMessage(message(5, 2, 1, "hi")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.state().await.messages_by_user.is_empty());
}

#[tokio::test]
async fn unsubscribed_store_ignores_push_events() {
    let store = store_with(
        "http://127.0.0.1:9",
        RecordingNotifier::new(),
        Arc::new(MemoryStateStore::default()),
    );
    let session = TestPushSession::new();
    store.attach_session(session.clone()).await;
    store.set_selected_user(Some(user(2, "U2"))).await;
    store.subscribe_to_messages().await;
    store.unsubscribe_from_messages().await;

    session.emit(ServerEvent::NewMessage(message(5, 2, 1, "hi")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.state().await.messages_by_user.is_empty());
}

#[tokio::test]
async fn persistence_restores_messages_and_selection_but_not_users() {
    let state_store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::default());
    let router = Router::new().route(
        "/messages/users",
        get(|| async { Json(vec![user(2, "bob")]) }),
    );
    let server_url = spawn_server(router).await;

    {
        let store = store_with(
            &server_url,
            RecordingNotifier::new(),
            Arc::clone(&state_store),
        );
        store.get_users().await.expect("get_users");
        store.set_selected_user(Some(user(2, "bob"))).await;
        let mut state = store.inner.lock().await;
        state
            .messages_by_user
            .entry(UserId(2))
            .or_default()
            .push(message(1, 2, 1, "hi"));
        let persisted = snapshot(&state);
        drop(state);
        persist_state(&persisted, state_store.as_ref());
    }

    let raw = state_store
        .load(CHAT_STORAGE_KEY)
        .expect("load")
        .expect("entry");
    assert!(raw.contains("messagesByUser"));
    assert!(raw.contains("selectedUser"));
    assert!(!raw.contains("\"users\""));
    assert!(!raw.contains("is_users_loading"));

    let restored = store_with(
        &server_url,
        RecordingNotifier::new(),
        Arc::clone(&state_store),
    );
    let state = restored.state().await;
    assert!(state.users.is_empty());
    assert_eq!(state.selected_user.as_ref().map(|u| u.user_id), Some(UserId(2)));
    assert_eq!(state.messages_by_user[&UserId(2)].len(), 1);
}

/// `StateStore` whose `save` blocks until the test releases it, signalling
/// entry so the test can probe the store mid-write.
struct GatedStateStore {
    entered: std::sync::Mutex<std::sync::mpsc::Sender<()>>,
    release: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
}

impl StateStore for GatedStateStore {
    fn load(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn save(&self, _name: &str, _value: &str) -> Result<()> {
        self.entered
            .lock()
            .expect("entered lock")
            .send(())
            .expect("signal entry");
        self.release
            .lock()
            .expect("release lock")
            .recv()
            .expect("await release");
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_stays_readable_while_a_save_is_in_flight() {
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let state_store = Arc::new(GatedStateStore {
        entered: std::sync::Mutex::new(entered_tx),
        release: std::sync::Mutex::new(release_rx),
    });
    let store = Arc::new(store_with(
        "http://127.0.0.1:9",
        RecordingNotifier::new(),
        state_store,
    ));

    let writer = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store.set_selected_user(Some(user(2, "bob"))).await;
        })
    };

    entered_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("save should start");
    // The write is parked inside save; reading state must not wait for it.
    let state = tokio::time::timeout(Duration::from_secs(1), store.state())
        .await
        .expect("state should not be blocked by persistence");
    assert_eq!(
        state.selected_user.as_ref().map(|u| u.user_id),
        Some(UserId(2))
    );

    release_tx.send(()).expect("release save");
    writer.await.expect("writer task");
}

#[tokio::test]
async fn file_state_store_round_trips_entries() {
    let dir = tempfile::tempdir().expect("dir");
    let store = FileStateStore::new(dir.path().join("state"));
    assert!(store.load("chat-storage").expect("load").is_none());
    store.save("chat-storage", "{\"x\":1}").expect("save");
    assert_eq!(
        store.load("chat-storage").expect("load").as_deref(),
        Some("{\"x\":1}")
    );
}
