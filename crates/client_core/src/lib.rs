use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{UserId, UserSummary},
    protocol::{MessageDraft, MessagePayload, ServerEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::warn;

pub mod session;
pub use session::WsSession;

/// Fixed name of the persisted client state entry.
const CHAT_STORAGE_KEY: &str = "chat-storage";

/// User-visible transient error surface (a toast in a UI shell).
pub trait Notifier: Send + Sync {
    fn error(&self, message: &str);
}

/// Default notifier that routes errors into the log stream.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn error(&self, message: &str) {
        warn!(%message, "chat: action failed");
    }
}

/// Named key-value persistence for client state that survives restarts.
pub trait StateStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Option<String>>;
    fn save(&self, name: &str, value: &str) -> Result<()>;
}

/// File-backed `StateStore` writing one JSON file per entry name.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, name: &str) -> Result<Option<String>> {
        let path = self.entry_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read state entry '{}'", path.display()))?;
        Ok(Some(raw))
    }

    fn save(&self, name: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create state dir '{}'", self.dir.display()))?;
        let path = self.entry_path(name);
        fs::write(&path, value)
            .with_context(|| format!("failed to write state entry '{}'", path.display()))?;
        Ok(())
    }
}

/// In-memory `StateStore`, mainly for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

impl StateStore for MemoryStateStore {
    fn load(&self, name: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?;
        Ok(entries.get(name).cloned())
    }

    fn save(&self, name: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("state store lock poisoned"))?;
        entries.insert(name.to_string(), value.to_string());
        Ok(())
    }
}

/// The push channel connection, owned by the session layer. The store only
/// attaches and detaches receivers; it never manages the connection itself.
pub trait PushSession: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent>;
}

#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub users: Vec<UserSummary>,
    pub messages_by_user: HashMap<UserId, Vec<MessagePayload>>,
    pub selected_user: Option<UserSummary>,
    pub is_users_loading: bool,
    pub is_messages_loading: bool,
}

/// Slice of [`ChatState`] that survives restarts. The user list and loading
/// flags are transient.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedChatState {
    #[serde(rename = "messagesByUser")]
    messages_by_user: HashMap<UserId, Vec<MessagePayload>>,
    #[serde(rename = "selectedUser")]
    selected_user: Option<UserSummary>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    user_id: i64,
}

/// Obtains (or idempotently creates) the server-side identity for `username`.
pub async fn login(server_url: &str, username: &str) -> Result<UserId> {
    let response: LoginResponse = Client::new()
        .post(format!("{server_url}/login"))
        .json(&LoginRequest { username })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(UserId(response.user_id))
}

/// Client-side chat state and the actions that drive it. One instance per
/// logged-in user; all actions take `&self` and suspend at network I/O.
pub struct ChatStore {
    http: Client,
    server_url: String,
    user_id: UserId,
    notifier: Arc<dyn Notifier>,
    state_store: Arc<dyn StateStore>,
    session: Mutex<Option<Arc<dyn PushSession>>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
    inner: Arc<Mutex<ChatState>>,
}

impl ChatStore {
    pub fn new(
        server_url: impl Into<String>,
        user_id: UserId,
        notifier: Arc<dyn Notifier>,
        state_store: Arc<dyn StateStore>,
    ) -> Self {
        let mut state = ChatState::default();
        match state_store.load(CHAT_STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedChatState>(&raw) {
                Ok(persisted) => {
                    state.messages_by_user = persisted.messages_by_user;
                    state.selected_user = persisted.selected_user;
                }
                Err(err) => warn!(%err, "chat: discarding unreadable persisted state"),
            },
            Ok(None) => {}
            Err(err) => warn!(%err, "chat: failed to load persisted state"),
        }

        Self {
            http: Client::new(),
            server_url: server_url.into(),
            user_id,
            notifier,
            state_store,
            session: Mutex::new(None),
            subscription: Mutex::new(None),
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Snapshot of the current state for rendering.
    pub async fn state(&self) -> ChatState {
        self.inner.lock().await.clone()
    }

    pub async fn attach_session(&self, session: Arc<dyn PushSession>) {
        *self.session.lock().await = Some(session);
    }

    pub async fn detach_session(&self) {
        self.unsubscribe_from_messages().await;
        *self.session.lock().await = None;
    }

    /// Fetches the sidebar user list. The loading flag resets whatever the
    /// outcome; failures surface through the notifier and leave the previous
    /// list in place.
    pub async fn get_users(&self) -> Result<()> {
        self.inner.lock().await.is_users_loading = true;
        let result = self.fetch_users().await;
        let mut state = self.inner.lock().await;
        state.is_users_loading = false;
        match result {
            Ok(users) => {
                state.users = users;
                Ok(())
            }
            Err(err) => {
                drop(state);
                self.notifier.error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Fetches the conversation with `user_id` and fully replaces that
    /// bucket. Other buckets are untouched; the response is keyed by the
    /// explicit id, so a reply that lands after a selection change still
    /// goes to the right bucket.
    pub async fn get_messages(&self, user_id: UserId) -> Result<()> {
        self.inner.lock().await.is_messages_loading = true;
        let result = self.fetch_messages(user_id).await;
        let mut state = self.inner.lock().await;
        state.is_messages_loading = false;
        match result {
            Ok(messages) => {
                state.messages_by_user.insert(user_id, messages);
                let persisted = snapshot(&state);
                drop(state);
                persist_state(&persisted, self.state_store.as_ref());
                Ok(())
            }
            Err(err) => {
                drop(state);
                self.notifier.error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Sends `draft` to the selected counterpart. Only the confirmed,
    /// server-echoed message is recorded; there is no optimistic update, and
    /// a failed send leaves state untouched.
    pub async fn send_message(&self, draft: &MessageDraft) -> Result<()> {
        let Some(recipient) = self.inner.lock().await.selected_user.clone() else {
            return Err(anyhow!("send_message requires a selected user"));
        };

        match self.post_message(recipient.user_id, draft).await {
            Ok(message) => {
                let mut state = self.inner.lock().await;
                state
                    .messages_by_user
                    .entry(recipient.user_id)
                    .or_default()
                    .push(message);
                let persisted = snapshot(&state);
                drop(state);
                persist_state(&persisted, self.state_store.as_ref());
                Ok(())
            }
            Err(err) => {
                self.notifier.error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Registers the single push handler for the currently selected
    /// counterpart. No-op without a selected user or an attached session.
    /// Re-subscribing replaces the previous handler rather than stacking a
    /// duplicate.
    pub async fn subscribe_to_messages(&self) {
        let Some(selected) = self.inner.lock().await.selected_user.clone() else {
            return;
        };
        let Some(session) = self.session.lock().await.clone() else {
            return;
        };

        let mut events = session.subscribe();
        let counterpart = selected.user_id;
        let inner = Arc::clone(&self.inner);
        let state_store = Arc::clone(&self.state_store);
        let handle = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let ServerEvent::NewMessage(message) = event else {
                    continue;
                };
                if message.sender_id != counterpart {
                    continue;
                }
                let mut state = inner.lock().await;
                state
                    .messages_by_user
                    .entry(counterpart)
                    .or_default()
                    .push(message);
                let persisted = snapshot(&state);
                drop(state);
                persist_state(&persisted, state_store.as_ref());
            }
        });

        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Removes the push handler; safe to call repeatedly and with no session.
    pub async fn unsubscribe_from_messages(&self) {
        if let Some(handle) = self.subscription.lock().await.take() {
            handle.abort();
        }
    }

    /// Unconditional replace. Triggers neither a history fetch nor a
    /// resubscription; callers sequence those themselves.
    pub async fn set_selected_user(&self, selected: Option<UserSummary>) {
        let mut state = self.inner.lock().await;
        state.selected_user = selected;
        let persisted = snapshot(&state);
        drop(state);
        persist_state(&persisted, self.state_store.as_ref());
    }

    async fn fetch_users(&self) -> Result<Vec<UserSummary>> {
        let users = self
            .http
            .get(format!("{}/messages/users", self.server_url))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(users)
    }

    async fn fetch_messages(&self, user_id: UserId) -> Result<Vec<MessagePayload>> {
        let messages = self
            .http
            .get(format!("{}/messages/{}", self.server_url, user_id.0))
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    async fn post_message(
        &self,
        recipient_id: UserId,
        draft: &MessageDraft,
    ) -> Result<MessagePayload> {
        let message = self
            .http
            .post(format!(
                "{}/messages/send/{}",
                self.server_url, recipient_id.0
            ))
            .query(&[("user_id", self.user_id.0)])
            .json(draft)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }
}

/// Cloned persisted slice, taken while the state lock is held so the write
/// itself can happen after the lock is released.
fn snapshot(state: &ChatState) -> PersistedChatState {
    PersistedChatState {
        messages_by_user: state.messages_by_user.clone(),
        selected_user: state.selected_user.clone(),
    }
}

fn persist_state(persisted: &PersistedChatState, store: &dyn StateStore) {
    let raw = match serde_json::to_string(persisted) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(%err, "chat: failed to serialize persisted state");
            return;
        }
    };
    if let Err(err) = store.save(CHAT_STORAGE_KEY, &raw) {
        warn!(%err, "chat: failed to persist state");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
