use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::ServerEvent,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;

use crate::PushSession;

/// Live `/ws` connection fanning server events into a broadcast channel.
/// Owned by the session layer; stores subscribe through [`PushSession`].
pub struct WsSession {
    events: broadcast::Sender<ServerEvent>,
    reader_task: JoinHandle<()>,
}

impl WsSession {
    pub async fn connect(server_url: &str, user_id: UserId) -> Result<Arc<Self>> {
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let ws_url = format!("{ws_url}/ws?user_id={}", user_id.0);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let (events, _) = broadcast::channel(256);
        let sender = events.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            let _ = sender.send(event);
                        }
                        Err(err) => {
                            let _ = sender.send(ServerEvent::Error(ApiError::new(
                                ErrorCode::Internal,
                                format!("invalid server event: {err}"),
                            )));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "push channel receive failed");
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            events,
            reader_task,
        }))
    }
}

impl PushSession for WsSession {
    fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
