use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{ChatStore, FileStateStore, TracingNotifier, WsSession};
use tracing::info;

mod theme;

use theme::{spawn_theme_sync, RootPresentation, ThemeStore};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    username: String,
    /// Counterpart to open a conversation with, by username.
    #[arg(long)]
    chat_with: Option<String>,
    #[arg(long, default_value = "dark")]
    theme: String,
    /// Directory for persisted client state.
    #[arg(long, default_value = "./data/client")]
    state_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let user_id = client_core::login(&args.server_url, &args.username).await?;
    info!(user_id = user_id.0, "logged in");

    let store = ChatStore::new(
        args.server_url.clone(),
        user_id,
        Arc::new(TracingNotifier),
        Arc::new(FileStateStore::new(&args.state_dir)),
    );

    let session = WsSession::connect(&args.server_url, user_id).await?;
    store.attach_session(session).await;

    let theme_store = ThemeStore::new(args.theme);
    let root = Arc::new(RootPresentation::default());
    let _theme_sync = spawn_theme_sync(theme_store.subscribe(), Arc::clone(&root));

    store.get_users().await?;
    let state = store.state().await;
    for user in &state.users {
        println!("{}  {}", user.user_id.0, user.username);
    }

    if let Some(username) = &args.chat_with {
        let Some(counterpart) = state.users.iter().find(|u| &u.username == username).cloned()
        else {
            anyhow::bail!("no such user: {username}");
        };
        store.set_selected_user(Some(counterpart.clone())).await;
        store.get_messages(counterpart.user_id).await?;
        store.subscribe_to_messages().await;

        let state = store.state().await;
        let bucket = state
            .messages_by_user
            .get(&counterpart.user_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for message in bucket {
            println!(
                "[{}] {}: {}",
                message.sent_at,
                message.sender_id.0,
                message.text.as_deref().unwrap_or("<image>")
            );
        }
        println!("listening for new messages from {username}; ctrl-c to quit");
        tokio::signal::ctrl_c().await?;
        store.detach_session().await;
    }

    Ok(())
}
