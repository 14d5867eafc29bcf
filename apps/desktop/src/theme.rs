use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::{sync::watch, task::JoinHandle};

pub const THEME_ATTRIBUTE: &str = "data-theme";

/// Attribute map standing in for the presentation root of the app shell
/// (the `<html>` element in a browser shell).
#[derive(Default)]
pub struct RootPresentation {
    attributes: Mutex<HashMap<String, String>>,
}

impl RootPresentation {
    pub fn set_attribute(&self, name: &str, value: &str) {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), value.to_string());
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

/// Holds the current theme and notifies observers on change.
pub struct ThemeStore {
    tx: watch::Sender<String>,
}

impl ThemeStore {
    pub fn new(initial: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(initial.into());
        Self { tx }
    }

    pub fn set_theme(&self, theme: &str) {
        let _ = self.tx.send(theme.to_string());
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Passive synchronizer: mirrors the observed theme onto the root's
/// `data-theme` attribute, once at startup and then on every change. No
/// return value, no other state.
pub fn spawn_theme_sync(
    mut theme: watch::Receiver<String>,
    root: Arc<RootPresentation>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = theme.borrow_and_update().clone();
            root.set_attribute(THEME_ATTRIBUTE, &current);
            if theme.changed().await.is_err() {
                break;
            }
        }
    })
}
