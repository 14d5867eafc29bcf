use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{MessageId, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub body: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every pooled connection to `sqlite::memory:` is a distinct database,
        // so in-memory urls must stay on a single connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, display_name: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn load_user(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(
            "SELECT id, username, display_name, avatar_url FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| StoredUser {
            user_id: UserId(r.get::<i64, _>(0)),
            username: r.get::<String, _>(1),
            display_name: r.get::<String, _>(2),
            avatar_url: r.get::<Option<String>, _>(3),
        }))
    }

    /// Everyone except `user_id`, for the sidebar user list.
    pub async fn list_users_except(&self, user_id: UserId) -> Result<Vec<StoredUser>> {
        let rows = sqlx::query(
            "SELECT id, username, display_name, avatar_url FROM users
             WHERE id != ?
             ORDER BY username",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredUser {
                user_id: UserId(r.get::<i64, _>(0)),
                username: r.get::<String, _>(1),
                display_name: r.get::<String, _>(2),
                avatar_url: r.get::<Option<String>, _>(3),
            })
            .collect())
    }

    pub async fn insert_message(
        &self,
        sender_id: UserId,
        recipient_id: UserId,
        body: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<StoredMessage> {
        let rec = sqlx::query(
            "INSERT INTO messages (sender_user_id, recipient_user_id, body, image_url)
             VALUES (?, ?, ?, ?)
             RETURNING id, created_at",
        )
        .bind(sender_id.0)
        .bind(recipient_id.0)
        .bind(body)
        .bind(image_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            sender_id,
            recipient_id,
            body: body.map(str::to_string),
            image_url: image_url.map(str::to_string),
            created_at: rec.get::<DateTime<Utc>, _>(1),
        })
    }

    /// Full history between two users, both directions, chronological.
    pub async fn list_conversation(&self, a: UserId, b: UserId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, sender_user_id, recipient_user_id, body, image_url, created_at
             FROM messages
             WHERE (sender_user_id = ?1 AND recipient_user_id = ?2)
                OR (sender_user_id = ?2 AND recipient_user_id = ?1)
             ORDER BY id ASC",
        )
        .bind(a.0)
        .bind(b.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredMessage {
                message_id: MessageId(r.get::<i64, _>(0)),
                sender_id: UserId(r.get::<i64, _>(1)),
                recipient_id: UserId(r.get::<i64, _>(2)),
                body: r.get::<Option<String>, _>(3),
                image_url: r.get::<Option<String>, _>(4),
                created_at: r.get::<DateTime<Utc>, _>(5),
            })
            .collect())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
