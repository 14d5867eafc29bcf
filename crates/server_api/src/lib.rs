use shared::{
    domain::{UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{MessageDraft, MessagePayload, ServerEvent},
};
use storage::{Storage, StoredMessage, StoredUser};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Idempotent username registration: re-registering an existing username
/// returns its id unchanged.
pub async fn register_user(
    ctx: &ApiContext,
    username: &str,
    display_name: Option<&str>,
) -> Result<UserId, ApiError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "username must not be empty",
        ));
    }
    let display_name = display_name
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(username);
    ctx.storage
        .create_user(username, display_name)
        .await
        .map_err(internal)
}

/// Sidebar user list: everyone known to the server except the caller.
pub async fn list_chat_users(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<UserSummary>, ApiError> {
    ensure_user_exists(ctx, user_id).await?;
    let users = ctx
        .storage
        .list_users_except(user_id)
        .await
        .map_err(internal)?;
    Ok(users.into_iter().map(summary).collect())
}

/// Full history between the caller and `other`, chronological.
pub async fn list_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    other: UserId,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_user_exists(ctx, user_id).await?;
    ensure_user_exists(ctx, other).await?;
    let messages = ctx
        .storage
        .list_conversation(user_id, other)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(payload).collect())
}

pub async fn send_message(
    ctx: &ApiContext,
    sender_id: UserId,
    recipient_id: UserId,
    draft: &MessageDraft,
) -> Result<ServerEvent, ApiError> {
    let text = draft.text.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let image_url = draft
        .image_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());
    if text.is_none() && image_url.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message needs text or an image",
        ));
    }

    ensure_user_exists(ctx, sender_id).await?;
    ensure_user_exists(ctx, recipient_id).await?;

    let stored = ctx
        .storage
        .insert_message(sender_id, recipient_id, text, image_url)
        .await
        .map_err(internal)?;

    Ok(ServerEvent::NewMessage(payload(stored)))
}

async fn ensure_user_exists(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    ctx.storage
        .load_user(user_id)
        .await
        .map_err(internal)?
        .map(|_| ())
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("unknown user {}", user_id.0)))
}

fn summary(user: StoredUser) -> UserSummary {
    UserSummary {
        user_id: user.user_id,
        username: user.username,
        display_name: user.display_name,
        avatar_url: user.avatar_url,
    }
}

fn payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        sender_id: message.sender_id,
        recipient_id: message.recipient_id,
        text: message.body,
        image_url: message.image_url,
        sent_at: message.created_at,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
