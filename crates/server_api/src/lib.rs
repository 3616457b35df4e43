use std::collections::{BTreeMap, HashMap};

use chrono::DateTime;
use conversation_transport::{channel_name_for, mint_join_token, TokenConfig};
use shared::{
    domain::{
        ChatMessage, ConversationId, ConversationKey, DeliveryStatus, MessageId, ReadReceipt,
        UserId,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AppendMessageRequest, AppendOutcome, ConversationSummary, CreateGroupConversationRequest,
        ParticipantSummary, ServerEvent, TransportTokenResponse,
    },
};
use storage::{NewMessage, Storage, StoredConversation, StoredMessage};
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;
const MAX_CONTENT_CHARS: usize = 8_000;
const MAX_USERNAME_CHARS: usize = 64;
const MAX_READ_BATCH: usize = 500;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub transport: TokenConfig,
}

/// An event the caller must push to `target` over the notification hub.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target: UserId,
    pub event: ServerEvent,
}

pub async fn login(ctx: &ApiContext, username: &str) -> Result<UserId, ApiError> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("username must be 1..={MAX_USERNAME_CHARS} characters"),
        ));
    }
    ctx.storage.create_user(username).await.map_err(internal)
}

pub async fn open_direct_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    other_user_id: UserId,
) -> Result<ConversationSummary, ApiError> {
    if user_id == other_user_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot open a conversation with yourself",
        ));
    }
    ensure_user_exists(ctx, other_user_id).await?;
    let conversation = ctx
        .storage
        .get_or_create_direct_conversation(user_id, other_user_id)
        .await
        .map_err(internal)?;
    Ok(to_summary(conversation))
}

pub async fn create_group_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    req: &CreateGroupConversationRequest,
) -> Result<ConversationSummary, ApiError> {
    let local_key = req.local_key.trim();
    if local_key.is_empty() || local_key.starts_with("direct-") {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "group conversations need a client key without the direct- prefix",
        ));
    }
    for member in &req.member_ids {
        ensure_user_exists(ctx, *member).await?;
    }
    let conversation = ctx
        .storage
        .create_group_conversation(local_key, req.name.trim(), user_id, &req.member_ids)
        .await
        .map_err(|err| ApiError::new(ErrorCode::Validation, err.to_string()))?;
    if !conversation
        .participants
        .iter()
        .any(|participant| participant.user_id == user_id)
    {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "conversation key belongs to another group",
        ));
    }
    Ok(to_summary(conversation))
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(conversations.into_iter().map(to_summary).collect())
}

/// Stores a message sent by `user_id`.
///
/// Retries of an already stored id succeed with `AlreadyExists` and produce
/// no notifications; a fresh insert notifies every other participant.
pub async fn append_message(
    ctx: &ApiContext,
    user_id: UserId,
    req: &AppendMessageRequest,
) -> Result<(AppendOutcome, Vec<Notification>), ApiError> {
    if req.id.as_str().trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "message id is required"));
    }
    if req.content.trim().is_empty() || req.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("message content must be 1..={MAX_CONTENT_CHARS} characters"),
        ));
    }
    let conversation = ensure_participant(ctx, req.conversation_id, user_id).await?;

    let outcome = ctx
        .storage
        .append_message(&NewMessage {
            id: req.id.clone(),
            conversation_id: req.conversation_id,
            sender_id: user_id,
            content: req.content.clone(),
            kind: req.kind,
            sent_at: req.timestamp,
        })
        .await
        .map_err(internal)?;

    if outcome == AppendOutcome::AlreadyExists {
        debug!(message_id = %req.id, "append: duplicate id acknowledged");
        return Ok((outcome, Vec::new()));
    }

    let sender_name = participant_name(&conversation, user_id);
    let message = ChatMessage {
        id: req.id.clone(),
        conversation: ConversationKey::Persisted(req.conversation_id),
        sender_id: user_id,
        sender_name,
        content: req.content.clone(),
        kind: req.kind,
        timestamp: req.timestamp,
        status: DeliveryStatus::Sent,
    };
    let notifications = others(&conversation, user_id)
        .map(|target| Notification {
            target,
            event: ServerEvent::NewMessage {
                conversation_id: conversation.conversation_id,
                local_key: conversation.local_key.clone(),
                message: message.clone(),
            },
        })
        .collect();
    info!(
        conversation_id = req.conversation_id.0,
        message_id = %req.id,
        "append: stored message"
    );
    Ok((outcome, notifications))
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    limit: Option<u32>,
    before_ms: Option<i64>,
) -> Result<Vec<ChatMessage>, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let before = match before_ms {
        Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| {
            ApiError::new(ErrorCode::Validation, "before is not a valid timestamp")
        })?),
        None => None,
    };
    let messages = ctx
        .storage
        .list_messages(conversation_id, limit, before)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(to_chat_message).collect())
}

pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    message_id: &MessageId,
) -> Result<(), ApiError> {
    let message = ctx
        .storage
        .message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if message.sender_id != user_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender may delete a message",
        ));
    }
    ctx.storage
        .soft_delete_message(message_id, user_id)
        .await
        .map_err(internal)?;
    Ok(())
}

/// Records reads and builds one `messages-read` notification per sender.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    message_ids: &[MessageId],
    conversation_id: Option<ConversationId>,
) -> Result<(u64, Vec<Notification>), ApiError> {
    if message_ids.len() > MAX_READ_BATCH {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("at most {MAX_READ_BATCH} message ids per request"),
        ));
    }
    let accepted = ctx
        .storage
        .record_reads(message_ids, user_id, conversation_id)
        .await
        .map_err(internal)?;

    let mut by_sender: BTreeMap<(UserId, ConversationId), Vec<MessageId>> = BTreeMap::new();
    for read in &accepted {
        by_sender
            .entry((read.sender_id, read.conversation_id))
            .or_default()
            .push(read.message_id.clone());
    }
    let notifications = by_sender
        .into_iter()
        .map(|((target, conversation_id), message_ids)| Notification {
            target,
            event: ServerEvent::MessagesRead {
                message_ids,
                reader_id: user_id,
                conversation_id: Some(conversation_id),
            },
        })
        .collect();
    Ok((accepted.len() as u64, notifications))
}

pub async fn receipts(
    ctx: &ApiContext,
    user_id: UserId,
    message_ids: &[MessageId],
) -> Result<HashMap<MessageId, Vec<ReadReceipt>>, ApiError> {
    if message_ids.len() > MAX_READ_BATCH {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("at most {MAX_READ_BATCH} message ids per request"),
        ));
    }
    ctx.storage
        .receipts_for(message_ids, user_id)
        .await
        .map_err(internal)
}

pub async fn typing(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    is_typing: bool,
) -> Result<Vec<Notification>, ApiError> {
    let conversation = ensure_participant(ctx, conversation_id, user_id).await?;
    let user_name = participant_name(&conversation, user_id);
    Ok(others(&conversation, user_id)
        .map(|target| Notification {
            target,
            event: ServerEvent::Typing {
                conversation_id,
                local_key: conversation.local_key.clone(),
                user_id,
                user_name: user_name.clone(),
                is_typing,
            },
        })
        .collect())
}

pub async fn transport_token(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<TransportTokenResponse, ApiError> {
    let conversation = ensure_participant(ctx, conversation_id, user_id).await?;
    let channel_name = channel_name_for(&conversation.local_key);
    let token = mint_join_token(&ctx.transport, user_id, &channel_name)
        .map_err(|e| ApiError::new(ErrorCode::Internal, e.to_string()))?;
    Ok(TransportTokenResponse {
        channel_name,
        token,
    })
}

async fn ensure_user_exists(ctx: &ApiContext, user_id: UserId) -> Result<String, ApiError> {
    ctx.storage
        .username_for_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("user {user_id} not found")))
}

async fn ensure_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<StoredConversation, ApiError> {
    let conversation = ctx
        .storage
        .conversation(conversation_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "conversation not found"))?;
    if !conversation
        .participants
        .iter()
        .any(|participant| participant.user_id == user_id)
    {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a participant of this conversation",
        ));
    }
    Ok(conversation)
}

fn others(conversation: &StoredConversation, user_id: UserId) -> impl Iterator<Item = UserId> + '_ {
    conversation
        .participants
        .iter()
        .map(|participant| participant.user_id)
        .filter(move |id| *id != user_id)
}

fn participant_name(conversation: &StoredConversation, user_id: UserId) -> String {
    conversation
        .participants
        .iter()
        .find(|participant| participant.user_id == user_id)
        .map(|participant| participant.username.clone())
        .unwrap_or_default()
}

fn to_summary(conversation: StoredConversation) -> ConversationSummary {
    ConversationSummary {
        conversation_id: conversation.conversation_id,
        local_key: conversation.local_key,
        kind: conversation.kind,
        name: conversation.name,
        participants: conversation
            .participants
            .into_iter()
            .map(|participant| ParticipantSummary {
                user_id: participant.user_id,
                username: participant.username,
            })
            .collect(),
    }
}

fn to_chat_message(message: StoredMessage) -> ChatMessage {
    ChatMessage {
        id: message.id,
        conversation: ConversationKey::Persisted(message.conversation_id),
        sender_id: message.sender_id,
        sender_name: message.sender_name,
        content: message.content,
        kind: message.kind,
        timestamp: message.sent_at,
        status: DeliveryStatus::Sent,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
