use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, CorrelationKey, MessageId, UserId, WriteKind},
    error::{ApiError, RemoteError},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<CorrelationKey>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Last confirmed remote position within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCursor {
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
}

impl MessageCursor {
    pub fn of(message: &RemoteMessage) -> Self {
        Self {
            message_id: message.id,
            created_at: message.created_at,
        }
    }

    /// Ordering used for catch-up merges: timestamp first, server id as tiebreak.
    pub fn is_after(&self, other: &MessageCursor) -> bool {
        (self.created_at, self.message_id) > (other.created_at, other.message_id)
    }
}

/// Event produced by a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Subscribed,
    Change(RemoteMessage),
    Error(String),
    Closed,
}

/// Frames received over the realtime websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeFrame {
    Subscribed { conversations: Vec<ConversationId> },
    Change { message: RemoteMessage },
    Error(ApiError),
    HeartbeatAck,
}

/// Frames sent by the client over the realtime websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageWrite {
    pub correlation_key: CorrelationKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleLikeWrite {
    pub correlation_key: CorrelationKey,
    pub message_id: MessageId,
    pub user_id: UserId,
    pub liked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementViewWrite {
    pub correlation_key: CorrelationKey,
    pub message_id: MessageId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadWrite {
    pub correlation_key: CorrelationKey,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub last_read_at: DateTime<Utc>,
    pub last_read_message_id: MessageId,
}

/// Payload persisted with every pending write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WritePayload {
    SendMessage(SendMessageWrite),
    ToggleLike(ToggleLikeWrite),
    IncrementView(IncrementViewWrite),
    MarkRead(MarkReadWrite),
}

impl WritePayload {
    pub fn kind(&self) -> WriteKind {
        match self {
            WritePayload::SendMessage(_) => WriteKind::SendMessage,
            WritePayload::ToggleLike(_) => WriteKind::ToggleLike,
            WritePayload::IncrementView(_) => WriteKind::IncrementView,
            WritePayload::MarkRead(_) => WriteKind::MarkRead,
        }
    }

    pub fn correlation_key(&self) -> CorrelationKey {
        match self {
            WritePayload::SendMessage(w) => w.correlation_key,
            WritePayload::ToggleLike(w) => w.correlation_key,
            WritePayload::IncrementView(w) => w.correlation_key,
            WritePayload::MarkRead(w) => w.correlation_key,
        }
    }
}

/// Per-item result of a batched write call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub correlation_key: CorrelationKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    pub correlation_key: CorrelationKey,
    pub message_id: Option<MessageId>,
    pub created_at: Option<DateTime<Utc>>,
}

impl WriteResponse {
    pub fn accepted(
        correlation_key: CorrelationKey,
        message_id: Option<MessageId>,
        created_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            correlation_key,
            message_id,
            created_at,
            error: None,
        }
    }

    pub fn rejected(correlation_key: CorrelationKey, error: ApiError) -> Self {
        Self {
            correlation_key,
            message_id: None,
            created_at: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<WriteAck, RemoteError> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(WriteAck {
                correlation_key: self.correlation_key,
                message_id: self.message_id,
                created_at: self.created_at,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarker {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountQuery {
    pub user_id: UserId,
    pub conversations: Vec<ReadMarker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCountEntry {
    pub conversation_id: ConversationId,
    pub count: u32,
    /// Newest message timestamp the server included in `count`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_through: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub const PUSH_TYPE_NEW_MESSAGE: &str = "new_message";

/// Data payload delivered with a push wake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub correlation_key: Option<CorrelationKey>,
}

impl PushPayload {
    /// Returns the carried message when the payload is a complete `new_message` push.
    pub fn message(&self) -> Option<RemoteMessage> {
        if self.kind.as_deref() != Some(PUSH_TYPE_NEW_MESSAGE) {
            return None;
        }
        Some(RemoteMessage {
            id: self.message_id?,
            correlation_key: self.correlation_key,
            conversation_id: self.conversation_id?,
            sender_id: self.sender_id?,
            content: self.content.clone().unwrap_or_default(),
            created_at: self.created_at?,
        })
    }
}
