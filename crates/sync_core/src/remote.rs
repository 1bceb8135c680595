use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::ConversationId,
    error::RemoteError,
    protocol::{
        ChannelEvent, IncrementViewWrite, MarkReadWrite, MessageCursor, RemoteMessage,
        SendMessageWrite, ToggleLikeWrite, UnreadCountEntry, UnreadCountQuery, WriteResponse,
    },
};
use tokio::sync::mpsc;

/// Live subscription handle owned by the connection manager.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Round-trips a heartbeat. Callers apply their own timeout.
    async fn heartbeat(&self) -> Result<(), RemoteError>;
    async fn close(&self);
}

pub struct Subscription {
    pub channel: Arc<dyn LiveChannel>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn subscribe(&self, conversations: &[ConversationId]) -> Result<Subscription, RemoteError>;

    /// Messages strictly after `cursor`, oldest first.
    async fn fetch_since(
        &self,
        conversation_id: ConversationId,
        cursor: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError>;

    async fn send_messages(
        &self,
        writes: Vec<SendMessageWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError>;
    async fn toggle_likes(&self, writes: Vec<ToggleLikeWrite>)
        -> Result<Vec<WriteResponse>, RemoteError>;
    async fn increment_views(
        &self,
        writes: Vec<IncrementViewWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError>;
    async fn mark_reads(&self, writes: Vec<MarkReadWrite>) -> Result<Vec<WriteResponse>, RemoteError>;

    async fn fetch_unread_counts(
        &self,
        query: UnreadCountQuery,
    ) -> Result<Vec<UnreadCountEntry>, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn current(&self) -> Option<Credential>;
    async fn refresh(&self) -> Result<Credential, RemoteError>;
}

/// Provider for sessions that never received a credential.
pub struct MissingCredentialProvider;

#[async_trait]
impl CredentialProvider for MissingCredentialProvider {
    async fn current(&self) -> Option<Credential> {
        None
    }

    async fn refresh(&self) -> Result<Credential, RemoteError> {
        Err(RemoteError::AuthExpired("no credential configured".into()))
    }
}
