use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, CorrelationKey, MessageId, UserId},
    error::{ApiError, ErrorCode, RemoteError},
    protocol::{
        ChannelEvent, IncrementViewWrite, MarkReadWrite, MessageCursor, RemoteMessage,
        SendMessageWrite, ToggleLikeWrite, UnreadCountEntry, UnreadCountQuery, WriteResponse,
    },
};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    connection::RealtimeSink,
    remote::{Credential, CredentialProvider, LiveChannel, RemoteStore, Subscription},
};

pub enum SubscribeScript {
    /// Returns a channel that acknowledges right away.
    Ack,
    Fail(RemoteError),
    /// The subscribe call itself takes this long, then acknowledges.
    SlowAck(Duration),
    /// Returns a channel that never acknowledges.
    Silent,
}

pub enum WriteScript {
    Fail(RemoteError),
    /// The server applies the batch but the response never arrives.
    ApplyThenHang,
    RejectEach(ErrorCode),
}

#[derive(Default)]
pub struct FakeChannel {
    pub closed: AtomicBool,
    pub heartbeat_fails: AtomicBool,
    pub heartbeats: AtomicUsize,
}

#[async_trait]
impl LiveChannel for FakeChannel {
    async fn heartbeat(&self) -> Result<(), RemoteError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.heartbeat_fails.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("heartbeat lost".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct OpenedChannel {
    pub channel: Arc<FakeChannel>,
    pub events: mpsc::Sender<ChannelEvent>,
    pub scope: Vec<ConversationId>,
}

pub struct FakeRemoteState {
    pub online: bool,
    pub subscribe_script: VecDeque<SubscribeScript>,
    pub subscribe_attempts: Vec<Instant>,
    pub opened: Vec<OpenedChannel>,
    pub messages: BTreeMap<ConversationId, Vec<RemoteMessage>>,
    pub next_message_id: i64,
    pub sent_keys: HashMap<CorrelationKey, (MessageId, DateTime<Utc>)>,
    pub write_script: VecDeque<WriteScript>,
    pub write_calls: usize,
    pub fetch_calls: Vec<ConversationId>,
    pub fetch_delay: Duration,
    pub fetch_error: Option<RemoteError>,
    pub unread_override: Option<Vec<UnreadCountEntry>>,
    pub unread_calls: usize,
    pub likes: Vec<ToggleLikeWrite>,
    pub views: Vec<IncrementViewWrite>,
    pub read_marks: Vec<MarkReadWrite>,
}

impl Default for FakeRemoteState {
    fn default() -> Self {
        Self {
            online: true,
            subscribe_script: VecDeque::new(),
            subscribe_attempts: Vec::new(),
            opened: Vec::new(),
            messages: BTreeMap::new(),
            next_message_id: 1_000,
            sent_keys: HashMap::new(),
            write_script: VecDeque::new(),
            write_calls: 0,
            fetch_calls: Vec::new(),
            fetch_delay: Duration::ZERO,
            fetch_error: None,
            unread_override: None,
            unread_calls: 0,
            likes: Vec::new(),
            views: Vec::new(),
            read_marks: Vec::new(),
        }
    }
}

/// In-memory remote store with idempotent upserts keyed on correlation key.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeRemoteState>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, FakeRemoteState> {
        self.state.lock().expect("fake remote state")
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Adds a message authored by someone else directly on the server.
    pub fn post(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> RemoteMessage {
        let mut state = self.state();
        state.next_message_id += 1;
        let message = RemoteMessage {
            id: MessageId(state.next_message_id),
            correlation_key: None,
            conversation_id,
            sender_id,
            content: content.into(),
            created_at,
        };
        state
            .messages
            .entry(conversation_id)
            .or_default()
            .push(message.clone());
        message
    }

    pub fn server_messages(&self, conversation_id: ConversationId) -> Vec<RemoteMessage> {
        self.state()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest_channel(&self) -> Option<(Arc<FakeChannel>, mpsc::Sender<ChannelEvent>)> {
        self.state()
            .opened
            .last()
            .map(|opened| (Arc::clone(&opened.channel), opened.events.clone()))
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.state().online {
            Ok(())
        } else {
            Err(RemoteError::Network("offline".into()))
        }
    }

    fn open_channel(&self, scope: &[ConversationId], acknowledge: bool) -> Subscription {
        let (tx, rx) = mpsc::channel(64);
        if acknowledge {
            let _ = tx.try_send(ChannelEvent::Subscribed);
        }
        let channel = Arc::new(FakeChannel::default());
        self.state().opened.push(OpenedChannel {
            channel: Arc::clone(&channel),
            events: tx,
            scope: scope.to_vec(),
        });
        Subscription {
            channel,
            events: rx,
        }
    }

    fn next_write_script(&self) -> Option<WriteScript> {
        let mut state = self.state();
        state.write_calls += 1;
        state.write_script.pop_front()
    }

    async fn apply_writes<W>(
        &self,
        writes: Vec<W>,
        key_of: impl Fn(&W) -> CorrelationKey,
        apply: impl Fn(&mut FakeRemoteState, &W) -> WriteResponse,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.check_online()?;
        let script = self.next_write_script();
        let hang = match script {
            Some(WriteScript::Fail(err)) => return Err(err),
            Some(WriteScript::RejectEach(code)) => {
                return Ok(writes
                    .iter()
                    .map(|w| WriteResponse::rejected(key_of(w), ApiError::new(code, "rejected")))
                    .collect())
            }
            Some(WriteScript::ApplyThenHang) => true,
            None => false,
        };
        let responses: Vec<WriteResponse> = {
            let mut state = self.state();
            writes.iter().map(|w| apply(&mut *state, w)).collect()
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }
        Ok(responses)
    }
}

#[async_trait]
impl RemoteStore for FakeRemote {
    async fn subscribe(&self, scope: &[ConversationId]) -> Result<Subscription, RemoteError> {
        let script = {
            let mut state = self.state();
            state.subscribe_attempts.push(Instant::now());
            state.subscribe_script.pop_front()
        };
        match script {
            None | Some(SubscribeScript::Ack) => {
                self.check_online()?;
                Ok(self.open_channel(scope, true))
            }
            Some(SubscribeScript::Fail(err)) => Err(err),
            Some(SubscribeScript::SlowAck(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.open_channel(scope, true))
            }
            Some(SubscribeScript::Silent) => Ok(self.open_channel(scope, false)),
        }
    }

    async fn fetch_since(
        &self,
        conversation_id: ConversationId,
        cursor: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        let (delay, error) = {
            let mut state = self.state();
            state.fetch_calls.push(conversation_id);
            (state.fetch_delay, state.fetch_error.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = error {
            return Err(err);
        }
        self.check_online()?;

        let mut messages: Vec<RemoteMessage> = self
            .server_messages(conversation_id)
            .into_iter()
            .filter(|m| cursor.map_or(true, |c| MessageCursor::of(m).is_after(&c)))
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn send_messages(
        &self,
        writes: Vec<SendMessageWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.apply_writes(
            writes,
            |w| w.correlation_key,
            |state, w| {
                if let Some((id, created_at)) = state.sent_keys.get(&w.correlation_key) {
                    return WriteResponse::accepted(w.correlation_key, Some(*id), Some(*created_at));
                }
                state.next_message_id += 1;
                let id = MessageId(state.next_message_id);
                let message = RemoteMessage {
                    id,
                    correlation_key: Some(w.correlation_key),
                    conversation_id: w.conversation_id,
                    sender_id: w.sender_id,
                    content: w.content.clone(),
                    created_at: w.created_at,
                };
                state
                    .messages
                    .entry(w.conversation_id)
                    .or_default()
                    .push(message);
                state
                    .sent_keys
                    .insert(w.correlation_key, (id, w.created_at));
                WriteResponse::accepted(w.correlation_key, Some(id), Some(w.created_at))
            },
        )
        .await
    }

    async fn toggle_likes(
        &self,
        writes: Vec<ToggleLikeWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.apply_writes(
            writes,
            |w| w.correlation_key,
            |state, w| {
                state.likes.push(w.clone());
                WriteResponse::accepted(w.correlation_key, None, None)
            },
        )
        .await
    }

    async fn increment_views(
        &self,
        writes: Vec<IncrementViewWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.apply_writes(
            writes,
            |w| w.correlation_key,
            |state, w| {
                state.views.push(w.clone());
                WriteResponse::accepted(w.correlation_key, None, None)
            },
        )
        .await
    }

    async fn mark_reads(
        &self,
        writes: Vec<MarkReadWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.apply_writes(
            writes,
            |w| w.correlation_key,
            |state, w| {
                state.read_marks.push(w.clone());
                WriteResponse::accepted(w.correlation_key, None, None)
            },
        )
        .await
    }

    async fn fetch_unread_counts(
        &self,
        query: UnreadCountQuery,
    ) -> Result<Vec<UnreadCountEntry>, RemoteError> {
        self.check_online()?;
        let mut state = self.state();
        state.unread_calls += 1;
        if let Some(entries) = state.unread_override.clone() {
            return Ok(entries);
        }
        Ok(query
            .conversations
            .iter()
            .map(|marker| {
                let messages = state
                    .messages
                    .get(&marker.conversation_id)
                    .cloned()
                    .unwrap_or_default();
                let count = messages
                    .iter()
                    .filter(|m| m.sender_id != query.user_id)
                    .filter(|m| marker.last_read_at.map_or(true, |at| m.created_at > at))
                    .count() as u32;
                UnreadCountEntry {
                    conversation_id: marker.conversation_id,
                    count,
                    confirmed_through: messages.iter().map(|m| m.created_at).max(),
                }
            })
            .collect())
    }
}

pub struct StaticCredentials {
    pub credential: Option<Credential>,
    pub refresh_result: Mutex<Result<Credential, RemoteError>>,
    pub refresh_calls: AtomicUsize,
}

impl StaticCredentials {
    pub fn valid() -> Arc<Self> {
        let credential = Credential {
            access_token: "token".into(),
            expires_at: None,
        };
        Arc::new(Self {
            credential: Some(credential.clone()),
            refresh_result: Mutex::new(Ok(credential)),
            refresh_calls: AtomicUsize::new(0),
        })
    }

    /// Credential already expired and refresh is rejected.
    pub fn rejected() -> Arc<Self> {
        Arc::new(Self {
            credential: Some(Credential {
                access_token: "stale".into(),
                expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            }),
            refresh_result: Mutex::new(Err(RemoteError::AuthExpired("revoked".into()))),
            refresh_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_refresh_result(&self, result: Result<Credential, RemoteError>) {
        *self.refresh_result.lock().expect("refresh result") = result;
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current(&self) -> Option<Credential> {
        self.credential.clone()
    }

    async fn refresh(&self) -> Result<Credential, RemoteError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_result.lock().expect("refresh result").clone()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<RemoteMessage>>,
    pub polls: Mutex<Vec<Instant>>,
}

impl RecordingSink {
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.messages
            .lock()
            .expect("messages")
            .iter()
            .map(|m| m.id)
            .collect()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.lock().expect("polls").len()
    }
}

#[async_trait]
impl RealtimeSink for RecordingSink {
    async fn on_remote_message(&self, message: RemoteMessage) {
        self.messages.lock().expect("messages").push(message);
    }

    async fn poll(&self, _scope: &[ConversationId]) {
        self.polls.lock().expect("polls").push(Instant::now());
    }
}

pub fn remote_message(id: i64, conversation: i64, sender: i64, created_at: DateTime<Utc>) -> RemoteMessage {
    RemoteMessage {
        id: MessageId(id),
        correlation_key: None,
        conversation_id: ConversationId(conversation),
        sender_id: UserId(sender),
        content: format!("message {id}"),
        created_at,
    }
}

/// Polls `check` until it holds, failing the test after about two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
