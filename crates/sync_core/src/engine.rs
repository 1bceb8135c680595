use std::sync::{Arc, Mutex, PoisonError};

use shared::{
    domain::{ConnectionStatus, ConversationId, MessageId, PendingWriteId, UserId, WakeReason},
    protocol::PushPayload,
};
use storage::{PendingWrite, Storage, StoredMessage};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_stream::Stream;
use tracing::{info, warn};

use crate::{
    auth::AuthGate,
    config::SyncSettings,
    connection::ConnectionManager,
    durability::DurabilityManager,
    error::SyncError,
    events::{EventHub, SyncEvent},
    ingest::Ingestor,
    outbox::{OutboxIndicator, OutboxProcessor},
    remote::{CredentialProvider, RemoteStore},
    resync::MissedDataResync,
    unread::{UnreadTracker, UnreadUpdate},
    view::ViewState,
    wake::{WakeOrchestrator, WakeReport},
};

/// Signals from the host environment.
#[derive(Debug, Clone)]
pub enum LifecycleSignal {
    Foreground,
    Background,
    NetworkOnline,
    NetworkOffline,
    PushWake {
        hint: Option<ConversationId>,
        payload: Option<PushPayload>,
    },
}

/// Owns every sync component and is the only surface the presentation
/// layer talks to.
pub struct SyncEngine {
    user_id: UserId,
    storage: Storage,
    auth: Arc<AuthGate>,
    connection: Arc<ConnectionManager>,
    outbox: Arc<OutboxProcessor>,
    unread: Arc<UnreadTracker>,
    durability: Arc<DurabilityManager>,
    wake: Arc<WakeOrchestrator>,
    view: Arc<ViewState>,
    events: Arc<EventHub>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Opens the local store named in `settings` and wires the engine to it.
    pub async fn start(
        settings: &SyncSettings,
        remote: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<Self>, SyncError> {
        let storage = Storage::new(&settings.database_url).await?;
        Self::with_storage(settings, storage, remote, credentials).await
    }

    pub async fn with_storage(
        settings: &SyncSettings,
        storage: Storage,
        remote: Arc<dyn RemoteStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<Self>, SyncError> {
        let user_id = UserId(settings.user_id);
        let events = Arc::new(EventHub::new());
        let view = Arc::new(ViewState::new());
        let auth = AuthGate::new(credentials, settings.auth.clone());

        let durability = DurabilityManager::new(storage.clone(), settings.durability.clone());
        durability.verify_commit_mode().await?;

        let outbox = OutboxProcessor::new(
            storage.clone(),
            remote.clone(),
            auth.clone(),
            events.clone(),
            durability.clone(),
            user_id,
            settings.outbox.clone(),
        );
        let unread = UnreadTracker::new(
            storage.clone(),
            remote.clone(),
            outbox.clone(),
            view.clone(),
            user_id,
            settings.unread.clone(),
        );
        let ingest = Ingestor::new(
            storage.clone(),
            MissedDataResync::new(storage.clone(), remote.clone(), settings.resync.clone()),
            unread.clone(),
            durability.clone(),
            view.clone(),
            events.clone(),
        );
        let connection = ConnectionManager::new(
            remote,
            auth.clone(),
            ingest.clone(),
            settings.connection.clone(),
        );
        let wake = WakeOrchestrator::new(
            storage.clone(),
            auth.clone(),
            connection.clone(),
            ingest,
            outbox.clone(),
            unread.clone(),
        );
        let idle_timer = durability.spawn_idle_timer();

        info!(user_id = %user_id, "engine: assembled");
        Ok(Arc::new(Self {
            user_id,
            storage,
            auth,
            connection,
            outbox,
            unread,
            durability,
            wake,
            view,
            events,
            idle_timer: Mutex::new(Some(idle_timer)),
        }))
    }

    /// First wake after launch; the app starts in the foreground.
    pub async fn cold_start(&self) -> WakeReport {
        self.activate();
        self.wake.on_wake(WakeReason::ColdStart, None).await
    }

    /// Returns the wake report when the signal triggered a wake.
    pub async fn handle_signal(&self, signal: LifecycleSignal) -> Option<WakeReport> {
        match signal {
            LifecycleSignal::Foreground => {
                self.activate();
                Some(self.wake.on_wake(WakeReason::AppForeground, None).await)
            }
            LifecycleSignal::Background => {
                self.view.set_foreground(false);
                self.outbox.set_active(false);
                self.unread.set_active(false);
                self.durability.on_background();
                info!("engine: moved to background");
                None
            }
            LifecycleSignal::NetworkOnline => {
                Some(self.wake.on_wake(WakeReason::NetworkRestored, None).await)
            }
            LifecycleSignal::NetworkOffline => {
                info!(status = ?self.connection.status(), "engine: network reported offline");
                None
            }
            LifecycleSignal::PushWake { hint, payload } => Some(match payload {
                Some(payload) => self.wake.on_push(payload).await,
                None => self.wake.on_wake(WakeReason::PushWake, hint).await,
            }),
        }
    }

    /// Runs a wake on behalf of the user ("pull to refresh").
    pub async fn refresh(&self, hint: Option<ConversationId>) -> WakeReport {
        self.wake.on_wake(WakeReason::Manual, hint).await
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<StoredMessage, SyncError> {
        self.outbox.send_message(conversation_id, content).await
    }

    pub async fn toggle_like(
        &self,
        message_id: MessageId,
        liked: bool,
    ) -> Result<PendingWriteId, SyncError> {
        self.outbox.toggle_like(message_id, liked).await
    }

    pub async fn increment_view(&self, message_id: MessageId) -> Result<PendingWriteId, SyncError> {
        self.outbox.increment_view(message_id).await
    }

    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool, SyncError> {
        self.unread.mark_read(conversation_id, message_id).await
    }

    pub async fn retry_failed(&self, id: PendingWriteId) -> Result<bool, SyncError> {
        self.outbox.retry_failed(id).await
    }

    pub async fn failed_writes(&self) -> Result<Vec<PendingWrite>, SyncError> {
        Ok(self.storage.list_failed_writes().await?)
    }

    /// Oldest-first page of locally stored messages.
    pub async fn messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, SyncError> {
        Ok(self
            .storage
            .get_messages_after(conversation_id, None, limit)
            .await?)
    }

    pub async fn message_count(&self, conversation_id: ConversationId) -> Result<i64, SyncError> {
        Ok(self.storage.count_messages(conversation_id).await?)
    }

    pub async fn members(&self, conversation_id: ConversationId) -> Result<Vec<UserId>, SyncError> {
        Ok(self.storage.list_members(conversation_id).await?)
    }

    pub fn open_conversation(&self, conversation_id: ConversationId) {
        self.view.open(conversation_id);
    }

    pub fn close_conversation(&self) {
        self.view.close();
    }

    pub async fn unread_count(&self, conversation_id: ConversationId) -> Result<u32, SyncError> {
        match self.unread.displayed(conversation_id) {
            Some(count) => Ok(count),
            None => self.unread.get_unread_count(conversation_id).await,
        }
    }

    pub fn unread_updates(&self) -> impl Stream<Item = UnreadUpdate> + Send + Unpin + 'static {
        self.unread.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe_status()
    }

    pub fn outbox_indicator(&self) -> watch::Receiver<OutboxIndicator> {
        self.outbox.indicator()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn writes_blocked(&self) -> bool {
        self.auth.writes_blocked()
    }

    pub fn subscribe_writes_blocked(&self) -> watch::Receiver<bool> {
        self.auth.subscribe_writes_blocked()
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Stops background work, closes the live channel and checkpoints.
    pub async fn shutdown(&self) {
        self.outbox.set_active(false);
        self.unread.set_active(false);
        self.durability.on_foreground();
        if let Some(timer) = self
            .idle_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        self.connection.teardown().await;
        if let Err(err) = self.durability.on_bulk_complete().await {
            warn!(error = %err, "engine: final checkpoint failed");
        }
        info!("engine: shut down");
    }

    fn activate(&self) {
        self.view.set_foreground(true);
        self.durability.on_foreground();
        self.outbox.set_active(true);
        self.unread.set_active(true);
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
