use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, DeliveryStatus},
    error::FailureClass,
    protocol::{PushPayload, RemoteMessage, PUSH_TYPE_NEW_MESSAGE},
};
use storage::{MergeOutcome, Storage};
use tracing::{debug, info, warn};

use crate::{
    connection::RealtimeSink,
    durability::DurabilityManager,
    error::SyncError,
    events::{EventHub, SyncEvent},
    resync::{MissedDataResync, ResyncReport},
    unread::UnreadTracker,
    view::ViewState,
};

/// Single path by which remote records reach the local store: live events,
/// push payloads, polling and catch-up all merge here.
pub struct Ingestor {
    storage: Storage,
    resync: MissedDataResync,
    unread: Arc<UnreadTracker>,
    durability: Arc<DurabilityManager>,
    view: Arc<ViewState>,
    events: Arc<EventHub>,
}

impl Ingestor {
    pub fn new(
        storage: Storage,
        resync: MissedDataResync,
        unread: Arc<UnreadTracker>,
        durability: Arc<DurabilityManager>,
        view: Arc<ViewState>,
        events: Arc<EventHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            resync,
            unread,
            durability,
            view,
            events,
        })
    }

    /// Merges one record by server id. Live events do not move the catch-up
    /// cursor; the next resync re-reads past them and ignores the duplicates.
    pub async fn apply_remote(&self, message: &RemoteMessage) -> Result<MergeOutcome, SyncError> {
        let outcome = match self.storage.insert_or_ignore_message(message).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.events
                    .raise_banner(FailureClass::FatalLocalStorage, "Local storage is unavailable");
                return Err(err.into());
            }
        };
        self.durability.note_write();

        match outcome {
            MergeOutcome::Inserted => self.announce(message).await,
            MergeOutcome::Reconciled => {
                if let Some(correlation_key) = message.correlation_key {
                    self.events.emit(SyncEvent::DeliveryChanged {
                        correlation_key,
                        status: DeliveryStatus::Delivered,
                        server_id: Some(message.id),
                    });
                }
            }
            MergeOutcome::Ignored => {
                debug!(message_id = %message.id, "ingest: duplicate ignored");
            }
        }
        Ok(outcome)
    }

    /// Fetches what each conversation missed since its last completed
    /// catch-up, or everything when it has none.
    pub async fn catch_up(&self, conversations: &[ConversationId]) -> ResyncReport {
        let report = self.resync.resync(conversations).await;
        self.after_resync(report).await
    }

    /// Stores the message carried by a push, if any. Returns the conversation
    /// the push points at.
    pub async fn ingest_push(
        &self,
        payload: &PushPayload,
    ) -> Result<Option<ConversationId>, SyncError> {
        match payload.message() {
            Some(message) => {
                let outcome = self.apply_remote(&message).await?;
                info!(
                    conversation_id = %message.conversation_id,
                    message_id = %message.id,
                    ?outcome,
                    "ingest: push payload stored"
                );
                Ok(Some(message.conversation_id))
            }
            None => {
                if payload.kind.as_deref() == Some(PUSH_TYPE_NEW_MESSAGE) {
                    warn!(?payload, "ingest: malformed push payload ignored");
                }
                Ok(payload.conversation_id)
            }
        }
    }

    async fn after_resync(&self, report: ResyncReport) -> ResyncReport {
        for message in &report.inserted {
            self.announce(message).await;
        }
        if report
            .failures
            .iter()
            .any(|(_, err)| err.class() == FailureClass::FatalLocalStorage)
        {
            self.events
                .raise_banner(FailureClass::FatalLocalStorage, "Local storage is unavailable");
        }
        if report.fetched > 0 {
            if let Err(err) = self.durability.on_bulk_complete().await {
                warn!(error = %err, "ingest: checkpoint after catch-up failed");
            }
        }
        report
    }

    /// Feeds a newly stored record to the unread tracker and, when its
    /// conversation is on screen, to the view.
    async fn announce(&self, message: &RemoteMessage) {
        if let Err(err) = self.unread.on_incoming(message).await {
            warn!(message_id = %message.id, error = %err, "ingest: unread update failed");
        }
        if self.view.is_viewing(message.conversation_id) {
            self.events.emit(SyncEvent::MessageReceived(message.clone()));
        }
    }
}

#[async_trait]
impl RealtimeSink for Ingestor {
    async fn on_remote_message(&self, message: RemoteMessage) {
        if let Err(err) = self.apply_remote(&message).await {
            warn!(message_id = %message.id, error = %err, "ingest: live event not stored");
        }
    }

    async fn poll(&self, scope: &[ConversationId]) {
        let report = self.catch_up(scope).await;
        if !report.is_clean() {
            debug!(failures = report.failures.len(), "ingest: polling pass incomplete");
        }
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
