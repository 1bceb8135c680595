use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::RemoteError,
    protocol::{ReadMarker, RemoteMessage, UnreadCountQuery},
};
use storage::{ReadState, Storage};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::{
    config::UnreadSettings, error::SyncError, outbox::OutboxProcessor, remote::RemoteStore,
    view::ViewState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadUpdate {
    pub conversation_id: ConversationId,
    pub count: u32,
}

/// Displayed count = confirmed baseline + increments observed after the
/// baseline's `confirmed_through` marker.
#[derive(Debug, Clone, Default)]
struct UnreadEntry {
    baseline: u32,
    confirmed_through: Option<DateTime<Utc>>,
    increments: HashMap<MessageId, DateTime<Utc>>,
}

impl UnreadEntry {
    fn displayed(&self) -> u32 {
        self.baseline
            .saturating_add(u32::try_from(self.increments.len()).unwrap_or(u32::MAX))
    }

    fn covers(&self, created_at: DateTime<Utc>) -> bool {
        self.confirmed_through.is_some_and(|through| created_at <= through)
    }
}

pub struct UnreadTracker {
    storage: Storage,
    remote: Arc<dyn RemoteStore>,
    outbox: Arc<OutboxProcessor>,
    view: Arc<ViewState>,
    user_id: UserId,
    settings: UnreadSettings,
    entries: Mutex<HashMap<ConversationId, UnreadEntry>>,
    updates: broadcast::Sender<UnreadUpdate>,
    periodic: Mutex<Option<JoinHandle<()>>>,
}

impl UnreadTracker {
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteStore>,
        outbox: Arc<OutboxProcessor>,
        view: Arc<ViewState>,
        user_id: UserId,
        settings: UnreadSettings,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        Arc::new(Self {
            storage,
            remote,
            outbox,
            view,
            user_id,
            settings,
            entries: Mutex::new(HashMap::new()),
            updates,
            periodic: Mutex::new(None),
        })
    }

    /// Per-conversation unread counts as they change.
    pub fn subscribe(&self) -> impl Stream<Item = UnreadUpdate> + Send + Unpin + 'static {
        BroadcastStream::new(self.updates.subscribe()).filter_map(|update| update.ok())
    }

    /// Unread count from the local store alone.
    pub async fn get_unread_count(&self, conversation_id: ConversationId) -> Result<u32, SyncError> {
        Ok(self
            .storage
            .count_unread(conversation_id, self.user_id)
            .await?)
    }

    /// Count currently shown for the conversation, if it has been tracked.
    pub fn displayed(&self, conversation_id: ConversationId) -> Option<u32> {
        self.lock_entries()
            .get(&conversation_id)
            .map(UnreadEntry::displayed)
    }

    /// Moves the read marker to the referenced message's own timestamp.
    ///
    /// Returns `false` without touching anything when the message is unknown,
    /// belongs to another conversation, or would move the marker backward.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool, SyncError> {
        let Some(message) = self.storage.get_message(message_id).await? else {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "unread: mark read for unknown message ignored");
            return Ok(false);
        };
        if message.conversation_id != conversation_id {
            warn!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                actual = %message.conversation_id,
                "unread: mark read for message of another conversation ignored"
            );
            return Ok(false);
        }

        let state = ReadState {
            conversation_id,
            user_id: self.user_id,
            last_read_at: message.created_at,
            last_read_message_id: message_id,
            synced: false,
        };
        if !self.storage.upsert_read_state(&state).await? {
            debug!(conversation_id = %conversation_id, message_id = %message_id, "unread: read marker not advanced");
            return Ok(false);
        }
        self.outbox.enqueue_mark_read(&state).await?;

        let entry = self.local_entry(conversation_id).await?;
        let count = entry.displayed();
        self.lock_entries().insert(conversation_id, entry);
        self.publish(conversation_id, count);
        info!(conversation_id = %conversation_id, message_id = %message_id, unread = count, "unread: marked read");
        Ok(true)
    }

    /// Counts a newly stored message from someone else, once per message id.
    pub async fn on_incoming(&self, message: &RemoteMessage) -> Result<(), SyncError> {
        let conversation_id = message.conversation_id;
        if message.sender_id == self.user_id || self.view.is_viewing(conversation_id) {
            return Ok(());
        }
        let read = self
            .storage
            .get_read_state(conversation_id, self.user_id)
            .await?;
        if read.is_some_and(|state| message.created_at <= state.last_read_at) {
            return Ok(());
        }

        let tracked = self.lock_entries().contains_key(&conversation_id);
        let seed = if tracked {
            None
        } else {
            Some(self.local_entry(conversation_id).await?)
        };

        let count = {
            let mut entries = self.lock_entries();
            let entry = entries.entry(conversation_id).or_insert_with(|| seed.unwrap_or_default());
            if !entry.covers(message.created_at) {
                entry.increments.insert(message.id, message.created_at);
            }
            entry.displayed()
        };
        self.publish(conversation_id, count);
        Ok(())
    }

    /// Pulls authoritative counts for every known conversation in one call.
    /// Returns how many conversations took a new baseline.
    pub async fn reconcile(&self) -> Result<usize, SyncError> {
        let conversations = self.storage.list_conversation_ids().await?;
        if conversations.is_empty() {
            return Ok(0);
        }
        let mut markers = Vec::with_capacity(conversations.len());
        for conversation_id in conversations {
            let read = self
                .storage
                .get_read_state(conversation_id, self.user_id)
                .await?;
            markers.push(ReadMarker {
                conversation_id,
                last_read_at: read.map(|state| state.last_read_at),
            });
        }

        let query = UnreadCountQuery {
            user_id: self.user_id,
            conversations: markers,
        };
        let counts = tokio::time::timeout(
            self.settings.fetch_timeout,
            self.remote.fetch_unread_counts(query),
        )
        .await
        .map_err(|_| RemoteError::Timeout(self.settings.fetch_timeout))??;

        let mut updated = Vec::new();
        {
            let mut entries = self.lock_entries();
            for remote in counts {
                let entry = entries.entry(remote.conversation_id).or_default();
                if let (Some(marker), Some(current)) = (remote.confirmed_through, entry.confirmed_through) {
                    if marker < current {
                        debug!(conversation_id = %remote.conversation_id, "unread: stale remote count ignored");
                        continue;
                    }
                }
                let before = entry.displayed();
                entry.baseline = remote.count;
                // No server marker: the count covers nothing newer than what
                // was already confirmed, so later increments stay on top.
                if let Some(marker) = remote.confirmed_through {
                    entry.confirmed_through = Some(marker);
                    entry.increments.retain(|_, created_at| *created_at > marker);
                }
                if entry.displayed() != before {
                    debug!(
                        conversation_id = %remote.conversation_id,
                        before,
                        after = entry.displayed(),
                        "unread: baseline corrected"
                    );
                }
                updated.push((remote.conversation_id, entry.displayed()));
            }
        }
        for (conversation_id, count) in &updated {
            self.publish(*conversation_id, *count);
        }
        Ok(updated.len())
    }

    /// Starts or stops periodic reconciliation.
    pub fn set_active(self: &Arc<Self>, active: bool) {
        let mut periodic = self.periodic.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = periodic.take() {
            task.abort();
        }
        if !active {
            return;
        }
        let tracker = Arc::clone(self);
        let interval = self.settings.reconcile_interval;
        *periodic = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(err) = tracker.reconcile().await {
                    warn!(error = %err, "unread: periodic reconciliation failed");
                }
            }
        }));
    }

    async fn local_entry(&self, conversation_id: ConversationId) -> Result<UnreadEntry, SyncError> {
        let baseline = self
            .storage
            .count_unread(conversation_id, self.user_id)
            .await?;
        let confirmed_through = self.storage.latest_message_at(conversation_id).await?;
        Ok(UnreadEntry {
            baseline,
            confirmed_through,
            increments: HashMap::new(),
        })
    }

    fn publish(&self, conversation_id: ConversationId, count: u32) {
        let _ = self.updates.send(UnreadUpdate {
            conversation_id,
            count,
        });
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, UnreadEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
