use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::ConversationId,
    error::RemoteError,
    protocol::RemoteMessage,
};
use storage::Storage;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::ResyncSettings, error::SyncError, remote::RemoteStore};

/// Outcome of one missed-data pass. Failures are per conversation; one
/// failing conversation does not stop the others.
#[derive(Debug, Default)]
pub struct ResyncReport {
    pub conversations: usize,
    pub fetched: usize,
    /// Rows that did not exist locally before this pass.
    pub inserted: Vec<RemoteMessage>,
    pub failures: Vec<(ConversationId, SyncError)>,
}

impl ResyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: ResyncReport) {
        self.conversations += other.conversations;
        self.fetched += other.fetched;
        self.inserted.extend(other.inserted);
        self.failures.extend(other.failures);
    }
}

#[derive(Debug, Default)]
struct ConversationPass {
    fetched: usize,
    inserted: Vec<RemoteMessage>,
}

/// Fetches remote records newer than each conversation's cursor in bounded
/// batches and merges them with insert-or-ignore semantics.
pub struct MissedDataResync {
    storage: Storage,
    remote: Arc<dyn RemoteStore>,
    settings: ResyncSettings,
    generations: Mutex<HashMap<ConversationId, u64>>,
}

impl MissedDataResync {
    pub fn new(storage: Storage, remote: Arc<dyn RemoteStore>, settings: ResyncSettings) -> Self {
        Self {
            storage,
            remote,
            settings,
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// Resyncs every listed conversation. One that never completed a
    /// catch-up has no cursor and is fetched from the beginning.
    pub async fn resync(&self, conversations: &[ConversationId]) -> ResyncReport {
        let mut report = ResyncReport::default();
        for &conversation_id in conversations {
            let mut single = ResyncReport {
                conversations: 1,
                ..ResyncReport::default()
            };
            match self.resync_conversation(conversation_id).await {
                Ok(pass) => {
                    single.fetched = pass.fetched;
                    single.inserted = pass.inserted;
                }
                Err(err) => {
                    warn!(conversation_id = %conversation_id, error = %err, "resync: conversation failed");
                    single.failures.push((conversation_id, err));
                }
            }
            report.absorb(single);
        }
        if report.fetched > 0 {
            info!(
                conversations = report.conversations,
                fetched = report.fetched,
                inserted = report.inserted.len(),
                "resync: pass complete"
            );
        }
        report
    }

    async fn resync_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationPass, SyncError> {
        let generation = self.begin(conversation_id).await;
        // Only a completed catch-up moves the cursor. Live and pushed rows
        // never do, so messages missed before them are still fetched.
        let mut cursor = self.storage.get_sync_cursor(conversation_id).await?;
        if cursor.is_none() {
            debug!(conversation_id = %conversation_id, "resync: no cursor yet, fetching from start");
        }

        let mut pass = ConversationPass::default();
        loop {
            let batch = tokio::time::timeout(
                self.settings.fetch_timeout,
                self.remote
                    .fetch_since(conversation_id, cursor, self.settings.batch_size),
            )
            .await
            .map_err(|_| RemoteError::Timeout(self.settings.fetch_timeout))??;

            if !self.is_current(conversation_id, generation).await {
                debug!(conversation_id = %conversation_id, generation, "resync: dropping superseded fetch");
                return Ok(pass);
            }
            if batch.is_empty() {
                return Ok(pass);
            }

            let full_batch = batch.len() as u32 >= self.settings.batch_size;
            let merge = self.storage.merge_batch(conversation_id, &batch).await?;
            pass.fetched += batch.len();
            pass.inserted.extend(merge.inserted);
            debug!(
                conversation_id = %conversation_id,
                fetched = batch.len(),
                reconciled = merge.reconciled,
                ignored = merge.ignored,
                "resync: batch merged"
            );

            let advanced = match (merge.cursor, cursor) {
                (Some(next), Some(previous)) => next.is_after(&previous),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !full_batch || !advanced {
                return Ok(pass);
            }
            cursor = merge.cursor;
        }
    }

    async fn begin(&self, conversation_id: ConversationId) -> u64 {
        let mut generations = self.generations.lock().await;
        let generation = generations.entry(conversation_id).or_insert(0);
        *generation += 1;
        *generation
    }

    async fn is_current(&self, conversation_id: ConversationId, generation: u64) -> bool {
        self.generations.lock().await.get(&conversation_id) == Some(&generation)
    }
}

#[cfg(test)]
#[path = "tests/resync_tests.rs"]
mod tests;
