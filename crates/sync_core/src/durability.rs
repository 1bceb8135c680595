use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use storage::{CheckpointMode, CheckpointResult, CommitMode, Storage};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{config::DurabilitySettings, error::SyncError, retry::RetryPolicy};

/// Schedules WAL checkpoints. Committed data is already durable through
/// `synchronous=FULL`; checkpoints only bound the size of the log.
pub struct DurabilityManager {
    storage: Storage,
    settings: DurabilitySettings,
    retry: RetryPolicy,
    last_write: Mutex<Option<Instant>>,
    background: Mutex<Option<JoinHandle<()>>>,
    completed: AtomicU64,
}

impl DurabilityManager {
    pub fn new(storage: Storage, settings: DurabilitySettings) -> Arc<Self> {
        Arc::new(Self {
            storage,
            retry: settings.checkpoint_retry(),
            settings,
            last_write: Mutex::new(None),
            background: Mutex::new(None),
            completed: AtomicU64::new(0),
        })
    }

    /// Returns whether the store runs in a crash-safe commit mode. In-memory
    /// stores report `false`.
    pub async fn verify_commit_mode(&self) -> Result<bool, SyncError> {
        let mode = self.storage.commit_mode().await?;
        let safe = mode.is_crash_safe() && mode.wal_autocheckpoint == 0;
        if safe {
            info!(journal_mode = %mode.journal_mode, synchronous = mode.synchronous, "durability: commit mode verified");
        } else {
            log_unsafe_mode(&mode);
        }
        Ok(safe)
    }

    /// Records write activity. Never checkpoints.
    pub fn note_write(&self) {
        *self
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Number of checkpoints that completed without reporting busy.
    pub fn checkpoints_completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Schedules a checkpoint after the settle delay. A newer call replaces a
    /// pending one.
    pub fn on_background(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(manager.settings.settle_delay).await;
            let mode = manager.mode_for_size(CheckpointMode::Passive);
            if let Err(err) = manager.checkpoint_with_retry(mode).await {
                warn!(error = %err, "durability: background checkpoint failed");
            }
        });
        let previous = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!(
            settle_ms = self.settings.settle_delay.as_millis() as u64,
            "durability: background checkpoint scheduled"
        );
    }

    pub fn on_foreground(&self) {
        let pending = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            if !pending.is_finished() {
                debug!("durability: background checkpoint cancelled");
            }
            pending.abort();
        }
    }

    pub async fn on_bulk_complete(&self) -> Result<CheckpointResult, SyncError> {
        let mode = self.mode_for_size(CheckpointMode::Passive);
        self.checkpoint_with_retry(mode).await
    }

    /// Checkpoints once the store has been quiet and the log is large.
    pub async fn on_idle_tick(&self) -> Result<Option<CheckpointResult>, SyncError> {
        let recently_written = self
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|at| at.elapsed() < self.settings.quiet_period);
        if recently_written {
            return Ok(None);
        }

        let wal_bytes = self.storage.wal_size_bytes()?;
        let mode = if wal_bytes >= self.settings.wal_ceiling_bytes {
            CheckpointMode::Truncate
        } else if wal_bytes >= self.settings.wal_threshold_bytes {
            CheckpointMode::Passive
        } else {
            return Ok(None);
        };
        debug!(wal_bytes, ?mode, "durability: idle checkpoint");
        self.checkpoint_with_retry(mode).await.map(Some)
    }

    pub fn spawn_idle_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(manager.settings.idle_interval);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(err) = manager.on_idle_tick().await {
                    warn!(error = %err, "durability: idle checkpoint failed");
                }
            }
        })
    }

    /// Runs a checkpoint, backing off while SQLite reports the log as busy
    /// or locked.
    pub async fn checkpoint_with_retry(
        &self,
        mode: CheckpointMode,
    ) -> Result<CheckpointResult, SyncError> {
        let mut failures = 0;
        loop {
            let busy_reason = match self.storage.checkpoint(mode).await {
                Ok(result) if !result.busy => {
                    self.completed.fetch_add(1, Ordering::SeqCst);
                    info!(
                        ?mode,
                        log_frames = result.log_frames,
                        checkpointed_frames = result.checkpointed_frames,
                        "durability: checkpoint complete"
                    );
                    return Ok(result);
                }
                Ok(result) => Ok(result),
                Err(err) if is_lock_error(&err) => Err(err),
                Err(err) => return Err(err.into()),
            };

            failures += 1;
            let Some(delay) = self.retry.next_delay(failures) else {
                warn!(?mode, failures, "durability: checkpoint still busy, giving up");
                return busy_reason.map_err(SyncError::from);
            };
            debug!(?mode, failures, delay_ms = delay.as_millis() as u64, "durability: checkpoint busy, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    fn mode_for_size(&self, preferred: CheckpointMode) -> CheckpointMode {
        match self.storage.wal_size_bytes() {
            Ok(bytes) if bytes >= self.settings.wal_ceiling_bytes => CheckpointMode::Truncate,
            _ => preferred,
        }
    }
}

fn log_unsafe_mode(mode: &CommitMode) {
    warn!(
        journal_mode = %mode.journal_mode,
        synchronous = mode.synchronous,
        wal_autocheckpoint = mode.wal_autocheckpoint,
        "durability: store is not in a crash-safe commit mode"
    );
}

fn is_lock_error(err: &anyhow::Error) -> bool {
    let message = format!("{err:#}").to_ascii_lowercase();
    message.contains("database is locked") || message.contains("busy")
}

#[cfg(test)]
#[path = "tests/durability_tests.rs"]
mod tests;
