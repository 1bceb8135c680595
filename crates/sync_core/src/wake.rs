use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use shared::{
    domain::{ConversationId, WakeReason},
    protocol::PushPayload,
};
use storage::Storage;
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthGate, BlockReason},
    connection::ConnectionManager,
    error::SyncError,
    ingest::Ingestor,
    outbox::{DrainTrigger, OutboxProcessor},
    resync::ResyncReport,
    unread::UnreadTracker,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    /// Not run because another invocation covers it.
    Skipped,
    Blocked(BlockReason),
    Failed(String),
}

impl StepOutcome {
    fn from_error(err: &SyncError) -> Self {
        StepOutcome::Failed(err.to_string())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Done => f.write_str("done"),
            StepOutcome::Skipped => f.write_str("skipped"),
            StepOutcome::Blocked(reason) => write!(f, "blocked ({reason:?})"),
            StepOutcome::Failed(err) => write!(f, "failed ({err})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeReport {
    pub reason: WakeReason,
    pub hint: Option<ConversationId>,
    /// The invocation joined a run already in progress.
    pub coalesced: bool,
    pub auth: StepOutcome,
    pub rebuild: StepOutcome,
    pub resync: StepOutcome,
    pub drain: StepOutcome,
    pub unread: StepOutcome,
    /// Conversations hinted by overlapping invocations and resynced after
    /// the main pass.
    pub follow_ups: Vec<ConversationId>,
}

impl WakeReport {
    fn new(reason: WakeReason, hint: Option<ConversationId>) -> Self {
        Self {
            reason,
            hint,
            coalesced: false,
            auth: StepOutcome::Skipped,
            rebuild: StepOutcome::Skipped,
            resync: StepOutcome::Skipped,
            drain: StepOutcome::Skipped,
            unread: StepOutcome::Skipped,
            follow_ups: Vec::new(),
        }
    }

    fn coalesced(reason: WakeReason, hint: Option<ConversationId>) -> Self {
        Self {
            coalesced: true,
            ..Self::new(reason, hint)
        }
    }
}

#[derive(Default)]
struct WakeState {
    running: bool,
    /// Hints the active run has handled or already queued.
    covered: HashSet<ConversationId>,
    pending: Vec<ConversationId>,
}

/// Clears the running flag when a wake future is dropped mid-run. Queued
/// hints are kept for the next run.
struct RunGuard<'a> {
    state: &'a Mutex<WakeState>,
    armed: bool,
}

impl RunGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.running = false;
            state.covered.clear();
            debug!(pending = state.pending.len(), "wake: run cancelled before finishing");
        }
    }
}

/// Single entry point for lifecycle signals. Runs
/// auth → rebuild → resync → drain → unread, each step isolated from the
/// failures of the others.
pub struct WakeOrchestrator {
    storage: Storage,
    auth: Arc<AuthGate>,
    connection: Arc<ConnectionManager>,
    ingest: Arc<Ingestor>,
    outbox: Arc<OutboxProcessor>,
    unread: Arc<UnreadTracker>,
    state: Mutex<WakeState>,
}

impl WakeOrchestrator {
    pub fn new(
        storage: Storage,
        auth: Arc<AuthGate>,
        connection: Arc<ConnectionManager>,
        ingest: Arc<Ingestor>,
        outbox: Arc<OutboxProcessor>,
        unread: Arc<UnreadTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            auth,
            connection,
            ingest,
            outbox,
            unread,
            state: Mutex::new(WakeState::default()),
        })
    }

    pub async fn on_wake(
        &self,
        reason: WakeReason,
        hint: Option<ConversationId>,
    ) -> WakeReport {
        {
            let mut state = self.lock_state();
            if state.running {
                if let Some(conversation_id) = hint {
                    if state.covered.insert(conversation_id) {
                        state.pending.push(conversation_id);
                        debug!(reason = reason.as_str(), conversation_id = %conversation_id, "wake: hint queued for follow-up");
                    }
                }
                return WakeReport::coalesced(reason, hint);
            }
            state.running = true;
            let WakeState {
                covered, pending, ..
            } = &mut *state;
            covered.clear();
            covered.extend(hint);
            covered.extend(pending.iter().copied());
        }
        let mut guard = RunGuard {
            state: &self.state,
            armed: true,
        };

        info!(reason = reason.as_str(), hint = ?hint, "wake: starting");
        let mut report = self.run_pass(reason, hint).await;

        loop {
            let hints = {
                let mut state = self.lock_state();
                if state.pending.is_empty() {
                    state.running = false;
                    state.covered.clear();
                    guard.disarm();
                    break;
                }
                std::mem::take(&mut state.pending)
            };
            self.follow_up(reason, &hints).await;
            report.follow_ups.extend(hints);
        }

        info!(
            reason = reason.as_str(),
            auth = %report.auth,
            rebuild = %report.rebuild,
            resync = %report.resync,
            drain = %report.drain,
            unread = %report.unread,
            follow_ups = report.follow_ups.len(),
            "wake: finished"
        );
        report
    }

    /// Stores the message a push carries, then wakes for its conversation.
    pub async fn on_push(&self, payload: PushPayload) -> WakeReport {
        let hint = match self.ingest.ingest_push(&payload).await {
            Ok(hint) => hint,
            Err(err) => {
                warn!(error = %err, "wake: push payload not stored");
                payload.conversation_id
            }
        };
        self.on_wake(WakeReason::PushWake, hint).await
    }

    async fn run_pass(&self, reason: WakeReason, hint: Option<ConversationId>) -> WakeReport {
        let mut report = WakeReport::new(reason, hint);

        let decision = self
            .auth
            .ensure_writable(self.auth.refresh_timeout())
            .await;
        report.auth = match decision.reason {
            Some(block) if !decision.can_write => StepOutcome::Blocked(block),
            _ => StepOutcome::Done,
        };

        report.rebuild = match self.rebuild(hint.as_slice()).await {
            Ok(()) => StepOutcome::Done,
            Err(err) => {
                warn!(error = %err, "wake: rebuild with stored scope failed, reusing current scope");
                self.connection.rebuild().await;
                StepOutcome::from_error(&err)
            }
        };

        report.resync = self.resync(hint).await;

        report.drain = match self.outbox.drain(DrainTrigger::Wake(reason)).await {
            Ok(drain) => match drain.deferred {
                Some(block) => StepOutcome::Blocked(block),
                None => StepOutcome::Done,
            },
            Err(err) => {
                warn!(error = %err, "wake: outbox drain failed");
                StepOutcome::from_error(&err)
            }
        };

        report.unread = match self.unread.reconcile().await {
            Ok(_) => StepOutcome::Done,
            Err(err) => {
                warn!(error = %err, "wake: unread reconciliation failed");
                StepOutcome::from_error(&err)
            }
        };
        report
    }

    /// Resyncs conversations hinted while the main pass ran, then drains once.
    async fn follow_up(&self, reason: WakeReason, hints: &[ConversationId]) {
        info!(reason = reason.as_str(), conversations = hints.len(), "wake: follow-up pass");
        if let Err(err) = self.rebuild(hints).await {
            warn!(error = %err, "wake: follow-up scope update failed");
        }
        let report = self.ingest.catch_up(hints).await;
        log_failures("follow-up", &report);
        if let Err(err) = self.outbox.drain(DrainTrigger::Wake(reason)).await {
            warn!(error = %err, "wake: follow-up drain failed");
        }
    }

    /// Adds any unknown hinted conversation, then resubscribes to the full scope.
    async fn rebuild(&self, hints: &[ConversationId]) -> Result<(), SyncError> {
        for &conversation_id in hints {
            if self.storage.ensure_conversation(conversation_id).await? {
                info!(conversation_id = %conversation_id, "wake: hinted conversation added to scope");
            }
        }
        let scope = self.storage.list_conversation_ids().await?;
        let generation = self.connection.rebuild_with_scope(scope).await;
        debug!(generation, "wake: connection rebuild started");
        Ok(())
    }

    async fn resync(&self, hint: Option<ConversationId>) -> StepOutcome {
        let mut report = match hint {
            Some(conversation_id) => self.ingest.catch_up(&[conversation_id]).await,
            None => ResyncReport::default(),
        };
        match self.storage.list_conversation_ids().await {
            Ok(mut conversations) => {
                conversations.retain(|id| Some(*id) != hint);
                report.absorb(self.ingest.catch_up(&conversations).await);
            }
            Err(err) => {
                let err = SyncError::from(err);
                warn!(error = %err, "wake: conversation list unavailable for resync");
                return StepOutcome::from_error(&err);
            }
        }
        log_failures("resync", &report);
        match report.failures.first() {
            None => StepOutcome::Done,
            Some((conversation_id, err)) => StepOutcome::Failed(format!(
                "{} of {} conversations failed, first {conversation_id}: {err}",
                report.failures.len(),
                report.conversations
            )),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_failures(step: &str, report: &ResyncReport) {
    for (conversation_id, err) in &report.failures {
        warn!(step, conversation_id = %conversation_id, error = %err, "wake: conversation not caught up");
    }
}

#[cfg(test)]
#[path = "tests/wake_tests.rs"]
mod tests;
