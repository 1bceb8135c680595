use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConversationId, CorrelationKey, DeliveryStatus, MessageId, PendingWriteId, UserId,
        WakeReason, WriteKind,
    },
    error::{FailureClass, RemoteError},
    protocol::{
        IncrementViewWrite, MarkReadWrite, SendMessageWrite, ToggleLikeWrite, WriteAck,
        WritePayload, WriteResponse,
    },
};
use storage::{PendingWrite, ReadState, Storage, StoredMessage, WriteOutcome};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    auth::{AuthGate, BlockReason},
    config::OutboxSettings,
    durability::DurabilityManager,
    error::SyncError,
    events::{EventHub, SyncEvent},
    remote::RemoteStore,
    retry::RetryPolicy,
};

const SEND_ORDER: [WriteKind; 4] = [
    WriteKind::SendMessage,
    WriteKind::ToggleLike,
    WriteKind::IncrementView,
    WriteKind::MarkRead,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainTrigger {
    Wake(WakeReason),
    /// Periodic timer while the app is active.
    Periodic,
    /// Backoff or auth-deferral timer armed by a previous cycle.
    Timer,
    Enqueue,
    /// Explicit retrigger of a failed write.
    Retry,
}

impl DrainTrigger {
    /// Lifecycle signals retry everything queued without waiting out backoff.
    fn bypasses_backoff(self) -> bool {
        matches!(
            self,
            DrainTrigger::Wake(
                WakeReason::ColdStart
                    | WakeReason::AppForeground
                    | WakeReason::NetworkRestored
                    | WakeReason::Manual
            ) | DrainTrigger::Retry
        )
    }

    fn merge(self, other: DrainTrigger) -> DrainTrigger {
        if other.bypasses_backoff() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Set when the cycle was deferred for an auth problem.
    pub deferred: Option<BlockReason>,
    /// Another drain was already running and will rerun on our behalf.
    pub coalesced: bool,
}

/// Counts behind the "sending…" and "failed, retry" affordances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxIndicator {
    pub pending: u32,
    pub failed: u32,
}

#[derive(Default)]
struct DrainState {
    running: bool,
    rerun: Option<DrainTrigger>,
}

/// Releases the running flag of a drain future dropped before it finished.
/// A queued rerun stays queued for the next drain.
struct DrainGuard<'a> {
    state: &'a Mutex<DrainState>,
    armed: bool,
}

impl DrainGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().unwrap_or_else(PoisonError::into_inner).running = false;
            debug!("outbox: drain cancelled before finishing");
        }
    }
}

#[derive(Default)]
struct TimerSlot {
    token: u64,
    handle: Option<JoinHandle<()>>,
}

enum GroupOutcome {
    Done,
    AuthRejected,
}

/// Durable write queue in front of the remote store's batched endpoints.
pub struct OutboxProcessor {
    storage: Storage,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<AuthGate>,
    events: Arc<EventHub>,
    durability: Arc<DurabilityManager>,
    user_id: UserId,
    settings: OutboxSettings,
    retry: RetryPolicy,
    drain_state: Mutex<DrainState>,
    timer: Mutex<TimerSlot>,
    periodic: Mutex<Option<JoinHandle<()>>>,
    indicator: watch::Sender<OutboxIndicator>,
}

impl OutboxProcessor {
    pub fn new(
        storage: Storage,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<AuthGate>,
        events: Arc<EventHub>,
        durability: Arc<DurabilityManager>,
        user_id: UserId,
        settings: OutboxSettings,
    ) -> Arc<Self> {
        let (indicator, _) = watch::channel(OutboxIndicator::default());
        Arc::new(Self {
            storage,
            remote,
            auth,
            events,
            durability,
            user_id,
            retry: settings.retry(),
            settings,
            drain_state: Mutex::new(DrainState::default()),
            timer: Mutex::new(TimerSlot::default()),
            periodic: Mutex::new(None),
            indicator,
        })
    }

    pub fn indicator(&self) -> watch::Receiver<OutboxIndicator> {
        self.indicator.subscribe()
    }

    /// Stores the message optimistically as `pending` and queues the send.
    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<StoredMessage, SyncError> {
        let correlation_key = CorrelationKey::generate();
        let now = Utc::now();
        let stored = self
            .storage
            .insert_local_message(conversation_id, self.user_id, content, correlation_key, now)
            .await?;
        let write = WritePayload::SendMessage(SendMessageWrite {
            correlation_key,
            conversation_id,
            sender_id: self.user_id,
            content: content.to_owned(),
            created_at: now,
        });
        self.events.emit(SyncEvent::DeliveryChanged {
            correlation_key,
            status: DeliveryStatus::Pending,
            server_id: None,
        });
        self.enqueue(write, now).await?;
        info!(conversation_id = %conversation_id, %correlation_key, "outbox: message queued");
        Ok(stored)
    }

    pub async fn toggle_like(
        self: &Arc<Self>,
        message_id: MessageId,
        liked: bool,
    ) -> Result<PendingWriteId, SyncError> {
        let write = WritePayload::ToggleLike(ToggleLikeWrite {
            correlation_key: CorrelationKey::generate(),
            message_id,
            user_id: self.user_id,
            liked,
        });
        self.enqueue(write, Utc::now()).await
    }

    pub async fn increment_view(
        self: &Arc<Self>,
        message_id: MessageId,
    ) -> Result<PendingWriteId, SyncError> {
        let write = WritePayload::IncrementView(IncrementViewWrite {
            correlation_key: CorrelationKey::generate(),
            message_id,
            user_id: self.user_id,
        });
        self.enqueue(write, Utc::now()).await
    }

    pub async fn enqueue_mark_read(
        self: &Arc<Self>,
        state: &ReadState,
    ) -> Result<PendingWriteId, SyncError> {
        let write = WritePayload::MarkRead(MarkReadWrite {
            correlation_key: CorrelationKey::generate(),
            conversation_id: state.conversation_id,
            user_id: state.user_id,
            last_read_at: state.last_read_at,
            last_read_message_id: state.last_read_message_id,
        });
        self.enqueue(write, Utc::now()).await
    }

    /// Gives a permanently failed write a fresh retry budget and drains.
    pub async fn retry_failed(self: &Arc<Self>, id: PendingWriteId) -> Result<bool, SyncError> {
        let Some(write) = self.storage.retry_failed_write(id, Utc::now()).await? else {
            return Ok(false);
        };
        if let WritePayload::SendMessage(send) = &write.payload {
            self.storage
                .set_delivery_status(send.correlation_key, DeliveryStatus::Pending)
                .await?;
            self.events.emit(SyncEvent::DeliveryChanged {
                correlation_key: send.correlation_key,
                status: DeliveryStatus::Pending,
                server_id: None,
            });
        }
        info!(write_id = %id, kind = write.kind.as_str(), "outbox: failed write retriggered");
        self.refresh_indicator().await?;
        self.spawn_drain(DrainTrigger::Retry);
        Ok(true)
    }

    /// Starts or stops the periodic drain timer.
    pub fn set_active(self: &Arc<Self>, active: bool) {
        let mut periodic = self.periodic.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = periodic.take() {
            task.abort();
        }
        if !active {
            return;
        }
        let outbox = Arc::clone(self);
        let interval = self.settings.periodic_interval;
        *periodic = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(err) = outbox.drain(DrainTrigger::Periodic).await {
                    warn!(error = %err, "outbox: periodic drain failed");
                }
            }
        }));
    }

    /// Sends everything that is due. A drain requested while another one is
    /// running is folded into a rerun of the active drain.
    pub async fn drain(self: &Arc<Self>, trigger: DrainTrigger) -> Result<DrainReport, SyncError> {
        {
            let mut state = self.drain_state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.running {
                state.rerun = Some(match state.rerun {
                    Some(pending) => pending.merge(trigger),
                    None => trigger,
                });
                debug!(?trigger, "outbox: drain already running, coalesced");
                return Ok(DrainReport {
                    coalesced: true,
                    ..DrainReport::default()
                });
            }
            state.running = true;
        }
        let mut guard = DrainGuard {
            state: &self.drain_state,
            armed: true,
        };

        let mut report = DrainReport::default();
        let mut trigger = trigger;
        let outcome = loop {
            let cycle = self.drain_cycle(trigger, &mut report).await;
            let next = {
                let mut state = self.drain_state.lock().unwrap_or_else(PoisonError::into_inner);
                let next = match &cycle {
                    Ok(true) => Some(state.rerun.take().unwrap_or(DrainTrigger::Timer)),
                    Ok(false) => state.rerun.take(),
                    Err(_) => None,
                };
                if next.is_none() {
                    state.running = false;
                    state.rerun = None;
                    guard.disarm();
                }
                next
            };
            match next {
                Some(rerun) => trigger = rerun,
                None => break cycle.map(|_| ()),
            }
        };

        if let Err(err) = outcome {
            error!(error = %err, "outbox: drain aborted on local store failure");
            self.events
                .raise_banner(FailureClass::FatalLocalStorage, "Local storage is unavailable");
            return Err(err);
        }

        self.arm_timer(report.deferred.is_some()).await?;
        self.refresh_indicator().await?;
        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed,
                deferred = ?report.deferred,
                "outbox: drain finished"
            );
        }
        Ok(report)
    }

    /// Runs one batch. Returns whether more due writes may remain.
    async fn drain_cycle(
        self: &Arc<Self>,
        trigger: DrainTrigger,
        report: &mut DrainReport,
    ) -> Result<bool, SyncError> {
        let horizon = if trigger.bypasses_backoff() {
            DateTime::<Utc>::MAX_UTC
        } else {
            Utc::now()
        };
        let due = self
            .storage
            .dequeue_due(horizon, self.settings.batch_limit)
            .await?;
        if due.is_empty() {
            return Ok(false);
        }
        let full_batch = due.len() as u32 >= self.settings.batch_limit;

        let decision = self.auth.ensure_writable(self.auth.refresh_timeout()).await;
        if !decision.can_write {
            info!(reason = ?decision.reason, queued = due.len(), ?trigger, "outbox: cycle deferred");
            report.deferred = decision.reason;
            return Ok(false);
        }
        report.deferred = None;

        let mut groups: HashMap<WriteKind, Vec<PendingWrite>> = HashMap::new();
        for write in due {
            groups.entry(write.kind).or_default().push(write);
        }
        for kind in SEND_ORDER {
            let Some(writes) = groups.remove(&kind) else {
                continue;
            };
            if let GroupOutcome::AuthRejected = self.send_group(kind, writes, report).await? {
                self.auth.invalidate().await;
                report.deferred = Some(BlockReason::CredentialRejected);
                return Ok(false);
            }
        }
        // Backoff-bypassing triggers would pick the rescheduled rows up again.
        Ok(full_batch && !trigger.bypasses_backoff())
    }

    async fn send_group(
        &self,
        kind: WriteKind,
        writes: Vec<PendingWrite>,
        report: &mut DrainReport,
    ) -> Result<GroupOutcome, SyncError> {
        report.attempted += writes.len();
        for write in &writes {
            if let WritePayload::SendMessage(send) = &write.payload {
                self.mark_sent(send.correlation_key).await?;
            }
        }

        debug!(kind = kind.as_str(), count = writes.len(), "outbox: sending batch");
        let call = self.call_remote(kind, &writes);
        let responses = match tokio::time::timeout(self.settings.write_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.settings.write_timeout)),
        };

        let mut outcome = GroupOutcome::Done;
        match responses {
            Ok(responses) => {
                let mut by_key: HashMap<CorrelationKey, WriteResponse> = responses
                    .into_iter()
                    .map(|response| (response.correlation_key, response))
                    .collect();
                for write in writes {
                    let result = match by_key.remove(&write.correlation_key) {
                        Some(response) => response.into_result(),
                        None => Err(RemoteError::Network("no result returned for write".into())),
                    };
                    if self.settle(write, result, report).await? {
                        outcome = GroupOutcome::AuthRejected;
                    }
                }
            }
            Err(err) => {
                warn!(kind = kind.as_str(), error = %err, "outbox: batch call failed");
                for write in writes {
                    if self.settle(write, Err(err.clone()), report).await? {
                        outcome = GroupOutcome::AuthRejected;
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn call_remote(
        &self,
        kind: WriteKind,
        writes: &[PendingWrite],
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        let payloads = writes.iter().map(|w| &w.payload);
        match kind {
            WriteKind::SendMessage => {
                let batch = payloads
                    .filter_map(|p| match p {
                        WritePayload::SendMessage(w) => Some(w.clone()),
                        _ => None,
                    })
                    .collect();
                self.remote.send_messages(batch).await
            }
            WriteKind::ToggleLike => {
                let batch = payloads
                    .filter_map(|p| match p {
                        WritePayload::ToggleLike(w) => Some(w.clone()),
                        _ => None,
                    })
                    .collect();
                self.remote.toggle_likes(batch).await
            }
            WriteKind::IncrementView => {
                let batch = payloads
                    .filter_map(|p| match p {
                        WritePayload::IncrementView(w) => Some(w.clone()),
                        _ => None,
                    })
                    .collect();
                self.remote.increment_views(batch).await
            }
            WriteKind::MarkRead => {
                let batch = payloads
                    .filter_map(|p| match p {
                        WritePayload::MarkRead(w) => Some(w.clone()),
                        _ => None,
                    })
                    .collect();
                self.remote.mark_reads(batch).await
            }
        }
    }

    /// Applies one item's result. Returns `true` when the remote refused the
    /// credential; the item is left untouched for the deferred cycle.
    async fn settle(
        &self,
        write: PendingWrite,
        result: Result<WriteAck, RemoteError>,
        report: &mut DrainReport,
    ) -> Result<bool, SyncError> {
        match result {
            Ok(ack) => {
                self.complete(&write, Some(ack)).await?;
                report.delivered += 1;
            }
            Err(RemoteError::AlreadyExists(_)) => {
                self.complete(&write, None).await?;
                report.delivered += 1;
            }
            Err(RemoteError::AuthExpired(reason)) => {
                debug!(write_id = %write.id, %reason, "outbox: write refused, credential expired");
                return Ok(true);
            }
            Err(err @ RemoteError::Validation(_)) => {
                self.fail(&write, &err).await?;
                self.events
                    .raise_banner(FailureClass::Validation, "A change was rejected by the server");
                report.failed += 1;
            }
            Err(err) => {
                let failures = write.retry_count + 1;
                match self.retry.next_delay(failures) {
                    Some(delay) => {
                        let next_eligible_at = Utc::now() + chrono_delay(delay);
                        self.storage
                            .mark_write_result(
                                write.id,
                                &WriteOutcome::RetryAt {
                                    retry_count: failures,
                                    next_eligible_at,
                                    error: err.to_string(),
                                },
                            )
                            .await?;
                        debug!(
                            write_id = %write.id,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "outbox: write rescheduled"
                        );
                        report.retried += 1;
                    }
                    None => {
                        self.fail(&write, &err).await?;
                        self.events.raise_banner(
                            FailureClass::TransientNetwork,
                            "Some changes could not be sent",
                        );
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(false)
    }

    async fn complete(&self, write: &PendingWrite, ack: Option<WriteAck>) -> Result<(), SyncError> {
        self.events.clear_banner(FailureClass::TransientNetwork);
        match &write.payload {
            WritePayload::SendMessage(send) => {
                let server_id = ack.and_then(|ack| ack.message_id);
                match server_id {
                    Some(server_id) => {
                        self.storage
                            .acknowledge_message(
                                send.correlation_key,
                                server_id,
                                ack.and_then(|ack| ack.created_at),
                            )
                            .await?;
                    }
                    None => {
                        self.storage
                            .set_delivery_status(send.correlation_key, DeliveryStatus::Delivered)
                            .await?;
                    }
                }
                self.events.emit(SyncEvent::DeliveryChanged {
                    correlation_key: send.correlation_key,
                    status: DeliveryStatus::Delivered,
                    server_id,
                });
            }
            WritePayload::MarkRead(mark) => {
                self.storage
                    .mark_read_state_synced(
                        mark.conversation_id,
                        mark.user_id,
                        mark.last_read_message_id,
                    )
                    .await?;
            }
            WritePayload::ToggleLike(_) | WritePayload::IncrementView(_) => {}
        }
        self.storage
            .mark_write_result(write.id, &WriteOutcome::Succeeded)
            .await?;
        self.durability.note_write();
        Ok(())
    }

    async fn fail(&self, write: &PendingWrite, err: &RemoteError) -> Result<(), SyncError> {
        warn!(
            write_id = %write.id,
            kind = write.kind.as_str(),
            retries = write.retry_count,
            error = %err,
            "outbox: write failed permanently"
        );
        self.storage
            .mark_write_result(
                write.id,
                &WriteOutcome::Failed {
                    error: err.to_string(),
                },
            )
            .await?;
        if let WritePayload::SendMessage(send) = &write.payload {
            self.storage
                .set_delivery_status(send.correlation_key, DeliveryStatus::Failed)
                .await?;
            self.events.emit(SyncEvent::DeliveryChanged {
                correlation_key: send.correlation_key,
                status: DeliveryStatus::Failed,
                server_id: None,
            });
        }
        Ok(())
    }

    async fn mark_sent(&self, correlation_key: CorrelationKey) -> Result<(), SyncError> {
        let current = self
            .storage
            .get_message_by_correlation_key(correlation_key)
            .await?;
        if current.is_some_and(|m| m.delivery_status == DeliveryStatus::Pending) {
            self.storage
                .set_delivery_status(correlation_key, DeliveryStatus::Sent)
                .await?;
            self.events.emit(SyncEvent::DeliveryChanged {
                correlation_key,
                status: DeliveryStatus::Sent,
                server_id: None,
            });
        }
        Ok(())
    }

    async fn enqueue(
        self: &Arc<Self>,
        write: WritePayload,
        now: DateTime<Utc>,
    ) -> Result<PendingWriteId, SyncError> {
        let id = self.storage.enqueue_pending_write(&write, now).await?;
        self.durability.note_write();
        debug!(write_id = %id, kind = write.kind().as_str(), "outbox: write enqueued");
        self.refresh_indicator().await?;
        if self.auth.writes_blocked() {
            debug!(write_id = %id, "outbox: writes blocked, leaving write queued");
        } else {
            self.spawn_drain(DrainTrigger::Enqueue);
        }
        Ok(id)
    }

    pub fn spawn_drain(self: &Arc<Self>, trigger: DrainTrigger) {
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = outbox.drain(trigger).await {
                warn!(?trigger, error = %err, "outbox: background drain failed");
            }
        });
    }

    async fn arm_timer(self: &Arc<Self>, deferred: bool) -> Result<(), SyncError> {
        let delay = if deferred {
            Some(self.settings.auth_deferral)
        } else {
            self.storage
                .next_due_at()
                .await?
                .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        };
        self.schedule_timer(delay);
        Ok(())
    }

    /// Keeps a single outstanding timer; a newer schedule replaces it.
    fn schedule_timer(self: &Arc<Self>, delay: Option<Duration>) {
        let mut slot = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.handle.take() {
            previous.abort();
        }
        let Some(delay) = delay else {
            return;
        };
        slot.token += 1;
        let token = slot.token;
        let outbox = Arc::clone(self);
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = outbox.timer.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.token != token {
                    return;
                }
                // Detach so the drain below can arm the next timer without aborting itself.
                slot.handle = None;
            }
            if let Err(err) = outbox.drain(DrainTrigger::Timer).await {
                warn!(error = %err, "outbox: timer drain failed");
            }
        }));
        debug!(delay_ms = delay.as_millis() as u64, "outbox: timer armed");
    }

    async fn refresh_indicator(&self) -> Result<(), SyncError> {
        let counts = self.storage.pending_write_counts().await?;
        if counts.failed == 0 {
            self.events.clear_banner(FailureClass::Validation);
        }
        self.indicator.send_if_modified(|current| {
            let next = OutboxIndicator {
                pending: counts.pending,
                failed: counts.failed,
            };
            let changed = *current != next;
            *current = next;
            changed
        });
        Ok(())
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
