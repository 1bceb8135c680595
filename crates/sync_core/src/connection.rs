use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConnectionStatus, ConversationId},
    protocol::{ChannelEvent, RemoteMessage},
};
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthGate,
    config::ConnectionSettings,
    remote::{LiveChannel, RemoteStore, Subscription},
    retry::RetryPolicy,
};

/// Receiver of everything the live subscription (or its polling substitute)
/// produces.
#[async_trait]
pub trait RealtimeSink: Send + Sync {
    async fn on_remote_message(&self, message: RemoteMessage);
    async fn poll(&self, scope: &[ConversationId]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    pub generation: u64,
    pub status: ConnectionStatus,
    pub subscribed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

struct ConnectionState {
    session: ConnectionSession,
    scope: Vec<ConversationId>,
    channel: Option<Arc<dyn LiveChannel>>,
    /// Heartbeat and retry timers of the current generation.
    timers: Vec<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

/// Owns the live subscription across all of the user's conversations.
///
/// Every subscribe attempt runs under a fresh generation. Results, events and
/// timers belonging to an older generation are dropped on arrival, so a slow
/// attempt that resolves after a newer rebuild cannot touch the session.
pub struct ConnectionManager {
    remote: Arc<dyn RemoteStore>,
    auth: Arc<AuthGate>,
    sink: Arc<dyn RealtimeSink>,
    settings: ConnectionSettings,
    backoff: RetryPolicy,
    inner: Mutex<ConnectionState>,
    status: watch::Sender<ConnectionStatus>,
    generation: watch::Sender<u64>,
}

impl ConnectionManager {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        auth: Arc<AuthGate>,
        sink: Arc<dyn RealtimeSink>,
        settings: ConnectionSettings,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (generation, _) = watch::channel(0);
        Arc::new(Self {
            remote,
            auth,
            sink,
            backoff: settings.backoff(),
            settings,
            inner: Mutex::new(ConnectionState {
                session: ConnectionSession {
                    generation: 0,
                    status: ConnectionStatus::Disconnected,
                    subscribed_at: None,
                    retry_count: 0,
                },
                scope: Vec::new(),
                channel: None,
                timers: Vec::new(),
                poller: None,
            }),
            status,
            generation,
        })
    }

    pub async fn setup(self: &Arc<Self>, scope: Vec<ConversationId>) -> u64 {
        self.rebuild_with_scope(scope).await
    }

    /// Tears down the current subscription and subscribes again. Safe to call
    /// in any state.
    pub async fn rebuild(self: &Arc<Self>) -> u64 {
        let mut inner = self.inner.lock().await;
        self.start_attempt(&mut inner)
    }

    pub async fn rebuild_with_scope(self: &Arc<Self>, mut scope: Vec<ConversationId>) -> u64 {
        scope.sort();
        scope.dedup();
        let mut inner = self.inner.lock().await;
        inner.scope = scope;
        self.start_attempt(&mut inner)
    }

    pub async fn teardown(&self) {
        let mut inner = self.inner.lock().await;
        let generation = inner.session.generation + 1;
        self.retire_current(&mut inner);
        if let Some(poller) = inner.poller.take() {
            poller.abort();
        }
        inner.session = ConnectionSession {
            generation,
            status: ConnectionStatus::Disconnected,
            subscribed_at: None,
            retry_count: 0,
        };
        self.generation.send_replace(generation);
        self.publish_status(ConnectionStatus::Disconnected);
        info!(generation, "realtime: torn down");
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub async fn session(&self) -> ConnectionSession {
        self.inner.lock().await.session.clone()
    }

    pub async fn scope(&self) -> Vec<ConversationId> {
        self.inner.lock().await.scope.clone()
    }

    pub async fn is_polling(&self) -> bool {
        self.inner.lock().await.poller.is_some()
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    fn start_attempt(self: &Arc<Self>, inner: &mut ConnectionState) -> u64 {
        let generation = inner.session.generation + 1;
        self.retire_current(inner);
        inner.session.generation = generation;
        inner.session.status = ConnectionStatus::Connecting;
        inner.session.subscribed_at = None;
        self.generation.send_replace(generation);
        self.publish_status(ConnectionStatus::Connecting);

        info!(
            generation,
            conversations = inner.scope.len(),
            retry_count = inner.session.retry_count,
            "realtime: subscribing"
        );
        let scope = inner.scope.clone();
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_attempt(generation, scope).await });
        generation
    }

    fn retire_current(&self, inner: &mut ConnectionState) {
        for timer in inner.timers.drain(..) {
            timer.abort();
        }
        if let Some(channel) = inner.channel.take() {
            tokio::spawn(async move { channel.close().await });
        }
    }

    fn publish_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    async fn run_attempt(self: Arc<Self>, generation: u64, scope: Vec<ConversationId>) {
        let mut current_generation = self.generation.subscribe();

        if self.auth.credential_for_connect().await.is_none() {
            debug!(generation, "realtime: subscribing without a cached credential");
        }

        let subscribe = self.remote.subscribe(&scope);
        let Subscription { channel, events } =
            match tokio::time::timeout(self.settings.subscribe_timeout, subscribe).await {
                Ok(Ok(subscription)) => subscription,
                Ok(Err(err)) => {
                    self.on_failure(generation, format!("subscribe failed: {err}"))
                        .await;
                    return;
                }
                Err(_) => {
                    self.on_failure(generation, "subscribe timed out".into()).await;
                    return;
                }
            };

        {
            let mut inner = self.inner.lock().await;
            if inner.session.generation != generation {
                debug!(
                    generation,
                    current = inner.session.generation,
                    "realtime: discarding superseded subscription"
                );
                drop(inner);
                channel.close().await;
                return;
            }
            inner.channel = Some(channel);
        }

        self.pump(generation, events, &mut current_generation).await;
    }

    async fn pump(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<ChannelEvent>,
        current_generation: &mut watch::Receiver<u64>,
    ) {
        let ack_deadline = tokio::time::sleep(self.settings.ack_timeout);
        tokio::pin!(ack_deadline);
        let mut acknowledged = false;

        loop {
            if *current_generation.borrow_and_update() != generation {
                debug!(generation, "realtime: pump superseded");
                return;
            }

            let event = tokio::select! {
                changed = current_generation.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                _ = &mut ack_deadline, if !acknowledged => {
                    self.on_failure(generation, "subscription was not acknowledged".into())
                        .await;
                    return;
                }
                event = events.recv() => event,
            };

            match event {
                Some(ChannelEvent::Subscribed) => {
                    if !self.on_subscribed(generation).await {
                        return;
                    }
                    acknowledged = true;
                }
                Some(ChannelEvent::Change(message)) => {
                    if !self.is_current(generation) {
                        debug!(
                            generation,
                            message_id = message.id.0,
                            "realtime: dropping event from stale session"
                        );
                        return;
                    }
                    self.sink.on_remote_message(message).await;
                }
                Some(ChannelEvent::Error(reason)) => {
                    self.on_failure(generation, reason).await;
                    return;
                }
                Some(ChannelEvent::Closed) | None => {
                    self.on_failure(generation, "channel closed".into()).await;
                    return;
                }
            }
        }
    }

    async fn on_subscribed(self: &Arc<Self>, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.session.generation != generation {
            return false;
        }
        inner.session.status = ConnectionStatus::Connected;
        inner.session.retry_count = 0;
        inner.session.subscribed_at = Some(Utc::now());
        if let Some(poller) = inner.poller.take() {
            poller.abort();
            info!(generation, "realtime: live again, polling stopped");
        }
        self.publish_status(ConnectionStatus::Connected);

        let manager = Arc::clone(self);
        inner
            .timers
            .push(tokio::spawn(async move { manager.heartbeat_loop(generation).await }));
        info!(generation, "realtime: connected");
        true
    }

    async fn heartbeat_loop(self: Arc<Self>, generation: u64) {
        loop {
            tokio::time::sleep(self.settings.heartbeat_interval).await;
            let channel = {
                let inner = self.inner.lock().await;
                if inner.session.generation != generation {
                    return;
                }
                inner.channel.clone()
            };
            let Some(channel) = channel else {
                return;
            };

            match tokio::time::timeout(self.settings.heartbeat_timeout, channel.heartbeat()).await
            {
                Ok(Ok(())) => debug!(generation, "realtime: heartbeat acknowledged"),
                Ok(Err(err)) => {
                    self.on_failure(generation, format!("heartbeat failed: {err}"))
                        .await;
                    return;
                }
                Err(_) => {
                    self.on_failure(generation, "heartbeat timed out".into()).await;
                    return;
                }
            }
        }
    }

    async fn on_failure(self: &Arc<Self>, generation: u64, reason: String) {
        let mut inner = self.inner.lock().await;
        if inner.session.generation != generation {
            debug!(generation, %reason, "realtime: ignoring failure from stale session");
            return;
        }
        self.retire_current(&mut inner);
        inner.session.retry_count += 1;
        inner.session.subscribed_at = None;
        let failures = inner.session.retry_count;
        let from_degraded = inner.poller.is_some();

        match self.backoff.next_delay(failures) {
            Some(delay) if !from_degraded => {
                inner.session.status = ConnectionStatus::Reconnecting;
                self.publish_status(ConnectionStatus::Reconnecting);
                warn!(
                    generation,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "realtime: channel failed, reconnect scheduled"
                );
                let manager = Arc::clone(self);
                inner.timers.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut inner = manager.inner.lock().await;
                    if inner.session.generation == generation {
                        manager.start_attempt(&mut inner);
                    }
                }));
            }
            _ => {
                inner.session.status = ConnectionStatus::Degraded;
                self.publish_status(ConnectionStatus::Degraded);
                warn!(generation, failures, %reason, "realtime: degraded, polling instead");
                if inner.poller.is_none() {
                    let manager = Arc::clone(self);
                    inner.poller = Some(tokio::spawn(async move { manager.poll_loop().await }));
                }
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            let scope = self.inner.lock().await.scope.clone();
            debug!(conversations = scope.len(), "realtime: polling");
            self.sink.poll(&scope).await;
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
