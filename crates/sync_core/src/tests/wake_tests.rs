use super::*;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ConnectionStatus, MessageId, UserId},
    error::RemoteError,
    protocol::PUSH_TYPE_NEW_MESSAGE,
};

use crate::{
    config::{
        AuthSettings, ConnectionSettings, DurabilitySettings, OutboxSettings, ResyncSettings,
        UnreadSettings,
    },
    durability::DurabilityManager,
    events::EventHub,
    remote::CredentialProvider,
    resync::MissedDataResync,
    test_support::{eventually, FakeRemote, StaticCredentials},
    view::ViewState,
};

const ME: UserId = UserId(1);
const ALICE: UserId = UserId(2);
const KNOWN: ConversationId = ConversationId(1);

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 9, 7, minute, 0)
        .single()
        .expect("valid timestamp")
}

struct Harness {
    storage: Storage,
    remote: Arc<FakeRemote>,
    connection: Arc<ConnectionManager>,
    outbox: Arc<OutboxProcessor>,
    wake: Arc<WakeOrchestrator>,
}

async fn harness(credentials: Arc<dyn CredentialProvider>) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let remote = FakeRemote::new();
    let auth = AuthGate::new(
        credentials,
        AuthSettings {
            refresh_timeout: Duration::from_millis(100),
            ..AuthSettings::default()
        },
    );
    let events = Arc::new(EventHub::new());
    let view = Arc::new(ViewState::new());
    let durability = DurabilityManager::new(storage.clone(), DurabilitySettings::default());
    let outbox = OutboxProcessor::new(
        storage.clone(),
        remote.clone(),
        auth.clone(),
        events.clone(),
        durability.clone(),
        ME,
        OutboxSettings {
            retry_base: Duration::from_millis(20),
            retry_jitter: 0.0,
            write_timeout: Duration::from_millis(200),
            ..OutboxSettings::default()
        },
    );
    let unread = UnreadTracker::new(
        storage.clone(),
        remote.clone(),
        outbox.clone(),
        view.clone(),
        ME,
        UnreadSettings::default(),
    );
    let ingest = Ingestor::new(
        storage.clone(),
        MissedDataResync::new(
            storage.clone(),
            remote.clone(),
            ResyncSettings {
                batch_size: 50,
                fetch_timeout: Duration::from_secs(1),
            },
        ),
        unread.clone(),
        durability,
        view,
        events,
    );
    let connection = ConnectionManager::new(
        remote.clone(),
        auth.clone(),
        ingest.clone(),
        ConnectionSettings::default(),
    );
    let wake = WakeOrchestrator::new(
        storage.clone(),
        auth,
        connection.clone(),
        ingest,
        outbox.clone(),
        unread,
    );
    Harness {
        storage,
        remote,
        connection,
        outbox,
        wake,
    }
}

/// Gives `conversation` a cursor by storing its first server message.
async fn seed(h: &Harness, conversation: ConversationId) {
    let first = h.remote.post(conversation, ALICE, "first", at(0));
    h.storage
        .merge_batch(conversation, &[first])
        .await
        .expect("seed");
}

#[tokio::test]
async fn reads_and_subscription_proceed_while_writes_are_blocked() {
    let h = harness(StaticCredentials::rejected()).await;
    seed(&h, KNOWN).await;
    h.remote.post(KNOWN, ALICE, "missed", at(1));

    let first = h.wake.on_wake(WakeReason::AppForeground, None).await;
    assert_eq!(first.auth, StepOutcome::Blocked(BlockReason::RefreshRejected));

    h.outbox
        .send_message(KNOWN, "queued while blocked")
        .await
        .expect("send");
    let report = h.wake.on_wake(WakeReason::NetworkRestored, None).await;

    assert_eq!(report.auth, StepOutcome::Blocked(BlockReason::RefreshRejected));
    assert_eq!(report.rebuild, StepOutcome::Done);
    assert_eq!(report.resync, StepOutcome::Done);
    assert_eq!(report.drain, StepOutcome::Blocked(BlockReason::RefreshRejected));
    assert_eq!(report.unread, StepOutcome::Done);
    assert_eq!(h.storage.count_messages(KNOWN).await.expect("count"), 3);
    assert_eq!(h.remote.state().write_calls, 0);

    let mut status = h.connection.subscribe_status();
    tokio::time::timeout(
        Duration::from_secs(1),
        status.wait_for(|s| *s == ConnectionStatus::Connected),
    )
    .await
    .expect("connected in time")
    .expect("status channel open");
}

#[tokio::test]
async fn failed_resync_does_not_prevent_the_drain() {
    let h = harness(StaticCredentials::valid()).await;
    seed(&h, KNOWN).await;
    h.remote.state().fetch_error = Some(RemoteError::Network("fetch unavailable".into()));
    let sent = h.outbox.send_message(KNOWN, "hello").await.expect("send");

    let report = h.wake.on_wake(WakeReason::AppForeground, None).await;

    assert!(report.resync.is_failed(), "resync: {}", report.resync);
    assert!(!report.drain.is_failed(), "drain: {}", report.drain);
    assert_eq!(report.unread, StepOutcome::Done);
    let storage = h.storage.clone();
    let key = sent.correlation_key.expect("local key");
    eventually("send delivered", || {
        let storage = storage.clone();
        async move {
            storage
                .get_message_by_correlation_key(key)
                .await
                .expect("lookup")
                .is_some_and(|m| m.server_id.is_some())
        }
    })
    .await;
}

#[tokio::test]
async fn overlapping_wakes_are_coalesced_and_new_hints_followed_up() {
    let h = harness(StaticCredentials::valid()).await;
    seed(&h, KNOWN).await;
    let first_hint = ConversationId(20);
    let late_hint = ConversationId(30);
    h.remote.post(first_hint, ALICE, "for the first hint", at(2));
    h.remote.post(late_hint, ALICE, "for the late hint", at(3));
    h.remote.state().fetch_delay = Duration::from_millis(150);

    let wake = h.wake.clone();
    let running =
        tokio::spawn(async move { wake.on_wake(WakeReason::PushWake, Some(first_hint)).await });
    tokio::time::sleep(Duration::from_millis(40)).await;

    let resume = h.wake.on_wake(WakeReason::AppForeground, None).await;
    let late = h.wake.on_wake(WakeReason::PushWake, Some(late_hint)).await;
    let repeat = h.wake.on_wake(WakeReason::PushWake, Some(first_hint)).await;
    assert!(resume.coalesced && late.coalesced && repeat.coalesced);

    let report = running.await.expect("wake task");
    assert!(!report.coalesced);
    assert_eq!(report.follow_ups, vec![late_hint]);
    assert_eq!(h.storage.count_messages(first_hint).await.expect("count"), 1);
    assert_eq!(h.storage.count_messages(late_hint).await.expect("count"), 1);

    let fetches = h.remote.state().fetch_calls.clone();
    assert_eq!(fetches.iter().filter(|c| **c == first_hint).count(), 1);
    assert_eq!(fetches.iter().filter(|c| **c == late_hint).count(), 1);
    assert_eq!(fetches.iter().filter(|c| **c == KNOWN).count(), 1);
    assert!(h.connection.scope().await.contains(&late_hint));
}

#[tokio::test]
async fn push_payload_is_stored_and_its_conversation_joins_the_scope() {
    let h = harness(StaticCredentials::valid()).await;
    let conversation = ConversationId(40);
    h.remote.post(conversation, ALICE, "older", at(1));
    let payload = PushPayload {
        kind: Some(PUSH_TYPE_NEW_MESSAGE.into()),
        message_id: Some(MessageId(5_000)),
        conversation_id: Some(conversation),
        sender_id: Some(ALICE),
        content: Some("pushed".into()),
        created_at: Some(at(2)),
        correlation_key: None,
    };
    h.remote
        .state()
        .messages
        .entry(conversation)
        .or_default()
        .push(payload.message().expect("complete payload"));

    let report = h.wake.on_push(payload).await;

    assert_eq!(report.reason, WakeReason::PushWake);
    assert_eq!(report.hint, Some(conversation));
    assert_eq!(report.resync, StepOutcome::Done);
    assert_eq!(h.storage.count_messages(conversation).await.expect("count"), 2);
    assert!(h.connection.scope().await.contains(&conversation));
}

#[tokio::test]
async fn push_without_a_usable_payload_still_wakes_for_the_hint() {
    let h = harness(StaticCredentials::valid()).await;
    let conversation = ConversationId(41);
    h.remote.post(conversation, ALICE, "waiting", at(1));
    let payload = PushPayload {
        kind: Some(PUSH_TYPE_NEW_MESSAGE.into()),
        conversation_id: Some(conversation),
        ..PushPayload::default()
    };

    let report = h.wake.on_push(payload).await;

    assert_eq!(report.hint, Some(conversation));
    assert_eq!(h.storage.count_messages(conversation).await.expect("count"), 1);
}

#[tokio::test]
async fn cancelled_wake_does_not_coalesce_later_wakes() {
    let h = harness(StaticCredentials::valid()).await;
    seed(&h, KNOWN).await;
    h.remote.state().fetch_delay = Duration::from_millis(300);

    let wake = h.wake.clone();
    let running =
        tokio::spawn(async move { wake.on_wake(WakeReason::AppForeground, None).await });
    tokio::time::sleep(Duration::from_millis(40)).await;
    let late_hint = ConversationId(30);
    assert!(h.wake.on_wake(WakeReason::PushWake, Some(late_hint)).await.coalesced);
    running.abort();
    assert!(running.await.expect_err("aborted").is_cancelled());

    h.remote.state().fetch_delay = Duration::ZERO;
    h.remote.post(late_hint, ALICE, "queued before the cancel", at(4));
    let report = h.wake.on_wake(WakeReason::Manual, None).await;
    assert!(!report.coalesced);
    assert_eq!(report.follow_ups, vec![late_hint]);
    assert_eq!(h.storage.count_messages(late_hint).await.expect("count"), 1);
}
