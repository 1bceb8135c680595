use super::*;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{CorrelationKey, MessageId, UserId},
    protocol::RemoteMessage,
};

use crate::{
    auth::AuthGate,
    config::{AuthSettings, DurabilitySettings, OutboxSettings, ResyncSettings, UnreadSettings},
    outbox::OutboxProcessor,
    test_support::{remote_message, FakeRemote, StaticCredentials},
};

const ME: UserId = UserId(1);
const ALICE: UserId = UserId(2);
const CONVERSATION: ConversationId = ConversationId(8);

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 2, 18, minute, 0)
        .single()
        .expect("valid timestamp")
}

struct Fixture {
    storage: Storage,
    remote: Arc<FakeRemote>,
    events: Arc<EventHub>,
    view: Arc<ViewState>,
    unread: Arc<UnreadTracker>,
    ingestor: Arc<Ingestor>,
}

async fn fixture() -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    let remote = FakeRemote::new();
    let auth = AuthGate::new(StaticCredentials::valid(), AuthSettings::default());
    let events = Arc::new(EventHub::new());
    let durability = DurabilityManager::new(storage.clone(), DurabilitySettings::default());
    let view = Arc::new(ViewState::new());
    let outbox = OutboxProcessor::new(
        storage.clone(),
        remote.clone(),
        auth,
        events.clone(),
        durability.clone(),
        ME,
        OutboxSettings::default(),
    );
    let unread = UnreadTracker::new(
        storage.clone(),
        remote.clone(),
        outbox,
        view.clone(),
        ME,
        UnreadSettings::default(),
    );
    let resync = MissedDataResync::new(
        storage.clone(),
        remote.clone(),
        ResyncSettings {
            batch_size: 50,
            fetch_timeout: Duration::from_millis(500),
        },
    );
    let ingestor = Ingestor::new(
        storage.clone(),
        resync,
        unread.clone(),
        durability,
        view.clone(),
        events.clone(),
    );
    Fixture {
        storage,
        remote,
        events,
        view,
        unread,
        ingestor,
    }
}

fn drained(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test]
async fn live_event_is_stored_once_and_counted_once() {
    let f = fixture().await;
    let message = remote_message(1, CONVERSATION.0, ALICE.0, at(1));

    let first = f.ingestor.apply_remote(&message).await.expect("apply");
    let second = f.ingestor.apply_remote(&message).await.expect("apply");

    assert_eq!(first, MergeOutcome::Inserted);
    assert_eq!(second, MergeOutcome::Ignored);
    assert_eq!(f.storage.count_messages(CONVERSATION).await.expect("count"), 1);
    assert_eq!(f.unread.displayed(CONVERSATION), Some(1));
}

#[tokio::test]
async fn echo_of_own_send_reconciles_the_local_row() {
    let f = fixture().await;
    let mut rx = f.events.subscribe();
    let key = CorrelationKey::generate();
    f.storage
        .insert_local_message(CONVERSATION, ME, "hi", key, at(2))
        .await
        .expect("local row");

    let mut echo = remote_message(40, CONVERSATION.0, ME.0, at(2));
    echo.correlation_key = Some(key);
    let outcome = f.ingestor.apply_remote(&echo).await.expect("apply");

    assert_eq!(outcome, MergeOutcome::Reconciled);
    assert_eq!(f.storage.count_messages(CONVERSATION).await.expect("count"), 1);
    let stored = f
        .storage
        .get_message(MessageId(40))
        .await
        .expect("lookup")
        .expect("row");
    assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
    assert!(drained(&mut rx).iter().any(|event| matches!(
        event,
        SyncEvent::DeliveryChanged {
            correlation_key,
            status: DeliveryStatus::Delivered,
            server_id: Some(MessageId(40)),
        } if *correlation_key == key
    )));
    assert_eq!(f.unread.displayed(CONVERSATION), None);
}

#[tokio::test]
async fn catch_up_after_live_event_does_not_duplicate() {
    let f = fixture().await;
    let seed = f.remote.post(CONVERSATION, ALICE, "seed", at(0));
    f.storage
        .merge_batch(CONVERSATION, &[seed])
        .await
        .expect("seed");
    let live = f.remote.post(CONVERSATION, ALICE, "live", at(1));
    f.remote.post(CONVERSATION, ALICE, "missed", at(2));

    f.ingestor.apply_remote(&live).await.expect("live");
    let report = f.ingestor.catch_up(&[CONVERSATION]).await;

    assert!(report.is_clean());
    assert_eq!(report.inserted.len(), 1);
    assert_eq!(f.storage.count_messages(CONVERSATION).await.expect("count"), 3);
}

#[tokio::test]
async fn messages_for_the_open_conversation_reach_the_view() {
    let f = fixture().await;
    let mut rx = f.events.subscribe();
    f.view.set_foreground(true);
    f.view.open(CONVERSATION);

    let message = remote_message(5, CONVERSATION.0, ALICE.0, at(3));
    f.ingestor.apply_remote(&message).await.expect("apply");
    let other = remote_message(6, 99, ALICE.0, at(3));
    f.ingestor.apply_remote(&other).await.expect("apply");

    let received: Vec<MessageId> = drained(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::MessageReceived(message) => Some(message.id),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![MessageId(5)]);
    assert_eq!(f.unread.displayed(CONVERSATION), None);
}

#[tokio::test]
async fn push_payload_with_full_record_is_stored_and_points_at_its_conversation() {
    let f = fixture().await;
    let payload = PushPayload {
        kind: Some(PUSH_TYPE_NEW_MESSAGE.into()),
        message_id: Some(MessageId(77)),
        conversation_id: Some(CONVERSATION),
        sender_id: Some(ALICE),
        content: Some("from push".into()),
        created_at: Some(at(4)),
        correlation_key: None,
    };

    let hint = f.ingestor.ingest_push(&payload).await.expect("push");
    assert_eq!(hint, Some(CONVERSATION));
    let stored = f
        .storage
        .get_message(MessageId(77))
        .await
        .expect("lookup")
        .expect("row");
    assert_eq!(stored.content, "from push");

    // The same record arriving live afterwards is a duplicate.
    let live = RemoteMessage {
        id: MessageId(77),
        correlation_key: None,
        conversation_id: CONVERSATION,
        sender_id: ALICE,
        content: "from push".into(),
        created_at: at(4),
    };
    assert_eq!(
        f.ingestor.apply_remote(&live).await.expect("live"),
        MergeOutcome::Ignored
    );
}

#[tokio::test]
async fn malformed_push_payload_stores_nothing() {
    let f = fixture().await;
    let payload = PushPayload {
        kind: Some(PUSH_TYPE_NEW_MESSAGE.into()),
        message_id: None,
        conversation_id: Some(CONVERSATION),
        sender_id: Some(ALICE),
        content: None,
        created_at: None,
        correlation_key: None,
    };

    let hint = f.ingestor.ingest_push(&payload).await.expect("push");
    assert_eq!(hint, Some(CONVERSATION));
    assert_eq!(f.storage.count_messages(CONVERSATION).await.expect("count"), 0);
}

#[tokio::test]
async fn sink_poll_runs_a_catch_up_pass() {
    let f = fixture().await;
    let seed = f.remote.post(CONVERSATION, ALICE, "seed", at(0));
    f.storage
        .merge_batch(CONVERSATION, &[seed])
        .await
        .expect("seed");
    f.remote.post(CONVERSATION, ALICE, "while polling", at(5));

    let sink: Arc<dyn RealtimeSink> = f.ingestor.clone();
    sink.poll(&[CONVERSATION]).await;

    assert_eq!(f.storage.count_messages(CONVERSATION).await.expect("count"), 2);
    assert_eq!(f.unread.displayed(CONVERSATION), Some(2));
}

#[tokio::test]
async fn live_event_before_first_catch_up_does_not_skip_missed_messages() {
    let f = fixture().await;
    f.storage
        .ensure_conversation(CONVERSATION)
        .await
        .expect("conversation");
    let report = f.ingestor.catch_up(&[CONVERSATION]).await;
    assert_eq!(report.fetched, 0);

    let missed = f.remote.post(CONVERSATION, ALICE, "while away", at(1));
    let live = f.remote.post(CONVERSATION, ALICE, "live", at(2));
    f.ingestor.apply_remote(&live).await.expect("live");

    let report = f.ingestor.catch_up(&[CONVERSATION]).await;
    assert!(report.is_clean());
    assert_eq!(
        report.inserted.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![missed.id]
    );
    f.ingestor.catch_up(&[CONVERSATION]).await;
    assert_eq!(f.storage.count_messages(CONVERSATION).await.expect("count"), 2);
    assert!(f.storage.get_message(missed.id).await.expect("lookup").is_some());
}

#[tokio::test]
async fn polling_reaches_a_known_empty_conversation() {
    let f = fixture().await;
    f.storage
        .ensure_conversation(CONVERSATION)
        .await
        .expect("conversation");
    f.remote.post(CONVERSATION, ALICE, "first ever", at(1));

    let sink: Arc<dyn RealtimeSink> = f.ingestor.clone();
    sink.poll(&[CONVERSATION]).await;

    assert_eq!(f.remote.state().fetch_calls, vec![CONVERSATION]);
    assert_eq!(f.storage.count_messages(CONVERSATION).await.expect("count"), 1);
    assert_eq!(f.unread.displayed(CONVERSATION), Some(1));
}
