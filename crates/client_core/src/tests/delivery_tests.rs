use super::*;
use crate::{state::Identity, test_support::FakeGateway};
use chrono::TimeZone;
use conversation_transport::{ChannelConnector, ChannelJoin, InMemoryRelay};
use shared::domain::{MessageKind, ReadReceipt};

const ME: UserId = UserId(1);
const PEER: UserId = UserId(2);

fn machine(gateway: &Arc<FakeGateway>) -> (Arc<SyncState>, Arc<DeliveryStateMachine>) {
    let state = Arc::new(SyncState::new(Identity {
        user_id: ME,
        username: "alice".into(),
    }));
    let delivery = DeliveryStateMachine::new(Arc::clone(&state), gateway.clone());
    (state, delivery)
}

fn direct() -> ConversationKey {
    ConversationKey::direct(ME, PEER)
}

fn status_of(state: &SyncState, id: &MessageId) -> Option<DeliveryStatus> {
    state.cache().find(id).map(|m| m.status)
}

#[tokio::test]
async fn send_is_optimistic_and_becomes_sent_after_persist() {
    let gateway = FakeGateway::new(ME);
    let (state, delivery) = machine(&gateway);

    let pending = delivery.send(&direct(), "hi", None);
    let id = pending.id().clone();
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Sending));
    assert_eq!(state.cache().get(&direct()).len(), 1);

    assert_eq!(pending.outcome().await, Ok(AppendOutcome::Inserted));
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Sent));

    let conversation_id = state.cache().linked_persisted(&direct()).expect("linked");
    assert_eq!(gateway.stored_ids(conversation_id), vec![id]);
    assert_eq!(gateway.with(|s| s.open_direct_calls), 1);
}

#[tokio::test]
async fn first_sends_link_the_conversation_once() {
    let gateway = FakeGateway::new(ME);
    let (state, delivery) = machine(&gateway);

    let first = delivery.send(&direct(), "one", None);
    let second = delivery.send(&direct(), "two", None);
    assert!(first.outcome().await.is_ok());
    assert!(second.outcome().await.is_ok());
    let third = delivery.send(&direct(), "three", None);
    assert!(third.outcome().await.is_ok());

    assert_eq!(gateway.with(|s| s.open_direct_calls), 1);
    let conversation_id = state.cache().linked_persisted(&direct()).unwrap();
    assert_eq!(
        state.cache().get(&ConversationKey::Persisted(conversation_id)).len(),
        3
    );
}

#[tokio::test]
async fn failed_send_stays_visible_and_retry_reuses_the_id() {
    let gateway = FakeGateway::new(ME);
    gateway.with(|s| s.failing_appends = 2);
    let (state, delivery) = machine(&gateway);

    let pending = delivery.send(&direct(), "hi", None);
    let id = pending.id().clone();
    assert!(pending.outcome().await.is_err());
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Failed));

    let retry = delivery.retry(&id, None).expect("failed message is retryable");
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Sending));
    assert!(retry.outcome().await.is_err());
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Failed));
    assert_eq!(state.cache().get(&direct()).len(), 1);

    let retry = delivery.retry(&id, None).unwrap();
    assert_eq!(retry.outcome().await, Ok(AppendOutcome::Inserted));
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Sent));

    let conversation_id = state.cache().linked_persisted(&direct()).unwrap();
    assert_eq!(gateway.stored_ids(conversation_id), vec![id.clone()]);
    assert_eq!(
        delivery.retry(&id, None).err(),
        Some(SyncError::NotRetryable(id))
    );
}

#[tokio::test]
async fn duplicate_append_counts_as_sent() {
    let gateway = FakeGateway::new(ME);
    let (state, delivery) = machine(&gateway);

    let pending = delivery.send(&direct(), "hi", None);
    let id = pending.id().clone();
    pending.outcome().await.unwrap();

    // the server kept the first copy; a replay of the same id is a success
    let conversation_id = state.cache().linked_persisted(&direct()).unwrap();
    let copy = state.cache().find(&id).unwrap();
    assert_eq!(
        gateway.append_message(conversation_id, &copy).await,
        Ok(AppendOutcome::AlreadyExists)
    );
    assert_eq!(gateway.stored_ids(conversation_id).len(), 1);
}

#[tokio::test]
async fn unknown_group_key_fails_the_send() {
    let gateway = FakeGateway::new(ME);
    let (state, delivery) = machine(&gateway);
    let group = ConversationKey::local("group-unknown");

    let pending = delivery.send(&group, "hi", None);
    let id = pending.id().clone();
    assert!(matches!(
        pending.outcome().await,
        Err(SyncError::UnknownConversation(_))
    ));
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Failed));
}

#[tokio::test]
async fn transport_publish_never_marks_sent() {
    let gateway = FakeGateway::new(ME);
    let summary = gateway.seed_direct(PEER);
    gateway.with(|s| s.failing_appends = 1);
    let (state, delivery) = machine(&gateway);
    state.link_keys(&direct(), &ConversationKey::Persisted(summary.conversation_id));

    let relay = InMemoryRelay::new();
    let join = ChannelJoin {
        channel_name: conversation_transport::channel_name_for(&summary.local_key),
        token: "t".into(),
    };
    let mine = relay.connector("user:1").connect(join.clone()).await.unwrap();
    let theirs = relay.connector("user:2").connect(join).await.unwrap();
    let mut inbound = theirs.subscribe_events();

    let pending = delivery.send(&direct(), "hi", Some(mine));
    let id = pending.id().clone();
    assert!(pending.outcome().await.is_err());

    // the peer saw the frame, but the sender's copy is failed, not sent
    assert!(matches!(
        inbound.try_recv(),
        Ok(conversation_transport::ChannelEvent::Data(_))
    ));
    assert_eq!(status_of(&state, &id), Some(DeliveryStatus::Failed));
}

#[tokio::test]
async fn read_signals_promote_only_own_messages() {
    let gateway = FakeGateway::new(ME);
    let (state, delivery) = machine(&gateway);

    let pending = delivery.send(&direct(), "mine", None);
    let mine = pending.id().clone();
    pending.outcome().await.unwrap();

    let theirs = ChatMessage {
        id: MessageId::from("theirs"),
        conversation: direct(),
        sender_id: PEER,
        sender_name: "bob".into(),
        content: "yo".into(),
        kind: MessageKind::Text,
        timestamp: Utc::now(),
        status: DeliveryStatus::Sent,
    };
    state.upsert(&direct(), theirs.clone());

    assert_eq!(delivery.apply_messages_read(&[mine.clone()], ME), 0);
    assert_eq!(
        delivery.apply_messages_read(&[mine.clone(), theirs.id.clone()], PEER),
        1
    );
    assert_eq!(status_of(&state, &mine), Some(DeliveryStatus::Read));
    assert_eq!(status_of(&state, &theirs.id), Some(DeliveryStatus::Sent));
    assert_eq!(delivery.apply_messages_read(&[mine.clone()], PEER), 0);
}

#[tokio::test]
async fn receipts_from_other_readers_mark_read() {
    let gateway = FakeGateway::new(ME);
    let (state, delivery) = machine(&gateway);

    let first = delivery.send(&direct(), "one", None);
    let second = delivery.send(&direct(), "two", None);
    let (first_id, second_id) = (first.id().clone(), second.id().clone());
    first.outcome().await.unwrap();
    second.outcome().await.unwrap();

    gateway.with(|s| {
        s.receipts.insert(
            first_id.clone(),
            vec![ReadReceipt {
                message_id: first_id.clone(),
                reader_id: PEER,
                reader_name: "bob".into(),
                read_at: Utc::now(),
            }],
        );
    });

    assert_eq!(delivery.refresh_receipts(&direct()).await, Ok(1));
    assert_eq!(status_of(&state, &first_id), Some(DeliveryStatus::Read));
    assert_eq!(status_of(&state, &second_id), Some(DeliveryStatus::Sent));
}

#[test]
fn probably_delivered_is_a_display_hint_only() {
    let sent_at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let mut message = ChatMessage::outgoing(direct(), ME, "alice", "hi");
    message.timestamp = sent_at;
    message.status = DeliveryStatus::Sent;
    let hint = Duration::from_secs(5);

    assert_eq!(
        display_status(&message, sent_at + chrono::Duration::seconds(2), hint),
        DisplayStatus::Sent
    );
    assert_eq!(
        display_status(&message, sent_at + chrono::Duration::seconds(5), hint),
        DisplayStatus::ProbablyDelivered
    );
    assert_eq!(message.status, DeliveryStatus::Sent);

    message.status = DeliveryStatus::Sending;
    assert_eq!(
        display_status(&message, sent_at + chrono::Duration::seconds(60), hint),
        DisplayStatus::Sending
    );
}
