use std::time::Duration;

use super::*;
use crate::{
    state::{Identity, SyncEvent},
    test_support::FakeGateway,
};
use conversation_transport::{channel_name_for, participant_identity, InMemoryRelay};
use shared::domain::{MessageId, UserId};

const ME: UserId = UserId(1);

struct Fixture {
    state: Arc<SyncState>,
    gateway: Arc<FakeGateway>,
    relay: InMemoryRelay,
    manager: BackgroundConnectionManager,
}

fn fixture(max_subscriptions: usize) -> Fixture {
    let state = Arc::new(SyncState::new(Identity {
        user_id: ME,
        username: "alice".into(),
    }));
    let gateway = FakeGateway::new(ME);
    let relay = InMemoryRelay::new();
    let manager = BackgroundConnectionManager::new(
        Arc::clone(&state),
        gateway.clone(),
        Arc::new(relay.connector(participant_identity(ME))),
        max_subscriptions,
    );
    Fixture {
        state,
        gateway,
        relay,
        manager,
    }
}

fn local(summary: &ConversationSummary) -> ConversationKey {
    ConversationKey::local(summary.local_key.clone())
}

fn my_sessions(relay: &InMemoryRelay, summary: &ConversationSummary) -> usize {
    relay.sessions_for(
        &channel_name_for(&summary.local_key),
        &participant_identity(ME),
    )
}

fn message_from(sender: UserId, id: &str, conversation: &ConversationKey) -> ChatMessage {
    let mut message = ChatMessage::outgoing(conversation.clone(), sender, "peer", "hello");
    message.id = MessageId::from(id);
    message
}

async fn publish_as(
    relay: &InMemoryRelay,
    identity: UserId,
    summary: &ConversationSummary,
    message: ChatMessage,
) {
    let session = relay
        .connector(participant_identity(identity))
        .connect(ChannelJoin {
            channel_name: channel_name_for(&summary.local_key),
            token: "t".into(),
        })
        .await
        .unwrap();
    let payload = ChannelFrame::Message { message }.encode().unwrap();
    session.publish(payload).await.unwrap();
    session.leave().await.unwrap();
}

async fn next_unread(events: &mut broadcast::Receiver<SyncEvent>) -> u32 {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for unread change")
            .expect("event stream closed");
        if let SyncEvent::UnreadChanged { unread, .. } = event {
            return unread;
        }
    }
}

#[tokio::test]
async fn subscriptions_are_bounded() {
    let f = fixture(2);
    let known: Vec<_> = [2, 3, 4]
        .into_iter()
        .map(|peer| f.gateway.seed_direct(UserId(peer)))
        .collect();

    assert_eq!(f.manager.reconcile(&known).await, 2);
    assert_eq!(f.manager.subscribed().len(), 2);
    assert_eq!(f.manager.reconcile(&known).await, 0);
}

#[tokio::test]
async fn foreground_conversation_is_never_subscribed_in_background() {
    let f = fixture(32);
    let chat = f.gateway.seed_direct(UserId(2));
    let other = f.gateway.seed_direct(UserId(3));
    let known = vec![chat.clone(), other.clone()];

    f.state.set_foreground(Some(local(&chat)));
    f.manager.reconcile(&known).await;
    assert!(!f.manager.is_subscribed(&local(&chat)));
    assert!(f.manager.is_subscribed(&local(&other)));
    assert_eq!(my_sessions(&f.relay, &chat), 0);

    f.state.set_foreground(None);
    f.manager.reconcile(&known).await;
    assert_eq!(my_sessions(&f.relay, &chat), 1);

    f.state.set_foreground(Some(local(&chat)));
    let detached = f.manager.detach(&local(&chat)).expect("was subscribed");
    leave_all(vec![detached]).await;
    assert_eq!(my_sessions(&f.relay, &chat), 0);
    assert!(!f.manager.is_subscribed(&ConversationKey::Persisted(chat.conversation_id)));

    f.manager.reconcile(&known).await;
    assert_eq!(my_sessions(&f.relay, &chat), 0);
    assert_eq!(my_sessions(&f.relay, &other), 1);
}

#[tokio::test]
async fn forgotten_conversations_are_torn_down() {
    let f = fixture(32);
    let a = f.gateway.seed_direct(UserId(2));
    let b = f.gateway.seed_direct(UserId(3));

    f.manager.reconcile(&[a.clone(), b.clone()]).await;
    assert_eq!(my_sessions(&f.relay, &b), 1);

    f.manager.reconcile(&[a.clone()]).await;
    assert_eq!(my_sessions(&f.relay, &a), 1);
    assert_eq!(my_sessions(&f.relay, &b), 0);
}

#[tokio::test]
async fn failed_subscribe_is_retried_on_the_next_pass() {
    let f = fixture(32);
    let chat = f.gateway.seed_direct(UserId(2));
    let channel = channel_name_for(&chat.local_key);

    f.relay.refuse_channel(&channel);
    assert_eq!(f.manager.reconcile(&[chat.clone()]).await, 0);
    f.relay.allow_channel(&channel);
    assert_eq!(f.manager.reconcile(&[chat.clone()]).await, 1);
}

#[tokio::test]
async fn incoming_messages_raise_unread_once() {
    let f = fixture(32);
    let chat = f.gateway.seed_direct(UserId(2));
    let key = local(&chat);
    let mut events = f.state.subscribe();
    f.manager.reconcile(&[chat.clone()]).await;

    let first = message_from(UserId(2), "m1", &key);
    publish_as(&f.relay, UserId(2), &chat, first.clone()).await;
    assert_eq!(next_unread(&mut events).await, 1);

    // replayed copy, a spoofed sender and our own echo change nothing
    publish_as(&f.relay, UserId(2), &chat, first).await;
    publish_as(&f.relay, UserId(3), &chat, message_from(UserId(2), "spoof", &key)).await;
    f.state.apply_incoming(&key, message_from(ME, "mine", &key));

    publish_as(&f.relay, UserId(2), &chat, message_from(UserId(2), "m2", &key)).await;
    assert_eq!(next_unread(&mut events).await, 2);

    let ids: Vec<String> = f
        .state
        .cache()
        .get(&key)
        .into_iter()
        .map(|m| m.id.0)
        .collect();
    assert!(!ids.contains(&"spoof".to_string()));
    assert_eq!(ids.len(), 3);
    assert_eq!(
        f.state.cache().find(&MessageId::from("m1")).map(|m| m.status),
        Some(DeliveryStatus::Sent)
    );
}

#[tokio::test]
async fn frames_queued_before_detach_are_discarded() {
    let f = fixture(32);
    let chat = f.gateway.seed_direct(UserId(2));
    let key = local(&chat);
    f.manager.reconcile(&[chat.clone()]).await;
    assert!(f.manager.is_subscribed(&key));

    // the frame sits in the subscription's queue; the pump has not run yet
    publish_as(&f.relay, UserId(2), &chat, message_from(UserId(2), "late", &key)).await;
    let detached = f.manager.detach(&key).expect("was subscribed");
    leave_all(vec![detached]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(f.state.cache().get(&key).is_empty());
    assert_eq!(f.state.unread(&key), 0);
}

#[tokio::test]
async fn linking_keys_carries_unread_counts_to_the_merged_conversation() {
    let f = fixture(4);
    let local = ConversationKey::local("dm:1:2");
    let persisted = ConversationKey::Persisted(shared::domain::ConversationId(7));
    let mut events = f.state.subscribe();

    f.state
        .apply_incoming(&persisted, message_from(UserId(2), "p1", &persisted));
    f.state
        .apply_incoming(&local, message_from(UserId(2), "l1", &local));
    assert_eq!(f.state.unread(&persisted), 1);
    assert_eq!(f.state.unread(&local), 1);
    assert_eq!(next_unread(&mut events).await, 1);
    assert_eq!(next_unread(&mut events).await, 1);

    assert!(f.state.link_keys(&local, &persisted));
    assert_eq!(next_unread(&mut events).await, 2);
    assert_eq!(f.state.unread(&local), 2);
    assert_eq!(f.state.unread(&persisted), 2);
    assert!(!f.state.link_keys(&local, &persisted));

    f.state.clear_unread(&persisted);
    assert_eq!(f.state.unread(&local), 0);
    assert_eq!(next_unread(&mut events).await, 0);
}
