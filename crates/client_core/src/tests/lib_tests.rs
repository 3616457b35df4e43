use std::time::Duration;

use super::*;
use crate::{
    hub::HubFrame,
    test_support::{FakeGateway, FakeHub},
};
use chrono::TimeZone;
use conversation_transport::{channel_name_for, participant_identity, InMemoryRelay};
use shared::domain::DeliveryStatus;

const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

fn engine_for(
    me: UserId,
    gateway: &Arc<FakeGateway>,
    relay: &InMemoryRelay,
    hub: &Arc<FakeHub>,
) -> SyncEngine {
    SyncEngine::new(
        Identity {
            user_id: me,
            username: format!("user{}", me.0),
        },
        SyncConfig::default(),
        gateway.clone(),
        Arc::new(relay.connector(participant_identity(me))),
        hub.clone(),
    )
}

fn chat() -> ConversationKey {
    ConversationKey::direct(ALICE, BOB)
}

fn from_bob(id: &str) -> ChatMessage {
    let mut message = ChatMessage::outgoing(chat(), BOB, "user2", format!("hello {id}"));
    message.id = MessageId::from(id);
    message
}

fn from_bob_at(id: &str, millis: i64) -> ChatMessage {
    let mut message = from_bob(id);
    message.timestamp = Utc.timestamp_millis_opt(millis).unwrap();
    message
}

fn hub_event(event: &ServerEvent) -> HubFrame {
    HubFrame::Text(serde_json::to_string(event).unwrap())
}

async fn wait_for(
    events: &mut broadcast::Receiver<SyncEvent>,
    done: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for sync event")
            .expect("event stream closed");
        if done(&event) {
            return event;
        }
    }
}

fn unread_is(n: u32) -> impl Fn(&SyncEvent) -> bool {
    move |event: &SyncEvent| matches!(event, SyncEvent::UnreadChanged { unread, .. } if *unread == n)
}

#[test]
fn config_defaults_and_partial_toml() {
    let defaults = SyncConfig::default();
    assert_eq!(defaults.max_background_subscriptions, 32);
    assert_eq!(defaults.history_page_size, 50);
    assert_eq!(defaults.fallback_poll_interval, Duration::from_secs(15));
    assert_eq!(defaults.delivered_hint_after, Duration::from_secs(5));

    let config = SyncConfig::from_toml_str(
        "max_background_subscriptions = 4\n\n[reconnect]\nmax_attempts = 2\n\n[typing]\nexpiry = 1500\n",
    )
    .unwrap();
    assert_eq!(config.max_background_subscriptions, 4);
    assert_eq!(config.reconnect.max_attempts, 2);
    assert_eq!(config.reconnect.base_delay, Duration::from_secs(1));
    assert_eq!(config.typing.expiry, Duration::from_millis(1500));
    assert_eq!(config.typing.debounce, Duration::from_secs(2));

    assert!(SyncConfig::from_toml_str("history_page_size = \"many\"").is_err());
}

#[test]
fn reconnect_delay_doubles_up_to_the_cap() {
    let policy = ReconnectPolicy::default();
    let delays: Vec<u64> = (0..6).map(|n| policy.delay_for(n).as_secs()).collect();
    assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    assert_eq!(policy.delay_for(40), Duration::from_secs(10));
}

#[tokio::test]
async fn foreground_and_background_subscriptions_are_exclusive() {
    let gateway = FakeGateway::new(ALICE);
    let with_bob = gateway.seed_direct(BOB);
    let with_carol = gateway.seed_direct(UserId(3));
    let relay = InMemoryRelay::new();
    let engine = engine_for(ALICE, &gateway, &relay, &FakeHub::new(false));
    let me = participant_identity(ALICE);
    let bob_channel = channel_name_for(&with_bob.local_key);

    engine
        .set_conversations(vec![with_bob.clone(), with_carol.clone()])
        .await;
    assert_eq!(engine.subscription_mode(&chat()), SubscriptionMode::Background);
    assert_eq!(relay.sessions_for(&bob_channel, &me), 1);

    engine.open_conversation(&chat()).await.unwrap();
    assert_eq!(engine.subscription_mode(&chat()), SubscriptionMode::Foreground);
    assert_eq!(relay.sessions_for(&bob_channel, &me), 1);
    assert!(!engine.background_subscriptions().contains(&chat()));
    assert_eq!(
        engine.subscription_mode(&ConversationKey::Persisted(with_carol.conversation_id)),
        SubscriptionMode::Background
    );

    engine.close_conversation().await;
    assert_eq!(engine.subscription_mode(&chat()), SubscriptionMode::Background);
    assert_eq!(relay.sessions_for(&bob_channel, &me), 1);

    engine.shutdown().await;
    assert_eq!(relay.sessions_for(&bob_channel, &me), 0);
}

#[tokio::test]
async fn message_reaches_the_open_conversation_over_the_transport() {
    let relay = InMemoryRelay::new();
    let alice_gateway = FakeGateway::new(ALICE);
    alice_gateway.seed_direct(BOB);
    let bob_gateway = FakeGateway::new(BOB);
    bob_gateway.seed_direct(ALICE);
    let alice = engine_for(ALICE, &alice_gateway, &relay, &FakeHub::new(false));
    let bob = engine_for(BOB, &bob_gateway, &relay, &FakeHub::new(false));

    bob.open_conversation(&chat()).await.unwrap();
    alice.open_conversation(&chat()).await.unwrap();
    let mut bob_events = bob.subscribe_events();

    let pending = alice.send(&chat(), "hi bob");
    let id = pending.id().clone();
    assert!(pending.outcome().await.is_ok());

    let event = wait_for(&mut bob_events, |event| {
        matches!(event, SyncEvent::MessageUpdated { message, .. } if message.content == "hi bob")
    })
    .await;
    let SyncEvent::MessageUpdated { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.id, id);
    assert_eq!(message.sender_id, ALICE);
    assert_eq!(message.status, DeliveryStatus::Sent);
    assert_eq!(bob.unread(&chat()), 0);
    assert_eq!(bob.get(&chat()).len(), 1);
}

#[tokio::test]
async fn hub_message_raises_unread_once_outside_the_foreground() {
    let gateway = FakeGateway::new(ALICE);
    let summary = gateway.seed_direct(BOB);
    let relay = InMemoryRelay::new();
    let hub = FakeHub::new(true);
    let engine = engine_for(ALICE, &gateway, &relay, &hub);
    engine.set_conversations(vec![summary.clone()]).await;
    let mut events = engine.subscribe_events();
    engine.start();

    let new_message = |id: &str| {
        hub_event(&ServerEvent::NewMessage {
            conversation_id: summary.conversation_id,
            local_key: summary.local_key.clone(),
            message: from_bob(id),
        })
    };
    hub.push(new_message("m1"));
    wait_for(&mut events, unread_is(1)).await;

    // the same message again, this time over the background transport
    let bob_session = relay
        .connector(participant_identity(BOB))
        .connect(conversation_transport::ChannelJoin {
            channel_name: channel_name_for(&summary.local_key),
            token: "t".into(),
        })
        .await
        .unwrap();
    bob_session
        .publish(
            ChannelFrame::Message {
                message: from_bob("m1"),
            }
            .encode()
            .unwrap(),
        )
        .await
        .unwrap();
    hub.push(new_message("m1"));
    hub.push(new_message("m2"));
    wait_for(&mut events, unread_is(2)).await;
    assert_eq!(engine.get(&chat()).len(), 2);

    engine.open_conversation(&chat()).await.unwrap();
    assert_eq!(engine.unread(&chat()), 0);

    hub.push(new_message("m3"));
    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::MessageUpdated { message, .. } if message.id.as_str() == "m3")
    })
    .await;
    assert_eq!(engine.unread(&chat()), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn read_signal_from_the_hub_marks_own_message_read() {
    let gateway = FakeGateway::new(ALICE);
    let summary = gateway.seed_direct(BOB);
    let hub = FakeHub::new(true);
    let engine = engine_for(ALICE, &gateway, &InMemoryRelay::new(), &hub);
    let mut events = engine.subscribe_events();
    engine.start();

    let pending = engine.send(&chat(), "did you see this?");
    let id = pending.id().clone();
    assert!(pending.outcome().await.is_ok());

    // a reader cannot mark their own messages read for others
    hub.push(hub_event(&ServerEvent::MessagesRead {
        message_ids: vec![id.clone()],
        reader_id: ALICE,
        conversation_id: Some(summary.conversation_id),
    }));
    hub.push(hub_event(&ServerEvent::MessagesRead {
        message_ids: vec![id.clone(), MessageId::from("unknown")],
        reader_id: BOB,
        conversation_id: Some(summary.conversation_id),
    }));
    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::MessageUpdated { message, .. }
            if message.id == id && message.status == DeliveryStatus::Read)
    })
    .await;

    let message = engine.get(&chat()).pop().unwrap();
    assert_eq!(engine.display_status(&message), DisplayStatus::Read);
    engine.shutdown().await;
}

#[tokio::test]
async fn reconcile_pass_recovers_messages_while_the_hub_is_down() {
    let gateway = FakeGateway::new(ALICE);
    let summary = gateway.seed_direct(BOB);
    let engine = engine_for(ALICE, &gateway, &InMemoryRelay::new(), &FakeHub::new(false));
    engine.start();
    engine.set_conversations(vec![summary.clone()]).await;
    assert_ne!(engine.hub_status(), HubStatus::Open);

    for (n, id) in ["old-1", "old-2", "old-3"].into_iter().enumerate() {
        gateway.seed_message(summary.conversation_id, from_bob_at(id, 1_000 * (n as i64 + 1)));
    }
    // a cold page is history, not news
    assert_eq!(engine.reconcile_now().await, 3);
    assert_eq!(engine.unread(&chat()), 0);

    gateway.seed_message(summary.conversation_id, from_bob_at("missed", 10_000));
    assert_eq!(engine.reconcile_now().await, 1);
    assert_eq!(engine.unread(&chat()), 1);
    assert!(engine
        .get(&chat())
        .iter()
        .all(|m| m.status == DeliveryStatus::Sent));

    // nothing new on the next pass
    assert_eq!(engine.reconcile_now().await, 0);
    assert_eq!(engine.unread(&chat()), 1);

    gateway.with(|s| s.offline = true);
    assert_eq!(engine.reconcile_now().await, 0);
    assert_eq!(engine.get(&chat()).len(), 4);

    gateway.with(|s| s.offline = false);
    let accepted = engine
        .mark_read(&[MessageId::from("missed")], &chat())
        .await
        .unwrap();
    assert_eq!(accepted, 1);
    assert_eq!(engine.unread(&chat()), 0);
    assert_eq!(
        gateway.with(|s| s.reads.clone()),
        vec![(vec![MessageId::from("missed")], Some(summary.conversation_id))]
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn opening_offline_keeps_the_cache_and_allows_sending_later() {
    let gateway = FakeGateway::new(ALICE);
    gateway.with(|s| s.offline = true);
    let engine = engine_for(ALICE, &gateway, &InMemoryRelay::new(), &FakeHub::new(false));

    engine.open_conversation(&chat()).await.unwrap();
    assert_eq!(engine.subscription_mode(&chat()), SubscriptionMode::Foreground);

    let pending = engine.send(&chat(), "queued");
    assert!(pending.outcome().await.is_err());
    let failed = engine.get(&chat()).pop().unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);

    gateway.with(|s| s.offline = false);
    let retry = engine.retry(&failed.id).unwrap();
    assert!(retry.outcome().await.is_ok());
    assert_eq!(engine.get(&chat()).pop().unwrap().status, DeliveryStatus::Sent);
    assert!(engine.retry(&failed.id).is_err());
}

#[tokio::test(start_paused = true)]
async fn local_typing_stops_after_idle() {
    let gateway = FakeGateway::new(ALICE);
    let summary = gateway.seed_direct(BOB);
    let engine = engine_for(ALICE, &gateway, &InMemoryRelay::new(), &FakeHub::new(false));
    engine.set_conversations(vec![summary.clone()]).await;

    engine.set_typing(&chat(), true);
    engine.set_typing(&chat(), true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        gateway.with(|s| s.typing.clone()),
        vec![(summary.conversation_id, true)]
    );

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(
        gateway.with(|s| s.typing.clone()),
        vec![
            (summary.conversation_id, true),
            (summary.conversation_id, false)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn remote_typing_indicator_expires() {
    let gateway = FakeGateway::new(ALICE);
    let summary = gateway.seed_direct(BOB);
    let hub = FakeHub::new(true);
    let engine = engine_for(ALICE, &gateway, &InMemoryRelay::new(), &hub);
    let mut events = engine.subscribe_events();

    hub.push(hub_event(&ServerEvent::Typing {
        conversation_id: summary.conversation_id,
        local_key: summary.local_key.clone(),
        user_id: BOB,
        user_name: "user2".into(),
        is_typing: true,
    }));
    engine.start();

    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::TypingChanged { typing, .. } if typing.len() == 1)
    })
    .await;
    let typing = engine.typing(&chat());
    assert_eq!(typing.len(), 1);
    assert_eq!(typing[0].user_id, BOB);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(engine.typing(&chat()).is_empty());
    wait_for(&mut events, |event| {
        matches!(event, SyncEvent::TypingChanged { typing, .. } if typing.is_empty())
    })
    .await;
    engine.shutdown().await;
}

#[tokio::test]
async fn frames_queued_before_closing_the_conversation_are_discarded() {
    let gateway = FakeGateway::new(ALICE);
    let summary = gateway.seed_direct(BOB);
    let relay = InMemoryRelay::new();
    let engine = engine_for(ALICE, &gateway, &relay, &FakeHub::new(false));
    engine.open_conversation(&chat()).await.unwrap();

    let bob_session = relay
        .connector(participant_identity(BOB))
        .connect(conversation_transport::ChannelJoin {
            channel_name: channel_name_for(&summary.local_key),
            token: "t".into(),
        })
        .await
        .unwrap();
    let frame = ChannelFrame::Message {
        message: from_bob("late"),
    };
    bob_session.publish(frame.encode().unwrap()).await.unwrap();
    engine.close_conversation().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(engine.get(&chat()).is_empty());
    assert_eq!(engine.unread(&chat()), 0);
    engine.shutdown().await;
}
