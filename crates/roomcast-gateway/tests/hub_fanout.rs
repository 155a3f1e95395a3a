#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use roomcast_core::error::{Result, RoomcastError};
use roomcast_core::{ConversationId, Envelope, Kind, UserId};
use roomcast_gateway::broker::{publish_envelope, Broker, MemoryBroker, Subscription};
use roomcast_gateway::hub::{open_connection, Hub, HubSettings, Outbox, Source};
use roomcast_gateway::obs::GatewayMetrics;

const INSTANCE: &str = "instance-a";

fn settings() -> HubSettings {
    HubSettings {
        topic_prefix: "chat:".into(),
        instance_id: Arc::from(INSTANCE),
        resubscribe_backoff: Duration::from_millis(20),
        command_buffer: 64,
    }
}

fn conv(s: &str) -> ConversationId {
    ConversationId::parse(s).unwrap()
}

fn user(s: &str) -> UserId {
    UserId::parse(s).unwrap()
}

struct Harness {
    hub: Hub,
    broker: Arc<MemoryBroker>,
    metrics: Arc<GatewayMetrics>,
}

impl Harness {
    fn new() -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let metrics = Arc::new(GatewayMetrics::default());
        let hub = Hub::spawn(broker.clone(), settings(), metrics.clone());
        Self { hub, broker, metrics }
    }

    async fn join(&self, u: &str, c: &str, capacity: usize) -> Outbox {
        let (handle, outbox) = open_connection(user(u), conv(c), capacity);
        self.hub.register(handle).await.expect("register");
        outbox
    }

    async fn leave(&self, outbox: &Outbox) {
        self.hub
            .unregister(outbox.conversation_id.clone(), outbox.id)
            .await
            .unwrap();
    }

    /// Send an envelope the way a socket reader does.
    async fn send_from(&self, outbox: &Outbox, raw: &str) {
        let mut env = Envelope::decode(raw).unwrap();
        env.stamp(&outbox.user_id, &outbox.conversation_id);
        env.normalize();
        self.hub.link().dispatch(env, Source::Socket).await.unwrap();
    }

    /// Round-trip through the registry so earlier commands are applied.
    async fn settle(&self) {
        self.hub.snapshot().await.unwrap();
    }

    async fn wait_subscribers(&self, topic: &str, want: usize) {
        for _ in 0..200 {
            if self.broker.subscriber_count(topic) == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "topic {topic}: expected {want} subscribers, have {}",
            self.broker.subscriber_count(topic)
        );
    }
}

async fn next_env(outbox: &mut Outbox) -> Envelope {
    let frame = tokio::time::timeout(Duration::from_secs(2), outbox.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbox closed");
    Envelope::decode(&frame).unwrap()
}

async fn expect_presence(outbox: &mut Outbox, kind: Kind, who: &str) {
    let env = next_env(outbox).await;
    assert_eq!(env.kind, kind);
    assert_eq!(env.presence_user(), Some(who));
    assert!(env.sender_id.is_none());
}

#[tokio::test]
async fn chat_reaches_every_member_with_stamped_sender() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-1", 16).await;
    let mut c2 = h.join("u2", "conv-1", 16).await;

    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;
    expect_presence(&mut c1, Kind::MemberJoined, "u2").await;
    expect_presence(&mut c2, Kind::MemberJoined, "u2").await;

    h.send_from(
        &c1,
        r#"{"kind":"chat","conversation_id":"elsewhere","sender_id":"mallory","content":"hi"}"#,
    )
    .await;

    for outbox in [&mut c1, &mut c2] {
        let env = next_env(outbox).await;
        assert_eq!(env.kind, Kind::Chat);
        assert_eq!(env.content, "hi");
        assert_eq!(env.sender_id.as_ref().map(UserId::as_str), Some("u1"));
        assert_eq!(env.conversation_id.as_str(), "conv-1");
        assert!(env.message_id.is_some());
    }
}

#[tokio::test]
async fn first_join_subscribes_before_admission_and_sees_itself() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-2", 16).await;

    // register() resolved, so the subscription is already live.
    assert_eq!(h.broker.subscriber_count("chat:conv-2"), 1);
    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;

    h.settle().await;
    assert!(c1.try_recv().is_none());

    let snap = h.hub.snapshot().await.unwrap();
    let room = snap.room(&conv("conv-2")).unwrap();
    assert_eq!(room.members, 1);
    assert!(room.subscribed);
}

#[tokio::test]
async fn last_leave_tears_down_subscription() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-2", 16).await;
    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;

    h.leave(&c1).await;
    h.wait_subscribers("chat:conv-2", 0).await;

    let snap = h.hub.snapshot().await.unwrap();
    assert!(snap.room(&conv("conv-2")).is_none());

    let late = Envelope::chat(conv("conv-2"), user("u9"), "anyone?");
    publish_envelope(h.broker.as_ref(), "chat:", &late).await.unwrap();

    assert!(c1.is_closed());
    assert!(c1.recv().await.is_none());
}

#[tokio::test]
async fn broker_envelope_reaches_sole_member() {
    let h = Harness::new();
    let mut c3 = h.join("u3", "conv-3", 16).await;
    expect_presence(&mut c3, Kind::MemberJoined, "u3").await;

    let external = Envelope::chat(conv("conv-3"), user("u7"), "from another instance");
    publish_envelope(h.broker.as_ref(), "chat:", &external).await.unwrap();

    let env = next_env(&mut c3).await;
    assert_eq!(env.content, "from another instance");
    assert_eq!(env.sender_id.as_ref().map(UserId::as_str), Some("u7"));
}

#[tokio::test]
async fn stalled_consumer_is_evicted_without_delaying_others() {
    let h = Harness::new();
    let mut stalled = h.join("u4", "conv-5", 256).await;
    let mut healthy = h.join("u5", "conv-5", 512).await;

    for i in 0..257 {
        let raw = format!(r#"{{"kind":"chat","conversation_id":"conv-5","content":"m{i}"}}"#);
        h.send_from(&healthy, &raw).await;
    }
    h.settle().await;

    // The stalled outbox already held two presence frames, so it refuses
    // chat m254; the eviction notice follows that chat immediately.
    expect_presence(&mut healthy, Kind::MemberJoined, "u5").await;
    for i in 0..257 {
        let env = next_env(&mut healthy).await;
        assert_eq!(env.content, format!("m{i}"));
        if i == 254 {
            expect_presence(&mut healthy, Kind::MemberLeft, "u4").await;
        }
    }

    assert!(stalled.is_closed());
    let mut drained = 0;
    while stalled.recv().await.is_some() {
        drained += 1;
    }
    assert_eq!(drained, 256);

    assert_eq!(h.metrics.evictions.get(&[("reason", "outbox_full")]), 1);
    let snap = h.hub.snapshot().await.unwrap();
    assert_eq!(snap.room(&conv("conv-5")).unwrap().members, 1);
}

#[tokio::test]
async fn dropped_consumer_is_evicted_on_next_fanout() {
    let h = Harness::new();
    let gone = h.join("u1", "conv-6", 16).await;
    let mut alive = h.join("u2", "conv-6", 16).await;
    drop(gone);

    h.send_from(&alive, r#"{"kind":"typing","conversation_id":"conv-6"}"#)
        .await;

    expect_presence(&mut alive, Kind::MemberJoined, "u2").await;
    let typing = next_env(&mut alive).await;
    assert_eq!(typing.kind, Kind::Typing);
    expect_presence(&mut alive, Kind::MemberLeft, "u1").await;
    assert_eq!(h.metrics.evictions.get(&[("reason", "outbox_closed")]), 1);
}

#[tokio::test]
async fn conversations_do_not_leak() {
    let h = Harness::new();
    let mut a = h.join("u1", "conv-a", 16).await;
    let mut b = h.join("u2", "conv-b", 16).await;
    expect_presence(&mut a, Kind::MemberJoined, "u1").await;
    expect_presence(&mut b, Kind::MemberJoined, "u2").await;

    h.send_from(&a, r#"{"kind":"chat","conversation_id":"conv-b","content":"secret"}"#)
        .await;
    let env = next_env(&mut a).await;
    assert_eq!(env.conversation_id.as_str(), "conv-a");

    h.settle().await;
    assert!(b.try_recv().is_none());
}

#[tokio::test]
async fn double_unregister_acts_once() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-7", 16).await;
    let c2 = h.join("u2", "conv-7", 16).await;
    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;
    expect_presence(&mut c1, Kind::MemberJoined, "u2").await;

    h.leave(&c2).await;
    h.leave(&c2).await;
    h.settle().await;

    expect_presence(&mut c1, Kind::MemberLeft, "u2").await;
    assert!(c1.try_recv().is_none());
    assert_eq!(h.metrics.connections_active.get(&[]), 1);
    assert_eq!(h.broker.subscriber_count("chat:conv-7"), 1);
}

#[tokio::test]
async fn join_then_leave_restores_prior_state() {
    let h = Harness::new();
    let before = h.hub.snapshot().await.unwrap();
    assert!(before.rooms.is_empty());

    let c1 = h.join("u1", "conv-8", 16).await;
    h.leave(&c1).await;
    h.wait_subscribers("chat:conv-8", 0).await;

    let after = h.hub.snapshot().await.unwrap();
    assert!(after.rooms.is_empty());
    assert_eq!(h.metrics.rooms_active.get(&[]), 0);
    assert_eq!(h.metrics.connections_active.get(&[]), 0);
}

#[tokio::test]
async fn own_republished_envelopes_are_not_delivered_twice() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-9", 16).await;
    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;

    let mut echo = Envelope::chat(conv("conv-9"), user("u1"), "echo");
    echo.origin = Some(INSTANCE.to_string());
    publish_envelope(h.broker.as_ref(), "chat:", &echo).await.unwrap();

    let mut foreign = Envelope::chat(conv("conv-9"), user("u2"), "foreign");
    foreign.origin = Some("instance-b".to_string());
    publish_envelope(h.broker.as_ref(), "chat:", &foreign).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), c1.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!frame.contains("origin"));
    let env = Envelope::decode(&frame).unwrap();
    assert_eq!(env.content, "foreign");
}

#[tokio::test]
async fn undecodable_broker_payload_keeps_subscription() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-10", 16).await;
    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;

    h.broker
        .publish("chat:conv-10", Bytes::from_static(b"not json"))
        .await
        .unwrap();
    let ok = Envelope::chat(conv("conv-10"), user("u2"), "after garbage");
    publish_envelope(h.broker.as_ref(), "chat:", &ok).await.unwrap();

    assert_eq!(next_env(&mut c1).await.content, "after garbage");
    assert_eq!(h.metrics.decode_errors.get(&[("source", "broker")]), 1);
}

#[tokio::test]
async fn bridge_resubscribes_after_disconnect() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-11", 16).await;
    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;

    h.broker.disconnect("chat:conv-11");
    h.wait_subscribers("chat:conv-11", 1).await;

    let env = Envelope::chat(conv("conv-11"), user("u2"), "back again");
    publish_envelope(h.broker.as_ref(), "chat:", &env).await.unwrap();
    assert_eq!(next_env(&mut c1).await.content, "back again");
}

#[tokio::test]
async fn local_dispatch_reaches_members() {
    let h = Harness::new();
    let mut c1 = h.join("u1", "conv-12", 16).await;
    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;

    h.hub
        .dispatch(Envelope::chat(conv("conv-12"), user("system"), "notice"))
        .await
        .unwrap();
    assert_eq!(next_env(&mut c1).await.content, "notice");
}

struct FailingBroker;

#[async_trait]
impl Broker for FailingBroker {
    async fn subscribe(&self, _topic: &str) -> Result<Subscription> {
        Err(RoomcastError::Broker("connection refused".into()))
    }

    async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<()> {
        Err(RoomcastError::Broker("connection refused".into()))
    }
}

#[tokio::test]
async fn subscribe_failure_rejects_the_join() {
    let metrics = Arc::new(GatewayMetrics::default());
    let hub = Hub::spawn(Arc::new(FailingBroker), settings(), metrics.clone());

    let (handle, outbox) = open_connection(user("u1"), conv("conv-13"), 16);
    let err = hub.register(handle).await.unwrap_err();
    assert_eq!(err.client_code().as_str(), "BROKER");
    assert!(outbox.is_closed());

    let snap = hub.snapshot().await.unwrap();
    assert!(snap.rooms.is_empty());
    assert_eq!(metrics.connections_active.get(&[]), 0);
}

/// Holds every subscribe until a permit is released.
struct GatedBroker {
    inner: MemoryBroker,
    gate: Semaphore,
}

#[async_trait]
impl Broker for GatedBroker {
    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.gate.acquire().await.unwrap().forget();
        self.inner.subscribe(topic).await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.inner.publish(topic, payload).await
    }
}

async fn wait_pending(hub: &Hub, c: &str, want: usize) {
    for _ in 0..200 {
        let snap = hub.snapshot().await.unwrap();
        if snap.room(&conv(c)).map(|r| r.pending) == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("room {c} never had {want} pending joins");
}

#[tokio::test]
async fn concurrent_first_joins_share_one_subscription() {
    let broker = Arc::new(GatedBroker {
        inner: MemoryBroker::new(),
        gate: Semaphore::new(0),
    });
    let hub = Hub::spawn(broker.clone(), settings(), Arc::new(GatewayMetrics::default()));

    let mut outboxes = Vec::new();
    let mut joins = Vec::new();
    for u in ["u1", "u2"] {
        let (handle, outbox) = open_connection(user(u), conv("conv-14"), 16);
        outboxes.push(outbox);
        let hub = hub.clone();
        joins.push(tokio::spawn(async move { hub.register(handle).await }));
    }

    wait_pending(&hub, "conv-14", 2).await;
    let snap = hub.snapshot().await.unwrap();
    assert!(!snap.room(&conv("conv-14")).unwrap().subscribed);

    broker.gate.add_permits(1);
    for j in joins {
        j.await.unwrap().unwrap();
    }

    assert_eq!(broker.inner.subscriber_count("chat:conv-14"), 1);
    let snap = hub.snapshot().await.unwrap();
    let room = snap.room(&conv("conv-14")).unwrap();
    assert_eq!(room.members, 2);
    assert_eq!(room.pending, 0);
}

#[tokio::test]
async fn abandoned_opening_room_leaks_no_subscription() {
    let broker = Arc::new(GatedBroker {
        inner: MemoryBroker::new(),
        gate: Semaphore::new(0),
    });
    let hub = Hub::spawn(broker.clone(), settings(), Arc::new(GatewayMetrics::default()));

    let (handle, outbox) = open_connection(user("u1"), conv("conv-15"), 16);
    let join = {
        let hub = hub.clone();
        tokio::spawn(async move { hub.register(handle).await })
    };
    wait_pending(&hub, "conv-15", 1).await;

    hub.unregister(conv("conv-15"), outbox.id).await.unwrap();
    join.abort();
    broker.gate.add_permits(1);

    let snap = hub.snapshot().await.unwrap();
    assert!(snap.rooms.is_empty());
    assert!(outbox.is_closed());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.inner.subscriber_count("chat:conv-15"), 0);
}

#[tokio::test]
async fn presence_stays_on_the_local_instance() {
    let h = Harness::new();
    let mut watcher = h.broker.subscribe("chat:conv-presence").await.unwrap();

    let mut c1 = h.join("u1", "conv-presence", 16).await;
    let c2 = h.join("u2", "conv-presence", 16).await;
    h.leave(&c2).await;

    expect_presence(&mut c1, Kind::MemberJoined, "u1").await;
    expect_presence(&mut c1, Kind::MemberJoined, "u2").await;
    expect_presence(&mut c1, Kind::MemberLeft, "u2").await;

    let published = tokio::time::timeout(Duration::from_millis(200), watcher.next()).await;
    assert!(published.is_err(), "presence reached the broker: {published:?}");
}
