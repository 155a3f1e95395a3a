//! Room registry: single-owner actor for membership and local fan-out.
//!
//! Every mutation arrives as a `Command` on one bounded channel and is
//! applied by one loop, so the room table is never shared between tasks.
//! Command handling is synchronous (broker I/O happens in bridge tasks), which
//! also lets a panic in one command be caught without losing the loop.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use roomcast_core::error::{Result, RoomcastError};
use roomcast_core::protocol::topic::room_topic;
use roomcast_core::{ConnectionId, ConversationId, Envelope, Kind};

use crate::broker::{run_bridge, BridgeSpec, Broker};
use crate::config::GatewayConfig;
use crate::obs::GatewayMetrics;

use super::connection::{ConnectionHandle, Frame, Refused};
use super::room::{PendingJoin, Phase, Room};

/// Where a dispatched envelope came from (logging / metrics only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Socket,
    Broker,
    Local,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Socket => "socket",
            Source::Broker => "broker",
            Source::Local => "local",
        }
    }
}

pub(crate) enum Command {
    Register {
        conn: ConnectionHandle,
        ack: oneshot::Sender<Result<()>>,
    },
    Unregister {
        conversation: ConversationId,
        id: ConnectionId,
    },
    Dispatch {
        envelope: Envelope,
        source: Source,
    },
    SubscriptionReady {
        conversation: ConversationId,
        generation: u64,
        result: Result<()>,
    },
    Snapshot {
        reply: oneshot::Sender<HubSnapshot>,
    },
    /// Panics inside the loop.
    #[cfg(test)]
    Fault,
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Register { .. } => "register",
            Command::Unregister { .. } => "unregister",
            Command::Dispatch { .. } => "dispatch",
            Command::SubscriptionReady { .. } => "subscription_ready",
            Command::Snapshot { .. } => "snapshot",
            #[cfg(test)]
            Command::Fault => "fault",
        }
    }
}

/// Point-in-time view of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub conversation_id: ConversationId,
    pub members: usize,
    pub pending: usize,
    /// Broker subscription confirmed and bridge running.
    pub subscribed: bool,
    pub generation: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HubSnapshot {
    pub rooms: Vec<RoomSnapshot>,
}

impl HubSnapshot {
    pub fn room(&self, conversation: &ConversationId) -> Option<&RoomSnapshot> {
        self.rooms.iter().find(|r| &r.conversation_id == conversation)
    }
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub topic_prefix: String,
    /// Tag put on republished envelopes; bridges skip their own echoes.
    pub instance_id: Arc<str>,
    pub resubscribe_backoff: Duration,
    pub command_buffer: usize,
}

impl HubSettings {
    pub fn from_config(cfg: &GatewayConfig, instance_id: Arc<str>) -> Self {
        Self {
            topic_prefix: cfg.broker.topic_prefix.clone(),
            instance_id,
            resubscribe_backoff: Duration::from_millis(cfg.broker.resubscribe_backoff_ms),
            command_buffer: cfg.hub.command_buffer,
        }
    }
}

fn hub_gone() -> RoomcastError {
    RoomcastError::Unavailable("hub is not running".into())
}

/// Owning handle to the registry loop. The loop stops once every `Hub`
/// clone is dropped.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<Command>,
}

/// Non-owning handle for connections and bridges; it never keeps the
/// registry alive on its own.
#[derive(Clone)]
pub struct HubLink {
    tx: mpsc::WeakSender<Command>,
}

impl Hub {
    pub fn spawn(broker: Arc<dyn Broker>, settings: HubSettings, metrics: Arc<GatewayMetrics>) -> Self {
        let (tx, rx) = mpsc::channel(settings.command_buffer.max(1));
        let registry = Registry {
            rooms: HashMap::new(),
            broker,
            link: HubLink { tx: tx.downgrade() },
            settings,
            metrics,
            next_generation: 0,
        };
        tokio::spawn(registry.run(rx));
        Self { tx }
    }

    pub fn link(&self) -> HubLink {
        HubLink {
            tx: self.tx.downgrade(),
        }
    }

    /// Admit a connection. Resolves after the room's broker subscription is
    /// confirmed (opening it if this is the first local member); fails with
    /// `Broker` if the subscription could not be established.
    pub async fn register(&self, conn: ConnectionHandle) -> Result<()> {
        let (ack, admitted) = oneshot::channel();
        self.tx
            .send(Command::Register { conn, ack })
            .await
            .map_err(|_| hub_gone())?;
        admitted.await.map_err(|_| hub_gone())?
    }

    pub async fn unregister(&self, conversation: ConversationId, id: ConnectionId) -> Result<()> {
        self.tx
            .send(Command::Unregister { conversation, id })
            .await
            .map_err(|_| hub_gone())
    }

    /// Fan an envelope out to this process's members of its conversation.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(Command::Dispatch {
                envelope,
                source: Source::Local,
            })
            .await
            .map_err(|_| hub_gone())
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| hub_gone())?;
        rx.await.map_err(|_| hub_gone())
    }
}

impl HubLink {
    async fn send(&self, cmd: Command) -> Result<()> {
        let tx = self.tx.upgrade().ok_or_else(hub_gone)?;
        tx.send(cmd).await.map_err(|_| hub_gone())
    }

    pub async fn unregister(&self, conversation: ConversationId, id: ConnectionId) -> Result<()> {
        self.send(Command::Unregister { conversation, id }).await
    }

    pub async fn dispatch(&self, envelope: Envelope, source: Source) -> Result<()> {
        self.send(Command::Dispatch { envelope, source }).await
    }

    pub(crate) async fn subscription_ready(
        &self,
        conversation: ConversationId,
        generation: u64,
        result: Result<()>,
    ) -> Result<()> {
        self.send(Command::SubscriptionReady {
            conversation,
            generation,
            result,
        })
        .await
    }
}

struct Registry {
    rooms: HashMap<ConversationId, Room>,
    broker: Arc<dyn Broker>,
    link: HubLink,
    settings: HubSettings,
    metrics: Arc<GatewayMetrics>,
    next_generation: u64,
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
fn injected_fault() {
    panic!("injected registry fault");
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::info!(instance = %self.settings.instance_id, "hub registry started");

        while let Some(cmd) = rx.recv().await {
            let label = cmd.label();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.handle(cmd))) {
                self.metrics.hub_panics.inc(&[("command", label)]);
                tracing::error!(
                    command = label,
                    panic = %panic_message(panic.as_ref()),
                    "registry command panicked, continuing"
                );
            }
        }

        self.shutdown();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { conn, ack } => self.register(conn, ack),
            Command::Unregister { conversation, id } => self.unregister(&conversation, id),
            Command::Dispatch { envelope, source } => self.dispatch(envelope, source),
            Command::SubscriptionReady {
                conversation,
                generation,
                result,
            } => self.subscription_ready(conversation, generation, result),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            #[cfg(test)]
            Command::Fault => injected_fault(),
        }
    }

    fn register(&mut self, conn: ConnectionHandle, ack: oneshot::Sender<Result<()>>) {
        let open = match self.rooms.get_mut(&conn.conversation_id) {
            Some(room) => match &mut room.phase {
                Phase::Opening { pending } => {
                    pending.push(PendingJoin { conn, ack });
                    return;
                }
                Phase::Open => true,
            },
            None => false,
        };

        if open {
            self.admit(conn, ack);
        } else {
            self.open_room(PendingJoin { conn, ack });
        }
    }

    /// First local member: start the bridge and park the join until the
    /// broker confirms the subscription.
    fn open_room(&mut self, first: PendingJoin) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let conversation = first.conn.conversation_id.clone();
        let bridge = CancellationToken::new();

        let spec = BridgeSpec {
            topic: room_topic(&self.settings.topic_prefix, &conversation),
            conversation: conversation.clone(),
            generation,
            instance_id: Arc::clone(&self.settings.instance_id),
            backoff: self.settings.resubscribe_backoff,
        };
        tokio::spawn(run_bridge(
            Arc::clone(&self.broker),
            self.link.clone(),
            spec,
            bridge.clone(),
            Arc::clone(&self.metrics),
        ));

        tracing::debug!(%conversation, generation, "opening room");
        self.rooms
            .insert(conversation, Room::opening(generation, bridge, first));
    }

    fn subscription_ready(&mut self, conversation: ConversationId, generation: u64, result: Result<()>) {
        let Some(room) = self.rooms.get_mut(&conversation) else {
            tracing::debug!(%conversation, generation, "subscription confirmed for a closed room");
            return;
        };
        if room.generation != generation || room.is_open() {
            tracing::debug!(%conversation, generation, "stale subscription confirmation");
            return;
        }

        match result {
            Ok(()) => {
                let pending = match std::mem::replace(&mut room.phase, Phase::Open) {
                    Phase::Opening { pending } => pending,
                    Phase::Open => Vec::new(),
                };
                self.metrics.rooms_active.inc(&[]);
                tracing::info!(%conversation, joins = pending.len(), "room open");

                for join in pending {
                    self.admit(join.conn, join.ack);
                }
                self.close_if_vacant(&conversation);
            }
            Err(e) => {
                tracing::warn!(%conversation, error = %e, "room subscription failed, rejecting joins");
                if let Some(room) = self.rooms.remove(&conversation) {
                    room.bridge.cancel();
                    if let Phase::Opening { pending } = room.phase {
                        for join in pending {
                            let _ = join.ack.send(Err(RoomcastError::Broker(e.to_string())));
                            join.conn.close();
                        }
                    }
                }
            }
        }
    }

    /// Insert into an open room and announce the join to everyone,
    /// the new member included.
    fn admit(&mut self, conn: ConnectionHandle, ack: oneshot::Sender<Result<()>>) {
        if ack.send(Ok(())).is_err() {
            tracing::debug!(conn = %conn.id, "join abandoned before admission");
            conn.close();
            return;
        }

        let conversation = conn.conversation_id.clone();
        let user = conn.user_id.clone();
        let id = conn.id;
        let Some(room) = self.rooms.get_mut(&conversation) else {
            conn.close();
            return;
        };
        room.members.insert(id, conn);
        self.metrics.connections_active.inc(&[]);
        tracing::info!(%conversation, %user, conn = %id, "connection registered");

        self.fan_out(Envelope::presence(Kind::MemberJoined, conversation, &user));
    }

    fn unregister(&mut self, conversation: &ConversationId, id: ConnectionId) {
        let Some(room) = self.rooms.get_mut(conversation) else {
            return;
        };

        if let Some(join) = room.take_pending(id) {
            tracing::debug!(%conversation, conn = %id, "pending join withdrawn");
            join.conn.close();
            self.close_if_vacant(conversation);
            return;
        }

        if let Some(left) = self.detach(conversation, id, None) {
            self.fan_out(left);
        }
    }

    /// Remove one member and close its outbox. Returns the `member_left`
    /// envelope to fan out, or `None` if the member was absent or the room
    /// emptied (and was closed).
    fn detach(&mut self, conversation: &ConversationId, id: ConnectionId, evicted: Option<Refused>) -> Option<Envelope> {
        let room = self.rooms.get_mut(conversation)?;
        let member = room.members.remove(&id)?;
        let emptied = room.members.is_empty();
        let user = member.user_id.clone();
        member.close();
        self.metrics.connections_active.dec(&[]);

        match evicted {
            Some(why) => {
                self.metrics.evictions.inc(&[("reason", why.as_str())]);
                tracing::warn!(%conversation, %user, conn = %id, reason = why.as_str(), "connection evicted");
            }
            None => tracing::info!(%conversation, %user, conn = %id, "connection unregistered"),
        }

        if emptied {
            self.close_if_vacant(conversation);
            return None;
        }
        Some(Envelope::presence(Kind::MemberLeft, conversation.clone(), &user))
    }

    fn close_if_vacant(&mut self, conversation: &ConversationId) {
        let vacant = self.rooms.get(conversation).is_some_and(Room::is_vacant);
        if !vacant {
            return;
        }
        if let Some(room) = self.rooms.remove(conversation) {
            room.bridge.cancel();
            if room.is_open() {
                self.metrics.rooms_active.dec(&[]);
            }
            tracing::info!(%conversation, generation = room.generation, "room closed");
        }
    }

    fn dispatch(&mut self, envelope: Envelope, source: Source) {
        let open = self
            .rooms
            .get(&envelope.conversation_id)
            .is_some_and(Room::is_open);
        if !open {
            tracing::trace!(conversation = %envelope.conversation_id, source = source.as_str(), "no local room");
            return;
        }

        let started = Instant::now();
        self.fan_out(envelope);
        self.metrics
            .fanout_duration
            .observe(&[("source", source.as_str())], started.elapsed());
    }

    /// Deliver to every member of the envelope's room. Members that refuse
    /// (full or closed outbox) are evicted; their `member_left` is queued
    /// behind the current envelope so evictions never recurse.
    fn fan_out(&mut self, first: Envelope) {
        let mut queue = VecDeque::from([first]);

        while let Some(mut env) = queue.pop_front() {
            env.origin = None;
            let conversation = env.conversation_id.clone();

            let frame: Frame = match env.encode() {
                Ok(s) => Arc::from(s),
                Err(e) => {
                    tracing::warn!(%conversation, error = %e, "dropping unencodable envelope");
                    continue;
                }
            };

            let refused = match self.rooms.get(&conversation) {
                Some(room) if room.is_open() => room.deliver(&frame),
                _ => continue,
            };

            for (id, why) in refused {
                if let Some(left) = self.detach(&conversation, id, Some(why)) {
                    queue.push_back(left);
                }
            }
        }
    }

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            rooms: self
                .rooms
                .iter()
                .map(|(conversation, room)| RoomSnapshot {
                    conversation_id: conversation.clone(),
                    members: room.members.len(),
                    pending: room.pending_len(),
                    subscribed: room.is_open(),
                    generation: room.generation,
                })
                .collect(),
        }
    }

    fn shutdown(&mut self) {
        for (_, room) in self.rooms.drain() {
            room.bridge.cancel();
            if room.is_open() {
                self.metrics.rooms_active.dec(&[]);
            }
            if let Phase::Opening { pending } = room.phase {
                for join in pending {
                    let _ = join
                        .ack
                        .send(Err(RoomcastError::Unavailable("hub shutting down".into())));
                    join.conn.close();
                }
            }
            for (_, member) in room.members {
                member.close();
                self.metrics.connections_active.dec(&[]);
            }
        }
        tracing::info!("hub registry stopped");
    }
}
