//! One live socket as seen from both sides of the outbox.
//!
//! `open` returns the two halves: the registry keeps the `ConnectionHandle`
//! (producer side) while the connection's pumps own the `Outbox` (consumer
//! side). The registry is the only producer, the write pump the only
//! consumer, so the queue needs no further locking.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use roomcast_core::{ConnectionId, ConversationId, UserId};

/// Serialized envelope, encoded once per fan-out and shared by every outbox.
pub type Frame = Arc<str>;

/// Registry-side half: membership identity plus the producer end of the outbox.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    outbox: mpsc::Sender<Frame>,
    closer: CancellationToken,
}

/// Why a non-blocking enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refused {
    /// Slow consumer: outbox at capacity.
    Full,
    /// Consumer is gone (socket never upgraded or pump exited).
    Closed,
}

impl Refused {
    pub fn as_str(self) -> &'static str {
        match self {
            Refused::Full => "outbox_full",
            Refused::Closed => "outbox_closed",
        }
    }
}

impl ConnectionHandle {
    /// Non-blocking enqueue; the registry never waits on a consumer.
    pub fn offer(&self, frame: &Frame) -> Result<(), Refused> {
        match self.outbox.try_send(Arc::clone(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Refused::Full),
            Err(TrySendError::Closed(_)) => Err(Refused::Closed),
        }
    }

    /// Close the outbox and tell both pumps to stop. Consumes the handle so
    /// the registry cannot keep a closed connection around.
    pub fn close(self) {
        self.closer.cancel();
        drop(self.outbox);
    }
}

/// Connection-side half: the consumer end of the outbox and the shared
/// shutdown signal for the read and write pumps.
#[derive(Debug)]
pub struct Outbox {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    rx: mpsc::Receiver<Frame>,
    closer: CancellationToken,
}

impl Outbox {
    /// Next frame; `None` once the registry closed the outbox and it drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Non-blocking receive (tests and draining).
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn closer(&self) -> &CancellationToken {
        &self.closer
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }
}

/// Create both halves of a new connection with a bounded outbox.
pub fn open(user_id: UserId, conversation_id: ConversationId, capacity: usize) -> (ConnectionHandle, Outbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closer = CancellationToken::new();
    let id = ConnectionId::new();

    let handle = ConnectionHandle {
        id,
        user_id: user_id.clone(),
        conversation_id: conversation_id.clone(),
        outbox: tx,
        closer: closer.clone(),
    };
    let outbox = Outbox {
        id,
        user_id,
        conversation_id,
        rx,
        closer,
    };
    (handle, outbox)
}

/// Per-connection lifecycle, tracked by the pumps for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Registered,
    Active,
    Closing,
    Closed,
}

impl ConnState {
    /// Allowed forward transitions; anything else is ignored.
    pub fn advance(self, next: ConnState) -> ConnState {
        use ConnState::*;
        let ok = matches!(
            (self, next),
            (Connecting, Registered)
                | (Registered, Active)
                | (Registered, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        );
        if ok {
            tracing::trace!(from = ?self, to = ?next, "connection state");
            next
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn ids() -> (UserId, ConversationId) {
        (UserId::parse("u1").unwrap(), ConversationId::parse("c1").unwrap())
    }

    #[test]
    fn full_outbox_is_refused_not_blocked() {
        let (user, conv) = ids();
        let (handle, _outbox) = open(user, conv, 2);
        let frame: Frame = Arc::from("{}");
        assert_eq!(handle.offer(&frame), Ok(()));
        assert_eq!(handle.offer(&frame), Ok(()));
        assert_eq!(handle.offer(&frame), Err(Refused::Full));
    }

    #[test]
    fn dropped_consumer_is_reported_closed() {
        let (user, conv) = ids();
        let (handle, outbox) = open(user, conv, 2);
        drop(outbox);
        assert_eq!(handle.offer(&Arc::from("{}")), Err(Refused::Closed));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let (user, conv) = ids();
        let (handle, mut outbox) = open(user, conv, 4);
        handle.offer(&Arc::from("a")).unwrap();
        handle.close();
        assert!(outbox.is_closed());
        assert_eq!(outbox.recv().await.as_deref(), Some("a"));
        assert!(outbox.recv().await.is_none());
    }

    #[test]
    fn state_machine_only_moves_forward() {
        let s = ConnState::Connecting.advance(ConnState::Registered);
        let s = s.advance(ConnState::Active);
        assert_eq!(s.advance(ConnState::Registered), ConnState::Active);
        let s = s.advance(ConnState::Closing).advance(ConnState::Closed);
        assert_eq!(s, ConnState::Closed);
    }
}
