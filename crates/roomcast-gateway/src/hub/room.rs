use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use roomcast_core::error::Result;
use roomcast_core::ConnectionId;

use super::connection::{ConnectionHandle, Frame, Refused};

/// A join waiting for its room's broker subscription to be confirmed.
pub(crate) struct PendingJoin {
    pub conn: ConnectionHandle,
    pub ack: oneshot::Sender<Result<()>>,
}

pub(crate) enum Phase {
    /// Subscription requested, not yet confirmed. Nobody is admitted yet.
    Opening { pending: Vec<PendingJoin> },
    /// Subscription live; members receive fan-out.
    Open,
}

/// Local members of one conversation plus its bridge task.
///
/// Owned exclusively by the registry loop.
pub(crate) struct Room {
    pub generation: u64,
    pub bridge: CancellationToken,
    pub phase: Phase,
    pub members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Room {
    pub fn opening(generation: u64, bridge: CancellationToken, first: PendingJoin) -> Self {
        Self {
            generation,
            bridge,
            phase: Phase::Opening { pending: vec![first] },
            members: HashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.phase, Phase::Open)
    }

    pub fn pending_len(&self) -> usize {
        match &self.phase {
            Phase::Opening { pending } => pending.len(),
            Phase::Open => 0,
        }
    }

    /// No members and nobody waiting to join.
    pub fn is_vacant(&self) -> bool {
        self.members.is_empty() && self.pending_len() == 0
    }

    /// Take a not-yet-admitted join out of the waiting list.
    pub fn take_pending(&mut self, id: ConnectionId) -> Option<PendingJoin> {
        let Phase::Opening { pending } = &mut self.phase else {
            return None;
        };
        let idx = pending.iter().position(|p| p.conn.id == id)?;
        Some(pending.remove(idx))
    }

    /// Offer one frame to every member. Returns the members that refused it;
    /// they are still in the room and must be detached by the caller.
    pub fn deliver(&self, frame: &Frame) -> Vec<(ConnectionId, Refused)> {
        self.members
            .values()
            .filter_map(|m| m.offer(frame).err().map(|why| (m.id, why)))
            .collect()
    }
}
