//! Per-connection record and lifecycle state.

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::time::now_ms;

/// Lifecycle: `Connecting -> Connected -> (Idle <-> Active) ->
/// Disconnected`. `Connecting` exists only during the transport
/// handshake; the manager first sees a connection at `Connected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Idle,
    Active,
    Disconnected,
}

/// Outbound frames the transport task turns into wire messages.
#[derive(Clone, Debug)]
pub enum Frame {
    Text(String),
    Ping,
}

/// One live subscriber. Created on connect, destroyed on disconnect or
/// liveness eviction.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub id: Uuid,
    pub state: ConnectionState,
    /// Cleared by every heartbeat tick, set again by any inbound
    /// traffic. A connection that stays cleared for a full tick gets
    /// evicted.
    pub alive: bool,
    pub last_seen_ms: u64,
    pub connected_at_ms: u64,
    outbound: UnboundedSender<Frame>,
}

impl ConnectionRecord {
    pub fn new(id: Uuid, outbound: UnboundedSender<Frame>) -> Self {
        let now = now_ms();
        Self {
            id,
            state: ConnectionState::Connecting,
            alive: true,
            last_seen_ms: now,
            connected_at_ms: now,
            outbound,
        }
    }

    /// Queue a frame toward the transport. Failure means the transport
    /// task is gone and the connection should be evicted.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    pub fn sender(&self) -> UnboundedSender<Frame> {
        self.outbound.clone()
    }

    pub fn touch(&mut self) {
        self.alive = true;
        self.last_seen_ms = now_ms();
        self.state = ConnectionState::Active;
    }
}
