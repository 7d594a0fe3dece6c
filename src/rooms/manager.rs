//! Connection & room manager.
//!
//! Tracks live subscribers, their room memberships, and liveness, and
//! exposes the broadcast primitives the batch processor fans out
//! through.
//!
//! Guarantees:
//! - A send failure evicts that one connection; it never propagates to
//!   the caller or affects other recipients.
//! - Disconnect (transport close, error, or liveness eviction) removes
//!   the connection from every room before its record is freed.
//! - Data-pull requests are answered from the snapshot store directly;
//!   they never pass through the update queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::metrics::counters::Counters;
use crate::rooms::connection::{ConnectionRecord, ConnectionState, Frame};
use crate::rooms::protocol::{
    ClientMessage, ParseError, ServerMessage, parse_client_message, parse_period,
};
use crate::rooms::registry::{
    GLOBAL_ROOM, SubscriptionRegistry, instrument_room, validate_room_name,
};
use crate::store::{SnapshotStore, keys};
use crate::time::now_ms;

#[derive(Clone, Debug)]
pub struct RoomConfig {
    /// Heartbeat tick period. Every tick clears the liveness flag and
    /// pings; a connection still cleared at the next tick is evicted.
    pub heartbeat_interval: Duration,
    /// Hard silence bound, independent of ping/pong bookkeeping.
    pub stale_after: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(90),
        }
    }
}

/// Operational stats consumed by the (external) REST layer.
#[derive(Clone, Debug)]
pub struct ManagerStats {
    pub connections: usize,
    pub rooms_by_connection: HashMap<Uuid, Vec<String>>,
    pub heartbeat_running: bool,
}

pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, ConnectionRecord>>,
    registry: SubscriptionRegistry,
    store: Arc<dyn SnapshotStore>,
    cfg: RoomConfig,
    counters: Counters,
    heartbeat_running: AtomicBool,
}

impl ConnectionManager {
    pub fn new(store: Arc<dyn SnapshotStore>, cfg: RoomConfig, counters: Counters) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            registry: SubscriptionRegistry::new(),
            store,
            cfg,
            counters,
            heartbeat_running: AtomicBool::new(false),
        }
    }

    /// Registers a freshly handshaken transport. Assigns the connection
    /// id, places the connection in the global room, and sends the
    /// acknowledgement message.
    pub fn connect(&self, outbound: UnboundedSender<Frame>) -> Uuid {
        let id = Uuid::new_v4();
        let mut record = ConnectionRecord::new(id, outbound);
        record.state = ConnectionState::Connected;

        self.connections.write().insert(id, record);
        self.registry.insert_connection(id);
        // Global room membership is implicit and cannot fail validation.
        let _ = self.registry.join(id, GLOBAL_ROOM);

        self.counters.connections_opened.fetch_add(1, Ordering::Relaxed);
        info!(connection_id = %id, "connection established");

        self.send_to(
            id,
            &ServerMessage::ConnectionEstablished {
                connection_id: id,
                timestamp: Utc::now(),
            },
        );

        id
    }

    /// Removes the connection from every room and frees its record.
    /// Idempotent; the transport task and the eviction path may race
    /// to call it.
    pub fn disconnect(&self, id: Uuid) {
        let removed = self.connections.write().remove(&id);
        let rooms_left = self.registry.remove_connection(id);

        if let Some(mut record) = removed {
            record.state = ConnectionState::Disconnected;
            info!(connection_id = %id, rooms_left, "connection closed");
        }
    }

    /// Any inbound traffic confirms liveness.
    pub fn record_activity(&self, id: Uuid) {
        if let Some(rec) = self.connections.write().get_mut(&id) {
            rec.touch();
        }
    }

    /// Transport-level pong.
    pub fn record_pong(&self, id: Uuid) {
        self.record_activity(id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn stats(&self) -> ManagerStats {
        let ids: Vec<Uuid> = self.connections.read().keys().copied().collect();
        ManagerStats {
            connections: ids.len(),
            rooms_by_connection: ids
                .into_iter()
                .map(|id| (id, self.registry.rooms_of(id)))
                .collect(),
            heartbeat_running: self.heartbeat_running.load(Ordering::SeqCst),
        }
    }

    /* =========================
     * Broadcast primitives
     * ========================= */

    /// Direct send. A dead transport evicts the connection; the caller
    /// only learns whether delivery was queued.
    pub fn send_to(&self, id: Uuid, msg: &ServerMessage) -> bool {
        let frame = Frame::Text(msg.to_json());

        let sent = {
            let g = self.connections.read();
            match g.get(&id) {
                Some(rec) => rec.send(frame),
                None => return false,
            }
        };

        if !sent {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(connection_id = %id, "send failed; evicting connection");
            self.evict(id);
        }
        sent
    }

    /// Delivers to every live connection.
    pub fn broadcast_all(&self, msg: &ServerMessage) -> usize {
        let ids: Vec<Uuid> = self.connections.read().keys().copied().collect();
        self.deliver(ids, msg)
    }

    /// Delivers to exactly the connections whose room set contains
    /// `room`.
    pub fn broadcast_room(&self, room: &str, msg: &ServerMessage) -> usize {
        let members = self.registry.members_of(room);
        self.deliver(members, msg)
    }

    fn deliver(&self, targets: Vec<Uuid>, msg: &ServerMessage) -> usize {
        let payload = msg.to_json();
        let mut dead = Vec::new();
        let mut delivered = 0usize;

        {
            let g = self.connections.read();
            for id in targets {
                match g.get(&id) {
                    Some(rec) if rec.send(Frame::Text(payload.clone())) => delivered += 1,
                    Some(_) => dead.push(id),
                    None => {}
                }
            }
        }

        for id in dead {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            warn!(connection_id = %id, "send failed during broadcast; evicting");
            self.evict(id);
        }

        self.counters
            .broadcasts_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    fn evict(&self, id: Uuid) {
        self.counters.connections_evicted.fetch_add(1, Ordering::Relaxed);
        self.disconnect(id);
    }

    /* =========================
     * Inbound dispatch
     * ========================= */

    /// Handles one raw inbound payload from `id`. Malformed input gets
    /// an error reply and never tears down the connection.
    #[instrument(skip(self, raw), fields(connection_id = %id))]
    pub async fn handle_message(&self, id: Uuid, raw: &str) {
        self.record_activity(id);

        let msg = match parse_client_message(raw) {
            Ok(m) => m,
            Err(ParseError::Malformed) => {
                warn!(connection_id = %id, "malformed client message");
                self.send_to(id, &ServerMessage::error("invalid message format"));
                return;
            }
            Err(ParseError::UnknownType(t)) => {
                debug!(connection_id = %id, unknown_type = %t, "unrecognized message type");
                self.send_to(id, &ServerMessage::error(format!("unknown message type: {t}")));
                return;
            }
        };

        match msg {
            ClientMessage::Subscribe { symbols } => self.on_subscribe(id, symbols, true),
            ClientMessage::Unsubscribe { symbols } => self.on_subscribe(id, symbols, false),
            ClientMessage::Ping => {
                self.send_to(id, &ServerMessage::Pong { timestamp: Utc::now() });
            }
            ClientMessage::GetMarketSummary => self.on_get_summary(id).await,
            ClientMessage::GetStockHistory { symbol, period } => {
                self.on_get_history(id, symbol, period).await;
            }
        }
    }

    /// Join or leave the instrument rooms for `symbols`. Validation is
    /// all-or-nothing: one invalid symbol fails the whole request with
    /// no membership change.
    fn on_subscribe(&self, id: Uuid, symbols: Vec<String>, join: bool) {
        let rooms: Vec<String> = symbols.iter().map(|s| instrument_room(s)).collect();

        if let Some(bad) = rooms
            .iter()
            .zip(&symbols)
            .find(|(room, _)| validate_room_name(room).is_err())
            .map(|(_, sym)| sym.clone())
        {
            self.send_to(id, &ServerMessage::error(format!("invalid symbol: {bad}")));
            return;
        }

        for room in &rooms {
            let result = if join {
                self.registry.join(id, room)
            } else {
                self.registry.leave(id, room)
            };
            // Validated above; join/leave cannot fail here.
            let _ = result;
        }

        self.send_to(
            id,
            &ServerMessage::SubscriptionUpdated {
                subscriptions: self.registry.rooms_of(id),
                timestamp: Utc::now(),
            },
        );
    }

    async fn on_get_summary(&self, id: Uuid) {
        match self.store.get(&keys::summary()).await {
            Ok(Some(v)) => match serde_json::from_value(v) {
                Ok(summary) => {
                    self.send_to(
                        id,
                        &ServerMessage::MarketSummary {
                            summary,
                            timestamp: Utc::now(),
                        },
                    );
                }
                Err(e) => {
                    warn!(error = %e, "stored market summary is malformed");
                    self.send_to(id, &ServerMessage::error("market summary unavailable"));
                }
            },
            Ok(None) => {
                self.send_to(id, &ServerMessage::error("market summary unavailable"));
            }
            Err(e) => {
                warn!(error = %e, "market summary lookup failed");
                self.send_to(id, &ServerMessage::error("market summary unavailable"));
            }
        }
    }

    async fn on_get_history(&self, id: Uuid, symbol: String, period: String) {
        let Some(window) = parse_period(&period) else {
            self.send_to(id, &ServerMessage::error(format!("invalid period: {period}")));
            return;
        };

        let to = now_ms();
        let from = to.saturating_sub(window.as_millis() as u64);

        match self
            .store
            .range_by_score(&keys::series(&symbol.to_uppercase()), from, to)
            .await
        {
            Ok(history) => {
                self.send_to(
                    id,
                    &ServerMessage::PriceHistory {
                        symbol: symbol.to_uppercase(),
                        period,
                        history,
                        timestamp: Utc::now(),
                    },
                );
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "history lookup failed");
                self.send_to(id, &ServerMessage::error("price history unavailable"));
            }
        }
    }

    /* =========================
     * Liveness
     * ========================= */

    /// Heartbeat loop. Runs until `stop` flips to true.
    pub async fn run_heartbeat(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        if self.heartbeat_running.swap(true, Ordering::SeqCst) {
            info!("heartbeat loop already running; start ignored");
            return;
        }

        let mut ticker = interval(self.cfg.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so fresh
        // connections get a full window before their first ping.
        ticker.tick().await;

        info!(
            every_ms = self.cfg.heartbeat_interval.as_millis() as u64,
            "heartbeat loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.heartbeat_tick();
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.heartbeat_running.store(false, Ordering::SeqCst);
        info!("heartbeat loop stopped");
    }

    /// One liveness pass: evict connections that missed the previous
    /// window or went silent past the staleness bound, then clear the
    /// flag and ping the survivors.
    pub fn heartbeat_tick(&self) {
        let now = now_ms();
        let stale_ms = self.cfg.stale_after.as_millis() as u64;

        let mut to_evict = Vec::new();
        let mut to_ping = Vec::new();

        {
            let mut g = self.connections.write();
            for (id, rec) in g.iter_mut() {
                let silent_ms = now.saturating_sub(rec.last_seen_ms);
                if !rec.alive || silent_ms > stale_ms {
                    to_evict.push((*id, silent_ms));
                } else {
                    rec.alive = false;
                    if rec.state == ConnectionState::Active {
                        rec.state = ConnectionState::Idle;
                    }
                    to_ping.push((*id, rec.sender()));
                }
            }
        }

        for (id, silent_ms) in to_evict {
            warn!(connection_id = %id, silent_ms, "unresponsive connection; evicting");
            self.evict(id);
        }

        for (id, tx) in to_ping {
            if tx.send(Frame::Ping).is_err() {
                self.evict(id);
            }
        }
    }
}
