//! The node pool: registry of authenticated agents and the arbitration
//! logic that keeps exactly one endpoint holding the device.
//!
//! The pool is the single mutation domain for all of this state. Every
//! input (an inbound agent message, a liveness tick, a routing request, a
//! handoff timer) arrives as a [`PoolEvent`] on one channel and is applied
//! by the owning task in arrival order. Timers are scheduled as delayed
//! events carrying a generation number; a fired timer whose generation no
//! longer matches the current handoff cycle is discarded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blehub_proto::wire::{AgentMessage, CoordinatorMessage, ScanDevice};

/// Outbound instructions for a node's connection task.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    /// Serialize and send this message as a text frame.
    Send(CoordinatorMessage),
    /// Send a transport-level ping.
    Ping,
    /// Close the connection.
    Close,
}

/// Sender half of a node's link, held by its pool entry.
pub type NodeLink = mpsc::Sender<LinkCommand>;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub ping_interval: Duration,
    pub stale_timeout: Duration,
    pub scan_duration: Duration,
    /// Network slack added to the scan window before electing.
    pub scan_slack: Duration,
    pub handoff_timeout: Duration,
    pub command_timeout: Duration,
    /// Run a handoff as soon as a node registers while no writer exists.
    pub scan_on_start: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(30_000),
            stale_timeout: Duration::from_millis(60_000),
            scan_duration: Duration::from_millis(10_000),
            scan_slack: Duration::from_millis(3_000),
            handoff_timeout: Duration::from_millis(30_000),
            command_timeout: Duration::from_millis(5_000),
            scan_on_start: true,
        }
    }
}

/// Where the handoff cycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPhase {
    #[default]
    Idle,
    Scanning,
    AwaitingConnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandoffState {
    Idle,
    Scanning { generation: u64 },
    AwaitingConnect { generation: u64 },
}

impl HandoffState {
    fn phase(&self) -> HandoffPhase {
        match self {
            HandoffState::Idle => HandoffPhase::Idle,
            HandoffState::Scanning { .. } => HandoffPhase::Scanning,
            HandoffState::AwaitingConnect { .. } => HandoffPhase::AwaitingConnect,
        }
    }

    fn generation(&self) -> Option<u64> {
        match self {
            HandoffState::Idle => None,
            HandoffState::Scanning { generation }
            | HandoffState::AwaitingConnect { generation } => Some(*generation),
        }
    }
}

/// Notification sent to external subscribers when pool state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PoolNotification {
    NodeConnected { node_id: String },
    NodeRemoved { node_id: String },
    ActiveChanged { node_id: Option<String> },
    /// A handoff was requested but the pool has no members.
    NoActive,
    /// Battery level reported by the active node.
    Battery { level: u8 },
    /// Live RSSI reported by the active node.
    Rssi { value: i32 },
}

/// Per-node view exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub ble_connected: bool,
    pub last_battery: Option<u8>,
    pub is_active: bool,
    pub connected_at: DateTime<Utc>,
}

/// Consistent point-in-time view of the pool, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PoolSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub active: Option<String>,
    pub handoff: HandoffPhase,
    pub local_ready: bool,
}

enum PoolEvent {
    Register {
        node_id: String,
        conn_id: u64,
        link: NodeLink,
    },
    Message {
        node_id: String,
        msg: AgentMessage,
    },
    Pong {
        node_id: String,
        conn_id: u64,
    },
    LinkClosed {
        node_id: String,
        conn_id: u64,
    },
    PingTick {
        node_id: String,
        conn_id: u64,
    },
    ScanWindowElapsed {
        generation: u64,
    },
    HandoffRetry {
        generation: u64,
    },
    CommandTimeout {
        id: u64,
    },
    SubmitCommand {
        data: String,
        reply: oneshot::Sender<bool>,
    },
    SendToActive {
        msg: CoordinatorMessage,
        reply: oneshot::Sender<bool>,
    },
    LocalEndpoint {
        ready: bool,
    },
    TriggerHandoff,
}

struct NodeEntry {
    node_id: String,
    conn_id: u64,
    link: NodeLink,
    ble_connected: bool,
    last_battery: Option<u8>,
    last_seen: Instant,
    awaiting_pong: bool,
    is_active: bool,
    connected_at: DateTime<Utc>,
    ping_cancel: CancellationToken,
}

impl NodeEntry {
    fn send(&self, msg: CoordinatorMessage) {
        if self.link.try_send(LinkCommand::Send(msg)).is_err() {
            warn!(node_id = %self.node_id, "node link backed up, dropping message");
        }
    }

    fn ping(&self) {
        let _ = self.link.try_send(LinkCommand::Ping);
    }

    fn close(&self) {
        let _ = self.link.try_send(LinkCommand::Close);
    }

    fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_id: self.node_id.clone(),
            ble_connected: self.ble_connected,
            last_battery: self.last_battery,
            is_active: self.is_active,
            connected_at: self.connected_at,
        }
    }
}

/// Cloneable handle to a running [`NodePool`].
#[derive(Clone)]
pub struct PoolHandle {
    event_tx: mpsc::Sender<PoolEvent>,
    snapshot_rx: watch::Receiver<PoolSnapshot>,
    notify_tx: broadcast::Sender<PoolNotification>,
}

impl PoolHandle {
    pub async fn register(&self, node_id: String, conn_id: u64, link: NodeLink) {
        let _ = self
            .event_tx
            .send(PoolEvent::Register {
                node_id,
                conn_id,
                link,
            })
            .await;
    }

    pub async fn message(&self, node_id: String, msg: AgentMessage) {
        let _ = self.event_tx.send(PoolEvent::Message { node_id, msg }).await;
    }

    pub async fn pong(&self, node_id: String, conn_id: u64) {
        let _ = self.event_tx.send(PoolEvent::Pong { node_id, conn_id }).await;
    }

    pub async fn link_closed(&self, node_id: String, conn_id: u64) {
        let _ = self
            .event_tx
            .send(PoolEvent::LinkClosed { node_id, conn_id })
            .await;
    }

    /// Route one command frame (already hex-encoded) to the active node and
    /// wait for its `command_result`. `false` on timeout or when no node is
    /// active.
    pub async fn submit_command(&self, data: String) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .event_tx
            .send(PoolEvent::SubmitCommand { data, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Fire-and-forget send to the active node. `false` when none is active.
    pub async fn send_to_active(&self, msg: CoordinatorMessage) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .event_tx
            .send(PoolEvent::SendToActive { msg, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Report a local-endpoint readiness edge.
    pub async fn local_endpoint(&self, ready: bool) {
        let _ = self.event_tx.send(PoolEvent::LocalEndpoint { ready }).await;
    }

    pub async fn trigger_handoff(&self) {
        let _ = self.event_tx.send(PoolEvent::TriggerHandoff).await;
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolNotification> {
        self.notify_tx.subscribe()
    }
}

/// The pool's owning task. All state lives here; all mutation passes through
/// [`NodePool::run`]'s event loop.
pub struct NodePool {
    config: PoolConfig,
    nodes: HashMap<String, NodeEntry>,
    active: Option<String>,
    handoff: HandoffState,
    generation: u64,
    /// Scan reports gathered during the current window, in arrival order.
    pending_scan_results: Vec<(String, Vec<ScanDevice>)>,
    pending_commands: HashMap<u64, oneshot::Sender<bool>>,
    command_counter: u64,
    local_ready: bool,
    event_tx: mpsc::Sender<PoolEvent>,
    event_rx: mpsc::Receiver<PoolEvent>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
    notify_tx: broadcast::Sender<PoolNotification>,
    cancel: CancellationToken,
}

impl NodePool {
    pub fn new(config: PoolConfig, cancel: CancellationToken) -> (Self, PoolHandle) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot::default());
        let (notify_tx, _) = broadcast::channel(64);
        let handle = PoolHandle {
            event_tx: event_tx.clone(),
            snapshot_rx,
            notify_tx: notify_tx.clone(),
        };
        let pool = Self {
            config,
            nodes: HashMap::new(),
            active: None,
            handoff: HandoffState::Idle,
            generation: 0,
            pending_scan_results: Vec::new(),
            pending_commands: HashMap::new(),
            command_counter: 0,
            local_ready: false,
            event_tx,
            event_rx,
            snapshot_tx,
            notify_tx,
            cancel,
        };
        (pool, handle)
    }

    /// Event loop. Runs until cancelled or until every handle is gone.
    pub async fn run(mut self) {
        info!("node pool: event loop started");
        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!("node pool: event channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("node pool: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Register {
                node_id,
                conn_id,
                link,
            } => self.add_node(node_id, conn_id, link),
            PoolEvent::Message { node_id, msg } => self.handle_node_message(&node_id, msg),
            PoolEvent::Pong { node_id, conn_id } => {
                if let Some(entry) = self.nodes.get_mut(&node_id) {
                    if entry.conn_id == conn_id {
                        entry.awaiting_pong = false;
                        entry.last_seen = Instant::now();
                    }
                }
            }
            PoolEvent::LinkClosed { node_id, conn_id } => {
                let matches = self
                    .nodes
                    .get(&node_id)
                    .is_some_and(|e| e.conn_id == conn_id);
                if matches {
                    self.remove_node(&node_id, "link closed");
                }
            }
            PoolEvent::PingTick { node_id, conn_id } => self.ping_tick(&node_id, conn_id),
            PoolEvent::ScanWindowElapsed { generation } => {
                if self.handoff == (HandoffState::Scanning { generation }) {
                    self.elect_node();
                }
            }
            PoolEvent::HandoffRetry { generation } => self.handoff_retry(generation),
            PoolEvent::CommandTimeout { id } => {
                if let Some(reply) = self.pending_commands.remove(&id) {
                    debug!(id, "command timed out");
                    let _ = reply.send(false);
                }
            }
            PoolEvent::SubmitCommand { data, reply } => self.submit_command(data, reply),
            PoolEvent::SendToActive { msg, reply } => {
                let sent = match self.active.as_ref().and_then(|a| self.nodes.get(a)) {
                    Some(entry) => {
                        entry.send(msg);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(sent);
            }
            PoolEvent::LocalEndpoint { ready } => self.local_endpoint(ready),
            PoolEvent::TriggerHandoff => self.trigger_handoff(),
        }
    }

    // -------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------

    fn add_node(&mut self, node_id: String, conn_id: u64, link: NodeLink) {
        if self.nodes.contains_key(&node_id) {
            self.remove_node(&node_id, "replaced by new registration");
        }

        let ping_cancel = CancellationToken::new();
        self.spawn_ping_timer(node_id.clone(), conn_id, ping_cancel.clone());
        let entry = NodeEntry {
            node_id: node_id.clone(),
            conn_id,
            link,
            ble_connected: false,
            last_battery: None,
            last_seen: Instant::now(),
            awaiting_pong: false,
            is_active: false,
            connected_at: Utc::now(),
            ping_cancel,
        };
        self.nodes.insert(node_id.clone(), entry);
        info!(node_id = %node_id, "node registered");
        self.notify(PoolNotification::NodeConnected { node_id });

        // A fresh node is a chance to find the device when nothing holds it.
        if self.config.scan_on_start && self.active.is_none() && !self.local_ready {
            self.trigger_handoff();
        }
        self.sync_snapshot();
    }

    fn remove_node(&mut self, node_id: &str, reason: &str) {
        let Some(entry) = self.nodes.remove(node_id) else {
            return;
        };
        entry.ping_cancel.cancel();
        entry.close();
        info!(node_id = %node_id, reason, "node removed");
        self.notify(PoolNotification::NodeRemoved {
            node_id: node_id.to_string(),
        });

        if entry.is_active {
            self.active = None;
            self.notify(PoolNotification::ActiveChanged { node_id: None });
            self.trigger_handoff();
        }
        self.sync_snapshot();
    }

    fn spawn_ping_timer(&self, node_id: String, conn_id: u64, cancel: CancellationToken) {
        let event_tx = self.event_tx.clone();
        let interval = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first interval tick completes immediately; skip it so the
            // node gets a full interval before its first liveness check.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let event = PoolEvent::PingTick {
                            node_id: node_id.clone(),
                            conn_id,
                        };
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn ping_tick(&mut self, node_id: &str, conn_id: u64) {
        let stale = match self.nodes.get(node_id) {
            Some(entry) if entry.conn_id == conn_id => {
                entry.awaiting_pong || entry.last_seen.elapsed() >= self.config.stale_timeout
            }
            _ => return,
        };
        if stale {
            self.remove_node(node_id, "liveness timeout");
        } else if let Some(entry) = self.nodes.get_mut(node_id) {
            entry.awaiting_pong = true;
            entry.ping();
        }
    }

    // -------------------------------------------------------------------
    // Node message dispatch
    // -------------------------------------------------------------------

    fn handle_node_message(&mut self, node_id: &str, msg: AgentMessage) {
        match msg {
            // Authentication already happened at the server; a repeat auth
            // carries no information for the pool.
            AgentMessage::Auth { .. } => {}
            AgentMessage::Status {
                ble_connected,
                battery,
            } => self.handle_status(node_id, ble_connected, battery),
            AgentMessage::ScanResult { devices } => {
                let Some(entry) = self.nodes.get_mut(node_id) else {
                    return;
                };
                entry.last_seen = Instant::now();
                if matches!(self.handoff, HandoffState::Scanning { .. }) {
                    debug!(node_id, count = devices.len(), "scan result recorded");
                    match self
                        .pending_scan_results
                        .iter_mut()
                        .find(|(id, _)| id == node_id)
                    {
                        Some((_, existing)) => *existing = devices,
                        None => self.pending_scan_results.push((node_id.to_string(), devices)),
                    }
                } else {
                    debug!(node_id, "scan result outside a scan window, discarding");
                }
            }
            AgentMessage::Battery { level } => {
                let Some(entry) = self.nodes.get_mut(node_id) else {
                    return;
                };
                entry.last_seen = Instant::now();
                entry.last_battery = Some(level);
                if entry.is_active {
                    self.notify(PoolNotification::Battery { level });
                }
                self.sync_snapshot();
            }
            AgentMessage::Rssi { value } => {
                let Some(entry) = self.nodes.get_mut(node_id) else {
                    return;
                };
                entry.last_seen = Instant::now();
                if entry.is_active {
                    self.notify(PoolNotification::Rssi { value });
                }
            }
            AgentMessage::CommandResult { id, success } => {
                if let Some(entry) = self.nodes.get_mut(node_id) {
                    entry.last_seen = Instant::now();
                }
                if let Some(reply) = self.pending_commands.remove(&id) {
                    let _ = reply.send(success);
                }
            }
        }
    }

    fn handle_status(&mut self, node_id: &str, ble_connected: bool, battery: Option<u8>) {
        let (was_connected, was_active) = {
            let Some(entry) = self.nodes.get_mut(node_id) else {
                return;
            };
            entry.last_seen = Instant::now();
            if let Some(level) = battery {
                entry.last_battery = Some(level);
            }
            let was = entry.ble_connected;
            entry.ble_connected = ble_connected;
            (was, entry.is_active)
        };

        if !was_connected && ble_connected {
            self.try_promote(node_id);
        } else if was_connected && !ble_connected && was_active {
            info!(node_id, "active node lost the device");
            if let Some(entry) = self.nodes.get_mut(node_id) {
                entry.is_active = false;
            }
            self.active = None;
            self.notify(PoolNotification::ActiveChanged { node_id: None });
            self.trigger_handoff();
        }
        self.sync_snapshot();
    }

    // -------------------------------------------------------------------
    // Arbitration
    // -------------------------------------------------------------------

    /// Promote `node_id` if nothing else is active. A duplicate connection
    /// yields to the incumbent: the device accepts a single link, so the
    /// newcomer is told to drop its side.
    fn try_promote(&mut self, node_id: &str) {
        let connected = self
            .nodes
            .get(node_id)
            .is_some_and(|entry| entry.ble_connected);
        if !connected {
            return;
        }

        match self.active.clone() {
            None => {
                if let Some(entry) = self.nodes.get_mut(node_id) {
                    entry.is_active = true;
                }
                self.active = Some(node_id.to_string());
                self.handoff = HandoffState::Idle;
                info!(node_id, "node promoted to active");
                self.notify(PoolNotification::ActiveChanged {
                    node_id: Some(node_id.to_string()),
                });
                self.sync_snapshot();
            }
            Some(incumbent) if incumbent != node_id => {
                info!(node_id, incumbent = %incumbent, "duplicate device link, yielding to incumbent");
                if let Some(entry) = self.nodes.get(node_id) {
                    entry.send(CoordinatorMessage::DisconnectBle);
                }
            }
            Some(_) => {}
        }
    }

    /// The election protocol: broadcast a scan, gather results for the
    /// window plus slack, then elect. Concurrent triggers coalesce into the
    /// cycle already in flight.
    fn trigger_handoff(&mut self) {
        if self.handoff != HandoffState::Idle {
            debug!("handoff already in progress, coalescing");
            return;
        }
        if self.nodes.is_empty() {
            info!("handoff requested with an empty pool");
            self.notify(PoolNotification::NoActive);
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        self.handoff = HandoffState::Scanning { generation };
        self.pending_scan_results.clear();

        let duration_ms = self.config.scan_duration.as_millis() as u64;
        info!(generation, nodes = self.nodes.len(), "handoff: broadcasting scan");
        for entry in self.nodes.values() {
            entry.send(CoordinatorMessage::Scan {
                duration: Some(duration_ms),
            });
        }

        let window = self.config.scan_duration + self.config.scan_slack;
        self.schedule(window, PoolEvent::ScanWindowElapsed { generation });
        self.schedule(
            self.config.handoff_timeout + window,
            PoolEvent::HandoffRetry { generation },
        );
        self.sync_snapshot();
    }

    /// Pick the node whose scan saw the strongest signal. RSSI is negative
    /// dBm, so numerically largest wins; ties go to the earliest arrival.
    fn elect_node(&mut self) {
        let HandoffState::Scanning { generation } = self.handoff else {
            return;
        };

        let mut winner: Option<(String, i32)> = None;
        for (node_id, devices) in &self.pending_scan_results {
            if !self.nodes.contains_key(node_id) {
                continue;
            }
            for device in devices {
                let better = winner.as_ref().map_or(true, |(_, best)| device.rssi > *best);
                if better {
                    winner = Some((node_id.clone(), device.rssi));
                }
            }
        }
        self.pending_scan_results.clear();

        match winner {
            None => {
                info!("election found no candidate, waiting for retry");
            }
            Some((node_id, rssi)) => {
                info!(node_id = %node_id, rssi, "node elected, requesting connect");
                if let Some(entry) = self.nodes.get(&node_id) {
                    entry.send(CoordinatorMessage::Connect);
                }
                // Promotion happens when the winner's status flips to
                // connected, via try_promote.
                self.handoff = HandoffState::AwaitingConnect { generation };
                self.sync_snapshot();
            }
        }
    }

    fn handoff_retry(&mut self, generation: u64) {
        if self.handoff.generation() != Some(generation) {
            return;
        }
        if self.active.is_some() {
            return;
        }
        self.handoff = HandoffState::Idle;
        if self.nodes.is_empty() {
            self.sync_snapshot();
            return;
        }
        warn!(generation, "handoff produced no active node, retrying");
        self.trigger_handoff();
    }

    fn local_endpoint(&mut self, ready: bool) {
        if self.local_ready == ready {
            return;
        }
        self.local_ready = ready;
        if ready {
            // The local radio outranks any pending election; in-flight agent
            // scans finish on their own and their results are discarded.
            if self.handoff != HandoffState::Idle {
                info!("local endpoint ready, abandoning pending handoff");
                self.handoff = HandoffState::Idle;
                self.pending_scan_results.clear();
            }
        } else if self.active.is_none() {
            info!("local endpoint lost the device");
            self.trigger_handoff();
        }
        self.sync_snapshot();
    }

    // -------------------------------------------------------------------
    // Remote commands
    // -------------------------------------------------------------------

    fn submit_command(&mut self, data: String, reply: oneshot::Sender<bool>) {
        let Some(entry) = self.active.as_ref().and_then(|a| self.nodes.get(a)) else {
            let _ = reply.send(false);
            return;
        };

        self.command_counter += 1;
        let id = self.command_counter;
        entry.send(CoordinatorMessage::Command { id, data });
        self.pending_commands.insert(id, reply);
        self.schedule(self.config.command_timeout, PoolEvent::CommandTimeout { id });
        debug!(id, "command dispatched to active node");
    }

    // -------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------

    fn schedule(&self, delay: Duration, event: PoolEvent) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = event_tx.send(event).await;
        });
    }

    fn notify(&self, notification: PoolNotification) {
        // No subscribers is fine.
        let _ = self.notify_tx.send(notification);
    }

    fn sync_snapshot(&self) {
        let mut nodes: Vec<NodeSnapshot> = self.nodes.values().map(NodeEntry::snapshot).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        self.snapshot_tx.send_replace(PoolSnapshot {
            nodes,
            active: self.active.clone(),
            handoff: self.handoff.phase(),
            local_ready: self.local_ready,
        });
    }
}
