//! Broadcast-based neighbor discovery with passive liveness.
//!
//! Two periodic tasks maintain the neighbor set: the announce task
//! broadcasts this node's identity every `announce_interval_ms`, and the
//! sweep task walks the set every two seconds demoting anything that has
//! gone quiet. A neighbor that misses one liveness deadline turns
//! `Degraded` and receives a targeted ping; a second missed deadline makes
//! it `Lost` and removes it. Any announce or pong restores `Healthy`.
//!
//! # Lock discipline
//!
//! The neighbor map sits behind a read-write lock that is never held across
//! a call into another component. `neighbors()` hands out a clone, so
//! callers (diffusion forwarding in particular) can take their snapshot
//! without holding anything while they do their own locked work. Breaking
//! this rule recreates the forward/announce deadlock: forwarding reads
//! neighbors while an announce callback stores into diffusion.

use crate::net::comm::{Communication, DiscoverySink};
use crate::net::envelope::{AnnouncePayload, Envelope};
use crate::params::{self, RuntimeParameters};
use crate::spatial::SpatialHint;
use crate::types::{now, Neighbor, NeighborHealth, NodeId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Liveness sweep cadence.
const CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// A change in the neighbor set, delivered to registered callbacks.
#[derive(Debug, Clone)]
pub enum NeighborEvent {
    /// First announcement heard from this node.
    Joined(Neighbor),
    /// Missed one liveness deadline.
    Degraded(Neighbor),
    /// Heard from again after degrading.
    Restored(Neighbor),
    /// Missed a second deadline and was removed.
    Left(NodeId),
}

/// Callbacks run on a spawned task and must not call back into Discovery.
pub type NeighborCallback = Arc<dyn Fn(&NeighborEvent) + Send + Sync>;

pub struct Discovery {
    node_id: NodeId,
    cluster_id: String,
    listen_port: u16,
    http_port: u16,
    spatial: Option<SpatialHint>,
    comm: Arc<Communication>,
    params: Arc<RuntimeParameters>,
    neighbors: RwLock<HashMap<NodeId, Neighbor>>,
    callbacks: RwLock<Vec<NeighborCallback>>,
    shutdown: watch::Receiver<bool>,
}

impl Discovery {
    pub fn new(
        node_id: NodeId,
        cluster_id: String,
        http_port: u16,
        spatial: Option<SpatialHint>,
        comm: Arc<Communication>,
        params: Arc<RuntimeParameters>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let listen_port = comm.listen_port();
        Self {
            node_id,
            cluster_id,
            listen_port,
            http_port,
            spatial,
            comm,
            params,
            neighbors: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            shutdown,
        }
    }

    /// Spawn the announce and sweep tasks.
    pub fn start(self: &Arc<Self>) {
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            discovery.announce_loop().await;
        });
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            discovery.sweep_loop().await;
        });
    }

    /// Consistent snapshot of the neighbor set. The internal lock is
    /// released before this returns; callers may hold their own locks.
    pub fn neighbors(&self) -> Vec<Neighbor> {
        self.neighbors
            .read()
            .expect("neighbor lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.read().expect("neighbor lock poisoned").len()
    }

    /// Register a change callback. Fired asynchronously; must not re-enter
    /// Discovery.
    pub fn on_neighbor_change(&self, callback: NeighborCallback) {
        self.callbacks
            .write()
            .expect("callback lock poisoned")
            .push(callback);
    }

    fn announce_payload(&self) -> AnnouncePayload {
        AnnouncePayload {
            node_id: self.node_id.clone(),
            cluster_id: self.cluster_id.clone(),
            port: self.listen_port,
            http_port: self.http_port,
            spatial: self.spatial.clone(),
        }
    }

    async fn announce_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let env = Envelope::announce(&self.announce_payload());
            if let Err(e) = self
                .comm
                .send(IpAddr::V4(Ipv4Addr::BROADCAST), self.listen_port, &env)
                .await
            {
                // Common on networks that filter broadcast; not fatal.
                debug!(error = %e, "announce broadcast failed");
            }

            let interval = self.params.get_millis(params::ANNOUNCE_INTERVAL_MS, 5_000);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(node = %self.node_id, "announce loop stopped");
    }

    async fn sweep_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(CHECK_INTERVAL) => {
                    self.sweep().await;
                }
            }
        }
        debug!(node = %self.node_id, "sweep loop stopped");
    }

    /// One liveness pass: demote quiet neighbors, remove dead ones, ping
    /// the degraded. Pings go out after the lock is released.
    async fn sweep(&self) {
        let timeout = self.params.get_millis(params::NEIGHBOR_TIMEOUT_MS, 15_000);
        let at = now();
        let mut events = Vec::new();
        let mut to_ping = Vec::new();

        {
            let mut neighbors = self.neighbors.write().expect("neighbor lock poisoned");
            let mut lost = Vec::new();
            for neighbor in neighbors.values_mut() {
                let silent = Duration::from_secs(at.saturating_sub(neighbor.last_seen));
                match neighbor.health {
                    NeighborHealth::Healthy if silent > timeout => {
                        neighbor.health = NeighborHealth::Degraded;
                        events.push(NeighborEvent::Degraded(neighbor.clone()));
                        to_ping.push((neighbor.address, neighbor.port));
                    }
                    NeighborHealth::Degraded if silent > timeout * 2 => {
                        neighbor.health = NeighborHealth::Lost;
                        lost.push(neighbor.node_id.clone());
                    }
                    NeighborHealth::Degraded => {
                        to_ping.push((neighbor.address, neighbor.port));
                    }
                    _ => {}
                }
            }
            for node_id in lost {
                neighbors.remove(&node_id);
                info!(neighbor = %node_id, "neighbor lost");
                events.push(NeighborEvent::Left(node_id));
            }
        }

        self.fire(events);

        for (address, port) in to_ping {
            let ping = Envelope::ping(self.node_id.clone(), self.listen_port);
            if let Err(e) = self.comm.send(address, port, &ping).await {
                debug!(error = %e, "liveness ping failed");
            }
        }
    }

    /// Deliver events on a spawned task so callbacks can do arbitrary work
    /// without re-entering the sweep or announce paths.
    fn fire(&self, events: Vec<NeighborEvent>) {
        if events.is_empty() {
            return;
        }
        let callbacks = self
            .callbacks
            .read()
            .expect("callback lock poisoned")
            .clone();
        if callbacks.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for event in &events {
                for callback in &callbacks {
                    callback(event);
                }
            }
        });
    }
}

#[async_trait]
impl DiscoverySink for Discovery {
    /// Upsert a neighbor from an announcement. Foreign clusters and our own
    /// announcements (looped back by broadcast) are ignored.
    async fn handle_announce(&self, payload: AnnouncePayload, src: SocketAddr) {
        if payload.cluster_id != self.cluster_id || payload.node_id == self.node_id {
            return;
        }

        let mut events = Vec::new();
        {
            let mut neighbors = self.neighbors.write().expect("neighbor lock poisoned");
            match neighbors.get_mut(&payload.node_id) {
                Some(neighbor) => {
                    neighbor.address = src.ip();
                    neighbor.port = payload.port;
                    neighbor.http_port = payload.http_port;
                    neighbor.last_seen = now();
                    neighbor.spatial = payload.spatial;
                    if neighbor.health != NeighborHealth::Healthy {
                        neighbor.health = NeighborHealth::Healthy;
                        events.push(NeighborEvent::Restored(neighbor.clone()));
                    }
                }
                None => {
                    let cap = self.params.get_i64(params::MAX_NEIGHBORS, 0).max(0) as usize;
                    if cap > 0 && neighbors.len() >= cap {
                        // evict the entry heard from least recently
                        if let Some(oldest) = neighbors
                            .values()
                            .min_by_key(|n| n.last_seen)
                            .map(|n| n.node_id.clone())
                        {
                            neighbors.remove(&oldest);
                            events.push(NeighborEvent::Left(oldest));
                        }
                    }
                    let neighbor = Neighbor {
                        node_id: payload.node_id.clone(),
                        address: src.ip(),
                        port: payload.port,
                        http_port: payload.http_port,
                        last_seen: now(),
                        health: NeighborHealth::Healthy,
                        rtt_ms: None,
                        spatial: payload.spatial,
                    };
                    info!(neighbor = %payload.node_id, address = %src.ip(), "neighbor joined");
                    events.push(NeighborEvent::Joined(neighbor.clone()));
                    neighbors.insert(payload.node_id, neighbor);
                }
            }
        }
        self.fire(events);
    }

    /// A pong restores the neighbor to healthy and refreshes its RTT.
    async fn handle_pong(&self, node_id: &str, rtt_ms: f64) {
        let mut events = Vec::new();
        {
            let mut neighbors = self.neighbors.write().expect("neighbor lock poisoned");
            if let Some(neighbor) = neighbors.get_mut(node_id) {
                neighbor.last_seen = now();
                neighbor.rtt_ms = Some(rtt_ms);
                if neighbor.health != NeighborHealth::Healthy {
                    neighbor.health = NeighborHealth::Healthy;
                    events.push(NeighborEvent::Restored(neighbor.clone()));
                }
            }
        }
        self.fire(events);
    }
}
