//! Controlled-flood diffusion of information messages.
//!
//! Storage is a map from content-addressed id to message, so identical
//! content collides and the cluster deduplicates without coordination.
//! Reach is bounded three ways, checked independently per neighbor at
//! forward time: remaining energy, absolute TTL, and the traversed path.
//!
//! # Forwarding discipline
//!
//! The neighbor snapshot is taken from discovery *before* any storage lock
//! is acquired, and no storage lock is held while sending. The per-neighbor
//! energy decay is computed from the original message's energy, never from
//! a shared decrementing counter: a node forwarding to k neighbors sends k
//! copies, each charged its own decay.
//!
//! A forwarded copy keeps `id`, `source`, `ttl`, `timestamp`, `content`,
//! and `metadata` unchanged so deduplication stays end-to-end. Its path
//! gains the destination node, which keeps `hops == path.len() - 1` on
//! receipt and makes the path the loop-prevention record: a neighbor whose
//! id already appears in the path is never sent the message again.

use crate::behavior::BehaviorModifier;
use crate::compute::Computation;
use crate::net::comm::{Communication, InfoSink};
use crate::net::discovery::Discovery;
use crate::params::{self, RuntimeParameters};
use crate::spatial::BarrierPredicate;
use crate::types::{now, InfoMessage, MessageId, Neighbor, NodeId};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Message type that carries a computation task.
pub const TYPE_TASK: &str = "task";

/// Diffusion statistics for the observation read model.
#[derive(Debug, Clone, Serialize)]
pub struct DiffusionStats {
    pub total_messages: usize,
}

pub struct Diffusion {
    node_id: NodeId,
    comm: Arc<Communication>,
    discovery: Arc<Discovery>,
    modifier: Arc<dyn BehaviorModifier>,
    params: Arc<RuntimeParameters>,
    barrier: Arc<BarrierPredicate>,
    storage: RwLock<HashMap<MessageId, InfoMessage>>,
    compute: RwLock<Option<Arc<Computation>>>,
    shutdown: watch::Receiver<bool>,
}

impl Diffusion {
    pub fn new(
        node_id: NodeId,
        comm: Arc<Communication>,
        discovery: Arc<Discovery>,
        modifier: Arc<dyn BehaviorModifier>,
        params: Arc<RuntimeParameters>,
        barrier: Arc<BarrierPredicate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_id,
            comm,
            discovery,
            modifier,
            params,
            barrier,
            storage: RwLock::new(HashMap::new()),
            compute: RwLock::new(None),
            shutdown,
        }
    }

    /// Wire the computation sink. Part of the node's two-phase construction.
    pub fn register_compute(&self, compute: Arc<Computation>) {
        *self.compute.write().expect("compute slot poisoned") = Some(compute);
    }

    /// Spawn the cleanup task.
    pub fn start(self: &Arc<Self>) {
        let diffusion = Arc::clone(self);
        tokio::spawn(async move {
            diffusion.cleanup_loop().await;
        });
    }

    // =========================================================================
    // INJECTION AND RECEPTION
    // =========================================================================

    /// Create and store a new message, then forward it if it has energy.
    ///
    /// Idempotent: if a message with the same content is already stored, the
    /// stored message is returned unchanged and nothing else happens.
    pub fn inject(&self, kind: &str, content: &str, energy: f64, ttl: Duration) -> InfoMessage {
        let ttl = self.modifier.modify_ttl(kind, ttl);
        let msg = InfoMessage::new(
            kind,
            content,
            energy,
            now() + ttl.as_secs(),
            self.node_id.clone(),
        );

        {
            let mut storage = self.storage.write().expect("storage lock poisoned");
            if let Some(existing) = storage.get(&msg.id) {
                debug!(id = %msg.id, "inject of duplicate content, no-op");
                return existing.clone();
            }
            storage.insert(msg.id.clone(), msg.clone());
        }
        info!(id = %msg.id, kind = %msg.kind, energy = msg.energy, "message injected");

        self.after_store(&msg);
        msg
    }

    /// Inject with the configured default energy and TTL.
    pub fn inject_default(&self, kind: &str, content: &str) -> InfoMessage {
        let energy = self.params.get_i64(params::DEFAULT_ENERGY, 5) as f64;
        let ttl = self.params.get_secs(params::DEFAULT_TTL_SECONDS, 300);
        self.inject(kind, content, energy, ttl)
    }

    /// Post-storage fan-out shared by injection and reception: hand tasks to
    /// the computation sink and forward while energy remains. All slow work
    /// lands on fresh tasks, so this returns without blocking the caller
    /// (the receive loop in particular).
    fn after_store(&self, msg: &InfoMessage) {
        if msg.kind == TYPE_TASK {
            let compute = self.compute.read().expect("compute slot poisoned").clone();
            if let Some(compute) = compute {
                let task_msg = msg.clone();
                tokio::spawn(async move {
                    compute.dispatch(task_msg).await;
                });
            }
        }

        if msg.energy > 0.0 {
            self.forward(msg);
        }
    }

    // =========================================================================
    // FORWARDING
    // =========================================================================

    /// Fan a message out to every eligible neighbor.
    ///
    /// Gate order per neighbor: energy, loop prevention (source and path),
    /// the advisory barrier predicate, then the behavior modifier. Each send
    /// runs on its own task; failures are telemetry, not errors.
    fn forward(&self, msg: &InfoMessage) {
        if msg.energy <= 0.0 {
            return;
        }
        // our own id belongs at the end of the path: index 0 for a message
        // we injected, the last hop for one we received. Anywhere earlier
        // means the copy looped, and it stops here.
        if let Some(pos) = msg.path.iter().position(|id| *id == self.node_id) {
            if pos + 1 != msg.path.len() {
                debug!(id = %msg.id, "path loop detected, not forwarding");
                return;
            }
        }

        // snapshot before touching any storage state; discovery's lock is
        // released when this returns
        let neighbors = self.discovery.neighbors();
        if neighbors.is_empty() {
            return;
        }

        let base = self.params.get_f64(params::ENERGY_DECAY_BASE, 1.0);
        let base = self.modifier.modify_energy_decay(msg, base);

        for neighbor in neighbors {
            if !self.eligible(msg, &neighbor) {
                continue;
            }

            let decay =
                self.modifier
                    .modify_energy_decay_for_neighbor(msg, base, &neighbor.node_id);

            let mut copy = msg.clone();
            copy.energy = (msg.energy - decay).max(0.0);
            copy.hops = msg.hops + 1;
            copy.path.push(neighbor.node_id.clone());

            let comm = Arc::clone(&self.comm);
            tokio::spawn(async move {
                let _ = comm
                    .send_info_message(&neighbor.node_id, neighbor.address, neighbor.port, &copy)
                    .await;
            });
        }
    }

    fn eligible(&self, msg: &InfoMessage, neighbor: &Neighbor) -> bool {
        if neighbor.node_id == msg.source {
            return false;
        }
        if msg.path.iter().any(|id| *id == neighbor.node_id) {
            return false;
        }
        if self
            .barrier
            .path_blocked(neighbor.spatial.as_ref(), &msg.kind)
        {
            debug!(id = %msg.id, neighbor = %neighbor.node_id, "barrier advises against forwarding");
            return false;
        }
        self.modifier.should_forward(msg, neighbor)
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Periodic garbage collection. The eviction predicate and the next
    /// tick both come from the behavior modifier, so the sweep widens and
    /// quickens as storage approaches `max_storage_messages`.
    async fn cleanup_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let base = self.params.get_secs(params::CLEANUP_INTERVAL_SECONDS, 30);
            let interval = self
                .modifier
                .modify_cleanup_interval(base, self.total_messages());

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    self.cleanup();
                }
            }
        }
        debug!(node = %self.node_id, "cleanup loop stopped");
    }

    /// One eviction pass.
    pub fn cleanup(&self) {
        let max = self.params.get_i64(params::MAX_STORAGE_MESSAGES, 10_000).max(1) as usize;
        let mut storage = self.storage.write().expect("storage lock poisoned");
        let pressure = storage.len() >= max;
        let before = storage.len();
        storage.retain(|_, msg| !self.modifier.should_cleanup(msg, pressure));
        let evicted = before - storage.len();
        if evicted > 0 {
            info!(evicted, remaining = storage.len(), pressure, "cleanup pass");
        }
    }

    // =========================================================================
    // READ MODEL
    // =========================================================================

    pub fn total_messages(&self) -> usize {
        self.storage.read().expect("storage lock poisoned").len()
    }

    pub fn stats(&self) -> DiffusionStats {
        DiffusionStats {
            total_messages: self.total_messages(),
        }
    }

    pub fn get(&self, id: &str) -> Option<InfoMessage> {
        self.storage
            .read()
            .expect("storage lock poisoned")
            .get(id)
            .cloned()
    }

    /// Snapshot of all stored messages.
    pub fn messages(&self) -> Vec<InfoMessage> {
        self.storage
            .read()
            .expect("storage lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl InfoSink for Diffusion {
    /// Reception path: dedup, store, then dispatch and forward on fresh
    /// tasks. Duplicate ids are dropped silently; duplicates are expected
    /// under flooding.
    async fn handle_info_message(&self, msg: InfoMessage, from: Option<NodeId>) {
        {
            let mut storage = self.storage.write().expect("storage lock poisoned");
            if storage.contains_key(&msg.id) {
                debug!(id = %msg.id, "duplicate message dropped");
                return;
            }
            storage.insert(msg.id.clone(), msg.clone());
        }
        debug!(
            id = %msg.id,
            kind = %msg.kind,
            hops = msg.hops,
            from = from.as_deref().unwrap_or("local"),
            "message stored"
        );

        self.after_store(&msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::DefaultModifier;
    use crate::net::comm::DiscoverySink;
    use crate::spatial::parse_barriers;
    use crate::types::{message_id, NeighborHealth};
    use std::net::{IpAddr, Ipv4Addr};

    async fn test_diffusion(
        barrier: BarrierPredicate,
    ) -> (Arc<Diffusion>, Arc<Discovery>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let params = Arc::new(RuntimeParameters::new());
        let modifier: Arc<dyn BehaviorModifier> = Arc::new(DefaultModifier);
        let comm = Arc::new(
            Communication::bind(
                "node_self".to_string(),
                0,
                Arc::clone(&modifier),
                rx.clone(),
            )
            .await
            .unwrap(),
        );
        let discovery = Arc::new(Discovery::new(
            "node_self".to_string(),
            "default".to_string(),
            8001,
            None,
            Arc::clone(&comm),
            Arc::clone(&params),
            rx.clone(),
        ));
        let diffusion = Arc::new(Diffusion::new(
            "node_self".to_string(),
            comm,
            Arc::clone(&discovery),
            modifier,
            params,
            Arc::new(barrier),
            rx,
        ));
        (diffusion, discovery, tx)
    }

    fn neighbor(id: &str) -> Neighbor {
        Neighbor {
            node_id: id.to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9001,
            http_port: 8001,
            last_seen: now(),
            health: NeighborHealth::Healthy,
            rtt_ms: None,
            spatial: None,
        }
    }

    /// Two injections of "hello" store exactly one message whose id is the
    /// leading 8 bytes of SHA-256("hello").
    #[tokio::test]
    async fn test_inject_is_content_addressed_and_idempotent() {
        let (diffusion, _discovery, _shutdown) = test_diffusion(BarrierPredicate::default()).await;

        let first = diffusion.inject("data", "hello", 0.0, Duration::from_secs(60));
        let second = diffusion.inject("data", "hello", 7.0, Duration::from_secs(999));

        assert_eq!(first.id, "2cf24dba5fb0a30e");
        assert_eq!(diffusion.total_messages(), 1);
        // the second call returned the stored message unchanged
        assert_eq!(second.energy, 0.0);
        assert_eq!(second.ttl, first.ttl);
    }

    #[tokio::test]
    async fn test_inject_invariants() {
        let (diffusion, _discovery, _shutdown) = test_diffusion(BarrierPredicate::default()).await;
        let msg = diffusion.inject("event", "payload", 5.0, Duration::from_secs(60));

        assert_eq!(msg.id, message_id("payload"));
        assert_eq!(msg.source, "node_self");
        assert_eq!(msg.path, vec!["node_self"]);
        assert_eq!(msg.hops, 0);
        assert!(msg.ttl > now());
    }

    #[tokio::test]
    async fn test_reception_dedups_by_id() {
        let (diffusion, _discovery, _shutdown) = test_diffusion(BarrierPredicate::default()).await;

        let msg = InfoMessage::new("event", "X", 0.0, now() + 60, "node_a".to_string());
        diffusion
            .handle_info_message(msg.clone(), Some("node_a".to_string()))
            .await;
        diffusion
            .handle_info_message(msg, Some("node_b".to_string()))
            .await;

        assert_eq!(diffusion.total_messages(), 1);
    }

    #[tokio::test]
    async fn test_forward_gates() {
        let (diffusion, _discovery, _shutdown) = test_diffusion(BarrierPredicate::default()).await;
        let mut msg = InfoMessage::new("event", "X", 5.0, now() + 60, "node_a".to_string());

        // never back to the source
        assert!(!diffusion.eligible(&msg, &neighbor("node_a")));
        // never to a node already on the path
        msg.path.push("node_b".to_string());
        assert!(!diffusion.eligible(&msg, &neighbor("node_b")));
        // fresh neighbor is fine
        assert!(diffusion.eligible(&msg, &neighbor("node_c")));
    }

    #[tokio::test]
    async fn test_forward_honors_barrier_predicate() {
        let rules = parse_barriers("security:lab:office:1.0").unwrap();
        let self_hint = crate::spatial::SpatialHint {
            coord_system: crate::spatial::CoordSystem::Logical,
            zone: Some("lab".to_string()),
            ..Default::default()
        };
        let (diffusion, _discovery, _shutdown) =
            test_diffusion(BarrierPredicate::new(Some(self_hint), rules)).await;

        let msg = InfoMessage::new("routine", "X", 5.0, now() + 60, "node_a".to_string());
        let mut blocked = neighbor("node_b");
        blocked.spatial = Some(crate::spatial::SpatialHint {
            coord_system: crate::spatial::CoordSystem::Logical,
            zone: Some("office".to_string()),
            ..Default::default()
        });

        assert!(!diffusion.eligible(&msg, &blocked));
        // emergency traffic crosses the same barrier
        let urgent = InfoMessage::new("emergency", "Y", 5.0, now() + 60, "node_a".to_string());
        assert!(diffusion.eligible(&urgent, &blocked));
    }

    /// Forwarding with zero energy must be a no-op regardless of neighbors.
    #[tokio::test]
    async fn test_zero_energy_never_forwards() {
        let (diffusion, discovery, _shutdown) = test_diffusion(BarrierPredicate::default()).await;
        use crate::net::envelope::AnnouncePayload;
        use std::net::SocketAddr;
        discovery
            .handle_announce(
                AnnouncePayload {
                    node_id: "node_b".to_string(),
                    cluster_id: "default".to_string(),
                    port: 1,
                    http_port: 8001,
                    spatial: None,
                },
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            )
            .await;

        let msg = InfoMessage::new("event", "drained", 0.0, now() + 60, "node_a".to_string());
        diffusion.forward(&msg);
        // the drained copy is still storable, it just travels no further
        diffusion
            .handle_info_message(msg, Some("node_a".to_string()))
            .await;
        assert_eq!(diffusion.total_messages(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_only() {
        let (diffusion, _discovery, _shutdown) = test_diffusion(BarrierPredicate::default()).await;

        diffusion.inject("data", "fresh", 0.0, Duration::from_secs(600));
        // plant an already-expired message directly
        let mut stale = InfoMessage::new("data", "stale", 0.0, now() + 1, "node_a".to_string());
        stale.ttl = now() - 10;
        diffusion
            .storage
            .write()
            .unwrap()
            .insert(stale.id.clone(), stale.clone());

        assert_eq!(diffusion.total_messages(), 2);
        diffusion.cleanup();
        assert_eq!(diffusion.total_messages(), 1);
        assert!(diffusion.get(&stale.id).is_none());
        assert!(diffusion.get(&message_id("fresh")).is_some());
    }

    #[tokio::test]
    async fn test_task_messages_reach_compute_sink() {
        let (diffusion, _discovery, _shutdown) = test_diffusion(BarrierPredicate::default()).await;
        let compute = Arc::new(crate::compute::Computation::new(
            "node_self".to_string(),
            Arc::new(RuntimeParameters::new()),
            vec![Arc::new(crate::compute::WordCountExecutor)],
            watch::channel(false).1,
        ));
        diffusion.register_compute(Arc::clone(&compute));

        let content = serde_json::json!({"type": "wordcount", "data": "a b a"}).to_string();
        let msg = InfoMessage::new(TYPE_TASK, content, 0.0, now() + 60, "node_a".to_string());
        diffusion
            .handle_info_message(msg, Some("node_a".to_string()))
            .await;

        for _ in 0..100 {
            if compute.stats().completed_tasks == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never dispatched to compute");
    }
}
