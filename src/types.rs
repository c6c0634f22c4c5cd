//! Core data model for the ryx compute fabric.
//!
//! # Design Goals
//!
//! 1. **Content addressing** — every information message is identified by the
//!    first 8 bytes of the SHA-256 digest of its content. Identical content
//!    collides on purpose, which is what makes cluster-wide deduplication
//!    work without coordination.
//!
//! 2. **Bounded lifetime** — every message carries an absolute TTL and a
//!    non-negative energy budget. Both decay independently; whichever runs
//!    out first limits the message's reach.
//!
//! 3. **Loop-free paths** — the `path` field records the nodes a message has
//!    traversed. A node is never sent a message whose path already contains
//!    it, so no path can hold the same node twice.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// IDENTITY
// =============================================================================

/// Node identifier: `node_` followed by 16 random hex chars.
/// Unique within a cluster, stable for the process lifetime.
pub type NodeId = String;

/// Cluster tag. Nodes ignore datagrams from peers with a different cluster id.
pub type ClusterId = String;

/// Message identifier: first 8 bytes of SHA-256 over content, hex-encoded.
pub type MessageId = String;

/// Number of digest bytes kept for a message id (16 hex chars).
pub const MESSAGE_ID_BYTES: usize = 8;

/// Generate a fresh node id. Called at boot when `--node-id` is unset.
pub fn generate_node_id() -> NodeId {
    format!("node_{:016x}", rand::random::<u64>())
}

/// Current unix time in whole seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Content-addressed message id: hex of the first 8 bytes of SHA-256(content).
///
/// Deterministic by construction, so two injections of the same content
/// produce the same id anywhere in the cluster.
pub fn message_id(content: &str) -> MessageId {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..MESSAGE_ID_BYTES])
}

/// Id for a computation result message: hex of the first 8 bytes of
/// SHA-256 over `"<task_id>:<node_id>"`. Distinct per executing node, so a
/// task executed on k nodes yields k distinct result messages.
pub fn result_message_id(task_id: &str, node_id: &str) -> MessageId {
    let digest = Sha256::digest(format!("{}:{}", task_id, node_id).as_bytes());
    hex::encode(&digest[..MESSAGE_ID_BYTES])
}

// =============================================================================
// INFORMATION MESSAGES
// =============================================================================

/// The unit of information on the diffusion plane.
///
/// Invariants, maintained by the diffusion component:
/// - `id == message_id(&content)` for injected messages
/// - `source == path[0]`
/// - `hops == path.len() - 1` on receipt
/// - no node id appears twice in `path`
///
/// Energy is real-valued throughout: JSON encoding, forwarding gates, and
/// decay arithmetic all use `f64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoMessage {
    /// Content-addressed id (16 hex chars).
    pub id: MessageId,
    /// Type tag, e.g. `"data"`, `"task"`, `"result"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload. Non-text payloads are base64-encoded by callers.
    pub content: String,
    /// Remaining forwarding budget. A message with energy <= 0 is stored but
    /// never forwarded.
    pub energy: f64,
    /// Absolute expiry, unix seconds. Eligible for cleanup once `now >= ttl`.
    pub ttl: u64,
    /// Number of forwarding hops taken so far.
    pub hops: u32,
    /// Origin node id.
    pub source: NodeId,
    /// Ordered list of nodes this copy has traversed, starting at `source`.
    pub path: Vec<NodeId>,
    /// Creation time, unix seconds.
    pub timestamp: u64,
    /// Free-form annotations (task routing, executor info, ...).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InfoMessage {
    /// Build a freshly injected message originating at `source`.
    pub fn new(
        kind: impl Into<String>,
        content: impl Into<String>,
        energy: f64,
        ttl: u64,
        source: NodeId,
    ) -> Self {
        let content = content.into();
        Self {
            id: message_id(&content),
            kind: kind.into(),
            content,
            energy,
            ttl,
            hops: 0,
            source: source.clone(),
            path: vec![source],
            timestamp: now(),
            metadata: HashMap::new(),
        }
    }

    /// Whether this message is past its TTL.
    pub fn is_expired(&self, at: u64) -> bool {
        at >= self.ttl
    }
}

// =============================================================================
// NEIGHBORS
// =============================================================================

/// Liveness state of a neighbor.
///
/// ```text
/// State Transitions:
///
///      announce / pong received
///     ┌───────────────────────────────┐
///     ▼                               │
/// ┌─────────┐  timeout   ┌──────────┐ │  second timeout  ┌──────┐
/// │ Healthy │───────────►│ Degraded │─┴─────────────────►│ Lost │ (removed)
/// └─────────┘            └──────────┘                    └──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborHealth {
    /// Announced within the liveness deadline.
    Healthy,
    /// Missed one deadline; a targeted ping is in flight.
    Degraded,
    /// Missed a second deadline. Terminal; the entry is removed.
    Lost,
}

/// A peer discovered via broadcast announcements.
///
/// Owned exclusively by the discovery component. External callers only ever
/// see cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub node_id: NodeId,
    /// Observed source address of the last announcement.
    pub address: IpAddr,
    /// Advertised UDP listen port.
    pub port: u16,
    /// Advertised observation API port.
    pub http_port: u16,
    /// Unix seconds of the last announcement or pong.
    pub last_seen: u64,
    pub health: NeighborHealth,
    /// Rolling round-trip estimate from ping/pong, milliseconds.
    pub rtt_ms: Option<f64>,
    /// Spatial hint carried in the neighbor's announcements, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spatial: Option<crate::spatial::SpatialHint>,
}

// =============================================================================
// COMPUTATION
// =============================================================================

/// A typed task parsed from the JSON content of a `"task"` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationTask {
    /// Must match a registered executor's task type.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Executor input.
    pub data: String,
    /// Executor-specific knobs, e.g. `{"case_sensitive": false}`.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

/// Outcome of one task execution on one node. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputationResult {
    /// Id of the task message that produced this result.
    pub task_id: MessageId,
    pub task_type: String,
    /// Node that ran the executor.
    pub executed_by: NodeId,
    /// Executor output, opaque to the fabric.
    pub result: serde_json::Value,
    pub execution_time_ms: u64,
    /// Completion time, unix seconds.
    pub timestamp: u64,
}
