//! Behavior modifier: the strategy that rewrites forwarding, decay, and
//! cleanup decisions from observed network telemetry.
//!
//! The contract is a narrow set of pure predicate/transform operations plus
//! telemetry sinks. [`DefaultModifier`] is the null object returning
//! pass-through defaults; [`AdaptiveModifier`] maintains per-neighbor
//! exponentially-weighted averages of RTT and success rate and a
//! per-(neighbor, fault-kind) failure counter, and uses them to bias decay
//! against flaky neighbors, withhold forwarding from neighbors with
//! sustained failures, and tighten the cleanup interval as storage fills.
//!
//! Telemetry is never exposed through shared data. Reads go through copying
//! accessors; writes take a short-lived lock that readers of other keys do
//! not contend on in practice (one small map, updated per datagram).

use crate::params::{self, RuntimeParameters};
use crate::types::{now, InfoMessage, Neighbor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

// =============================================================================
// TELEMETRY INPUTS
// =============================================================================

/// Category of a communication failure, counted per neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    /// Local resolve/send failure.
    Transport,
    /// Peer sent something we could not decode.
    Decode,
    /// Expected response never arrived.
    Timeout,
}

/// Per-neighbor rolling statistics. Copied out by accessors.
#[derive(Debug, Clone, Serialize)]
pub struct NeighborTelemetry {
    /// EWMA of observed round-trip latency, milliseconds.
    pub rtt_ms: f64,
    /// EWMA of send success, in [0, 1].
    pub success_rate: f64,
    /// Total observations folded into the averages.
    pub samples: u64,
    /// Failure counts by category.
    pub faults: HashMap<FaultKind, u64>,
}

impl NeighborTelemetry {
    fn new() -> Self {
        Self {
            rtt_ms: 0.0,
            success_rate: 1.0,
            samples: 0,
            faults: HashMap::new(),
        }
    }
}

// =============================================================================
// STRATEGY CONTRACT
// =============================================================================

/// Swappable strategy consulted on the diffusion hot path.
///
/// All operations must be cheap: they run once per message per neighbor.
/// Default method bodies implement the pass-through policy, so a null
/// implementation only needs `impl BehaviorModifier for X {}`.
pub trait BehaviorModifier: Send + Sync {
    /// Adjust the TTL requested for a newly injected message.
    fn modify_ttl(&self, _message_type: &str, requested: Duration) -> Duration {
        requested
    }

    /// Message-level decay adjustment, applied before per-neighbor decay.
    fn modify_energy_decay(&self, _msg: &InfoMessage, base: f64) -> f64 {
        base
    }

    /// Per-neighbor decay. Larger values shrink the message's reach through
    /// that neighbor.
    fn modify_energy_decay_for_neighbor(
        &self,
        _msg: &InfoMessage,
        base: f64,
        _neighbor_id: &str,
    ) -> f64 {
        base
    }

    /// Whether to forward `msg` to `neighbor` at all.
    fn should_forward(&self, _msg: &InfoMessage, _neighbor: &Neighbor) -> bool {
        true
    }

    /// Whether the cleanup sweep should evict `msg`. The default policy
    /// evicts only expired messages regardless of pressure.
    fn should_cleanup(&self, msg: &InfoMessage, _memory_pressure: bool) -> bool {
        msg.is_expired(now())
    }

    /// Adjust the cleanup tick. `stored` is the current storage size.
    fn modify_cleanup_interval(&self, current: Duration, _stored: usize) -> Duration {
        current
    }

    /// A send to `neighbor_id` completed.
    fn record_comm_success(&self, _neighbor_id: &str) {}

    /// A send to `neighbor_id` failed.
    fn record_comm_failure(&self, _neighbor_id: &str, _kind: FaultKind) {}

    /// A latency observation for `neighbor_id` (ping round trip or send
    /// completion time).
    fn record_neighbor_performance(&self, _neighbor_id: &str, _latency_ms: f64, _ok: bool) {}
}

/// Null object: every decision is the pass-through default.
pub struct DefaultModifier;

impl BehaviorModifier for DefaultModifier {}

// =============================================================================
// ADAPTIVE IMPLEMENTATION
// =============================================================================

/// EWMA smoothing factor. One observation moves the average by 20%, so a
/// neighbor needs a sustained streak to change classification.
const EWMA_ALPHA: f64 = 0.2;

/// Observations required before telemetry influences forwarding decisions.
const MIN_SAMPLES: u64 = 10;

/// Success rate below which a neighbor stops receiving forwards.
const FORWARD_CUTOFF: f64 = 0.2;

/// Success rate below which decay is biased upward.
const FLAKY_THRESHOLD: f64 = 0.5;

/// RTT above which a neighbor is considered slow, milliseconds.
const SLOW_RTT_MS: f64 = 500.0;

/// Energy at or below which a message is evictable under memory pressure.
const PRESSURE_ENERGY_FLOOR: f64 = 1.0;

/// TTL bounds enforced on injection, seconds.
const MIN_TTL_SECS: u64 = 1;
const MAX_TTL_SECS: u64 = 86_400;

/// Strategy that adapts to observed network conditions.
pub struct AdaptiveModifier {
    params: Arc<RuntimeParameters>,
    telemetry: RwLock<HashMap<String, NeighborTelemetry>>,
}

impl AdaptiveModifier {
    pub fn new(params: Arc<RuntimeParameters>) -> Self {
        Self {
            params,
            telemetry: RwLock::new(HashMap::new()),
        }
    }

    /// Copy of one neighbor's stats.
    pub fn neighbor_telemetry(&self, neighbor_id: &str) -> Option<NeighborTelemetry> {
        self.telemetry
            .read()
            .expect("telemetry lock poisoned")
            .get(neighbor_id)
            .cloned()
    }

    /// Copy of all per-neighbor stats.
    pub fn telemetry_snapshot(&self) -> HashMap<String, NeighborTelemetry> {
        self.telemetry
            .read()
            .expect("telemetry lock poisoned")
            .clone()
    }

    /// Drop stats for a neighbor that left the cluster.
    pub fn forget_neighbor(&self, neighbor_id: &str) {
        self.telemetry
            .write()
            .expect("telemetry lock poisoned")
            .remove(neighbor_id);
    }

    fn observe(&self, neighbor_id: &str, latency_ms: Option<f64>, ok: bool) {
        let mut telemetry = self.telemetry.write().expect("telemetry lock poisoned");
        let entry = telemetry
            .entry(neighbor_id.to_string())
            .or_insert_with(NeighborTelemetry::new);
        if let Some(ms) = latency_ms {
            if entry.samples == 0 {
                entry.rtt_ms = ms;
            } else {
                entry.rtt_ms += EWMA_ALPHA * (ms - entry.rtt_ms);
            }
        }
        let outcome = if ok { 1.0 } else { 0.0 };
        entry.success_rate += EWMA_ALPHA * (outcome - entry.success_rate);
        entry.samples += 1;
    }
}

impl BehaviorModifier for AdaptiveModifier {
    fn modify_ttl(&self, _message_type: &str, requested: Duration) -> Duration {
        requested.clamp(
            Duration::from_secs(MIN_TTL_SECS),
            Duration::from_secs(MAX_TTL_SECS),
        )
    }

    fn modify_energy_decay_for_neighbor(
        &self,
        _msg: &InfoMessage,
        base: f64,
        neighbor_id: &str,
    ) -> f64 {
        let telemetry = self.telemetry.read().expect("telemetry lock poisoned");
        let Some(stats) = telemetry.get(neighbor_id) else {
            return base;
        };
        if stats.samples < MIN_SAMPLES {
            return base;
        }

        // Flaky neighbors cost more energy per hop, shrinking the reach of
        // anything routed through them. Bounded at 2x base so one neighbor
        // cannot zero out a healthy message on its own.
        let mut decay = base;
        if stats.success_rate < FLAKY_THRESHOLD {
            decay = base * (2.0 - stats.success_rate).min(2.0);
        }
        if stats.rtt_ms > SLOW_RTT_MS {
            decay *= 1.25;
        }
        decay
    }

    fn should_forward(&self, _msg: &InfoMessage, neighbor: &Neighbor) -> bool {
        let telemetry = self.telemetry.read().expect("telemetry lock poisoned");
        match telemetry.get(&neighbor.node_id) {
            Some(stats) => stats.samples < MIN_SAMPLES || stats.success_rate >= FORWARD_CUTOFF,
            None => true,
        }
    }

    fn should_cleanup(&self, msg: &InfoMessage, memory_pressure: bool) -> bool {
        let at = now();
        if msg.is_expired(at) {
            return true;
        }
        if !memory_pressure {
            return false;
        }
        // Under pressure, also evict entries that would contribute little if
        // kept: low remaining energy, or already past half their lifetime.
        if msg.energy <= PRESSURE_ENERGY_FLOOR {
            return true;
        }
        let lifetime = msg.ttl.saturating_sub(msg.timestamp);
        let age = at.saturating_sub(msg.timestamp);
        lifetime > 0 && age * 2 >= lifetime
    }

    fn modify_cleanup_interval(&self, current: Duration, stored: usize) -> Duration {
        let max = self.params.get_i64(params::MAX_STORAGE_MESSAGES, 10_000).max(1) as usize;
        if stored * 10 >= max * 9 {
            // above 90% full: sweep at quarter interval
            (current / 4).max(Duration::from_secs(1))
        } else if stored * 2 >= max {
            // above 50% full: sweep at half interval
            (current / 2).max(Duration::from_secs(1))
        } else {
            current
        }
    }

    fn record_comm_success(&self, neighbor_id: &str) {
        self.observe(neighbor_id, None, true);
    }

    fn record_comm_failure(&self, neighbor_id: &str, kind: FaultKind) {
        self.observe(neighbor_id, None, false);
        let mut telemetry = self.telemetry.write().expect("telemetry lock poisoned");
        if let Some(entry) = telemetry.get_mut(neighbor_id) {
            *entry.faults.entry(kind).or_insert(0) += 1;
        }
    }

    fn record_neighbor_performance(&self, neighbor_id: &str, latency_ms: f64, ok: bool) {
        self.observe(neighbor_id, Some(latency_ms), ok);
    }
}
