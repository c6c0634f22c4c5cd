//! Runtime-tunable parameters.
//!
//! A typed key/value store with a fixed set of recognized keys. Every key
//! carries a range constraint checked on write; reads never fail and fall
//! back to the caller-supplied default for unknown keys. Batch updates are
//! all-or-nothing: if any entry fails validation, nothing is applied, and
//! the outcome is reported per key either way.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

// =============================================================================
// RECOGNIZED KEYS
// =============================================================================

/// Discovery broadcast cadence, milliseconds.
pub const ANNOUNCE_INTERVAL_MS: &str = "announce_interval_ms";

/// Neighbor liveness deadline, milliseconds.
pub const NEIGHBOR_TIMEOUT_MS: &str = "neighbor_timeout_ms";

/// Diffusion garbage-collection tick, seconds.
pub const CLEANUP_INTERVAL_SECONDS: &str = "cleanup_interval_seconds";

/// How long completed computation results are retained, seconds.
pub const RESULT_RETENTION_SECONDS: &str = "result_retention_seconds";

/// Energy assigned to injected messages when the caller does not choose one.
pub const DEFAULT_ENERGY: &str = "default_energy";

/// TTL assigned to injected messages when the caller does not choose one.
pub const DEFAULT_TTL_SECONDS: &str = "default_ttl_seconds";

/// Base per-hop energy decay.
pub const ENERGY_DECAY_BASE: &str = "energy_decay_base";

/// Stored-message count at which cleanup switches to pressure eviction.
pub const MAX_STORAGE_MESSAGES: &str = "max_storage_messages";

/// Neighbor set cap. 0 means unlimited; when capped, the entry with the
/// oldest `last_seen` is evicted to make room.
pub const MAX_NEIGHBORS: &str = "max_neighbors";

// =============================================================================
// CONSTRAINTS
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Constraint {
    IntRange(i64, i64),
    FloatRange(f64, f64),
}

impl Constraint {
    /// Validate a candidate value against this constraint.
    /// Integer constraints reject non-integer numbers; float constraints
    /// accept any JSON number in range.
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Constraint::IntRange(lo, hi) => match value.as_i64() {
                Some(n) => n >= *lo && n <= *hi,
                None => false,
            },
            Constraint::FloatRange(lo, hi) => match value.as_f64() {
                Some(f) => f.is_finite() && f >= *lo && f <= *hi,
                None => false,
            },
        }
    }
}

/// Per-key default and constraint.
struct ParamSpec {
    key: &'static str,
    default: fn() -> Value,
    constraint: Constraint,
}

const SPECS: &[ParamSpec] = &[
    ParamSpec {
        key: ANNOUNCE_INTERVAL_MS,
        default: || Value::from(5_000),
        constraint: Constraint::IntRange(100, 3_600_000),
    },
    ParamSpec {
        key: NEIGHBOR_TIMEOUT_MS,
        default: || Value::from(15_000),
        constraint: Constraint::IntRange(1_000, 86_400_000),
    },
    ParamSpec {
        key: CLEANUP_INTERVAL_SECONDS,
        default: || Value::from(30),
        constraint: Constraint::IntRange(1, 3_600),
    },
    ParamSpec {
        key: RESULT_RETENTION_SECONDS,
        default: || Value::from(600),
        constraint: Constraint::IntRange(1, 86_400),
    },
    ParamSpec {
        key: DEFAULT_ENERGY,
        default: || Value::from(5),
        constraint: Constraint::IntRange(0, 1_000),
    },
    ParamSpec {
        key: DEFAULT_TTL_SECONDS,
        default: || Value::from(300),
        constraint: Constraint::IntRange(1, 86_400),
    },
    ParamSpec {
        key: ENERGY_DECAY_BASE,
        default: || Value::from(1.0),
        constraint: Constraint::FloatRange(0.0, 100.0),
    },
    ParamSpec {
        key: MAX_STORAGE_MESSAGES,
        default: || Value::from(10_000),
        constraint: Constraint::IntRange(1, 10_000_000),
    },
    ParamSpec {
        key: MAX_NEIGHBORS,
        default: || Value::from(0),
        constraint: Constraint::IntRange(0, 100_000),
    },
];

// =============================================================================
// STORE
// =============================================================================

/// Typed key/value store with per-key validation.
///
/// Lives for the process lifetime. Updates are atomic per key; `update_batch`
/// is atomic across the whole transaction.
pub struct RuntimeParameters {
    values: RwLock<HashMap<&'static str, Value>>,
}

impl RuntimeParameters {
    pub fn new() -> Self {
        let values = SPECS
            .iter()
            .map(|spec| (spec.key, (spec.default)()))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }

    fn spec(key: &str) -> Option<&'static ParamSpec> {
        SPECS.iter().find(|s| s.key == key)
    }

    /// Integer read. Unknown keys and type mismatches return `default`.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .read()
            .expect("params lock poisoned")
            .get(key)
            .and_then(|v| v.as_i64())
            .unwrap_or(default)
    }

    /// Float read. Unknown keys and type mismatches return `default`.
    /// Integer-typed values read as floats.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.values
            .read()
            .expect("params lock poisoned")
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    /// Millisecond-interval read as a `Duration`.
    pub fn get_millis(&self, key: &str, default_ms: u64) -> Duration {
        Duration::from_millis(self.get_i64(key, default_ms as i64).max(0) as u64)
    }

    /// Second-interval read as a `Duration`.
    pub fn get_secs(&self, key: &str, default_secs: u64) -> Duration {
        Duration::from_secs(self.get_i64(key, default_secs as i64).max(0) as u64)
    }

    /// Apply one update. Returns whether the per-key validator accepted it.
    /// Unknown keys are rejected.
    pub fn set(&self, key: &str, value: Value) -> bool {
        let Some(spec) = Self::spec(key) else {
            return false;
        };
        if !spec.constraint.accepts(&value) {
            return false;
        }
        self.values
            .write()
            .expect("params lock poisoned")
            .insert(spec.key, value);
        true
    }

    /// Apply a batch of updates atomically: every entry is validated first,
    /// and nothing is written unless all entries pass. The returned map
    /// reports acceptance per key either way.
    pub fn update_batch(&self, updates: &HashMap<String, Value>) -> HashMap<String, bool> {
        let mut report = HashMap::with_capacity(updates.len());
        let mut all_valid = true;
        for (key, value) in updates {
            let ok = Self::spec(key).is_some_and(|s| s.constraint.accepts(value));
            if !ok {
                all_valid = false;
            }
            report.insert(key.clone(), ok);
        }

        if all_valid {
            let mut values = self.values.write().expect("params lock poisoned");
            for (key, value) in updates {
                if let Some(spec) = Self::spec(key) {
                    values.insert(spec.key, value.clone());
                }
            }
        }
        report
    }

    /// Copy of the full parameter table, for the observation read model.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .read()
            .expect("params lock poisoned")
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

impl Default for RuntimeParameters {
    fn default() -> Self {
        Self::new()
    }
}
