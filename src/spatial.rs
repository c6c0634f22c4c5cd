//! Spatial hints and the advisory barrier predicate.
//!
//! Nodes may advertise an opaque position (coordinate system, coordinates,
//! zone) in their announcements. The barrier predicate consults those hints
//! plus locally configured rules to advise against forwarding across
//! administrative boundaries. It is advisory only: there is no enforcement
//! surface beyond the forwarding gate, and with no rules configured the
//! predicate is constant `false`.
//!
//! The predicate runs on the forwarding hot path, once per message per
//! neighbor. It is stateless and allocation-free: string comparisons only.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// HINTS
// =============================================================================

/// Coordinate system a node's position is expressed in. Opaque to the core;
/// carried through announcements for observers and the barrier predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordSystem {
    Gps,
    Relative,
    Logical,
    #[default]
    None,
}

impl FromStr for CoordSystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "gps" => Ok(CoordSystem::Gps),
            "relative" => Ok(CoordSystem::Relative),
            "logical" => Ok(CoordSystem::Logical),
            "none" => Ok(CoordSystem::None),
            other => Err(Error::Validation(format!(
                "unknown coordinate system: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CoordSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordSystem::Gps => "gps",
            CoordSystem::Relative => "relative",
            CoordSystem::Logical => "logical",
            CoordSystem::None => "none",
        };
        f.write_str(s)
    }
}

/// Optional position advertised in announcements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SpatialHint {
    pub coord_system: CoordSystem,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

impl SpatialHint {
    /// A hint is only meaningful when it carries a zone or a position.
    pub fn is_empty(&self) -> bool {
        self.coord_system == CoordSystem::None
            && self.x.is_none()
            && self.y.is_none()
            && self.z.is_none()
            && self.zone.is_none()
    }
}

// =============================================================================
// BARRIER RULES
// =============================================================================

/// One administrative boundary between two zones.
///
/// CLI form: `type:zoneA:zoneB:isolation`, with isolation in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierRule {
    pub barrier_type: String,
    pub zone_a: String,
    pub zone_b: String,
    /// 1.0 blocks every non-exempt type; lower values only block the types
    /// the barrier type names.
    pub isolation: f64,
}

impl BarrierRule {
    /// Whether this rule sits between the two zones, in either direction.
    fn separates(&self, a: &str, b: &str) -> bool {
        (self.zone_a == a && self.zone_b == b) || (self.zone_a == b && self.zone_b == a)
    }

    /// Whether this rule blocks the given message type when crossed.
    /// `emergency` traffic is never blocked.
    fn blocks(&self, message_type: &str) -> bool {
        if message_type == "emergency" {
            return false;
        }
        match self.barrier_type.as_str() {
            "security" => matches!(message_type, "routine" | "maintenance"),
            _ => self.isolation >= 1.0,
        }
    }
}

impl FromStr for BarrierRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 4 {
            return Err(Error::Validation(format!(
                "barrier must be type:zoneA:zoneB:isolation, got {:?}",
                s
            )));
        }
        if parts[..3].iter().any(|p| p.is_empty()) {
            return Err(Error::Validation(format!("barrier has empty field: {:?}", s)));
        }
        let isolation: f64 = parts[3]
            .parse()
            .map_err(|_| Error::Validation(format!("barrier isolation not a number: {:?}", s)))?;
        if !(0.0..=1.0).contains(&isolation) {
            return Err(Error::Validation(format!(
                "barrier isolation must be in [0, 1], got {}",
                isolation
            )));
        }
        Ok(BarrierRule {
            barrier_type: parts[0].to_string(),
            zone_a: parts[1].to_string(),
            zone_b: parts[2].to_string(),
            isolation,
        })
    }
}

/// Parse the comma-separated `--barriers` CLI value.
pub fn parse_barriers(s: &str) -> Result<Vec<BarrierRule>, Error> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(BarrierRule::from_str)
        .collect()
}

// =============================================================================
// PREDICATE
// =============================================================================

/// Advisory forwarding predicate over spatial hints.
#[derive(Debug, Clone, Default)]
pub struct BarrierPredicate {
    self_hint: Option<SpatialHint>,
    rules: Vec<BarrierRule>,
}

impl BarrierPredicate {
    pub fn new(self_hint: Option<SpatialHint>, rules: Vec<BarrierRule>) -> Self {
        Self { self_hint, rules }
    }

    pub fn self_hint(&self) -> Option<&SpatialHint> {
        self.self_hint.as_ref()
    }

    /// Whether forwarding `message_type` to a neighbor with `neighbor_hint`
    /// crosses a configured barrier. Returns `false` whenever either side
    /// lacks a zone or no rule separates the two zones.
    pub fn path_blocked(&self, neighbor_hint: Option<&SpatialHint>, message_type: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let (Some(self_zone), Some(neighbor_zone)) = (
            self.self_hint.as_ref().and_then(|h| h.zone.as_deref()),
            neighbor_hint.and_then(|h| h.zone.as_deref()),
        ) else {
            return false;
        };
        if self_zone == neighbor_zone {
            return false;
        }
        self.rules
            .iter()
            .any(|rule| rule.separates(self_zone, neighbor_zone) && rule.blocks(message_type))
    }
}
