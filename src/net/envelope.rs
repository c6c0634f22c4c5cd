//! Wire envelope for the UDP control and diffusion planes.
//!
//! One application message per datagram, encoded as JSON. The protocol is
//! built for small control messages; the receive buffer is fixed at 4096
//! bytes and anything larger fails to send locally rather than being
//! silently truncated by the platform.

use crate::error::Error;
use crate::spatial::SpatialHint;
use crate::types::{now, InfoMessage, NodeId};
use serde::{Deserialize, Serialize};

/// Receive buffer size, bytes. Datagrams are expected to stay well below it.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

// Envelope type tags.
pub const KIND_PING: &str = "ping";
pub const KIND_PONG: &str = "pong";
pub const KIND_ANNOUNCE: &str = "announce";
pub const KIND_INFO: &str = "info";
pub const KIND_CA_BOUNDARY: &str = "ca_boundary";

/// Datagram envelope. `to` is empty for broadcast-style messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: NodeId,
    #[serde(default)]
    pub to: NodeId,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub energy: f64,
    #[serde(default)]
    pub hops: u32,
    pub timestamp: u64,
}

/// Payload of `ping` and `pong` envelopes. A pong echoes the ping's
/// timestamp unchanged so the pinger can measure the round trip; `port` is
/// the sender's listen port, for replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: u64,
    pub port: u16,
}

/// Payload of `announce` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncePayload {
    pub node_id: NodeId,
    pub cluster_id: String,
    /// UDP listen port.
    pub port: u16,
    /// Observation API port, for external observers.
    pub http_port: u16,
    /// Opaque spatial hint consumed by the advisory barrier predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spatial: Option<SpatialHint>,
}

impl Envelope {
    pub fn ping(from: NodeId, listen_port: u16) -> Self {
        let ts = now();
        Self {
            kind: KIND_PING.to_string(),
            from,
            to: String::new(),
            data: serde_json::json!(PingPayload {
                timestamp: ts,
                port: listen_port,
            }),
            energy: 0.0,
            hops: 0,
            timestamp: ts,
        }
    }

    /// Reply to a ping, echoing its original timestamp.
    pub fn pong(from: NodeId, to: NodeId, echoed_timestamp: u64, listen_port: u16) -> Self {
        Self {
            kind: KIND_PONG.to_string(),
            from,
            to,
            data: serde_json::json!(PingPayload {
                timestamp: echoed_timestamp,
                port: listen_port,
            }),
            energy: 0.0,
            hops: 0,
            timestamp: now(),
        }
    }

    pub fn announce(payload: &AnnouncePayload) -> Self {
        Self {
            kind: KIND_ANNOUNCE.to_string(),
            from: payload.node_id.clone(),
            to: String::new(),
            data: serde_json::json!(payload),
            energy: 0.0,
            hops: 0,
            timestamp: now(),
        }
    }

    /// Wrap an information message for one neighbor.
    pub fn info(from: NodeId, to: NodeId, msg: &InfoMessage) -> Self {
        Self {
            kind: KIND_INFO.to_string(),
            from,
            to,
            data: serde_json::json!(msg),
            energy: msg.energy,
            hops: msg.hops,
            timestamp: now(),
        }
    }

    /// Serialize for the wire. Oversized envelopes fail locally.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::Transport(format!(
                "datagram of {} bytes exceeds {} byte limit",
                bytes.len(),
                MAX_DATAGRAM_SIZE
            )));
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let msg = InfoMessage::new("event", "X", 5.0, now() + 60, "node_a".to_string());
        let env = Envelope::info("node_a".to_string(), "node_b".to_string(), &msg);
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back.kind, KIND_INFO);
        assert_eq!(back.from, "node_a");
        assert_eq!(back.energy, 5.0);

        let inner: InfoMessage = serde_json::from_value(back.data).unwrap();
        assert_eq!(inner.id, msg.id);
        assert_eq!(inner.path, vec!["node_a"]);
    }

    #[test]
    fn test_wire_field_names_are_snake_case() {
        let payload = AnnouncePayload {
            node_id: "node_a".to_string(),
            cluster_id: "default".to_string(),
            port: 9001,
            http_port: 8001,
            spatial: None,
        };
        let json = serde_json::to_value(Envelope::announce(&payload)).unwrap();
        assert_eq!(json["type"], "announce");
        assert_eq!(json["data"]["cluster_id"], "default");
        assert_eq!(json["data"]["http_port"], 8001);
        // absent spatial hint is omitted entirely
        assert!(json["data"].get("spatial").is_none());
    }

    #[test]
    fn test_pong_echoes_ping_timestamp() {
        let ping = Envelope::ping("node_a".to_string(), 9001);
        let payload: PingPayload = serde_json::from_value(ping.data.clone()).unwrap();
        let pong = Envelope::pong(
            "node_b".to_string(),
            "node_a".to_string(),
            payload.timestamp,
            9002,
        );
        let echoed: PingPayload = serde_json::from_value(pong.data).unwrap();
        assert_eq!(echoed.timestamp, payload.timestamp);
        assert_eq!(echoed.port, 9002);
    }

    #[test]
    fn test_oversized_envelope_fails_locally() {
        let msg = InfoMessage::new(
            "data",
            "x".repeat(MAX_DATAGRAM_SIZE),
            1.0,
            now() + 60,
            "node_a".to_string(),
        );
        let env = Envelope::info("node_a".to_string(), String::new(), &msg);
        assert!(matches!(env.encode(), Err(Error::Transport(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"type":"info"}"#),
            Err(Error::Decode(_))
        ));
    }
}
