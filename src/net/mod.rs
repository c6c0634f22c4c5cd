//! Datagram transport and neighbor discovery.

pub mod comm;
pub mod discovery;
pub mod envelope;

pub use comm::{Communication, DiscoverySink, InfoSink};
pub use discovery::{Discovery, NeighborCallback, NeighborEvent};
pub use envelope::{
    AnnouncePayload, Envelope, PingPayload, KIND_ANNOUNCE, KIND_CA_BOUNDARY, KIND_INFO, KIND_PING,
    KIND_PONG, MAX_DATAGRAM_SIZE,
};
