//! Datagram transport for the control and diffusion planes.
//!
//! One UDP socket per node carries everything: announcements, ping/pong,
//! and information messages. Sends are best-effort and fire-and-forget;
//! the single receive task decodes each datagram and dispatches it to the
//! registered handler for its envelope type. Decode failures drop the
//! datagram. There are no retries at this layer.
//!
//! Inbound dispatch goes through polymorphic handler traits so this module
//! never names the diffusion or discovery types directly; the node wires
//! the actual components in during its construction phase.

use crate::behavior::{BehaviorModifier, FaultKind};
use crate::error::Error;
use crate::net::envelope::{
    AnnouncePayload, Envelope, PingPayload, KIND_ANNOUNCE, KIND_CA_BOUNDARY, KIND_INFO, KIND_PING,
    KIND_PONG, MAX_DATAGRAM_SIZE,
};
use crate::types::{now, InfoMessage, NodeId};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

// =============================================================================
// HANDLER SEAMS
// =============================================================================

/// Receiver of decoded information messages (the diffusion component, and
/// the CA boundary overlay when one is wired).
#[async_trait]
pub trait InfoSink: Send + Sync {
    /// `from` is the node id of the forwarding neighbor, when known.
    async fn handle_info_message(&self, msg: InfoMessage, from: Option<NodeId>);
}

/// Receiver of discovery traffic.
#[async_trait]
pub trait DiscoverySink: Send + Sync {
    async fn handle_announce(&self, payload: AnnouncePayload, src: SocketAddr);

    /// A pong arrived from `node_id` with the measured round trip.
    async fn handle_pong(&self, node_id: &str, rtt_ms: f64);
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Owner of the node's UDP socket.
pub struct Communication {
    node_id: NodeId,
    listen_port: u16,
    socket: UdpSocket,
    modifier: Arc<dyn BehaviorModifier>,
    info_handler: RwLock<Option<Arc<dyn InfoSink>>>,
    ca_handler: RwLock<Option<Arc<dyn InfoSink>>>,
    discovery: RwLock<Option<Arc<dyn DiscoverySink>>>,
    shutdown: watch::Receiver<bool>,
}

impl Communication {
    /// Bind the socket with broadcast enabled. Bind failure is fatal.
    pub async fn bind(
        node_id: NodeId,
        listen_port: u16,
        modifier: Arc<dyn BehaviorModifier>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", listen_port)).await?;
        socket.set_broadcast(true)?;
        // port 0 asks the OS to pick; advertise what was actually bound
        let listen_port = socket.local_addr()?.port();
        Ok(Self {
            node_id,
            listen_port,
            socket,
            modifier,
            info_handler: RwLock::new(None),
            ca_handler: RwLock::new(None),
            discovery: RwLock::new(None),
            shutdown,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn register_info_handler(&self, handler: Arc<dyn InfoSink>) {
        *self.info_handler.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn register_ca_handler(&self, handler: Arc<dyn InfoSink>) {
        *self.ca_handler.write().expect("handler lock poisoned") = Some(handler);
    }

    pub fn register_discovery(&self, sink: Arc<dyn DiscoverySink>) {
        *self.discovery.write().expect("handler lock poisoned") = Some(sink);
    }

    /// Best-effort send. Never blocks on the peer; fails only on local
    /// encode/send problems.
    pub async fn send(&self, address: IpAddr, port: u16, env: &Envelope) -> Result<(), Error> {
        let bytes = env.encode()?;
        self.socket
            .send_to(&bytes, SocketAddr::new(address, port))
            .await?;
        Ok(())
    }

    /// Wrap an information message for `neighbor_id` and send it, recording
    /// latency and success or failure against the neighbor's telemetry.
    pub async fn send_info_message(
        &self,
        neighbor_id: &str,
        address: IpAddr,
        port: u16,
        msg: &InfoMessage,
    ) -> Result<(), Error> {
        let env = Envelope::info(self.node_id.clone(), neighbor_id.to_string(), msg);
        let started = Instant::now();
        match self.send(address, port, &env).await {
            Ok(()) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
                self.modifier
                    .record_neighbor_performance(neighbor_id, elapsed_ms, true);
                self.modifier.record_comm_success(neighbor_id);
                Ok(())
            }
            Err(e) => {
                self.modifier
                    .record_comm_failure(neighbor_id, FaultKind::Transport);
                debug!(neighbor = neighbor_id, error = %e, "info send failed");
                Err(e)
            }
        }
    }

    /// Spawn the receive task.
    pub fn start(self: &Arc<Self>) {
        let comm = Arc::clone(self);
        tokio::spawn(async move {
            comm.receive_loop().await;
        });
    }

    /// Single reader for the socket. Waits on data or shutdown, whichever
    /// comes first; per-datagram work is cheap (handlers spawn their own
    /// tasks for anything slow), so dispatch runs inline.
    async fn receive_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.dispatch(&buf[..len], src).await,
                        Err(e) => {
                            warn!(error = %e, "udp receive failed");
                        }
                    }
                }
            }
        }
        debug!(node = %self.node_id, "receive loop stopped");
    }

    async fn dispatch(&self, bytes: &[u8], src: SocketAddr) {
        let env = match Envelope::decode(bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(src = %src, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        // Broadcast datagrams loop back; our own are of no interest.
        if env.from == self.node_id {
            return;
        }

        match env.kind.as_str() {
            KIND_PING => self.handle_ping(env, src).await,
            KIND_PONG => self.handle_pong(env).await,
            KIND_ANNOUNCE => {
                match serde_json::from_value::<AnnouncePayload>(env.data) {
                    Ok(payload) => {
                        if let Some(sink) = self.discovery_sink() {
                            sink.handle_announce(payload, src).await;
                        }
                    }
                    Err(e) => debug!(src = %src, error = %e, "bad announce payload"),
                }
            }
            KIND_INFO => self.dispatch_info(env, src, &self.info_handler).await,
            KIND_CA_BOUNDARY => self.dispatch_info(env, src, &self.ca_handler).await,
            other => debug!(src = %src, kind = other, "unknown envelope type"),
        }
    }

    /// Reply to a ping with a pong echoing its timestamp, sent to the
    /// sender's observed address at its advertised listen port.
    async fn handle_ping(&self, env: Envelope, src: SocketAddr) {
        let payload = serde_json::from_value::<PingPayload>(env.data).ok();
        let reply_port = payload.as_ref().map(|p| p.port).unwrap_or_else(|| src.port());
        let echoed = payload.map(|p| p.timestamp).unwrap_or(env.timestamp);
        let pong = Envelope::pong(self.node_id.clone(), env.from, echoed, self.listen_port);
        if let Err(e) = self.send(src.ip(), reply_port, &pong).await {
            debug!(src = %src, error = %e, "pong send failed");
        }
    }

    async fn handle_pong(&self, env: Envelope) {
        let echoed = serde_json::from_value::<PingPayload>(env.data)
            .map(|p| p.timestamp)
            .unwrap_or(env.timestamp);
        // Envelope timestamps are whole unix seconds, so the measured round
        // trip is coarse; recorded in milliseconds regardless.
        let rtt_ms = now().saturating_sub(echoed) as f64 * 1_000.0;
        self.modifier
            .record_neighbor_performance(&env.from, rtt_ms, true);
        if let Some(sink) = self.discovery_sink() {
            sink.handle_pong(&env.from, rtt_ms).await;
        }
    }

    async fn dispatch_info(
        &self,
        env: Envelope,
        src: SocketAddr,
        slot: &RwLock<Option<Arc<dyn InfoSink>>>,
    ) {
        let handler = slot.read().expect("handler lock poisoned").clone();
        let Some(handler) = handler else {
            debug!(src = %src, kind = %env.kind, "no handler registered, dropping");
            return;
        };
        match serde_json::from_value::<InfoMessage>(env.data) {
            Ok(msg) => handler.handle_info_message(msg, Some(env.from)).await,
            Err(e) => debug!(src = %src, error = %e, "bad info payload"),
        }
    }

    fn discovery_sink(&self) -> Option<Arc<dyn DiscoverySink>> {
        self.discovery.read().expect("handler lock poisoned").clone()
    }
}
