//! Node assembly and lifecycle.
//!
//! Components are built leaves-first with no cross-references, then wired
//! through small register calls: Communication dispatches inbound messages
//! to Diffusion, Diffusion hands tasks to Computation, and Computation
//! re-injects results through Diffusion. Start order mirrors dependency
//! order; shutdown flips one watch channel that every loop selects on.

use crate::behavior::{AdaptiveModifier, BehaviorModifier};
use crate::compute::{Computation, ComputationStats, Executor, WordCountExecutor};
use crate::diffusion::{Diffusion, DiffusionStats, TYPE_TASK};
use crate::error::Error;
use crate::net::comm::{Communication, DiscoverySink, InfoSink};
use crate::net::discovery::Discovery;
use crate::params::RuntimeParameters;
use crate::spatial::{BarrierPredicate, BarrierRule, SpatialHint};
use crate::types::{generate_node_id, ComputationTask, InfoMessage, Neighbor, NodeId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Boot configuration, normally produced from the CLI.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// UDP listen port for discovery and diffusion.
    pub port: u16,
    /// Advertised observation API port.
    pub http_port: u16,
    pub cluster_id: String,
    /// Empty or absent: generated at boot.
    pub node_id: Option<NodeId>,
    pub spatial: Option<SpatialHint>,
    pub barriers: Vec<BarrierRule>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 9001,
            http_port: 8001,
            cluster_id: "default".to_string(),
            node_id: None,
            spatial: None,
            barriers: Vec::new(),
        }
    }
}

/// Observation read model: one consistent snapshot of the node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub cluster_id: String,
    pub port: u16,
    pub http_port: u16,
    pub neighbors: Vec<Neighbor>,
    pub diffusion: DiffusionStats,
    pub computation: ComputationStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spatial: Option<SpatialHint>,
}

pub struct Node {
    node_id: NodeId,
    config: NodeConfig,
    params: Arc<RuntimeParameters>,
    comm: Arc<Communication>,
    discovery: Arc<Discovery>,
    diffusion: Arc<Diffusion>,
    compute: Arc<Computation>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Build and wire every component. Fails only on socket bind.
    pub async fn new(config: NodeConfig) -> Result<Self, Error> {
        Self::with_executors(config, vec![Arc::new(WordCountExecutor)]).await
    }

    /// Build with a caller-chosen executor registry.
    pub async fn with_executors(
        config: NodeConfig,
        executors: Vec<Arc<dyn Executor>>,
    ) -> Result<Self, Error> {
        let node_id = config
            .node_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_node_id);

        let (shutdown, shutdown_rx) = watch::channel(false);

        // leaves first
        let params = Arc::new(RuntimeParameters::new());
        let modifier: Arc<dyn BehaviorModifier> =
            Arc::new(AdaptiveModifier::new(Arc::clone(&params)));

        let comm = Arc::new(
            Communication::bind(
                node_id.clone(),
                config.port,
                Arc::clone(&modifier),
                shutdown_rx.clone(),
            )
            .await?,
        );

        let discovery = Arc::new(Discovery::new(
            node_id.clone(),
            config.cluster_id.clone(),
            config.http_port,
            config.spatial.clone(),
            Arc::clone(&comm),
            Arc::clone(&params),
            shutdown_rx.clone(),
        ));

        let barrier = Arc::new(BarrierPredicate::new(
            config.spatial.clone(),
            config.barriers.clone(),
        ));

        let diffusion = Arc::new(Diffusion::new(
            node_id.clone(),
            Arc::clone(&comm),
            Arc::clone(&discovery),
            Arc::clone(&modifier),
            Arc::clone(&params),
            barrier,
            shutdown_rx.clone(),
        ));

        let compute = Arc::new(Computation::new(
            node_id.clone(),
            Arc::clone(&params),
            executors,
            shutdown_rx,
        ));

        // wiring phase
        comm.register_info_handler(Arc::clone(&diffusion) as Arc<dyn InfoSink>);
        comm.register_discovery(Arc::clone(&discovery) as Arc<dyn DiscoverySink>);
        diffusion.register_compute(Arc::clone(&compute));
        compute.register_diffusion(Arc::clone(&diffusion));

        Ok(Self {
            node_id,
            config,
            params,
            comm,
            discovery,
            diffusion,
            compute,
            shutdown,
        })
    }

    /// Start every long-running task, in dependency order.
    pub fn start(&self) {
        self.comm.start();
        self.discovery.start();
        self.diffusion.start();
        self.compute.start();
        info!(
            node = %self.node_id,
            cluster = %self.config.cluster_id,
            port = self.comm.listen_port(),
            "node started"
        );
    }

    /// Stop all tasks. Idempotent; running executors are abandoned and
    /// their results discarded.
    pub fn shutdown(&self) {
        let already_stopped = self.shutdown.send_replace(true);
        if !already_stopped {
            info!(node = %self.node_id, "node shutting down");
        }
    }

    // =========================================================================
    // OBSERVATION SURFACE
    // =========================================================================

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn listen_port(&self) -> u16 {
        self.comm.listen_port()
    }

    pub fn params(&self) -> &Arc<RuntimeParameters> {
        &self.params
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    pub fn diffusion(&self) -> &Arc<Diffusion> {
        &self.diffusion
    }

    pub fn compute(&self) -> &Arc<Computation> {
        &self.compute
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id.clone(),
            cluster_id: self.config.cluster_id.clone(),
            port: self.comm.listen_port(),
            http_port: self.config.http_port,
            neighbors: self.discovery.neighbors(),
            diffusion: self.diffusion.stats(),
            computation: self.compute.stats(),
            spatial: self.config.spatial.clone(),
        }
    }

    /// Wrap a computation task into a `"task"` message and inject it.
    pub fn submit_task(
        &self,
        task_type: &str,
        data: &str,
        parameters: HashMap<String, serde_json::Value>,
        energy: f64,
        ttl: Duration,
    ) -> Result<InfoMessage, Error> {
        let task = ComputationTask {
            task_type: task_type.to_string(),
            data: data.to_string(),
            parameters,
        };
        let content = serde_json::to_string(&task)?;
        Ok(self.diffusion.inject(TYPE_TASK, &content, energy, ttl))
    }
}
