//! Ryx node binary.
//!
//! Boots one fabric node: UDP discovery and diffusion on `--port`, the
//! compiled-in executor registry, and the adaptive behavior modifier.
//! Runs until interrupted. Exit code 1 on startup failure (bad spatial
//! configuration or socket bind), 0 on clean shutdown.

use clap::Parser;
use ryx::node::{Node, NodeConfig};
use ryx::spatial::{parse_barriers, BarrierRule, CoordSystem, SpatialHint};
use ryx::Error;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "ryx", version, about = "Ryx: decentralized peer-to-peer compute fabric")]
struct Args {
    /// UDP listen port
    #[arg(short, long, default_value = "9001")]
    port: u16,

    /// Observation API port advertised to peers
    #[arg(long, default_value = "8001")]
    http_port: u16,

    /// Cluster tag; peers with a different tag are ignored
    #[arg(long, default_value = "default")]
    cluster_id: String,

    /// Node id (auto-generated when empty)
    #[arg(long, default_value = "")]
    node_id: String,

    /// Coordinate system for the spatial hint: gps, relative, logical, none
    #[arg(long, default_value = "none")]
    coord_system: String,

    /// Spatial coordinates (meaning depends on coord-system)
    #[arg(long)]
    x: Option<f64>,

    #[arg(long)]
    y: Option<f64>,

    #[arg(long)]
    z: Option<f64>,

    /// Administrative zone name
    #[arg(long)]
    zone: Option<String>,

    /// Barrier rules, comma-separated type:zoneA:zoneB:isolation
    #[arg(long)]
    barriers: Option<String>,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig, Error> {
        let coord_system: CoordSystem = self.coord_system.parse()?;
        let hint = SpatialHint {
            coord_system,
            x: self.x,
            y: self.y,
            z: self.z,
            zone: self.zone.clone(),
        };
        let spatial = if hint.is_empty() { None } else { Some(hint) };

        let barriers: Vec<BarrierRule> = match &self.barriers {
            Some(rules) => parse_barriers(rules)?,
            None => Vec::new(),
        };

        Ok(NodeConfig {
            port: self.port,
            http_port: self.http_port,
            cluster_id: self.cluster_id.clone(),
            node_id: (!self.node_id.is_empty()).then(|| self.node_id.clone()),
            spatial,
            barriers,
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ryx=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let config = match args.node_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let node = match Node::new(config).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to start node: {}", e);
            std::process::exit(1);
        }
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  Ryx v{} — compute fabric node", VERSION);
    info!("════════════════════════════════════════════════════════════");
    info!(
        "Node: {} | cluster: {} | udp: {} | http: {}",
        node.node_id(),
        args.cluster_id,
        node.listen_port(),
        args.http_port
    );

    node.start();
    info!(
        "Executors: {:?} | waiting for announcements...",
        node.status().computation.executors
    );

    // Status printer
    let discovery = node.discovery().clone();
    let diffusion = node.diffusion().clone();
    let compute = node.compute().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = compute.stats();
            info!(
                "Status: {} neighbors | {} messages | {} active / {} completed tasks",
                discovery.neighbor_count(),
                diffusion.total_messages(),
                stats.active_tasks,
                stats.completed_tasks
            );
        }
    });

    tokio::signal::ctrl_c().await.ok();
    node.shutdown();
}
