pub mod behavior;
pub mod compute;
pub mod diffusion;
pub mod error;
pub mod net;
pub mod node;
pub mod params;
pub mod spatial;
pub mod types;

pub use behavior::{AdaptiveModifier, BehaviorModifier, DefaultModifier, FaultKind};
pub use compute::{Computation, ComputationStats, Executor, WordCountExecutor};
pub use diffusion::{Diffusion, DiffusionStats};
pub use error::Error;
pub use node::{Node, NodeConfig, NodeStatus};
pub use params::RuntimeParameters;
pub use spatial::{BarrierPredicate, BarrierRule, CoordSystem, SpatialHint};
pub use types::*;
