//! Controller module for Node reconciliation
//!
//! This module contains the main controller loop, the node state
//! classification and the attach/detach orchestration built on top of the
//! [`crate::store::NodeStore`] and [`crate::registry::TargetRegistry`] seams.

mod attach;
mod cache;
pub mod conditions;
mod detach;
#[cfg(test)]
pub(crate) mod fake;
pub mod marking;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pod_trigger;
mod reconciler;
pub mod resolver;
pub mod state;

pub use attach::attach;
pub use cache::{cache_all, ensure_cached};
pub use detach::detach;
pub use pod_trigger::{run_pod_trigger, DaemonSetRef};
pub use reconciler::{
    reconcile_node, run_controller, ControllerState, EVENT_NODE_BEING_DETACHED,
    EVENT_NODE_REATTACHED,
};
pub use resolver::{resolve, ResolvedTargets};
pub use state::{classify, extract_instance_key, NodeState, SkipReason};
