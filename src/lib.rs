//! node-detacher: detach unschedulable Kubernetes nodes from their load balancers
//!
//! The controller watches Nodes and, once a node becomes unschedulable,
//! deregisters its cloud instance from every load balancer, target group and
//! auto-scaling group it belongs to. Registrations are cached per node in an
//! `Attachment` record so they can be restored when the node is uncordoned.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod registry;
pub mod store;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
