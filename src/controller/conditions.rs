//! Node condition helpers following Kubernetes API conventions

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Reason recorded when a detach sequence starts
pub const REASON_DETACHMENT_STARTED: &str = "DetachmentStarted";
/// Reason recorded when a detach sequence is cancelled and the node re-attached
pub const REASON_ATTACHMENT_STARTED: &str = "AttachmentStarted";

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [NodeCondition], type_: &str) -> Option<&'a NodeCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

fn node_conditions(node: &Node) -> &[NodeCondition] {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or(&[])
}

/// Check if a condition on the node is true
pub fn is_condition_true(node: &Node, type_: &str) -> bool {
    find_condition(node_conditions(node), type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Build the next value of a node condition
///
/// The transition time is carried over from the node's current condition of
/// the same type unless the status changes.
pub fn next_condition(
    node: &Node,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> NodeCondition {
    let now = Time(Utc::now());
    let last_transition_time = match find_condition(node_conditions(node), type_) {
        Some(existing) if existing.status == status => existing
            .last_transition_time
            .clone()
            .or_else(|| Some(now.clone())),
        _ => Some(now.clone()),
    };

    NodeCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(now),
        last_transition_time,
    }
}
