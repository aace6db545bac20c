//! Node markings written by the controller
//!
//! Pure mutations of a Node object plus [`update_latest_node`], which applies
//! one of them to a freshly fetched copy and writes it back.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
use tracing::debug;

use crate::config::WellKnownKeys;
use crate::error::Result;
use crate::store::NodeStore;

const TAINT_EFFECT_NO_SCHEDULE: &str = "NoSchedule";

/// Re-fetch the node, apply `mutate` and replace it
///
/// Returns `None` when the node no longer exists. A concurrent modification
/// surfaces as [`crate::Error::Conflict`].
pub async fn update_latest_node<F>(
    store: &dyn NodeStore,
    name: &str,
    mutate: F,
) -> Result<Option<Node>>
where
    F: FnOnce(&mut Node) + Send,
{
    let Some(mut node) = store.get_node(name).await? else {
        debug!(node = %name, "Node disappeared before update");
        return Ok(None);
    };
    mutate(&mut node);
    Ok(Some(store.replace_node(&node).await?))
}

fn set_label(node: &mut Node, key: &str, value: &str) {
    node.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

fn remove_label(node: &mut Node, key: &str) {
    if let Some(labels) = node.metadata.labels.as_mut() {
        labels.remove(key);
    }
}

fn set_annotation(node: &mut Node, key: &str, value: &str) {
    node.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

fn remove_annotation(node: &mut Node, key: &str) {
    if let Some(annotations) = node.metadata.annotations.as_mut() {
        annotations.remove(key);
    }
}

/// Add a NoSchedule taint unless one with the same key is present
pub fn add_taint(node: &mut Node, key: &str, value: &str) {
    let taints = node
        .spec
        .get_or_insert_with(NodeSpec::default)
        .taints
        .get_or_insert_with(Vec::new);
    if taints.iter().any(|t| t.key == key) {
        return;
    }
    taints.push(Taint {
        key: key.to_string(),
        value: Some(value.to_string()),
        effect: TAINT_EFFECT_NO_SCHEDULE.to_string(),
        time_added: None,
    });
}

pub fn remove_taint(node: &mut Node, key: &str) {
    if let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) {
        taints.retain(|t| t.key != key);
    }
}

/// Record that a detach sequence has started
pub fn mark_detaching(node: &mut Node, keys: &WellKnownKeys, controller: &str, now: DateTime<Utc>) {
    set_annotation(node, &keys.detaching_annotation, "true");
    set_annotation(node, &keys.detachment_timestamp_annotation, &now.to_rfc3339());
    remove_annotation(node, &keys.attachment_timestamp_annotation);
    add_taint(node, &keys.detaching_taint, controller);
}

/// Record that a detach sequence was cancelled and the node re-attached
///
/// The cached label goes back to "false" so the next cache pass captures a
/// fresh target set.
pub fn mark_reattached(node: &mut Node, keys: &WellKnownKeys, now: DateTime<Utc>) {
    set_annotation(node, &keys.detaching_annotation, "false");
    set_annotation(node, &keys.attachment_timestamp_annotation, &now.to_rfc3339());
    remove_annotation(node, &keys.detachment_timestamp_annotation);
    remove_taint(node, &keys.detaching_taint);
    set_label(node, &keys.cached_label, "false");
}

pub fn mark_cached(node: &mut Node, keys: &WellKnownKeys) {
    set_label(node, &keys.cached_label, "true");
}

/// Toggle the label that keeps service and ingress controllers from registering the node
pub fn set_exclude_balancer(node: &mut Node, keys: &WellKnownKeys, exclude: bool) {
    if exclude {
        set_label(node, &keys.exclude_balancer_label, "true");
    } else {
        remove_label(node, &keys.exclude_balancer_label);
    }
}

/// Ask for detachment regardless of schedulability
pub fn mark_requires_detached(node: &mut Node, keys: &WellKnownKeys, now: DateTime<Utc>) {
    set_annotation(node, &keys.detached_annotation, &now.to_rfc3339());
}
