//! Daemonset pod trigger
//!
//! Some node shutdown flows terminate a dedicated daemonset pod before the
//! node goes away. When such a pod starts terminating, its node is annotated
//! as requiring detachment, which the node reconciler then treats like any
//! other unschedulable node.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use super::marking::{mark_requires_detached, update_latest_node};
use super::reconciler::ControllerState;
use crate::error::{Error, Result};

/// A daemonset whose terminating pods request node detachment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonSetRef {
    pub namespace: String,
    pub name: String,
}

impl DaemonSetRef {
    /// Parse `[NAMESPACE/]NAME`, defaulting the namespace
    pub fn parse(value: &str, default_namespace: &str) -> Result<Self> {
        let (namespace, name) = match value.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (default_namespace, value),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(Error::ConfigError(format!(
                "invalid daemonset reference `{value}`, expected [NAMESPACE/]NAME"
            )));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

/// Whether the pod is owned by one of the given daemonsets
pub fn is_owned_by_any(pod: &Pod, daemonsets: &[DaemonSetRef]) -> bool {
    let namespace = pod.namespace().unwrap_or_default();
    pod.owner_references().iter().any(|owner| {
        owner.kind == "DaemonSet"
            && daemonsets
                .iter()
                .any(|ds| ds.name == owner.name && ds.namespace == namespace)
    })
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Annotate the pod's node if the pod is a terminating daemonset pod we watch
///
/// The annotation is never removed here. A pod that terminates because of a
/// daemonset rollout rather than a node shutdown leaves its node detached until
/// the annotation is deleted by hand, e.g. with
/// `kubectl annotate node NODE node-detacher.variant.run/detached-`.
///
/// Returns whether the node was annotated.
pub async fn handle_pod(
    ctx: &ControllerState,
    pod: &Pod,
    daemonsets: &[DaemonSetRef],
) -> Result<bool> {
    if !is_owned_by_any(pod, daemonsets) || !is_terminating(pod) {
        return Ok(false);
    }
    let Some(node_name) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
        return Ok(false);
    };

    let keys = &ctx.config.keys;
    let Some(node) = ctx.store.get_node(&node_name).await? else {
        return Ok(false);
    };
    if node.annotations().contains_key(&keys.detached_annotation) {
        debug!(node = %node_name, pod = %pod.name_any(), "Node already marked for detachment");
        return Ok(false);
    }

    let updated = update_latest_node(ctx.store.as_ref(), &node_name, |n| {
        mark_requires_detached(n, keys, Utc::now())
    })
    .await?;

    if updated.is_some() {
        info!(
            node = %node_name,
            pod = %pod.name_any(),
            "Daemonset pod is terminating, marked node for detachment"
        );
    }
    Ok(updated.is_some())
}

/// Watch pods cluster-wide and annotate nodes of terminating daemonset pods
pub async fn run_pod_trigger(
    client: Client,
    ctx: Arc<ControllerState>,
    daemonsets: Vec<DaemonSetRef>,
) -> Result<()> {
    let pods: Api<Pod> = Api::all(client);
    info!(daemonsets = ?daemonsets, "Starting daemonset pod trigger");

    let stream = watcher(pods, watcher::Config::default())
        .default_backoff()
        .applied_objects();
    tokio::pin!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(pod) => {
                if !ctx.is_leader.load(Ordering::Relaxed) {
                    continue;
                }
                if let Err(e) = handle_pod(&ctx, &pod, &daemonsets).await {
                    warn!(pod = %pod.name_any(), "Failed to handle pod: {}", e);
                }
            }
            Err(e) => warn!("Pod watch error: {}", e),
        }
    }

    Ok(())
}
