//! Main reconciler for Nodes
//!
//! Implements the controller pattern using kube-rs runtime. Every Node event
//! leads to one classification of the node followed by at most one
//! transition: detach, re-run detach, or re-attach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::attach::attach;
use super::cache::{cache_all, ensure_cached};
use super::conditions::{
    next_condition, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE, REASON_ATTACHMENT_STARTED,
    REASON_DETACHMENT_STARTED,
};
use super::detach::detach;
use super::marking::{mark_detaching, mark_reattached, update_latest_node};
use super::state::{classify, extract_instance_key, NodeState};
use crate::config::{ControllerConfig, DiscoveryMode};
use crate::crd::Attachment;
use crate::error::{Error, Result};
use crate::registry::TargetRegistry;
use crate::store::NodeStore;

/// Event reasons published against nodes
pub const EVENT_NODE_BEING_DETACHED: &str = "NodeBeingDetached";
pub const EVENT_NODE_REATTACHED: &str = "NodeReattached";

/// Shared state for the controller
pub struct ControllerState {
    pub store: Arc<dyn NodeStore>,
    pub registry: Arc<dyn TargetRegistry>,
    pub config: Arc<ControllerConfig>,
    /// Only the leader writes; followers requeue without side effects
    pub is_leader: Arc<AtomicBool>,
}

impl ControllerState {
    pub fn new(
        store: Arc<dyn NodeStore>,
        registry: Arc<dyn TargetRegistry>,
        config: ControllerConfig,
        is_leader: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            registry,
            config: Arc::new(config),
            is_leader,
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(client: Client, state: Arc<ControllerState>) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let attachments: Api<Attachment> = Api::namespaced(client.clone(), &state.config.namespace);

    info!("Starting Node controller");

    // Verify CRD exists
    match attachments.list(&ListParams::default().limit(1)).await {
        Ok(_) => info!("Attachment CRD is available"),
        Err(e) => {
            error!(
                "Attachment CRD not found. Install it with `crdgen | kubectl apply -f -`: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "Attachment CRD not installed".to_string(),
            ));
        }
    }

    if state.config.manage_attachments
        && state.config.discovery == DiscoveryMode::Eager
        && state.is_leader.load(Ordering::Relaxed)
    {
        if let Err(e) = cache_all(&state).await {
            warn!("Initial attachment caching failed: {}", e);
        }
    }

    Controller::new(nodes, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// This function is called whenever:
/// - A Node is created or updated
/// - The requeue timer expires
#[instrument(skip_all, fields(node = %node.name_any()))]
async fn reconcile(node: Arc<Node>, ctx: Arc<ControllerState>) -> Result<Action> {
    let started = Instant::now();
    let result = reconcile_node(&ctx, &node.name_any()).await;

    #[cfg(feature = "metrics")]
    super::metrics::observe_reconcile_duration(started.elapsed().as_secs_f64());
    #[cfg(not(feature = "metrics"))]
    let _ = started;

    result
}

/// Classify the named node and run the matching transition
pub async fn reconcile_node(ctx: &ControllerState, name: &str) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!(node = %name, "Not the leader, skipping");
        return Ok(Action::requeue(ctx.config.sync_period));
    }

    let Some(node) = ctx.store.get_node(name).await? else {
        debug!(node = %name, "Node no longer exists");
        return Ok(Action::await_change());
    };

    let keys = &ctx.config.keys;
    let state = classify(&node, keys);
    if let NodeState::Skipped(reason) = state {
        debug!(node = %name, ?reason, "Skipping node");
        return Ok(Action::await_change());
    }

    let instance_id = if ctx.config.manage_attachments {
        match extract_instance_key(&node, keys) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(node = %name, "{}, attachments are not managed", e);
                None
            }
        }
    } else {
        None
    };

    if let (Some(id), DiscoveryMode::Eager) = (instance_id.as_deref(), ctx.config.discovery) {
        ensure_cached(ctx, &node, id).await?;
    }

    match state {
        NodeState::Attached => {
            if let Some(id) = instance_id.as_deref() {
                resume_interrupted_detach(ctx, &node, id).await?;
            }
        }
        NodeState::Detaching => {
            info!(node = %name, "Node became unschedulable, detaching");
            start_detach(ctx, &node, instance_id.as_deref()).await?;
        }
        NodeState::BeingDetached => {
            if let Some(id) = instance_id.as_deref() {
                let progressed = detach_node(ctx, &node, id).await?;
                if !progressed {
                    debug!(node = %name, "Node is already detached");
                }
            }
        }
        NodeState::Reattaching => {
            info!(node = %name, "Node became schedulable again, re-attaching");
            start_reattach(ctx, &node, instance_id.as_deref()).await?;
        }
        NodeState::Skipped(_) => {}
    }

    #[cfg(feature = "metrics")]
    if matches!(state, NodeState::Detaching | NodeState::Reattaching) {
        super::metrics::inc_state_transition(state.as_str());
    }

    Ok(Action::requeue(ctx.config.sync_period))
}

/// Re-attach a schedulable node whose detach failed part way
///
/// A failed detach checkpoints the entries it completed but never marks the
/// node, so a node uncordoned in between classifies as attached while some of
/// its targets are still deregistered.
async fn resume_interrupted_detach(
    ctx: &ControllerState,
    node: &Node,
    instance_id: &str,
) -> Result<()> {
    let name = node.name_any();
    let interrupted = ctx
        .store
        .get_attachment(&name)
        .await?
        .is_some_and(|record| record.spec.any_detached());
    if !interrupted {
        debug!(node = %name, "Node is schedulable and attached");
        return Ok(());
    }

    info!(node = %name, "Detach was interrupted, re-attaching");
    start_reattach(ctx, node, Some(instance_id)).await
}

async fn detach_node(ctx: &ControllerState, node: &Node, instance_id: &str) -> Result<bool> {
    if ctx.config.discovery == DiscoveryMode::Lazy {
        ensure_cached(ctx, node, instance_id).await?;
    }
    detach(ctx, &node.name_any(), instance_id).await
}

async fn start_detach(ctx: &ControllerState, node: &Node, instance_id: Option<&str>) -> Result<()> {
    let name = node.name_any();
    let keys = &ctx.config.keys;

    if let Some(id) = instance_id {
        detach_node(ctx, node, id).await?;
    }

    let controller = ctx.config.name.as_str();
    let Some(updated) = update_latest_node(ctx.store.as_ref(), &name, |n| {
        mark_detaching(n, keys, controller, Utc::now())
    })
    .await?
    else {
        return Ok(());
    };

    let message = "Node is unschedulable and being detached from its load balancers";
    let condition = next_condition(
        &updated,
        &keys.being_detached_condition,
        CONDITION_STATUS_TRUE,
        REASON_DETACHMENT_STARTED,
        message,
    );
    ctx.store.patch_node_condition(&name, condition).await?;

    if let Err(e) = ctx
        .store
        .publish_event(&updated, "Normal", EVENT_NODE_BEING_DETACHED, message)
        .await
    {
        warn!(node = %name, "Failed to publish event: {}", e);
    }
    Ok(())
}

async fn start_reattach(
    ctx: &ControllerState,
    node: &Node,
    instance_id: Option<&str>,
) -> Result<()> {
    let name = node.name_any();
    let keys = &ctx.config.keys;

    if let Some(id) = instance_id {
        attach(ctx, &name, id).await?;
    }

    let Some(updated) = update_latest_node(ctx.store.as_ref(), &name, |n| {
        mark_reattached(n, keys, Utc::now())
    })
    .await?
    else {
        return Ok(());
    };

    let message = "Node is schedulable again and has been re-attached";
    let condition = next_condition(
        &updated,
        &keys.being_detached_condition,
        CONDITION_STATUS_FALSE,
        REASON_ATTACHMENT_STARTED,
        message,
    );
    ctx.store.patch_node_condition(&name, condition).await?;

    if let Err(e) = ctx
        .store
        .publish_event(&updated, "Normal", EVENT_NODE_REATTACHED, message)
        .await
    {
        warn!(node = %name, "Failed to publish event: {}", e);
    }
    Ok(())
}

/// Error policy for the controller
pub(crate) fn error_policy(node: Arc<Node>, error: &Error, ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {:?}", node.name_any(), error);

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(error.kind());

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        ctx.config.retry_delay
    } else {
        ctx.config.sync_period
    };

    Action::requeue(retry_duration)
}
