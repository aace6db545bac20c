//! Attach orchestration
//!
//! Mirror of detach: re-registers the instance with every entry of the
//! node's attachment record that is marked detached.

use tracing::{debug, info, instrument, warn};

use super::detach::persist_flags;
use super::marking::{set_exclude_balancer, update_latest_node};
use super::reconciler::ControllerState;
use crate::crd::{AttachmentPhase, AttachmentStatus, TargetRef};
use crate::error::Result;
use crate::registry;

/// Re-register the instance with every detached entry of the node's record
///
/// A node without a record was never detached by this controller, so there is
/// nothing to do. Returns whether any entry was flipped back to attached.
#[instrument(skip_all, fields(node = %node_name, instance = %instance_id))]
pub async fn attach(ctx: &ControllerState, node_name: &str, instance_id: &str) -> Result<bool> {
    let Some(record) = ctx.store.get_attachment(node_name).await? else {
        debug!("No attachment record, nothing to re-attach");
        return Ok(false);
    };

    let pending: Vec<TargetRef> = record
        .spec
        .targets
        .iter()
        .filter(|e| e.detached)
        .map(|e| e.target.clone())
        .collect();

    if pending.is_empty() {
        debug!("No detached targets left");
        return Ok(false);
    }

    let total = pending.len();
    let mut done = Vec::with_capacity(total);
    let mut failure = None;
    for target in pending {
        match attach_one(ctx, node_name, instance_id, &target).await {
            Ok(()) => {
                info!(target = %target, "Attached instance");
                done.push(target);
            }
            Err(e) => {
                warn!(target = %target, "Failed to attach instance: {}", e);
                failure = Some(e);
                break;
            }
        }
    }

    if !done.is_empty() {
        if let Err(e) = persist_flags(ctx, node_name, &done, false).await {
            match failure {
                Some(_) => warn!("Failed to checkpoint attach progress: {}", e),
                None => return Err(e),
            }
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }

    let status = AttachmentStatus::stamped(
        AttachmentPhase::Attached,
        "Attached",
        &format!("Attached instance {instance_id} to {total} target(s)"),
    );
    ctx.store.patch_attachment_status(node_name, &status).await?;
    Ok(true)
}

async fn attach_one(
    ctx: &ControllerState,
    node_name: &str,
    instance_id: &str,
    target: &TargetRef,
) -> Result<()> {
    if let TargetRef::TargetGroup { .. } = target {
        let keys = &ctx.config.keys;
        update_latest_node(ctx.store.as_ref(), node_name, |n| {
            set_exclude_balancer(n, keys, false)
        })
        .await?;
    }

    let result = registry::register(ctx.registry.as_ref(), target, instance_id).await;

    #[cfg(feature = "metrics")]
    super::metrics::inc_target_operation("register", target.kind(), result.is_ok());

    result
}
