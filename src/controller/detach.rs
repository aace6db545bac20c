//! Detach orchestration
//!
//! Walks the node's attachment record in order and deregisters the instance
//! from every entry not yet marked detached. Flags are persisted once at the
//! end, or as a checkpoint before a failure is returned, so a confirmed
//! deregistration is never repeated.

use tracing::{debug, info, instrument, warn};

use super::marking::{set_exclude_balancer, update_latest_node};
use super::reconciler::ControllerState;
use crate::crd::{AttachmentPhase, AttachmentStatus, TargetRef};
use crate::error::{Error, Result};
use crate::registry;

/// Deregister the instance from every attached entry of the node's record
///
/// Returns whether any entry was flipped to detached.
#[instrument(skip_all, fields(node = %node_name, instance = %instance_id))]
pub async fn detach(ctx: &ControllerState, node_name: &str, instance_id: &str) -> Result<bool> {
    let Some(record) = ctx.store.get_attachment(node_name).await? else {
        return Err(Error::AttachmentNotFound(node_name.to_string()));
    };

    let pending: Vec<TargetRef> = record
        .spec
        .targets
        .iter()
        .filter(|e| !e.detached)
        .map(|e| e.target.clone())
        .collect();

    if pending.is_empty() {
        debug!("No attached targets left");
        return Ok(false);
    }

    let total = pending.len();
    let mut done = Vec::with_capacity(total);
    let mut failure = None;
    for target in pending {
        match detach_one(ctx, node_name, instance_id, &target).await {
            Ok(()) => {
                info!(target = %target, "Detached instance");
                done.push(target);
            }
            Err(e) => {
                warn!(target = %target, "Failed to detach instance: {}", e);
                failure = Some(e);
                break;
            }
        }
    }

    if !done.is_empty() {
        if let Err(e) = persist_flags(ctx, node_name, &done, true).await {
            match failure {
                Some(_) => warn!("Failed to checkpoint detach progress: {}", e),
                None => return Err(e),
            }
        }
    }

    if let Some(err) = failure {
        if !done.is_empty() {
            let status = AttachmentStatus::stamped(
                AttachmentPhase::Detaching,
                "PartiallyDetached",
                &format!("Detached {} of {} target(s): {}", done.len(), total, err),
            );
            if let Err(e) = ctx.store.patch_attachment_status(node_name, &status).await {
                warn!("Failed to update attachment status: {}", e);
            }
        }
        return Err(err);
    }

    let status = AttachmentStatus::stamped(
        AttachmentPhase::Detached,
        "Detached",
        &format!("Detached instance {instance_id} from {total} target(s)"),
    );
    ctx.store.patch_attachment_status(node_name, &status).await?;
    Ok(true)
}

async fn detach_one(
    ctx: &ControllerState,
    node_name: &str,
    instance_id: &str,
    target: &TargetRef,
) -> Result<()> {
    if let TargetRef::TargetGroup { .. } = target {
        // keep the ingress controller from registering the node again
        let keys = &ctx.config.keys;
        update_latest_node(ctx.store.as_ref(), node_name, |n| {
            set_exclude_balancer(n, keys, true)
        })
        .await?;
    }

    let result = registry::deregister(ctx.registry.as_ref(), target, instance_id).await;

    #[cfg(feature = "metrics")]
    super::metrics::inc_target_operation("deregister", target.kind(), result.is_ok());

    result
}

/// Set the `detached` flag of the given entries on the latest copy of the record
pub(super) async fn persist_flags(
    ctx: &ControllerState,
    node_name: &str,
    targets: &[TargetRef],
    detached: bool,
) -> Result<()> {
    let Some(mut record) = ctx.store.get_attachment(node_name).await? else {
        return Err(Error::AttachmentNotFound(node_name.to_string()));
    };

    for entry in record.spec.targets.iter_mut() {
        if targets.contains(&entry.target) {
            entry.detached = detached;
        }
    }

    ctx.store.replace_attachment(&record).await?;
    Ok(())
}
