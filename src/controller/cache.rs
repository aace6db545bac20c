//! Attachment cache
//!
//! Captures the targets a node's instance is registered with into its
//! Attachment record, then labels the node as cached. The record is written
//! first, so a crash in between only causes a harmless re-resolution.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::marking::{mark_cached, update_latest_node};
use super::reconciler::ControllerState;
use super::resolver::resolve;
use super::state::{extract_instance_key, is_cached, is_control_plane};
use crate::crd::{Attachment, AttachmentPhase, AttachmentSpec, AttachmentStatus};
use crate::error::{Error, Result};

/// Make sure the node's attachment record exists and the node is labeled cached
pub async fn ensure_cached(ctx: &ControllerState, node: &Node, instance_id: &str) -> Result<()> {
    let keys = &ctx.config.keys;
    let name = node.name_any();

    if is_cached(node, keys) {
        debug!(node = %name, "Attachments already cached");
        return Ok(());
    }

    let resolved = resolve(ctx.registry.as_ref(), ctx.config.target_kinds, instance_id).await?;
    let count = resolved.len();
    let spec = AttachmentSpec::from_targets(&name, resolved.into_target_refs());

    let mut attachment = Attachment::new(&name, spec.clone());
    attachment.metadata.namespace = Some(ctx.config.namespace.clone());

    let refreshed = match ctx.store.create_attachment(&attachment).await {
        Ok(_) => true,
        Err(Error::AlreadyExists { .. }) => refresh_existing(ctx, &name, spec).await?,
        Err(e) => return Err(e),
    };

    if refreshed {
        let status = AttachmentStatus::stamped(
            AttachmentPhase::Cached,
            "Cached",
            &format!("Captured {count} target(s) for instance {instance_id}"),
        );
        ctx.store.patch_attachment_status(&name, &status).await?;
    }

    update_latest_node(ctx.store.as_ref(), &name, |n| mark_cached(n, keys)).await?;

    info!(node = %name, instance = %instance_id, targets = count, "Cached attachments");
    Ok(())
}

/// Replace an existing record's targets unless some of them are already detached
///
/// Returns whether the record was rewritten.
async fn refresh_existing(ctx: &ControllerState, name: &str, spec: AttachmentSpec) -> Result<bool> {
    let Some(mut existing) = ctx.store.get_attachment(name).await? else {
        return Err(Error::AttachmentNotFound(name.to_string()));
    };

    if existing.spec.any_detached() {
        // forgetting a detached target would leave it deregistered forever
        info!(node = %name, "Keeping existing attachment record with detached targets");
        return Ok(false);
    }

    existing.spec = spec;
    ctx.store.replace_attachment(&existing).await?;
    Ok(true)
}

/// Cache attachments of every node that has an instance key
///
/// Errors are logged per node and never abort the pass.
pub async fn cache_all(ctx: &ControllerState) -> Result<()> {
    let keys = &ctx.config.keys;
    let nodes = ctx.store.list_nodes().await?;
    info!(count = nodes.len(), "Caching attachments of existing nodes");

    for node in nodes {
        let name = node.name_any();
        if is_control_plane(&node, keys) {
            continue;
        }
        let instance_id = match extract_instance_key(&node, keys) {
            Ok(id) => id,
            Err(e) => {
                debug!(node = %name, "Skipping node: {}", e);
                continue;
            }
        };
        if let Err(e) = ensure_cached(ctx, &node, &instance_id).await {
            warn!(node = %name, "Failed to cache attachments: {}", e);
        }
    }
    Ok(())
}
