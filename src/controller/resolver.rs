//! Attachment resolution
//!
//! Answers "which targets is this instance registered with right now" by
//! listing every target of the enabled kinds and filtering by membership.

use tracing::debug;

use crate::config::TargetKinds;
use crate::crd::TargetRef;
use crate::error::Result;
use crate::registry::TargetRegistry;

/// Targets an instance is currently registered with, grouped by kind
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedTargets {
    /// `(arn, port)` where `None` means the group's default port
    pub target_groups: Vec<(String, Option<i32>)>,
    pub load_balancers: Vec<String>,
    pub scaling_groups: Vec<String>,
}

impl ResolvedTargets {
    pub fn is_empty(&self) -> bool {
        self.target_groups.is_empty() && self.load_balancers.is_empty() && self.scaling_groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.target_groups.len() + self.load_balancers.len() + self.scaling_groups.len()
    }

    /// Convert into target references in processing order
    pub fn into_target_refs(self) -> Vec<TargetRef> {
        let groups = self
            .target_groups
            .into_iter()
            .map(|(arn, port)| TargetRef::TargetGroup { arn, port });
        let lbs = self
            .load_balancers
            .into_iter()
            .map(|name| TargetRef::LoadBalancer { name });
        let asgs = self
            .scaling_groups
            .into_iter()
            .map(|name| TargetRef::ScalingGroup { name });
        groups.chain(lbs).chain(asgs).collect()
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// Resolve the targets `instance_id` is registered with, querying only the enabled kinds
pub async fn resolve(
    registry: &dyn TargetRegistry,
    kinds: TargetKinds,
    instance_id: &str,
) -> Result<ResolvedTargets> {
    let mut resolved = ResolvedTargets::default();

    if kinds.target_groups {
        for group in registry.target_group_members().await? {
            for member in group.members.iter().filter(|m| m.id == instance_id) {
                let port = match member.port {
                    Some(p) if Some(p) != group.default_port => Some(p),
                    _ => None,
                };
                push_unique(&mut resolved.target_groups, (group.arn.clone(), port));
            }
        }
    }

    if kinds.load_balancers {
        for lb in registry.load_balancer_members().await? {
            if lb.instances.iter().any(|i| i == instance_id) {
                push_unique(&mut resolved.load_balancers, lb.name);
            }
        }
    }

    if kinds.scaling_groups {
        for name in registry.scaling_groups_of(instance_id).await? {
            push_unique(&mut resolved.scaling_groups, name);
        }
    }

    debug!(
        instance = %instance_id,
        target_groups = resolved.target_groups.len(),
        load_balancers = resolved.load_balancers.len(),
        scaling_groups = resolved.scaling_groups.len(),
        "Resolved attachments"
    );
    Ok(resolved)
}
