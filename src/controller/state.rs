//! Node state classification
//!
//! Everything the reconciler decides about a node is derived here, once per
//! reconciliation, from the raw Node object. No I/O happens in this module.

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use super::conditions::is_condition_true;
use crate::config::WellKnownKeys;
use crate::error::{Error, Result};

/// Why a node is left alone entirely
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    ControlPlane,
}

/// What the reconciler should do with a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Schedulable and not being detached. Nothing to do.
    Attached,
    /// Became unschedulable. Start a detach sequence.
    Detaching,
    /// Detach already started and the node is still unschedulable. Re-run detach.
    BeingDetached,
    /// Detach started but the node is schedulable again. Undo it.
    Reattaching,
    Skipped(SkipReason),
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Attached => "attached",
            NodeState::Detaching => "detaching",
            NodeState::BeingDetached => "being_detached",
            NodeState::Reattaching => "reattaching",
            NodeState::Skipped(SkipReason::ControlPlane) => "skipped_control_plane",
        }
    }
}

/// Whether the node carries a control-plane taint or label
pub fn is_control_plane(node: &Node, keys: &WellKnownKeys) -> bool {
    let tainted = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|t| keys.control_plane_keys.iter().any(|k| k == &t.key))
        })
        .unwrap_or(false);

    tainted
        || keys
            .control_plane_keys
            .iter()
            .any(|k| node.labels().contains_key(k))
}

/// Whether the node should be treated as unable to serve traffic
///
/// A cordon, the cluster-autoscaler deletion taint, any taint outside the
/// ignored prefixes, or the requires-detached annotation all count.
pub fn is_unschedulable(node: &Node, keys: &WellKnownKeys) -> bool {
    let spec = node.spec.as_ref();

    if spec.and_then(|s| s.unschedulable).unwrap_or(false) {
        return true;
    }

    let taints = spec.and_then(|s| s.taints.as_deref()).unwrap_or(&[]);
    for taint in taints {
        if taint.key == keys.to_be_deleted_taint {
            return true;
        }
        let ignored = keys
            .ignored_taint_prefixes
            .iter()
            .any(|prefix| taint.key.starts_with(prefix.as_str()));
        if !ignored {
            return true;
        }
    }

    node.annotations().contains_key(&keys.detached_annotation)
}

/// Whether a detach sequence has been recorded on the node
pub fn is_being_detached(node: &Node, keys: &WellKnownKeys) -> bool {
    is_condition_true(node, &keys.being_detached_condition)
        || node
            .annotations()
            .get(&keys.detaching_annotation)
            .map(|v| v == "true")
            .unwrap_or(false)
}

/// Classify a node. Checks are evaluated in a fixed order since flags, taints
/// and annotations routinely coexist.
pub fn classify(node: &Node, keys: &WellKnownKeys) -> NodeState {
    if is_control_plane(node, keys) {
        return NodeState::Skipped(SkipReason::ControlPlane);
    }

    let unschedulable = is_unschedulable(node, keys);
    match (is_being_detached(node, keys), unschedulable) {
        (true, false) => NodeState::Reattaching,
        (true, true) => NodeState::BeingDetached,
        (false, false) => NodeState::Attached,
        (false, true) => NodeState::Detaching,
    }
}

/// Read the cloud instance id from the node's labels
pub fn extract_instance_key(node: &Node, keys: &WellKnownKeys) -> Result<String> {
    node.labels()
        .get(&keys.instance_id_label)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| Error::MissingInstanceKey {
            node: node.name_any(),
            label: keys.instance_id_label.clone(),
        })
}

/// Whether the node's attachment record is known to exist
pub fn is_cached(node: &Node, keys: &WellKnownKeys) -> bool {
    node.labels()
        .get(&keys.cached_label)
        .map(|v| v == "true")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus, Taint};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn keys() -> WellKnownKeys {
        WellKnownKeys::default()
    }

    fn taint(key: &str) -> Taint {
        Taint {
            key: key.to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        }
    }

    fn node(unschedulable: bool, taints: Vec<Taint>, annotations: &[(&str, &str)]) -> Node {
        let annotations: BTreeMap<String, String> = annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Node {
            metadata: ObjectMeta {
                name: Some("ip-10-0-0-1".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                taints: Some(taints),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_schedulable_node_is_attached() {
        assert_eq!(classify(&node(false, vec![], &[]), &keys()), NodeState::Attached);
    }

    #[test]
    fn test_cordoned_node_is_detaching() {
        assert_eq!(classify(&node(true, vec![], &[]), &keys()), NodeState::Detaching);
    }

    #[test]
    fn test_autoscaler_taint_wins_over_schedulable_flag() {
        let n = node(false, vec![taint("ToBeDeletedByClusterAutoscaler")], &[]);
        assert!(is_unschedulable(&n, &keys()));
        assert_eq!(classify(&n, &keys()), NodeState::Detaching);
    }

    #[test]
    fn test_custom_taint_makes_node_unschedulable() {
        let n = node(false, vec![taint("example.com/maintenance")], &[]);
        assert!(is_unschedulable(&n, &keys()));
    }

    #[test]
    fn test_ignored_taints_do_not_make_node_unschedulable() {
        let n = node(
            false,
            vec![
                taint("node.kubernetes.io/not-ready"),
                taint("node.cloudprovider.kubernetes.io/uninitialized"),
                taint("node-detacher.variant.run/detaching"),
            ],
            &[],
        );
        assert!(!is_unschedulable(&n, &keys()));
    }

    #[test]
    fn test_requires_detached_annotation() {
        let n = node(false, vec![], &[("node-detacher.variant.run/detached", "")]);
        assert_eq!(classify(&n, &keys()), NodeState::Detaching);
    }

    #[test]
    fn test_being_detached_and_schedulable_reattaches() {
        let n = node(false, vec![], &[("node-detacher.variant.run/detaching", "true")]);
        assert_eq!(classify(&n, &keys()), NodeState::Reattaching);
    }

    #[test]
    fn test_being_detached_and_unschedulable_stays() {
        // own repel taint alone is not enough, the cordon is what keeps it unschedulable
        let n = node(
            true,
            vec![taint("node-detacher.variant.run/detaching")],
            &[("node-detacher.variant.run/detaching", "true")],
        );
        assert_eq!(classify(&n, &keys()), NodeState::BeingDetached);
    }

    #[test]
    fn test_detaching_annotation_false_is_not_being_detached() {
        let n = node(false, vec![], &[("node-detacher.variant.run/detaching", "false")]);
        assert_eq!(classify(&n, &keys()), NodeState::Attached);
    }

    #[test]
    fn test_being_detached_from_condition() {
        let mut n = node(false, vec![], &[]);
        n.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "NodeBeingDetached".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_being_detached(&n, &keys()));
        assert_eq!(classify(&n, &keys()), NodeState::Reattaching);
    }

    #[test]
    fn test_control_plane_is_skipped_first() {
        let n = node(true, vec![taint("node-role.kubernetes.io/master")], &[]);
        assert_eq!(
            classify(&n, &keys()),
            NodeState::Skipped(SkipReason::ControlPlane)
        );

        let mut labeled = node(false, vec![], &[]);
        labeled.metadata.labels = Some(BTreeMap::from([(
            "node-role.kubernetes.io/control-plane".to_string(),
            String::new(),
        )]));
        assert!(is_control_plane(&labeled, &keys()));
    }

    #[test]
    fn test_extract_instance_key() {
        let mut n = node(false, vec![], &[]);
        let err = extract_instance_key(&n, &keys()).unwrap_err();
        assert!(matches!(err, Error::MissingInstanceKey { .. }));

        n.metadata.labels = Some(BTreeMap::from([(
            "alpha.eksctl.io/instance-id".to_string(),
            "i-123".to_string(),
        )]));
        assert_eq!(extract_instance_key(&n, &keys()).unwrap(), "i-123");

        let custom = keys().with_instance_id_label("example.com/instance");
        assert!(extract_instance_key(&n, &custom).is_err());
    }

    #[test]
    fn test_is_cached() {
        let mut n = node(false, vec![], &[]);
        assert!(!is_cached(&n, &keys()));
        n.metadata.labels = Some(BTreeMap::from([(
            "node-detacher.variant.run/cached".to_string(),
            "true".to_string(),
        )]));
        assert!(is_cached(&n, &keys()));
    }
}
