//! Attachment Custom Resource Definition
//!
//! An Attachment durably records which external targets a node's instance was
//! registered with when the node was first observed, and which of them have
//! since been deregistered. The list of targets is captured once; afterwards
//! only the per-entry `detached` flag changes, so detach and re-attach can be
//! replayed without asking the cloud provider again.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "node-detacher.variant.run",
    version = "v1alpha1",
    kind = "Attachment",
    namespaced,
    status = "AttachmentStatus",
    shortname = "att",
    printcolumn = r#"{"name":"NodeName","type":"string","jsonPath":".spec.nodeName"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentSpec {
    pub node_name: String,

    /// Targets the node's instance was registered with, in processing order
    #[serde(default)]
    pub targets: Vec<AttachedTarget>,
}

/// An external target the instance can be registered with
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TargetRef {
    /// ELBv2 target group. Without a port the instance is registered at the
    /// group's default port.
    TargetGroup {
        arn: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<i32>,
    },
    /// Classic (ELBv1) load balancer
    LoadBalancer { name: String },
    /// Autoscaling group
    ScalingGroup { name: String },
}

impl TargetRef {
    /// Short kind name used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TargetRef::TargetGroup { .. } => "target_group",
            TargetRef::LoadBalancer { .. } => "load_balancer",
            TargetRef::ScalingGroup { .. } => "scaling_group",
        }
    }

    /// Order in which kinds are processed: target groups, load balancers, scaling groups
    fn rank(&self) -> u8 {
        match self {
            TargetRef::TargetGroup { .. } => 0,
            TargetRef::LoadBalancer { .. } => 1,
            TargetRef::ScalingGroup { .. } => 2,
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetRef::TargetGroup { arn, port: Some(port) } => {
                write!(f, "target group {arn} (port {port})")
            }
            TargetRef::TargetGroup { arn, port: None } => write!(f, "target group {arn}"),
            TargetRef::LoadBalancer { name } => write!(f, "load balancer {name}"),
            TargetRef::ScalingGroup { name } => write!(f, "scaling group {name}"),
        }
    }
}

/// One entry of an attachment record
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachedTarget {
    pub target: TargetRef,

    /// True once the instance has been confirmed deregistered from the target
    #[serde(default)]
    pub detached: bool,
}

impl AttachedTarget {
    pub fn attached(target: TargetRef) -> Self {
        Self {
            target,
            detached: false,
        }
    }
}

impl AttachmentSpec {
    /// Build a spec with every target marked attached, in processing order
    pub fn from_targets(node_name: &str, targets: impl IntoIterator<Item = TargetRef>) -> Self {
        let mut targets: Vec<TargetRef> = targets.into_iter().collect();
        // stable: keeps discovery order within a kind
        targets.sort_by_key(TargetRef::rank);

        let mut entries: Vec<AttachedTarget> = Vec::with_capacity(targets.len());
        for target in targets {
            if !entries.iter().any(|e| e.target == target) {
                entries.push(AttachedTarget::attached(target));
            }
        }

        Self {
            node_name: node_name.to_string(),
            targets: entries,
        }
    }

    /// Whether any entry has already been deregistered
    pub fn any_detached(&self) -> bool {
        self.targets.iter().any(|t| t.detached)
    }

    /// Whether every entry has been deregistered
    pub fn all_detached(&self) -> bool {
        self.targets.iter().all(|t| t.detached)
    }
}

/// Lifecycle phase of an attachment record
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AttachmentPhase {
    #[default]
    Cached,
    Detaching,
    Detached,
    Attached,
}

impl std::fmt::Display for AttachmentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttachmentPhase::Cached => "Cached",
            AttachmentPhase::Detaching => "Detaching",
            AttachmentPhase::Detached => "Detached",
            AttachmentPhase::Attached => "Attached",
        };
        write!(f, "{s}")
    }
}

/// Observed state of an attachment record
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentStatus {
    pub phase: AttachmentPhase,

    /// RFC 3339 time the target set was captured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detached_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attached_at: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AttachmentStatus {
    /// Status with the given phase, stamped with the current time in the matching field
    pub fn stamped(phase: AttachmentPhase, reason: &str, message: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        let mut status = Self {
            phase: phase.clone(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        };
        match phase {
            AttachmentPhase::Cached => status.cached_at = Some(now),
            AttachmentPhase::Detached => status.detached_at = Some(now),
            AttachmentPhase::Attached => status.attached_at = Some(now),
            AttachmentPhase::Detaching => {}
        }
        status
    }
}
