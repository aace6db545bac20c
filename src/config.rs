//! Controller configuration
//!
//! Everything the reconciler needs to know about label, annotation and taint
//! names lives in [`WellKnownKeys`], built once at startup and handed to every
//! component. [`ControllerConfig`] adds the behavioural switches derived from
//! command-line flags.

use std::time::Duration;

/// Prefix shared by all keys owned by this controller
pub const KEY_PREFIX: &str = "node-detacher.variant.run";

/// Names of labels, annotations, taints and conditions read or written on nodes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WellKnownKeys {
    /// Label carrying the cloud instance id of the node
    pub instance_id_label: String,
    /// Label set to "true" once the node's attachment record exists
    pub cached_label: String,
    /// Label honoured by ingress/service controllers to stop (re-)registering the node
    pub exclude_balancer_label: String,
    /// Annotation set to "true" while a detach sequence is in progress
    pub detaching_annotation: String,
    /// Annotation requesting detachment regardless of schedulability
    pub detached_annotation: String,
    pub detachment_timestamp_annotation: String,
    pub attachment_timestamp_annotation: String,
    /// Taint added to nodes being detached
    pub detaching_taint: String,
    /// Taint cluster-autoscaler adds to nodes it is about to delete
    pub to_be_deleted_taint: String,
    /// Taint and label keys marking control-plane nodes
    pub control_plane_keys: Vec<String>,
    /// Taint key prefixes that never make a node unschedulable on their own
    pub ignored_taint_prefixes: Vec<String>,
    /// Node condition type recording an in-progress detach
    pub being_detached_condition: String,
}

impl Default for WellKnownKeys {
    fn default() -> Self {
        let detaching_taint = format!("{KEY_PREFIX}/detaching");
        Self {
            instance_id_label: "alpha.eksctl.io/instance-id".to_string(),
            cached_label: format!("{KEY_PREFIX}/cached"),
            exclude_balancer_label: "alpha.service-controller.kubernetes.io/exclude-balancer"
                .to_string(),
            detaching_annotation: format!("{KEY_PREFIX}/detaching"),
            detached_annotation: format!("{KEY_PREFIX}/detached"),
            detachment_timestamp_annotation: format!("{KEY_PREFIX}/detachment-timestamp"),
            attachment_timestamp_annotation: format!("{KEY_PREFIX}/attachment-timestamp"),
            to_be_deleted_taint: "ToBeDeletedByClusterAutoscaler".to_string(),
            control_plane_keys: vec![
                "node-role.kubernetes.io/master".to_string(),
                "node-role.kubernetes.io/control-plane".to_string(),
            ],
            ignored_taint_prefixes: vec![
                detaching_taint.clone(),
                "node.kubernetes.io/".to_string(),
                "node.cloudprovider.kubernetes.io/".to_string(),
            ],
            detaching_taint,
            being_detached_condition: "NodeBeingDetached".to_string(),
        }
    }
}

impl WellKnownKeys {
    /// Override the label used to look up the instance id
    pub fn with_instance_id_label(mut self, label: impl Into<String>) -> Self {
        self.instance_id_label = label.into();
        self
    }
}

/// Which kinds of external targets the controller manages
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetKinds {
    pub target_groups: bool,
    pub load_balancers: bool,
    pub scaling_groups: bool,
}

impl TargetKinds {
    pub fn all() -> Self {
        Self {
            target_groups: true,
            load_balancers: true,
            scaling_groups: true,
        }
    }

    pub fn none(&self) -> bool {
        !self.target_groups && !self.load_balancers && !self.scaling_groups
    }
}

/// When the attachment resolver runs for a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Resolve as soon as the node is observed. Suits load balancers and
    /// target groups managed outside the cluster (Terraform, CloudFormation).
    Eager,
    /// Resolve only once the node becomes unschedulable. Required when an
    /// in-cluster controller keeps changing the node's registrations.
    Lazy,
}

/// Integrations toggled on the command line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Integrations {
    pub alb_ingress: bool,
    pub dynamic_clb: bool,
    pub dynamic_nlb: bool,
    pub static_clb: bool,
    pub static_tg: bool,
    pub asg: bool,
}

impl Integrations {
    /// Any integration whose registrations are driven by an in-cluster controller
    pub fn dynamic(&self) -> bool {
        self.alb_ingress || self.dynamic_clb || self.dynamic_nlb
    }

    pub fn discovery_mode(&self) -> DiscoveryMode {
        if self.dynamic() {
            DiscoveryMode::Lazy
        } else {
            DiscoveryMode::Eager
        }
    }

    pub fn target_kinds(&self) -> TargetKinds {
        TargetKinds {
            target_groups: self.static_tg || self.alb_ingress || self.dynamic_nlb,
            load_balancers: self.static_clb || self.dynamic_clb,
            scaling_groups: self.asg,
        }
    }
}

/// Runtime configuration shared by every reconciliation
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Name of this controller instance, used as the repel taint value and event source
    pub name: String,
    /// Namespace holding Attachment records
    pub namespace: String,
    pub keys: WellKnownKeys,
    /// Whether cloud attachments are managed at all
    pub manage_attachments: bool,
    pub target_kinds: TargetKinds,
    pub discovery: DiscoveryMode,
    /// Requeue interval after a successful reconciliation
    pub sync_period: Duration,
    /// Requeue interval after a retriable failure
    pub retry_delay: Duration,
    /// Daemonsets whose terminating pods request detachment, as `[NAMESPACE/]NAME`
    pub daemonsets: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "node-detacher".to_string(),
            namespace: "default".to_string(),
            keys: WellKnownKeys::default(),
            manage_attachments: true,
            target_kinds: TargetKinds::all(),
            discovery: DiscoveryMode::Eager,
            sync_period: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
            daemonsets: Vec::new(),
        }
    }
}
