//! Cluster state store
//!
//! [`NodeStore`] is the controller's only path to the Kubernetes API for Node
//! and Attachment objects. All writes are full replaces of an object the
//! caller has just re-fetched, so a stale `resourceVersion` surfaces as
//! [`Error::Conflict`] instead of silently overwriting a concurrent change.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Node, NodeCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

use crate::crd::{Attachment, AttachmentStatus};
use crate::error::{Error, Result};

/// Field manager used for every patch issued by the controller
pub const FIELD_MANAGER: &str = "node-detacher";

/// Read and write access to Nodes, Attachments and Events
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch a node, `None` when it no longer exists
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Replace a node, failing with [`Error::Conflict`] if it changed since it was read
    async fn replace_node(&self, node: &Node) -> Result<Node>;

    /// Set a single condition on the node status, keyed by condition type
    async fn patch_node_condition(&self, name: &str, condition: NodeCondition) -> Result<()>;

    /// Fetch the attachment record for a node, `None` when absent
    async fn get_attachment(&self, name: &str) -> Result<Option<Attachment>>;

    /// Create an attachment record, failing with [`Error::AlreadyExists`] if one exists
    async fn create_attachment(&self, attachment: &Attachment) -> Result<Attachment>;

    async fn replace_attachment(&self, attachment: &Attachment) -> Result<Attachment>;

    async fn patch_attachment_status(&self, name: &str, status: &AttachmentStatus) -> Result<()>;

    /// Record a Kubernetes Event against the node
    async fn publish_event(
        &self,
        node: &Node,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

/// [`NodeStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeNodeStore {
    client: Client,
    namespace: String,
}

impl KubeNodeStore {
    /// Attachments and Events are kept in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn attachments(&self) -> Api<Attachment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Params for the merge and strategic patches issued by the controller
fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Translate a write failure, mapping 409 responses to typed errors
fn write_error(kind: &str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: ae.message,
        },
        other => Error::KubeError(other),
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.nodes().get_opt(name).await?)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes().list(&ListParams::default()).await?.items)
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        self.nodes()
            .replace(&name, &PostParams::default(), node)
            .await
            .map_err(|e| write_error("Node", &name, e))
    }

    async fn patch_node_condition(&self, name: &str, condition: NodeCondition) -> Result<()> {
        // strategic merge keys conditions by type, leaving kubelet-owned entries alone
        let patch = serde_json::json!({
            "status": {
                "conditions": [condition]
            }
        });
        self.nodes()
            .patch_status(name, &patch_params(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| write_error("Node", name, e))?;
        Ok(())
    }

    async fn get_attachment(&self, name: &str) -> Result<Option<Attachment>> {
        Ok(self.attachments().get_opt(name).await?)
    }

    async fn create_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        let name = attachment.name_any();
        self.attachments()
            .create(&PostParams::default(), attachment)
            .await
            .map_err(|e| write_error("Attachment", &name, e))
    }

    async fn replace_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        let name = attachment.name_any();
        self.attachments()
            .replace(&name, &PostParams::default(), attachment)
            .await
            .map_err(|e| write_error("Attachment", &name, e))
    }

    async fn patch_attachment_status(&self, name: &str, status: &AttachmentStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.attachments()
            .patch_status(name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| write_error("Attachment", name, e))?;
        Ok(())
    }

    async fn publish_event(
        &self,
        node: &Node,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-", node.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: node.object_ref(&()),
            reporting_component: Some(FIELD_MANAGER.to_string()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(Error::KubeError)?;
        debug!(node = %node.name_any(), %reason, "Published event");
        Ok(())
    }
}
