//! In-memory store and registry used by controller tests

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
use kube::ResourceExt;

use crate::crd::{Attachment, AttachmentStatus};
use crate::error::{Error, Result};
use crate::registry::{LoadBalancerMembers, TargetGroupMembers, TargetMember, TargetRegistry};
use crate::store::NodeStore;

/// A mutating registry call as seen by the fake
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryCall {
    pub operation: &'static str,
    pub target: String,
    pub instance: String,
    pub port: Option<i32>,
}

#[derive(Default)]
struct RegistryState {
    target_groups: Vec<TargetGroupMembers>,
    load_balancers: Vec<LoadBalancerMembers>,
    scaling_groups: BTreeMap<String, Vec<String>>,
    calls: Vec<RegistryCall>,
    queries: Vec<&'static str>,
    failing_targets: HashSet<String>,
}

/// Registry that keeps membership in memory and records every call
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
    fail_queries: AtomicBool,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_group(
        self,
        arn: &str,
        default_port: Option<i32>,
        members: &[(&str, Option<i32>)],
    ) -> Self {
        self.state.lock().unwrap().target_groups.push(TargetGroupMembers {
            arn: arn.to_string(),
            default_port,
            members: members
                .iter()
                .map(|(id, port)| TargetMember {
                    id: id.to_string(),
                    port: *port,
                })
                .collect(),
        });
        self
    }

    pub fn with_load_balancer(self, name: &str, instances: &[&str]) -> Self {
        self.state.lock().unwrap().load_balancers.push(LoadBalancerMembers {
            name: name.to_string(),
            instances: instances.iter().map(|i| i.to_string()).collect(),
        });
        self
    }

    pub fn with_scaling_group(self, name: &str, instances: &[&str]) -> Self {
        self.state.lock().unwrap().scaling_groups.insert(
            name.to_string(),
            instances.iter().map(|i| i.to_string()).collect(),
        );
        self
    }

    /// Make every membership query fail
    pub fn fail_queries(self) -> Self {
        self.fail_queries.store(true, Ordering::SeqCst);
        self
    }

    /// Make mutating calls against the named target (ARN or name) fail
    pub fn fail_target(&self, target: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_targets
            .insert(target.to_string());
    }

    pub fn heal_target(&self, target: &str) {
        self.state.lock().unwrap().failing_targets.remove(target);
    }

    /// Mutating calls attempted so far, including failed ones
    pub fn calls(&self) -> Vec<RegistryCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, operation: &str) -> Vec<RegistryCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn query_count(&self, query: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queries
            .iter()
            .filter(|q| **q == query)
            .count()
    }

    fn query(&self, name: &'static str) -> Result<std::sync::MutexGuard<'_, RegistryState>> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(name);
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(Error::registry(name, "injected failure"));
        }
        Ok(state)
    }

    fn mutate<F>(
        &self,
        operation: &'static str,
        target: &str,
        instance: &str,
        port: Option<i32>,
        apply: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut RegistryState),
    {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RegistryCall {
            operation,
            target: target.to_string(),
            instance: instance.to_string(),
            port,
        });
        if state.failing_targets.contains(target) {
            return Err(Error::registry(operation, "injected failure"));
        }
        apply(&mut state);
        Ok(())
    }
}

#[async_trait]
impl TargetRegistry for FakeRegistry {
    async fn target_group_members(&self) -> Result<Vec<TargetGroupMembers>> {
        Ok(self.query("target_group_members")?.target_groups.clone())
    }

    async fn load_balancer_members(&self) -> Result<Vec<LoadBalancerMembers>> {
        Ok(self.query("load_balancer_members")?.load_balancers.clone())
    }

    async fn scaling_groups_of(&self, instance_id: &str) -> Result<Vec<String>> {
        let state = self.query("scaling_groups_of")?;
        Ok(state
            .scaling_groups
            .iter()
            .filter(|(_, members)| members.iter().any(|m| m == instance_id))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn deregister_from_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()> {
        self.mutate("deregister_target", arn, instance_id, port, |state| {
            if let Some(group) = state.target_groups.iter_mut().find(|g| g.arn == arn) {
                let default_port = group.default_port;
                let effective = port.or(default_port);
                group
                    .members
                    .retain(|m| !(m.id == instance_id && m.port.or(default_port) == effective));
            }
        })
    }

    async fn register_to_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()> {
        self.mutate("register_target", arn, instance_id, port, |state| {
            if let Some(group) = state.target_groups.iter_mut().find(|g| g.arn == arn) {
                let member = TargetMember {
                    id: instance_id.to_string(),
                    port: port.or(group.default_port),
                };
                if !group.members.contains(&member) {
                    group.members.push(member);
                }
            }
        })
    }

    async fn deregister_from_load_balancer(&self, name: &str, instance_id: &str) -> Result<()> {
        self.mutate("deregister_instance", name, instance_id, None, |state| {
            if let Some(lb) = state.load_balancers.iter_mut().find(|l| l.name == name) {
                lb.instances.retain(|i| i != instance_id);
            }
        })
    }

    async fn register_to_load_balancer(&self, name: &str, instance_id: &str) -> Result<()> {
        self.mutate("register_instance", name, instance_id, None, |state| {
            if let Some(lb) = state.load_balancers.iter_mut().find(|l| l.name == name) {
                if !lb.instances.iter().any(|i| i == instance_id) {
                    lb.instances.push(instance_id.to_string());
                }
            }
        })
    }

    async fn detach_from_scaling_group(&self, name: &str, instance_id: &str) -> Result<()> {
        self.mutate("detach_instance", name, instance_id, None, |state| {
            if let Some(members) = state.scaling_groups.get_mut(name) {
                members.retain(|i| i != instance_id);
            }
        })
    }

    async fn attach_to_scaling_group(&self, name: &str, instance_id: &str) -> Result<()> {
        self.mutate("attach_instance", name, instance_id, None, |state| {
            let members = state.scaling_groups.entry(name.to_string()).or_default();
            if !members.iter().any(|i| i == instance_id) {
                members.push(instance_id.to_string());
            }
        })
    }
}

/// A recorded Kubernetes Event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub node: String,
    pub event_type: String,
    pub reason: String,
}

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<String, Node>,
    attachments: BTreeMap<String, Attachment>,
    events: Vec<RecordedEvent>,
    attachment_writes: usize,
}

/// Store with API-server-like optimistic concurrency on `resourceVersion`
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
    fail_attachment_writes: AtomicBool,
}

fn bump_version(meta: &mut kube::api::ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

fn check_version(kind: &str, name: &str, stored: &Option<String>, incoming: &Option<String>) -> Result<()> {
    if incoming.is_some() && incoming != stored {
        return Err(Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
            message: "the object has been modified".to_string(),
        });
    }
    Ok(())
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(self, mut node: Node) -> Self {
        bump_version(&mut node.metadata);
        self.state
            .lock()
            .unwrap()
            .nodes
            .insert(node.name_any(), node);
        self
    }

    pub fn with_attachment(self, mut attachment: Attachment) -> Self {
        bump_version(&mut attachment.metadata);
        self.state
            .lock()
            .unwrap()
            .attachments
            .insert(attachment.name_any(), attachment);
        self
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    pub fn attachment(&self, name: &str) -> Option<Attachment> {
        self.state.lock().unwrap().attachments.get(name).cloned()
    }

    pub fn remove_node(&self, name: &str) {
        self.state.lock().unwrap().nodes.remove(name);
    }

    /// Apply a change to a stored node as another writer would
    pub fn update_node<F: FnOnce(&mut Node)>(&self, name: &str, f: F) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(name) {
            f(node);
            bump_version(&mut node.metadata);
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Number of successful attachment creates and replaces
    pub fn attachment_writes(&self) -> usize {
        self.state.lock().unwrap().attachment_writes
    }

    pub fn set_fail_attachment_writes(&self, fail: bool) {
        self.fail_attachment_writes.store(fail, Ordering::SeqCst);
    }

    fn check_attachment_writes(&self) -> Result<()> {
        if self.fail_attachment_writes.load(Ordering::SeqCst) {
            return Err(Error::ConfigError("injected attachment write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeStore for FakeStore {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.node(name))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().unwrap().nodes.values().cloned().collect())
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        let mut state = self.state.lock().unwrap();
        let stored = state.nodes.get_mut(&name).ok_or_else(|| Error::Conflict {
            kind: "Node".to_string(),
            name: name.clone(),
            message: "not found".to_string(),
        })?;
        check_version(
            "Node",
            &name,
            &stored.metadata.resource_version,
            &node.metadata.resource_version,
        )?;

        let status = stored.status.clone();
        *stored = node.clone();
        // replace does not touch the status subresource
        stored.status = status;
        bump_version(&mut stored.metadata);
        Ok(stored.clone())
    }

    async fn patch_node_condition(&self, name: &str, condition: NodeCondition) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(node) = state.nodes.get_mut(name) else {
            return Ok(());
        };
        let status = node.status.get_or_insert_with(NodeStatus::default);
        let conditions = status.conditions.get_or_insert_with(Vec::new);
        conditions.retain(|c| c.type_ != condition.type_);
        conditions.push(condition);
        bump_version(&mut node.metadata);
        Ok(())
    }

    async fn get_attachment(&self, name: &str) -> Result<Option<Attachment>> {
        Ok(self.attachment(name))
    }

    async fn create_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        self.check_attachment_writes()?;
        let name = attachment.name_any();
        let mut state = self.state.lock().unwrap();
        if state.attachments.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "Attachment".to_string(),
                name,
            });
        }
        let mut created = attachment.clone();
        created.metadata.resource_version = None;
        bump_version(&mut created.metadata);
        state.attachments.insert(name, created.clone());
        state.attachment_writes += 1;
        Ok(created)
    }

    async fn replace_attachment(&self, attachment: &Attachment) -> Result<Attachment> {
        self.check_attachment_writes()?;
        let name = attachment.name_any();
        let mut state = self.state.lock().unwrap();
        let stored = state
            .attachments
            .get_mut(&name)
            .ok_or_else(|| Error::AttachmentNotFound(name.clone()))?;
        check_version(
            "Attachment",
            &name,
            &stored.metadata.resource_version,
            &attachment.metadata.resource_version,
        )?;
        let status = stored.status.clone();
        *stored = attachment.clone();
        stored.status = status;
        bump_version(&mut stored.metadata);
        let replaced = stored.clone();
        state.attachment_writes += 1;
        Ok(replaced)
    }

    async fn patch_attachment_status(&self, name: &str, status: &AttachmentStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(attachment) = state.attachments.get_mut(name) {
            attachment.status = Some(status.clone());
            bump_version(&mut attachment.metadata);
        }
        Ok(())
    }

    async fn publish_event(
        &self,
        node: &Node,
        event_type: &str,
        reason: &str,
        _message: &str,
    ) -> Result<()> {
        self.state.lock().unwrap().events.push(RecordedEvent {
            node: node.name_any(),
            event_type: event_type.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

/// A schedulable worker node, labeled with an instance id when given
pub fn test_node(name: &str, instance_id: Option<&str>) -> Node {
    let labels = instance_id
        .map(|id| {
            BTreeMap::from([(
                "alpha.eksctl.io/instance-id".to_string(),
                id.to_string(),
            )])
        })
        .unwrap_or_default();
    Node {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::NodeSpec {
            unschedulable: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Controller state over the given fakes, acting as leader
pub fn test_state(
    store: std::sync::Arc<FakeStore>,
    registry: std::sync::Arc<FakeRegistry>,
    config: crate::config::ControllerConfig,
) -> super::ControllerState {
    super::ControllerState::new(
        store,
        registry,
        config,
        std::sync::Arc::new(AtomicBool::new(true)),
    )
}
