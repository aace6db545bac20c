//! External target registry
//!
//! The controller only talks to the cloud through [`TargetRegistry`], which
//! covers the three kinds of targets an instance can be registered with:
//! ELBv2 target groups, classic load balancers and autoscaling groups.
//! [`aws::AwsTargetRegistry`] is the production implementation.

pub mod aws;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::crd::TargetRef;
use crate::error::Result;

pub use aws::AwsTargetRegistry;

/// A registered target group member
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetMember {
    pub id: String,
    pub port: Option<i32>,
}

/// A target group with its default port and current members
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetGroupMembers {
    pub arn: String,
    pub default_port: Option<i32>,
    pub members: Vec<TargetMember>,
}

/// A classic load balancer with its registered instance ids
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerMembers {
    pub name: String,
    pub instances: Vec<String>,
}

/// Membership queries and registration calls against the cloud provider
///
/// Every mutating call must be safe to repeat: deregistering an instance that
/// is not registered, or registering one that already is, succeeds.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// All target groups visible to the controller, with their members
    async fn target_group_members(&self) -> Result<Vec<TargetGroupMembers>>;

    /// All classic load balancers visible to the controller, with their instances
    async fn load_balancer_members(&self) -> Result<Vec<LoadBalancerMembers>>;

    /// Names of the autoscaling groups the instance belongs to
    async fn scaling_groups_of(&self, instance_id: &str) -> Result<Vec<String>>;

    async fn deregister_from_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()>;

    async fn register_to_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()>;

    async fn deregister_from_load_balancer(&self, name: &str, instance_id: &str) -> Result<()>;

    async fn register_to_load_balancer(&self, name: &str, instance_id: &str) -> Result<()>;

    /// Detach the instance without decrementing the group's desired capacity
    async fn detach_from_scaling_group(&self, name: &str, instance_id: &str) -> Result<()>;

    async fn attach_to_scaling_group(&self, name: &str, instance_id: &str) -> Result<()>;
}

/// Deregister the instance from a single target of any kind
pub async fn deregister(
    registry: &dyn TargetRegistry,
    target: &TargetRef,
    instance_id: &str,
) -> Result<()> {
    match target {
        TargetRef::TargetGroup { arn, port } => {
            registry
                .deregister_from_target_group(arn, instance_id, *port)
                .await
        }
        TargetRef::LoadBalancer { name } => {
            registry.deregister_from_load_balancer(name, instance_id).await
        }
        TargetRef::ScalingGroup { name } => {
            registry.detach_from_scaling_group(name, instance_id).await
        }
    }
}

/// Register the instance to a single target of any kind
pub async fn register(
    registry: &dyn TargetRegistry,
    target: &TargetRef,
    instance_id: &str,
) -> Result<()> {
    match target {
        TargetRef::TargetGroup { arn, port } => {
            registry
                .register_to_target_group(arn, instance_id, *port)
                .await
        }
        TargetRef::LoadBalancer { name } => {
            registry.register_to_load_balancer(name, instance_id).await
        }
        TargetRef::ScalingGroup { name } => registry.attach_to_scaling_group(name, instance_id).await,
    }
}

/// Registry wrapper that answers queries but only logs mutating calls
pub struct DryRunRegistry {
    inner: Arc<dyn TargetRegistry>,
}

impl DryRunRegistry {
    pub fn new(inner: Arc<dyn TargetRegistry>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl TargetRegistry for DryRunRegistry {
    async fn target_group_members(&self) -> Result<Vec<TargetGroupMembers>> {
        self.inner.target_group_members().await
    }

    async fn load_balancer_members(&self) -> Result<Vec<LoadBalancerMembers>> {
        self.inner.load_balancer_members().await
    }

    async fn scaling_groups_of(&self, instance_id: &str) -> Result<Vec<String>> {
        self.inner.scaling_groups_of(instance_id).await
    }

    async fn deregister_from_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()> {
        info!(target_group = %arn, instance = %instance_id, ?port, "[dry-run] would deregister target");
        Ok(())
    }

    async fn register_to_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()> {
        info!(target_group = %arn, instance = %instance_id, ?port, "[dry-run] would register target");
        Ok(())
    }

    async fn deregister_from_load_balancer(&self, name: &str, instance_id: &str) -> Result<()> {
        info!(load_balancer = %name, instance = %instance_id, "[dry-run] would deregister instance");
        Ok(())
    }

    async fn register_to_load_balancer(&self, name: &str, instance_id: &str) -> Result<()> {
        info!(load_balancer = %name, instance = %instance_id, "[dry-run] would register instance");
        Ok(())
    }

    async fn detach_from_scaling_group(&self, name: &str, instance_id: &str) -> Result<()> {
        info!(scaling_group = %name, instance = %instance_id, "[dry-run] would detach instance");
        Ok(())
    }

    async fn attach_to_scaling_group(&self, name: &str, instance_id: &str) -> Result<()> {
        info!(scaling_group = %name, instance = %instance_id, "[dry-run] would attach instance");
        Ok(())
    }
}
