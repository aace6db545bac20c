//! AWS implementation of [`TargetRegistry`]
//!
//! Target groups go through the ELBv2 API, classic load balancers through the
//! ELB API and scaling groups through the Auto Scaling API. Credentials and
//! region come from the standard AWS environment chain.

use async_trait::async_trait;
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_elasticloadbalancing::types::Instance;
use aws_sdk_elasticloadbalancing::Client as ElbClient;
use aws_sdk_elasticloadbalancingv2::types::{TargetDescription, TargetHealthDescription};
use aws_sdk_elasticloadbalancingv2::Client as ElbV2Client;
use tracing::{debug, info};

use super::{LoadBalancerMembers, TargetGroupMembers, TargetMember, TargetRegistry};
use crate::error::{Error, Result};

/// Registry backed by the AWS load balancing and autoscaling APIs
#[derive(Clone)]
pub struct AwsTargetRegistry {
    elbv2: ElbV2Client,
    elb: ElbClient,
    autoscaling: AutoScalingClient,
}

impl AwsTargetRegistry {
    /// Build clients from the shared environment configuration
    pub async fn from_env() -> Self {
        let shared_config = aws_config::load_from_env().await;
        info!(
            region = ?shared_config.region().map(|r| r.as_ref().to_string()),
            "Initialized AWS clients"
        );
        Self {
            elbv2: ElbV2Client::new(&shared_config),
            elb: ElbClient::new(&shared_config),
            autoscaling: AutoScalingClient::new(&shared_config),
        }
    }
}

fn sdk_error<E>(operation: &str, err: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::registry(
        operation,
        aws_sdk_elasticloadbalancingv2::error::DisplayErrorContext(err),
    )
}

fn target_description(instance_id: &str, port: Option<i32>) -> TargetDescription {
    TargetDescription::builder()
        .id(instance_id)
        .set_port(port)
        .build()
}

/// Registered targets of a group, skipping descriptions without a target id
fn target_members(descriptions: &[TargetHealthDescription]) -> Vec<TargetMember> {
    descriptions
        .iter()
        .filter_map(|d| d.target())
        .filter_map(|t| {
            Some(TargetMember {
                id: t.id()?.to_string(),
                port: t.port(),
            })
        })
        .collect()
}

#[async_trait]
impl TargetRegistry for AwsTargetRegistry {
    async fn target_group_members(&self) -> Result<Vec<TargetGroupMembers>> {
        let mut groups = Vec::new();
        let mut pages = self.elbv2.describe_target_groups().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_error("DescribeTargetGroups", e))?;
            for group in page.target_groups() {
                if let Some(arn) = group.target_group_arn() {
                    groups.push((arn.to_string(), group.port()));
                }
            }
        }

        let mut result = Vec::with_capacity(groups.len());
        for (arn, default_port) in groups {
            let health = self
                .elbv2
                .describe_target_health()
                .target_group_arn(&arn)
                .send()
                .await
                .map_err(|e| sdk_error("DescribeTargetHealth", e))?;

            let members = target_members(health.target_health_descriptions());

            debug!(target_group = %arn, members = members.len(), "Described target group");
            result.push(TargetGroupMembers {
                arn,
                default_port,
                members,
            });
        }
        Ok(result)
    }

    async fn load_balancer_members(&self) -> Result<Vec<LoadBalancerMembers>> {
        let mut result = Vec::new();
        let mut pages = self.elb.describe_load_balancers().into_paginator().send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_error("DescribeLoadBalancers", e))?;
            for lb in page.load_balancer_descriptions() {
                let Some(name) = lb.load_balancer_name() else {
                    continue;
                };
                let instances = lb
                    .instances()
                    .iter()
                    .filter_map(|i| i.instance_id())
                    .map(str::to_string)
                    .collect();
                result.push(LoadBalancerMembers {
                    name: name.to_string(),
                    instances,
                });
            }
        }
        Ok(result)
    }

    async fn scaling_groups_of(&self, instance_id: &str) -> Result<Vec<String>> {
        let output = self
            .autoscaling
            .describe_auto_scaling_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeAutoScalingInstances", e))?;

        Ok(output
            .auto_scaling_instances()
            .iter()
            .filter_map(|i| i.auto_scaling_group_name())
            .map(str::to_string)
            .collect())
    }

    async fn deregister_from_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()> {
        self.elbv2
            .deregister_targets()
            .target_group_arn(arn)
            .targets(target_description(instance_id, port))
            .send()
            .await
            .map_err(|e| sdk_error("DeregisterTargets", e))?;
        Ok(())
    }

    async fn register_to_target_group(
        &self,
        arn: &str,
        instance_id: &str,
        port: Option<i32>,
    ) -> Result<()> {
        self.elbv2
            .register_targets()
            .target_group_arn(arn)
            .targets(target_description(instance_id, port))
            .send()
            .await
            .map_err(|e| sdk_error("RegisterTargets", e))?;
        Ok(())
    }

    async fn deregister_from_load_balancer(&self, name: &str, instance_id: &str) -> Result<()> {
        self.elb
            .deregister_instances_from_load_balancer()
            .load_balancer_name(name)
            .instances(Instance::builder().instance_id(instance_id).build())
            .send()
            .await
            .map_err(|e| sdk_error("DeregisterInstancesFromLoadBalancer", e))?;
        Ok(())
    }

    async fn register_to_load_balancer(&self, name: &str, instance_id: &str) -> Result<()> {
        self.elb
            .register_instances_with_load_balancer()
            .load_balancer_name(name)
            .instances(Instance::builder().instance_id(instance_id).build())
            .send()
            .await
            .map_err(|e| sdk_error("RegisterInstancesWithLoadBalancer", e))?;
        Ok(())
    }

    async fn detach_from_scaling_group(&self, name: &str, instance_id: &str) -> Result<()> {
        self.autoscaling
            .detach_instances()
            .auto_scaling_group_name(name)
            .instance_ids(instance_id)
            .should_decrement_desired_capacity(false)
            .send()
            .await
            .map_err(|e| sdk_error("DetachInstances", e))?;
        Ok(())
    }

    async fn attach_to_scaling_group(&self, name: &str, instance_id: &str) -> Result<()> {
        self.autoscaling
            .attach_instances()
            .auto_scaling_group_name(name)
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| sdk_error("AttachInstances", e))?;
        Ok(())
    }
}
