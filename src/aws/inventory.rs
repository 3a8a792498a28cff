//! EC2 inventory joined with agent registrations, plus power transitions.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::{AwsBackend, svc};
use crate::backend::{BackendError, BackendFuture, Inventory, PowerAction, PowerControl};
use crate::command::CommandRunner;
use crate::target::{AgentState, Platform, TagFilter, Target};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    tags: Vec<Ec2Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Tag {
    key: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceInformationList {
    #[serde(default)]
    instance_information_list: Vec<InstanceInformation>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceInformation {
    instance_id: String,
    #[serde(default)]
    ping_status: Option<String>,
    #[serde(default)]
    platform_type: Option<String>,
    #[serde(default)]
    computer_name: Option<String>,
}

fn agent_state(info: Option<&InstanceInformation>) -> AgentState {
    match info.and_then(|found| found.ping_status.as_deref()) {
        Some("Online") => AgentState::Online,
        Some("ConnectionLost") => AgentState::ConnectionLost,
        Some(_) => AgentState::Inactive,
        None => AgentState::Unregistered,
    }
}

fn platform(ec2_platform: Option<&str>, info: Option<&InstanceInformation>) -> Platform {
    let agent_platform = info.and_then(|found| found.platform_type.as_deref());
    let ec2_windows = ec2_platform.is_some_and(|name| name.eq_ignore_ascii_case("windows"));
    if agent_platform == Some("Windows") || ec2_windows {
        Platform::Windows
    } else {
        Platform::Linux
    }
}

fn ec2_target(
    region: &str,
    instance: Ec2Instance,
    agents: &BTreeMap<String, InstanceInformation>,
) -> Target {
    let info = agents.get(&instance.instance_id);
    let tags = instance
        .tags
        .into_iter()
        .map(|tag| (tag.key, tag.value))
        .collect::<BTreeMap<_, _>>();
    Target {
        name: tags.get("Name").cloned().unwrap_or_default(),
        region: region.to_owned(),
        platform: platform(instance.platform.as_deref(), info),
        agent: agent_state(info),
        tags,
        id: instance.instance_id,
    }
}

/// Hybrid (`mi-`) instances exist only as agent registrations.
fn managed_target(region: &str, info: InstanceInformation) -> Target {
    Target {
        name: info.computer_name.clone().unwrap_or_default(),
        region: region.to_owned(),
        platform: platform(None, Some(&info)),
        agent: agent_state(Some(&info)),
        tags: BTreeMap::new(),
        id: info.instance_id,
    }
}

fn filter_args(filter: Option<&TagFilter>) -> Vec<String> {
    let mut args = svc(&["--filters", "Name=instance-state-name,Values=running"]);
    for constraint in filter.map(TagFilter::constraints).unwrap_or_default() {
        if constraint.values.is_empty() {
            args.push(format!("Name=tag-key,Values={}", constraint.key));
        } else {
            args.push(format!(
                "Name=tag:{},Values={}",
                constraint.key,
                constraint.values.join(",")
            ));
        }
    }
    args
}

impl<R: CommandRunner> AwsBackend<R> {
    async fn describe_instances(
        &self,
        region: &str,
        extra: Vec<String>,
    ) -> Result<Vec<Ec2Instance>, BackendError> {
        let mut args = svc(&["ec2", "describe-instances"]);
        args.extend(extra);
        let response: DescribeInstances = self.call_json(region, "instances", args).await?;
        Ok(response
            .reservations
            .into_iter()
            .flat_map(|reservation| reservation.instances)
            .collect())
    }

    async fn agent_registrations(
        &self,
        region: &str,
        id: Option<&str>,
    ) -> Result<BTreeMap<String, InstanceInformation>, BackendError> {
        let mut args = svc(&["ssm", "describe-instance-information"]);
        if let Some(instance_id) = id {
            args.push(String::from("--filters"));
            args.push(format!("Key=InstanceIds,Values={instance_id}"));
        }
        let response: InstanceInformationList =
            self.call_json(region, "instance information", args).await?;
        Ok(response
            .instance_information_list
            .into_iter()
            .map(|info| (info.instance_id.clone(), info))
            .collect())
    }
}

impl<R: CommandRunner> Inventory for AwsBackend<R> {
    fn describe<'a>(
        &'a self,
        region: &'a str,
        id: &'a str,
    ) -> BackendFuture<'a, Option<Target>, BackendError> {
        Box::pin(async move {
            if id.starts_with("mi-") {
                let mut agents = self.agent_registrations(region, Some(id)).await?;
                return Ok(agents.remove(id).map(|info| managed_target(region, info)));
            }
            let instances = match self
                .describe_instances(region, vec![String::from("--instance-ids"), id.to_owned()])
                .await
            {
                Ok(instances) => instances,
                Err(BackendError::NotFound { .. }) => return Ok(None),
                Err(err) => return Err(err),
            };
            let Some(instance) = instances.into_iter().next() else {
                return Ok(None);
            };
            let agents = self.agent_registrations(region, Some(id)).await?;
            Ok(Some(ec2_target(region, instance, &agents)))
        })
    }

    fn list<'a>(
        &'a self,
        region: &'a str,
        filter: Option<&'a TagFilter>,
    ) -> BackendFuture<'a, Vec<Target>, BackendError> {
        Box::pin(async move {
            let instances = self.describe_instances(region, filter_args(filter)).await?;
            let mut agents = self.agent_registrations(region, None).await?;
            let mut targets = instances
                .into_iter()
                .map(|instance| ec2_target(region, instance, &agents))
                .collect::<Vec<_>>();
            if filter.is_none() {
                agents.retain(|id, _| id.starts_with("mi-"));
                targets.extend(
                    agents
                        .into_values()
                        .map(|info| managed_target(region, info)),
                );
            }
            targets.sort_by(|left, right| left.id.cmp(&right.id));
            Ok(targets)
        })
    }
}

impl<R: CommandRunner> PowerControl for AwsBackend<R> {
    fn set_power<'a>(
        &'a self,
        target: &'a Target,
        action: PowerAction,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let subcommand = match action {
                PowerAction::Start => "start-instances",
                PowerAction::Stop => "stop-instances",
                PowerAction::Reboot => "reboot-instances",
            };
            let mut args = svc(&["ec2", subcommand, "--instance-ids"]);
            args.push(target.id.clone());
            self.call(&target.region, "power transition", args)
                .await
                .map(|_state| ())
        })
    }
}
