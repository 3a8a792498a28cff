//! Temporary grants as inline IAM role policies.
//!
//! A grant is an inline policy on the role behind the target's instance
//! profile, named after the grant id and allowing exactly one S3 action on
//! exactly one object. Roles are often shared across a fleet, so the
//! statement is further conditioned on the calling instance's ARN.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{AwsBackend, svc};
use crate::backend::{
    BackendError, BackendFuture, GrantAccess, GrantStore, LiveGrant, TemporaryGrant,
};
use crate::command::CommandRunner;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileAssociations {
    #[serde(default)]
    iam_instance_profile_associations: Vec<ProfileAssociation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileAssociation {
    instance_id: String,
    #[serde(default)]
    state: Option<String>,
    iam_instance_profile: ProfileRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProfileRef {
    arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceProfileResponse {
    instance_profile: InstanceProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceProfile {
    #[serde(default)]
    roles: Vec<Role>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Role {
    role_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RolePolicies {
    #[serde(default)]
    policy_names: Vec<String>,
}

/// Policy document allowing one action on one object, from one instance.
pub(super) fn policy_document(grant: &TemporaryGrant, instance_arn: &str) -> String {
    let action = match grant.access {
        GrantAccess::Read => "s3:GetObject",
        GrantAccess::Write => "s3:PutObject",
    };
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "GangwayRelay",
            "Effect": "Allow",
            "Action": action,
            "Resource": grant.scope.arn(),
            "Condition": {
                "StringEquals": { "ec2:SourceInstanceARN": instance_arn },
            },
        }],
    })
    .to_string()
}

fn profile_name(arn: &str) -> &str {
    arn.rsplit_once('/').map_or(arn, |(_, name)| name)
}

/// ARN of `instance_id`, in the partition and account named by the
/// instance profile ARN.
fn instance_arn(
    profile_arn: &str,
    region: &str,
    instance_id: &str,
) -> Result<String, BackendError> {
    let mut fields = profile_arn.split(':');
    match (fields.next(), fields.next(), fields.nth(2)) {
        (Some("arn"), Some(partition), Some(account))
            if !partition.is_empty() && !account.is_empty() =>
        {
            Ok(format!("arn:{partition}:ec2:{region}:{account}:instance/{instance_id}"))
        }
        _ => Err(BackendError::Parse {
            resource: String::from("instance profile"),
            message: format!("unexpected ARN {profile_arn}"),
        }),
    }
}

/// Role behind an instance profile, with the ARN of the instance using it.
struct InstanceIdentity {
    role: String,
    instance_arn: String,
}

impl<R: CommandRunner> AwsBackend<R> {
    async fn associations(
        &self,
        region: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<ProfileAssociation>, BackendError> {
        let mut args = svc(&["ec2", "describe-iam-instance-profile-associations"]);
        if let Some(id) = instance_id {
            args.push(String::from("--filters"));
            args.push(format!("Name=instance-id,Values={id}"));
        }
        let response: ProfileAssociations = self
            .call_json(region, "instance profile associations", args)
            .await?;
        Ok(response
            .iam_instance_profile_associations
            .into_iter()
            .filter(|association| {
                association
                    .state
                    .as_deref()
                    .is_none_or(|state| state == "associated")
            })
            .collect())
    }

    async fn profile_role(&self, region: &str, arn: &str) -> Result<Option<String>, BackendError> {
        let mut args = svc(&["iam", "get-instance-profile", "--instance-profile-name"]);
        args.push(profile_name(arn).to_owned());
        let response: InstanceProfileResponse =
            self.call_json(region, "instance profile", args).await?;
        Ok(response
            .instance_profile
            .roles
            .into_iter()
            .next()
            .map(|role| role.role_name))
    }

    /// Role carrying grants for `instance_id`, if it has one.
    async fn instance_identity(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceIdentity>, BackendError> {
        let Some(association) = self
            .associations(region, Some(instance_id))
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };
        let profile_arn = association.iam_instance_profile.arn;
        let Some(role) = self.profile_role(region, &profile_arn).await? else {
            return Ok(None);
        };
        Ok(Some(InstanceIdentity {
            role,
            instance_arn: instance_arn(&profile_arn, region, instance_id)?,
        }))
    }

    async fn role_policies(&self, region: &str, role: &str) -> Result<Vec<String>, BackendError> {
        let mut args = svc(&["iam", "list-role-policies", "--role-name"]);
        args.push(role.to_owned());
        let response: RolePolicies = self.call_json(region, "role policies", args).await?;
        Ok(response.policy_names)
    }
}

impl<R: CommandRunner> GrantStore for AwsBackend<R> {
    fn create<'a>(&'a self, grant: &'a TemporaryGrant) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let identity = self
                .instance_identity(&grant.region, &grant.target_id)
                .await?
                .ok_or_else(|| BackendError::Config {
                    message: format!(
                        "instance {} has no instance profile role; relayed transfers need one",
                        grant.target_id
                    ),
                })?;
            let mut args = svc(&["iam", "put-role-policy", "--role-name"]);
            args.extend([
                identity.role.clone(),
                String::from("--policy-name"),
                grant.grant_id.clone(),
                String::from("--policy-document"),
                policy_document(grant, &identity.instance_arn),
            ]);
            self.call(&grant.region, "role policy", args).await?;
            debug!(grant = %grant.grant_id, role = %identity.role, "attached relay grant");
            Ok(())
        })
    }

    fn revoke<'a>(
        &'a self,
        region: &'a str,
        target_id: &'a str,
        grant_id: &'a str,
    ) -> BackendFuture<'a, (), BackendError> {
        Box::pin(async move {
            let Some(InstanceIdentity { role, .. }) =
                self.instance_identity(region, target_id).await?
            else {
                warn!(
                    grant = grant_id,
                    instance = target_id,
                    "instance has no profile role; nothing to revoke"
                );
                return Ok(());
            };
            let mut args = svc(&["iam", "delete-role-policy", "--role-name"]);
            args.extend([role, String::from("--policy-name"), grant_id.to_owned()]);
            match self.call(region, "role policy", args).await {
                Ok(_) | Err(BackendError::NotFound { .. }) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }

    fn list_live<'a>(
        &'a self,
        region: &'a str,
        prefix: &'a str,
    ) -> BackendFuture<'a, Vec<LiveGrant>, BackendError> {
        Box::pin(async move {
            let mut seen_roles = BTreeSet::new();
            let mut live = Vec::new();
            for association in self.associations(region, None).await? {
                let Some(role) = self
                    .profile_role(region, &association.iam_instance_profile.arn)
                    .await?
                else {
                    continue;
                };
                if !seen_roles.insert(role.clone()) {
                    continue;
                }
                live.extend(
                    self.role_policies(region, &role)
                        .await?
                        .into_iter()
                        .filter(|name| name.starts_with(prefix))
                        .map(|grant_id| LiveGrant {
                            grant_id,
                            target_id: association.instance_id.clone(),
                        }),
                );
            }
            Ok(live)
        })
    }
}
