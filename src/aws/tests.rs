//! Unit tests for the AWS CLI backends.

use std::time::Duration;

use camino::Utf8Path;
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::backend::{
    AgentChannel, CommandStatus, GrantAccess, GrantStore, Inventory, PortPair, PowerAction,
    PowerControl, RelayLocation, RelayStore, RemoteCommand, SessionEnd, TemporaryGrant,
};
use crate::operation::OperationId;
use crate::target::{AgentState, Platform, TagFilter};
use crate::test_support::{FAKE_REGION, RecordedInvocation, ScriptedRunner, target};

const INSTANCE: &str = "i-0123456789abcdef0";
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

struct Harness {
    runner: ScriptedRunner,
    backend: AwsBackend<ScriptedRunner>,
}

impl Harness {
    fn command_lines(&self) -> Vec<String> {
        self.runner
            .invocations()
            .iter()
            .map(RecordedInvocation::command_string)
            .collect()
    }
}

#[fixture]
fn harness() -> Harness {
    let runner = ScriptedRunner::new();
    let backend = AwsBackend::new(runner.clone(), DEFAULT_AWS_BIN)
        .with_relay_bucket(Some(String::from("relay-bucket")))
        .with_poll_interval(Duration::ZERO);
    Harness { runner, backend }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(254),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

fn invocation_json(status: &str, code: i32, stdout: &str) -> String {
    serde_json::json!({
        "Status": status,
        "StatusDetails": status,
        "ResponseCode": code,
        "StandardOutputContent": stdout,
        "StandardErrorContent": "",
    })
    .to_string()
}

const SENT: &str = r#"{"Command": {"CommandId": "cmd-1"}}"#;

#[rstest]
#[case("An error occurred (ExpiredToken) when calling the DescribeInstances operation", "credential")]
#[case("Unable to locate credentials. You can configure credentials by running \"aws configure\".", "credential")]
#[case("An error occurred (ThrottlingException): Rate exceeded", "transient")]
#[case("Could not connect to the endpoint URL: \"https://ssm.ca-central-1.amazonaws.com/\"", "transient")]
#[case("An error occurred (NoSuchEntity) when calling the DeleteRolePolicy operation", "not_found")]
#[case("An error occurred (AccessDenied) when calling the PutRolePolicy operation", "failure")]
fn classifies_cli_failures(#[case] stderr: &str, #[case] expected: &str) {
    let kind = match classify_failure("aws", "thing", &failed(stderr)) {
        BackendError::Credential { .. } => "credential",
        BackendError::Transient { .. } => "transient",
        BackendError::NotFound { .. } => "not_found",
        BackendError::CommandFailure { .. } => "failure",
        other => panic!("unexpected classification {other:?}"),
    };
    assert_eq!(kind, expected);
}

#[rstest]
#[tokio::test]
async fn every_call_pins_region_output_and_profile() {
    let runner = ScriptedRunner::new();
    runner.push_json(r#"{"Account": "123456789012"}"#);
    let backend = AwsBackend::new(runner.clone(), "aws").with_profile(Some(String::from("ops")));

    backend.verify(FAKE_REGION).await.expect("credentials accepted");

    let invocations = runner.invocations();
    assert_eq!(
        invocations.first().map(RecordedInvocation::command_string),
        Some(String::from(
            "aws sts get-caller-identity --region ca-central-1 --output json --profile ops"
        ))
    );
}

#[rstest]
#[tokio::test]
async fn rejected_credentials_surface_as_credential_errors(harness: Harness) {
    harness
        .runner
        .push_failure(255, "An error occurred (InvalidClientTokenId) when calling the GetCallerIdentity operation");

    let err = harness
        .backend
        .verify(FAKE_REGION)
        .await
        .expect_err("credentials rejected");

    assert!(matches!(err, BackendError::Credential { .. }), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn describe_joins_instances_with_agent_registrations(harness: Harness) {
    harness.runner.push_json(
        r#"{"Reservations": [{"Instances": [{
            "InstanceId": "i-0123456789abcdef0",
            "Platform": "windows",
            "Tags": [{"Key": "Name", "Value": "build-agent"}, {"Key": "env", "Value": "ci"}]
        }]}]}"#,
    );
    harness.runner.push_json(
        r#"{"InstanceInformationList": [{
            "InstanceId": "i-0123456789abcdef0",
            "PingStatus": "Online",
            "PlatformType": "Windows"
        }]}"#,
    );

    let found = harness
        .backend
        .describe(FAKE_REGION, INSTANCE)
        .await
        .expect("describe")
        .expect("instance exists");

    assert_eq!(found.name, "build-agent");
    assert_eq!(found.platform, Platform::Windows);
    assert_eq!(found.agent, AgentState::Online);
    assert_eq!(found.tags.get("env").map(String::as_str), Some("ci"));
}

#[rstest]
#[tokio::test]
async fn describe_reports_missing_instances_as_none(harness: Harness) {
    harness.runner.push_failure(
        254,
        "An error occurred (InvalidInstanceID.NotFound) when calling the DescribeInstances operation",
    );

    let found = harness
        .backend
        .describe(FAKE_REGION, INSTANCE)
        .await
        .expect("missing is not an error");

    assert!(found.is_none());
    assert_eq!(harness.runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn listing_maps_tag_filters_and_marks_unregistered_agents(harness: Harness) {
    harness.runner.push_json(
        r#"{"Reservations": [{"Instances": [
            {"InstanceId": "i-00000000000000002", "Tags": [{"Key": "env", "Value": "prod"}]},
            {"InstanceId": "i-00000000000000001", "Tags": [{"Key": "env", "Value": "stage"}]}
        ]}]}"#,
    );
    harness.runner.push_json(
        r#"{"InstanceInformationList": [
            {"InstanceId": "i-00000000000000001", "PingStatus": "ConnectionLost", "PlatformType": "Linux"},
            {"InstanceId": "mi-00000000000000009", "PingStatus": "Online", "PlatformType": "Linux"}
        ]}"#,
    );
    let filter = TagFilter::parse("env=prod,stage;team").expect("filter");

    let listed = harness
        .backend
        .list(FAKE_REGION, Some(&filter))
        .await
        .expect("list");

    let summary = listed
        .iter()
        .map(|found| (found.id.as_str(), found.agent))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            ("i-00000000000000001", AgentState::ConnectionLost),
            ("i-00000000000000002", AgentState::Unregistered),
        ]
    );
    let describe = harness.command_lines().into_iter().next().unwrap_or_default();
    assert!(describe.contains("Name=instance-state-name,Values=running"), "{describe}");
    assert!(describe.contains("Name=tag:env,Values=prod,stage"), "{describe}");
    assert!(describe.contains("Name=tag-key,Values=team"), "{describe}");
}

#[rstest]
#[case(PowerAction::Start, "ec2 start-instances")]
#[case(PowerAction::Stop, "ec2 stop-instances")]
#[case(PowerAction::Reboot, "ec2 reboot-instances")]
#[tokio::test]
async fn power_actions_map_to_ec2_subcommands(
    harness: Harness,
    #[case] action: PowerAction,
    #[case] expected: &str,
) {
    harness.runner.push_json("{}");

    harness
        .backend
        .set_power(&target(INSTANCE, "web"), action)
        .await
        .expect("power");

    let line = harness.command_lines().into_iter().next().unwrap_or_default();
    assert!(line.contains(expected), "{line}");
    assert!(line.contains(INSTANCE));
}

#[rstest]
#[tokio::test]
async fn commands_are_polled_until_terminal(harness: Harness) {
    harness.runner.push_json(SENT);
    harness.runner.push_failure(
        254,
        "An error occurred (InvocationDoesNotExist) when calling the GetCommandInvocation operation",
    );
    harness
        .runner
        .push_json(invocation_json("InProgress", -1, ""));
    harness
        .runner
        .push_json(invocation_json("Success", 0, "hello\n"));
    let command = RemoteCommand {
        script: String::from("echo hello"),
        working_dir: Some(String::from("/srv")),
        timeout: Duration::from_secs(30),
    };

    let invocation = harness
        .backend
        .run_command(&target(INSTANCE, "web"), &command, &CancellationToken::new())
        .await
        .expect("command");

    assert_eq!(invocation.status, CommandStatus::Success);
    assert_eq!(invocation.exit_code, Some(0));
    assert_eq!(invocation.stdout, "hello\n");
    let lines = harness.command_lines();
    assert_eq!(lines.len(), 4);
    let send = lines.first().cloned().unwrap_or_default();
    assert!(send.contains("--document-name AWS-RunShellScript"), "{send}");
    assert!(send.contains("--parameters file://"), "{send}");
}

#[rstest]
#[case("Failed", 2, CommandStatus::Failed, Some(2))]
#[case("TimedOut", -1, CommandStatus::TimedOut, None)]
#[case("Cancelled", -1, CommandStatus::Failed, None)]
#[tokio::test]
async fn terminal_statuses_map_to_command_outcomes(
    harness: Harness,
    #[case] status: &str,
    #[case] code: i32,
    #[case] expected: CommandStatus,
    #[case] exit_code: Option<i32>,
) {
    harness.runner.push_json(SENT);
    harness.runner.push_json(invocation_json(status, code, ""));
    let command = RemoteCommand {
        script: String::from("false"),
        working_dir: None,
        timeout: Duration::from_secs(5),
    };

    let invocation = harness
        .backend
        .run_command(&target(INSTANCE, "web"), &command, &CancellationToken::new())
        .await
        .expect("command");

    assert_eq!(invocation.status, expected);
    assert_eq!(invocation.exit_code, exit_code);
}

#[rstest]
#[tokio::test]
async fn cancelled_commands_are_cancelled_remotely() {
    let runner = ScriptedRunner::new();
    let backend =
        AwsBackend::new(runner.clone(), "aws").with_poll_interval(Duration::from_secs(600));
    runner.push_json(SENT);
    runner.push_json("{}");
    let cancel = CancellationToken::new();
    cancel.cancel();
    let command = RemoteCommand {
        script: String::from("sleep 1000"),
        working_dir: None,
        timeout: Duration::from_secs(2000),
    };

    let err = backend
        .run_command(&target(INSTANCE, "web"), &command, &cancel)
        .await
        .expect_err("cancelled");

    assert_eq!(err, BackendError::Cancelled);
    let cancel_call = runner
        .invocations()
        .get(1)
        .map(RecordedInvocation::command_string)
        .unwrap_or_default();
    assert!(cancel_call.contains("ssm cancel-command --command-id cmd-1"), "{cancel_call}");
}

#[rstest]
#[tokio::test]
async fn direct_writes_report_what_landed(harness: Harness) {
    harness.runner.push_json(SENT);
    harness
        .runner
        .push_json(invocation_json("Success", 0, &format!("0 {EMPTY_SHA256}\n")));

    let written = harness
        .backend
        .write_file(&target(INSTANCE, "web"), "/tmp/empty", b"")
        .await
        .expect("write");

    assert_eq!(written.size, 0);
    assert_eq!(written.digest.as_deref(), Some(EMPTY_SHA256));
}

#[rstest]
#[tokio::test]
async fn direct_reads_decode_base64(harness: Harness) {
    harness.runner.push_json(SENT);
    harness
        .runner
        .push_json(invocation_json("Success", 0, "aGVsbG8gd29ybGQ=\n"));

    let bytes = harness
        .backend
        .read_file(&target(INSTANCE, "web"), "/etc/motd")
        .await
        .expect("read");

    assert_eq!(bytes, b"hello world");
}

#[rstest]
#[tokio::test]
async fn missing_remote_files_are_not_found(harness: Harness) {
    harness.runner.push_json(SENT);
    harness.runner.push_json(invocation_json("Failed", 3, ""));

    let err = harness
        .backend
        .stat_file(&target(INSTANCE, "web"), "/nope")
        .await
        .expect_err("missing");

    assert!(matches!(err, BackendError::NotFound { .. }), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn sessions_map_exit_codes(harness: Harness) {
    harness.runner.push_output(Some(0), "", "");
    harness.runner.push_output(Some(255), "", "");
    let web = target(INSTANCE, "web");
    let cancel = CancellationToken::new();

    let first = harness.backend.open_session(&web, &cancel).await.expect("session");
    let second = harness.backend.open_session(&web, &cancel).await.expect("session");

    assert_eq!(first, SessionEnd::Closed);
    assert_eq!(second, SessionEnd::Terminated(Some(255)));
    let line = harness.command_lines().into_iter().next().unwrap_or_default();
    assert_eq!(line, "aws ssm start-session --target i-0123456789abcdef0 --region ca-central-1");
}

#[rstest]
#[tokio::test]
async fn port_forwards_use_the_forwarding_document(harness: Harness) {
    harness.runner.push_output(Some(0), "", "");

    harness
        .backend
        .forward_port(
            &target(INSTANCE, "db"),
            PortPair {
                local: 15432,
                remote: 5432,
            },
            &CancellationToken::new(),
        )
        .await
        .expect("forward");

    let line = harness.command_lines().into_iter().next().unwrap_or_default();
    assert!(line.contains("--document-name AWS-StartPortForwardingSession"), "{line}");
    assert!(line.contains(r#""portNumber":["5432"]"#), "{line}");
    assert!(line.contains(r#""localPortNumber":["15432"]"#), "{line}");
}

#[rstest]
#[tokio::test]
async fn grants_are_scoped_to_one_object_and_action(harness: Harness) {
    harness.runner.push_json(
        r#"{"IamInstanceProfileAssociations": [{
            "InstanceId": "i-0123456789abcdef0",
            "State": "associated",
            "IamInstanceProfile": {"Arn": "arn:aws:iam::123456789012:instance-profile/web-profile"}
        }]}"#,
    );
    harness
        .runner
        .push_json(r#"{"InstanceProfile": {"Roles": [{"RoleName": "web-role"}]}}"#);
    harness.runner.push_success();
    let grant = TemporaryGrant {
        grant_id: String::from("gangway-grant-abc"),
        target_id: INSTANCE.to_owned(),
        region: FAKE_REGION.to_owned(),
        scope: RelayLocation {
            bucket: String::from("relay-bucket"),
            key: String::from("gangway-relay/abc/data.bin"),
        },
        access: GrantAccess::Read,
        created_at: chrono::Utc::now(),
        operation_id: OperationId::new(),
    };

    harness.backend.create(&grant).await.expect("grant");

    let lines = harness.command_lines();
    assert!(lines.get(1).is_some_and(|line| line.contains("--instance-profile-name web-profile")));
    let put = lines.get(2).cloned().unwrap_or_default();
    assert!(put.contains("iam put-role-policy --role-name web-role --policy-name gangway-grant-abc"));
    assert!(put.contains(r#""Action":"s3:GetObject""#), "{put}");
    assert!(
        put.contains(r#""Resource":"arn:aws:s3:::relay-bucket/gangway-relay/abc/data.bin""#),
        "{put}"
    );
    assert!(
        put.contains(
            r#""Condition":{"StringEquals":{"ec2:SourceInstanceARN":"arn:aws:ec2:ca-central-1:123456789012:instance/i-0123456789abcdef0"}}"#
        ),
        "grant must be limited to the target instance: {put}"
    );
}

#[rstest]
#[tokio::test]
async fn grants_follow_the_profile_partition(harness: Harness) {
    harness.runner.push_json(
        r#"{"IamInstanceProfileAssociations": [{
            "InstanceId": "i-0123456789abcdef0",
            "IamInstanceProfile": {"Arn": "arn:aws-us-gov:iam::210987654321:instance-profile/gov"}
        }]}"#,
    );
    harness
        .runner
        .push_json(r#"{"InstanceProfile": {"Roles": [{"RoleName": "gov-role"}]}}"#);
    harness.runner.push_success();
    let grant = TemporaryGrant {
        grant_id: String::from("gangway-grant-gov"),
        target_id: INSTANCE.to_owned(),
        region: String::from("us-gov-west-1"),
        scope: RelayLocation {
            bucket: String::from("relay-bucket"),
            key: String::from("gangway-relay/gov/data.bin"),
        },
        access: GrantAccess::Write,
        created_at: chrono::Utc::now(),
        operation_id: OperationId::new(),
    };

    harness.backend.create(&grant).await.expect("grant");

    let put = harness.command_lines().get(2).cloned().unwrap_or_default();
    assert!(put.contains(r#""Action":"s3:PutObject""#), "{put}");
    assert!(
        put.contains("arn:aws-us-gov:ec2:us-gov-west-1:210987654321:instance/i-0123456789abcdef0"),
        "{put}"
    );
}

#[rstest]
#[tokio::test]
async fn revoking_an_absent_grant_succeeds(harness: Harness) {
    harness.runner.push_json(
        r#"{"IamInstanceProfileAssociations": [{
            "InstanceId": "i-0123456789abcdef0",
            "IamInstanceProfile": {"Arn": "arn:aws:iam::123456789012:instance-profile/web-profile"}
        }]}"#,
    );
    harness
        .runner
        .push_json(r#"{"InstanceProfile": {"Roles": [{"RoleName": "web-role"}]}}"#);
    harness.runner.push_failure(
        254,
        "An error occurred (NoSuchEntity) when calling the DeleteRolePolicy operation",
    );

    harness
        .backend
        .revoke(FAKE_REGION, INSTANCE, "gangway-grant-abc")
        .await
        .expect("idempotent revoke");
}

#[rstest]
#[tokio::test]
async fn live_grants_are_found_by_prefix_once_per_role(harness: Harness) {
    harness.runner.push_json(
        r#"{"IamInstanceProfileAssociations": [
            {"InstanceId": "i-00000000000000001", "State": "associated",
             "IamInstanceProfile": {"Arn": "arn:aws:iam::1:instance-profile/shared"}},
            {"InstanceId": "i-00000000000000002", "State": "associated",
             "IamInstanceProfile": {"Arn": "arn:aws:iam::1:instance-profile/shared"}}
        ]}"#,
    );
    harness
        .runner
        .push_json(r#"{"InstanceProfile": {"Roles": [{"RoleName": "shared-role"}]}}"#);
    harness
        .runner
        .push_json(r#"{"PolicyNames": ["gangway-grant-1", "baseline", "gangway-grant-2"]}"#);
    harness
        .runner
        .push_json(r#"{"InstanceProfile": {"Roles": [{"RoleName": "shared-role"}]}}"#);

    let live = harness
        .backend
        .list_live(FAKE_REGION, "gangway-grant-")
        .await
        .expect("scan");

    let ids = live.iter().map(|grant| grant.grant_id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["gangway-grant-1", "gangway-grant-2"]);
    assert!(live.iter().all(|grant| grant.target_id == "i-00000000000000001"));
}

#[rstest]
fn relay_locations_need_a_bucket() {
    let backend = AwsBackend::new(ScriptedRunner::new(), "aws");
    let err = backend.location("gangway-relay/x/y").expect_err("no bucket");
    assert!(matches!(err, BackendError::Config { .. }));
}

#[rstest]
#[tokio::test]
async fn relay_round_trip_uses_s3(harness: Harness) {
    harness.runner.push_success();
    harness.runner.push_failure(
        254,
        "An error occurred (NoSuchKey) when calling the DeleteObject operation",
    );
    let location = harness
        .backend
        .location("gangway-relay/abc/data.bin")
        .expect("bucket configured");

    harness
        .backend
        .put(FAKE_REGION, Utf8Path::new("/tmp/data.bin"), &location)
        .await
        .expect("put");
    harness
        .backend
        .delete(FAKE_REGION, &location)
        .await
        .expect("missing objects delete cleanly");

    let lines = harness.command_lines();
    assert!(lines.first().is_some_and(|line| {
        line.starts_with("aws s3 cp /tmp/data.bin s3://relay-bucket/gangway-relay/abc/data.bin")
    }));
    assert!(lines.get(1).is_some_and(|line| {
        line.contains("s3api delete-object --bucket relay-bucket --key gangway-relay/abc/data.bin")
    }));
}
