//! Behavioural tests for fan-out command execution.

use std::sync::Arc;
use std::time::Duration;

use gangway::backend::CommandStatus;
use gangway::registry::MemoryRegistry;
use gangway::target::AgentState;
use gangway::test_support::{FakeCloud, FakeCommand, target};
use gangway::{
    Collaborators, CommandRequest, NonInteractivePicker, OpsError, Orchestrator, Policy, Selector,
    TagFilter, Target,
};
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

const A: &str = "i-0123456789abcdef0";
const B: &str = "i-0fedcba9876543210";
const C: &str = "i-0aaaabbbbccccdddd";

fn tagged(id: &str, name: &str, role: &str) -> Target {
    let mut found = target(id, name);
    found.tags.insert(String::from("Role"), role.to_owned());
    found
}

struct Fleet {
    cloud: Arc<FakeCloud>,
    ops: Orchestrator,
}

#[fixture]
fn fleet() -> Fleet {
    let mut offline = tagged(C, "c", "batch");
    offline.agent = AgentState::Inactive;
    let cloud = Arc::new(FakeCloud::with_targets(vec![
        tagged(A, "a", "worker"),
        tagged(B, "b", "worker"),
        offline,
    ]));
    let policy = Policy {
        max_command_timeout: Duration::from_secs(30),
        retry_backoff: Duration::from_millis(1),
        ..Policy::default()
    };
    let collaborators = Collaborators::from_cloud(
        &cloud,
        Arc::new(MemoryRegistry::new()),
        Arc::new(NonInteractivePicker),
    );
    Fleet {
        ops: Orchestrator::new(collaborators, &policy),
        cloud,
    }
}

fn role(value: &str) -> Selector {
    let filter = TagFilter::parse(&format!("Role={value}")).unwrap_or_else(|err| panic!("{err}"));
    Selector::tagged(filter, "cac1")
}

#[rstest]
#[tokio::test]
async fn one_timeout_among_successes_is_a_partial_failure(fleet: Fleet) {
    fleet.cloud.script_command(B, FakeCommand::Hang);
    let request = CommandRequest::new("systemctl restart app", Duration::from_millis(100));

    let failure = fleet
        .ops
        .run_commands(&role("worker"), &request, &CancellationToken::new())
        .await
        .expect_err("b never answers");

    let OpsError::PartialFailure { report } = failure.kind() else {
        panic!("expected a partial failure, got {failure}");
    };
    let [a, b] = report.results.as_slice() else {
        panic!("expected two results, got {}", report.results.len());
    };
    assert_eq!((a.target.id.as_str(), a.status), (A, CommandStatus::Success));
    assert_eq!(a.stdout, "systemctl restart app");
    assert_eq!((b.target.id.as_str(), b.status), (B, CommandStatus::TimedOut));
}

#[rstest]
#[tokio::test]
async fn a_single_timed_out_target_is_a_timeout(fleet: Fleet) {
    fleet.cloud.script_command(A, FakeCommand::Hang);
    let request = CommandRequest::new("sleep 600", Duration::from_millis(100));

    let failure = fleet
        .ops
        .run_commands(&Selector::instance(A, "cac1"), &request, &CancellationToken::new())
        .await
        .expect_err("a never answers");

    assert!(matches!(failure.kind(), OpsError::Timeout { .. }));
    assert_eq!(failure.target, A);
}

#[rstest]
#[tokio::test]
async fn transient_delivery_failures_are_retried(fleet: Fleet) {
    fleet
        .cloud
        .script_command(A, FakeCommand::FlakyDelivery { remaining: 2 });
    let request = CommandRequest::new("hostname", Duration::from_secs(5)).in_dir("/srv");

    let report = fleet
        .ops
        .run_commands(&role("worker"), &request, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("retries absorb throttling: {err}"));

    assert!(report.results.iter().all(|result| result.is_success()));
    let deliveries = fleet
        .cloud
        .calls()
        .iter()
        .filter(|call| call.as_str() == format!("agent.run_command:{A}"))
        .count();
    assert_eq!(deliveries, 3);
}

#[rstest]
#[tokio::test]
async fn unreachable_fleet_members_fail_without_delivery(fleet: Fleet) {
    let request = CommandRequest::new("uptime", Duration::from_secs(5));

    let report = fleet
        .ops
        .run_commands(&role("batch"), &request, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("a single target reports its result: {err}"));

    let [only] = report.results.as_slice() else {
        panic!("expected one result");
    };
    assert_eq!(only.status, CommandStatus::Failed);
    assert!(
        !fleet
            .cloud
            .calls()
            .iter()
            .any(|call| call.starts_with("agent.run_command"))
    );
}

#[rstest]
#[tokio::test]
async fn empty_fleets_run_nothing(fleet: Fleet) {
    let request = CommandRequest::new("uptime", Duration::from_secs(5));

    let report = fleet
        .ops
        .run_commands(&role("nobody"), &request, &CancellationToken::new())
        .await
        .unwrap_or_else(|err| panic!("an empty fleet is not an error: {err}"));

    assert!(report.results.is_empty());
}
