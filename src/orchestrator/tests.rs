//! Unit tests for the orchestrator facade.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::backend::CommandStatus;
use crate::registry::MemoryRegistry;
use crate::resolver::NonInteractivePicker;
use crate::test_support::{FAKE_REGION, FakeCloud, FakeCommand, target};
use crate::transfer::Strategy;

const WEB: &str = "i-0123456789abcdef0";
const DB: &str = "i-0fedcba9876543210";

struct Harness {
    cloud: Arc<FakeCloud>,
    registry: Arc<MemoryRegistry>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new(cloud: FakeCloud) -> Self {
        let cloud = Arc::new(cloud);
        let registry = Arc::new(MemoryRegistry::new());
        let policy = Policy {
            max_command_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(1),
            ..Policy::default()
        };
        let collaborators = Collaborators::from_cloud(
            &cloud,
            Arc::clone(&registry) as Arc<dyn Registry>,
            Arc::new(NonInteractivePicker),
        );
        Self {
            orchestrator: Orchestrator::new(collaborators, &policy),
            cloud,
            registry,
        }
    }
}

fn prod(id: &str, name: &str) -> Target {
    let mut tagged = target(id, name);
    tagged
        .tags
        .insert(String::from("Env"), String::from("prod"));
    tagged
}

#[fixture]
fn harness() -> Harness {
    Harness::new(FakeCloud::with_targets(vec![
        prod(WEB, "web"),
        prod(DB, "db"),
    ]))
}

fn prod_fleet() -> Selector {
    Selector::tagged(TagFilter::parse("Env=prod").expect("filter"), "cac1")
}

#[rstest]
#[case("cac1", "ca-central-1")]
#[case("ca-central-1", "ca-central-1")]
#[case("", "ca-central-1")]
#[case("  euw1 ", "eu-west-1")]
fn region_codes_resolve_through_the_facade(
    harness: Harness,
    #[case] code: &str,
    #[case] expected: &str,
) {
    assert_eq!(harness.orchestrator.resolve_region(code), expected);
}

#[rstest]
#[tokio::test]
async fn invalid_credentials_stop_the_operation_before_inventory(harness: Harness) {
    harness.cloud.set_faults(|faults| {
        faults.invalid_credentials = Some(String::from("ExpiredToken"));
    });
    let failure = harness
        .orchestrator
        .select(&Selector::instance("web", "cac1"))
        .await
        .expect_err("credentials are expired");

    assert_eq!(failure.target, "web");
    assert!(matches!(
        failure.kind(),
        OpsError::CredentialInvalid { region, .. } if region == FAKE_REGION
    ));
    assert_eq!(harness.cloud.calls(), vec![String::from("auth.verify")]);
}

#[rstest]
#[tokio::test]
async fn names_resolve_to_a_single_target(harness: Harness) {
    let selection = harness
        .orchestrator
        .select(&Selector::instance("db", ""))
        .await
        .expect("db resolves");
    assert_eq!(selection, Selection::One(prod(DB, "db")));
}

#[rstest]
#[tokio::test]
async fn out_of_range_timeouts_fail_before_any_call(harness: Harness) {
    let request = CommandRequest::new("uptime", Duration::from_secs(61));
    let failure = harness
        .orchestrator
        .run_commands(&prod_fleet(), &request, &CancellationToken::new())
        .await
        .expect_err("timeout above the bound");

    assert!(matches!(failure.kind(), OpsError::InvalidDuration { .. }));
    assert!(harness.cloud.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn a_hung_target_turns_the_fan_out_into_a_partial_failure(harness: Harness) {
    harness.cloud.script_command(DB, FakeCommand::Hang);
    let request = CommandRequest::new("uptime", Duration::from_millis(50));
    let failure = harness
        .orchestrator
        .run_commands(&prod_fleet(), &request, &CancellationToken::new())
        .await
        .expect_err("db never answers");

    assert_eq!(failure.target, "tag Env=prod");
    let OpsError::PartialFailure { report } = failure.kind() else {
        panic!("expected a partial failure, got {failure}");
    };
    assert_eq!(report.operation_id, failure.operation_id);
    let statuses = report
        .results
        .iter()
        .map(|result| (result.target.id.as_str(), result.status))
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![(WEB, CommandStatus::Success), (DB, CommandStatus::TimedOut)]
    );
}

#[rstest]
#[tokio::test]
async fn single_target_commands_report_non_zero_exits_as_results(harness: Harness) {
    harness.cloud.script_command(
        WEB,
        FakeCommand::Exit {
            code: 2,
            stdout: String::from("missing"),
        },
    );
    let report = harness
        .orchestrator
        .run_commands(
            &Selector::instance(WEB, "cac1"),
            &CommandRequest::new("ls /nope", Duration::from_secs(5)),
            &CancellationToken::new(),
        )
        .await
        .expect("a failed exit is still a result");

    let [only] = report.results.as_slice() else {
        panic!("expected one result");
    };
    assert_eq!(only.status, CommandStatus::Failed);
    assert_eq!(only.exit_code, Some(2));
}

#[rstest]
#[tokio::test]
async fn power_failures_are_aggregated(harness: Harness) {
    harness.cloud.set_faults(|faults| {
        faults.power_failures.insert(DB.to_owned());
    });
    let failure = harness
        .orchestrator
        .power(&prod_fleet(), PowerAction::Stop, &CancellationToken::new())
        .await
        .expect_err("db refuses to stop");

    let OpsError::PowerPartialFailure { report } = failure.kind() else {
        panic!("expected a power partial failure, got {failure}");
    };
    assert_eq!(report.results.len(), 2);
    assert_eq!(
        harness.cloud.power_log(),
        vec![(WEB.to_owned(), PowerAction::Stop)]
    );
}

#[rstest]
#[tokio::test]
async fn relayed_uploads_leave_no_registry_entries(harness: Harness) {
    let tmp = TempDir::new().expect("tempdir");
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    let local = dir.join("bundle.tar");
    let bytes = vec![7_u8; 2 * 1024 * 1024];
    std::fs::write(&local, &bytes).expect("write payload");

    let report = harness
        .orchestrator
        .upload_file(
            &Selector::instance("web", "cac1"),
            &local,
            "/opt/bundle.tar",
            &CancellationToken::new(),
        )
        .await
        .expect("upload succeeds");

    assert_eq!(report.plan.strategy(), Strategy::Relayed);
    assert!(report.teardown_failures.is_empty());
    assert_eq!(harness.cloud.remote_file(WEB, "/opt/bundle.tar"), Some(bytes));
    assert!(harness.registry.list_all().expect("registry").is_empty());
    assert!(harness.cloud.live_grant_ids().is_empty());
    assert!(harness.cloud.relay_uris().is_empty());
}

#[rstest]
#[tokio::test]
async fn downloads_of_missing_files_name_the_target(harness: Harness) {
    let tmp = TempDir::new().expect("tempdir");
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
    let failure = harness
        .orchestrator
        .download_file(
            &Selector::instance(WEB, "cac1"),
            "/var/log/absent.log",
            &dir.join("absent.log"),
            &CancellationToken::new(),
        )
        .await
        .expect_err("file does not exist");

    assert_eq!(failure.target, format!("web ({WEB})"));
    assert!(matches!(failure.kind(), OpsError::Transfer { .. }));
}

#[rstest]
#[case(70_000, 8080, "local")]
#[case(8080, 0, "remote")]
#[tokio::test]
async fn invalid_ports_fail_before_any_call(
    harness: Harness,
    #[case] local: u32,
    #[case] remote: u32,
    #[case] side: &str,
) {
    let failure = harness
        .orchestrator
        .forward_port(
            &Selector::instance("web", "cac1"),
            local,
            remote,
            &CancellationToken::new(),
        )
        .await
        .expect_err("port out of range");

    assert!(matches!(
        failure.kind(),
        OpsError::InvalidPort { side: rejected, .. } if *rejected == side
    ));
    assert!(harness.cloud.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn tunnels_close_cleanly(harness: Harness) {
    let tunnel = harness
        .orchestrator
        .forward_port(
            &Selector::instance("web", "cac1"),
            15432,
            5432,
            &CancellationToken::new(),
        )
        .await
        .expect("tunnel opens");
    tokio::task::yield_now().await;
    tunnel.close().await.expect("closing is not an error");

    assert!(
        harness
            .cloud
            .calls()
            .contains(&format!("agent.forward_port:{WEB}:15432:5432"))
    );
}

#[rstest]
#[tokio::test]
async fn dropped_sessions_are_terminal(harness: Harness) {
    harness.cloud.set_faults(|faults| faults.drop_sessions = true);
    let failure = harness
        .orchestrator
        .open_session(&Selector::instance(WEB, "cac1"), &CancellationToken::new())
        .await
        .expect_err("session drops");

    assert!(matches!(failure.kind(), OpsError::Session { .. }));
    let opened = harness
        .cloud
        .calls()
        .iter()
        .filter(|call| call.starts_with("agent.open_session"))
        .count();
    assert_eq!(opened, 1);
}

#[rstest]
#[tokio::test]
async fn cleanup_defaults_to_the_configured_age(harness: Harness) {
    let summary = harness
        .orchestrator
        .cleanup("cac1", None)
        .await
        .expect("nothing to reclaim");
    assert!(summary.is_clean());
    assert_eq!(summary.revoked_grants, 0);
}

#[rstest]
#[tokio::test]
async fn incomplete_cleanup_is_a_failure_naming_the_region(harness: Harness) {
    let op = OperationId::new();
    harness
        .registry
        .register(
            crate::registry::RegistryEntry::new(
                crate::registry::ResourceKind::Grant,
                format!("gangway-grant-{}", op.simple()),
                FAKE_REGION,
                op,
            )
            .with_subject(WEB),
        )
        .expect("register");
    harness.cloud.set_faults(|faults| faults.fail_revoke = true);

    let failure = harness
        .orchestrator
        .emergency_cleanup("cac1")
        .await
        .expect_err("revocation keeps failing");

    assert_eq!(failure.target, FAKE_REGION);
    let OpsError::CleanupIncomplete { summary } = failure.kind() else {
        panic!("expected incomplete cleanup, got {failure}");
    };
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(harness.registry.list_all().expect("registry").len(), 1);
}
