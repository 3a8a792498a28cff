//! Behavioural tests for reclaiming artifacts left by interrupted transfers.

#[path = "common/fleet.rs"]
mod common_fleet;

use std::time::Duration;

use gangway::Selector;
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use common_fleet::{Fleet, WEB};

/// Starts a 2 MiB upload that hangs in the agent pull and abandons it, as if
/// the process died before teardown.
async fn crash_mid_transfer(fleet: &Fleet) {
    fleet.cloud.set_faults(|faults| faults.hang_on_pull = true);
    let (local, _) = fleet.payload("bundle.tar", 2 * 1024 * 1024);
    let orchestrator = fleet.orchestrator();
    let selector = Selector::instance("web", "cac1");
    let cancel = CancellationToken::new();
    let upload = orchestrator.upload_file(&selector, &local, "/opt/bundle.tar", &cancel);
    let abandoned = tokio::time::timeout(Duration::from_secs(2), upload).await;
    assert!(abandoned.is_err(), "the upload should still be pulling");
    fleet.cloud.set_faults(|faults| faults.hang_on_pull = false);
}

#[fixture]
fn fleet() -> Fleet {
    Fleet::new()
}

#[rstest]
#[tokio::test]
async fn cleanup_reclaims_what_a_crashed_upload_left(fleet: Fleet) {
    crash_mid_transfer(&fleet).await;
    assert_eq!(fleet.cloud.remote_file(WEB, "/opt/bundle.tar"), None);
    assert_eq!(fleet.entries().len(), 3);
    assert_eq!(fleet.cloud.live_grant_ids().len(), 1);
    assert_eq!(fleet.cloud.relay_uris().len(), 1);

    let summary = fleet
        .orchestrator()
        .cleanup("cac1", Some(Duration::ZERO))
        .await
        .unwrap_or_else(|err| panic!("cleanup succeeds: {err}"));

    assert_eq!(summary.revoked_grants, 1);
    assert_eq!(summary.deleted_relay_objects, 1);
    assert_eq!(summary.removed_lock_markers, 1);
    assert_eq!(summary.interrupted_operations.len(), 1);
    assert!(fleet.entries().is_empty());
    assert!(fleet.cloud.live_grant_ids().is_empty());
    assert!(fleet.cloud.relay_uris().is_empty());
}

#[rstest]
#[tokio::test]
async fn routine_cleanup_spares_young_entries_but_emergency_does_not(fleet: Fleet) {
    crash_mid_transfer(&fleet).await;

    let routine = fleet
        .orchestrator()
        .cleanup("cac1", None)
        .await
        .unwrap_or_else(|err| panic!("routine cleanup succeeds: {err}"));
    assert_eq!(routine.revoked_grants, 0);
    assert_eq!(fleet.entries().len(), 3);

    let emergency = fleet
        .orchestrator()
        .emergency_cleanup("cac1")
        .await
        .unwrap_or_else(|err| panic!("emergency cleanup succeeds: {err}"));
    assert_eq!(emergency.revoked_grants, 1);
    assert!(fleet.entries().is_empty());
    assert!(fleet.cloud.live_grant_ids().is_empty());
}

#[rstest]
#[tokio::test]
async fn cleanup_is_idempotent(fleet: Fleet) {
    crash_mid_transfer(&fleet).await;
    let orchestrator = fleet.orchestrator();
    orchestrator
        .cleanup("cac1", Some(Duration::ZERO))
        .await
        .unwrap_or_else(|err| panic!("first cleanup succeeds: {err}"));

    let second = orchestrator
        .cleanup("cac1", Some(Duration::ZERO))
        .await
        .unwrap_or_else(|err| panic!("second cleanup succeeds: {err}"));

    assert_eq!(second.revoked_grants, 0);
    assert_eq!(second.deleted_relay_objects, 0);
    assert_eq!(second.removed_lock_markers, 0);
    assert!(second.is_clean());
}
