//! Unit tests for the janitor.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rstest::{fixture, rstest};

use super::*;
use crate::backend::{GrantAccess, TemporaryGrant};
use crate::registry::{MemoryRegistry, entry_id};
use crate::test_support::{FAKE_BUCKET, FAKE_REGION, FakeCloud};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const INSTANCE: &str = "i-0123456789abcdef0";

struct Harness {
    cloud: Arc<FakeCloud>,
    registry: Arc<MemoryRegistry>,
    janitor: Janitor,
}

impl Harness {
    /// Leaves behind what a transfer crashing after provisioning would.
    fn abandon_transfer(&self, age: ChronoDuration) -> OperationId {
        let op = OperationId::new();
        let created_at = Utc::now() - age;
        let location = RelayLocation {
            bucket: FAKE_BUCKET.to_owned(),
            key: format!("gangway-relay/{}/big.bin", op.simple()),
        };
        let grant_id = format!("gangway-grant-{}", op.simple());
        self.cloud.insert_relay_object(&location, vec![0; 16]);
        self.cloud.insert_grant(TemporaryGrant {
            grant_id: grant_id.clone(),
            target_id: INSTANCE.to_owned(),
            region: FAKE_REGION.to_owned(),
            scope: location.clone(),
            access: GrantAccess::Read,
            created_at,
            operation_id: op,
        });
        for entry in [
            RegistryEntry::new(ResourceKind::LockMarker, format!("transfer/{op}"), FAKE_REGION, op)
                .with_subject(INSTANCE),
            RegistryEntry::new(ResourceKind::RelayObject, location.key, FAKE_REGION, op)
                .with_bucket(FAKE_BUCKET),
            RegistryEntry::new(ResourceKind::Grant, grant_id, FAKE_REGION, op)
                .with_subject(INSTANCE),
        ] {
            self.registry
                .register(entry.created_at(created_at))
                .expect("register");
        }
        op
    }

    fn remaining(&self) -> usize {
        self.registry.list_all().expect("registry readable").len()
    }
}

#[fixture]
fn harness() -> Harness {
    let cloud = Arc::new(FakeCloud::default());
    let registry = Arc::new(MemoryRegistry::new());
    let policy = Policy {
        retry_backoff: Duration::from_millis(1),
        ..Policy::default()
    };
    let janitor = Janitor::new(
        Arc::clone(&cloud) as Arc<dyn RelayStore>,
        Arc::clone(&cloud) as Arc<dyn GrantStore>,
        Arc::clone(&registry) as Arc<dyn Registry>,
        policy,
    );
    Harness {
        cloud,
        registry,
        janitor,
    }
}

#[rstest]
#[tokio::test]
async fn reclaims_everything_an_interrupted_transfer_left(harness: Harness) {
    let op = harness.abandon_transfer(ChronoDuration::minutes(5));

    let summary = harness
        .janitor
        .cleanup(FAKE_REGION, Duration::ZERO)
        .await
        .expect("clean run");

    assert_eq!(summary.revoked_grants, 1);
    assert_eq!(summary.deleted_relay_objects, 1);
    assert_eq!(summary.removed_lock_markers, 1);
    assert_eq!(summary.interrupted_operations, vec![op]);
    assert_eq!(harness.remaining(), 0);
    assert!(harness.cloud.live_grant_ids().is_empty());
    assert!(harness.cloud.relay_uris().is_empty());
}

#[rstest]
#[tokio::test]
async fn grants_are_revoked_before_relay_objects_are_deleted(harness: Harness) {
    harness.abandon_transfer(ChronoDuration::hours(1));

    harness
        .janitor
        .cleanup(FAKE_REGION, Duration::ZERO)
        .await
        .expect("clean run");

    assert_eq!(harness.cloud.calls(), vec!["grant.revoke", "relay.delete"]);
}

#[rstest]
#[tokio::test]
async fn young_entries_survive_the_age_threshold(harness: Harness) {
    harness.abandon_transfer(ChronoDuration::hours(2));
    let old = harness.abandon_transfer(ChronoDuration::hours(25));

    let summary = harness
        .janitor
        .cleanup(FAKE_REGION, DAY)
        .await
        .expect("clean run");

    assert_eq!(summary.interrupted_operations, vec![old]);
    assert_eq!(harness.remaining(), 3);
    assert_eq!(harness.cloud.live_grant_ids().len(), 1);
    assert_eq!(harness.cloud.relay_uris().len(), 1);
}

#[rstest]
#[tokio::test]
async fn second_run_finds_nothing(harness: Harness) {
    harness.abandon_transfer(ChronoDuration::hours(1));
    harness
        .janitor
        .cleanup(FAKE_REGION, Duration::ZERO)
        .await
        .expect("first run");

    let summary = harness
        .janitor
        .cleanup(FAKE_REGION, Duration::ZERO)
        .await
        .expect("second run");

    assert_eq!(summary, CleanupSummary::default());
}

#[rstest]
#[tokio::test]
async fn other_regions_are_untouched(harness: Harness) {
    harness.abandon_transfer(ChronoDuration::hours(1));

    let summary = harness
        .janitor
        .cleanup("eu-west-1", Duration::ZERO)
        .await
        .expect("clean run");

    assert_eq!(summary, CleanupSummary::default());
    assert_eq!(harness.remaining(), 3);
}

#[rstest]
#[tokio::test]
async fn failures_keep_entries_and_the_lock_marker(harness: Harness) {
    harness.cloud.set_faults(|faults| faults.fail_revoke = true);
    let op = harness.abandon_transfer(ChronoDuration::hours(1));

    let err = harness
        .janitor
        .cleanup(FAKE_REGION, Duration::ZERO)
        .await
        .expect_err("revocation keeps failing");

    let CleanupError::Incomplete { summary } = err else {
        panic!("expected an incomplete cleanup, got {err:?}");
    };
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.deleted_relay_objects, 1, "relay deletion still ran");
    assert_eq!(summary.removed_lock_markers, 0);
    let mut kinds = harness
        .registry
        .list_for_operation(op)
        .expect("registry readable")
        .into_iter()
        .map(|entry| entry.kind)
        .collect::<Vec<_>>();
    kinds.sort();
    assert_eq!(kinds, vec![ResourceKind::Grant, ResourceKind::LockMarker]);
}

#[rstest]
#[tokio::test]
async fn deregistered_grants_are_left_alone(harness: Harness) {
    let op = harness.abandon_transfer(ChronoDuration::hours(1));
    let grant_id = entry_id(ResourceKind::Grant, &format!("gangway-grant-{}", op.simple()));
    harness.registry.deregister(&grant_id).expect("deregister");
    let entries = harness
        .registry
        .list_older_than(FAKE_REGION, Duration::ZERO, Utc::now())
        .expect("registry readable");
    assert_eq!(entries.len(), 2);

    let summary = harness
        .janitor
        .cleanup(FAKE_REGION, Duration::ZERO)
        .await
        .expect("clean run");

    assert_eq!(summary.revoked_grants, 0);
    assert_eq!(summary.deleted_relay_objects, 1);
    assert_eq!(summary.removed_lock_markers, 1);
}

#[rstest]
#[tokio::test]
async fn emergency_cleanup_ignores_age_and_revokes_unregistered_grants(harness: Harness) {
    harness.abandon_transfer(ChronoDuration::seconds(1));
    harness.cloud.insert_grant(TemporaryGrant {
        grant_id: String::from("gangway-grant-orphan"),
        target_id: String::from("i-0fedcba9876543210"),
        region: FAKE_REGION.to_owned(),
        scope: RelayLocation {
            bucket: FAKE_BUCKET.to_owned(),
            key: String::from("gangway-relay/orphan/payload"),
        },
        access: GrantAccess::Write,
        created_at: Utc::now(),
        operation_id: OperationId::new(),
    });
    harness.cloud.insert_grant(TemporaryGrant {
        grant_id: String::from("someone-elses-policy"),
        target_id: String::from("i-0fedcba9876543210"),
        region: FAKE_REGION.to_owned(),
        scope: RelayLocation {
            bucket: FAKE_BUCKET.to_owned(),
            key: String::from("elsewhere"),
        },
        access: GrantAccess::Read,
        created_at: Utc::now(),
        operation_id: OperationId::new(),
    });

    let summary = harness
        .janitor
        .emergency_cleanup(FAKE_REGION)
        .await
        .expect("clean run");

    assert_eq!(summary.revoked_grants, 2);
    assert_eq!(harness.remaining(), 0);
    assert_eq!(
        harness.cloud.live_grant_ids(),
        vec![String::from("someone-elses-policy")]
    );
}
