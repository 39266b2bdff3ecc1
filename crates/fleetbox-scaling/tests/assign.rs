//! Assignment action tests.

mod common;

use std::sync::Arc;

use common::{test_algorithm, test_image, test_instance, test_mandelbox};
use fleetbox_db::{InstanceStatus, MandelboxStatus, MemoryRepository};
use fleetbox_scaling::assign::{
    COMMIT_HASH_MISMATCH, NO_INSTANCE_AVAILABLE, USER_ALREADY_ACTIVE,
};
use fleetbox_scaling::AssignRequest;
use tokio_util::sync::CancellationToken;

fn seeded_repository(capacity: i32) -> Arc<MemoryRepository> {
    let repository = Arc::new(MemoryRepository::new());
    repository.seed_instances(vec![
        test_instance("test-assign-instance-1", "us-east-1", InstanceStatus::Active, capacity),
        test_instance("test-assign-instance-2", "us-west-1", InstanceStatus::Active, capacity),
    ]);
    repository.seed_images(vec![test_image("us-east-1"), test_image("us-west-1")]);
    repository
}

#[tokio::test]
async fn happy_path_assigns_and_decrements_capacity() {
    let repository = seeded_repository(4);
    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    let cancel = CancellationToken::new();

    let request = AssignRequest::new(
        "u@x",
        vec!["us-east-1".to_owned(), "us-west-1".to_owned()],
        "sha-1",
        "3.0.0",
    );
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();

    let result = slot.wait().await.unwrap();
    assert_eq!(result.error, "");
    assert_eq!(result.ip, "1.1.1.1");
    let mandelbox_id = result.mandelbox_id.expect("mandelbox id missing");

    let instances = repository.instances();
    let chosen = instances
        .iter()
        .find(|i| i.id == "test-assign-instance-1")
        .unwrap();
    assert_eq!(chosen.remaining_capacity, 3);

    let mandelboxes = repository.mandelboxes();
    assert_eq!(mandelboxes.len(), 1);
    assert_eq!(mandelboxes[0].id, mandelbox_id);
    assert_eq!(mandelboxes[0].status, MandelboxStatus::Allocated);
    assert_eq!(mandelboxes[0].user_id, "u@x");
}

#[tokio::test]
async fn commit_hash_mismatch_mutates_nothing() {
    let repository = seeded_repository(4);
    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    let cancel = CancellationToken::new();

    let request = AssignRequest::new(
        "u@x",
        vec!["us-east-1".to_owned(), "us-west-1".to_owned()],
        "outdated-sha",
        "3.0.0",
    );
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();

    let result = slot.wait().await.unwrap();
    assert_eq!(result.error, COMMIT_HASH_MISMATCH);
    assert!(result.mandelbox_id.is_none());

    assert!(repository.mandelboxes().is_empty());
    assert!(repository
        .instances()
        .iter()
        .all(|i| i.remaining_capacity == 4));
}

#[tokio::test]
async fn outdated_version_is_a_commit_hash_mismatch() {
    let repository = seeded_repository(4);
    let (algorithm, _config) = test_algorithm("us-east-1", repository);
    let cancel = CancellationToken::new();

    let request = AssignRequest::new(
        "u@x",
        vec!["us-east-1".to_owned()],
        "sha-1",
        "2.13.2",
    );
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();
    assert_eq!(slot.wait().await.unwrap().error, COMMIT_HASH_MISMATCH);
}

#[tokio::test]
async fn dev_override_bypasses_the_version_gate() {
    let repository = seeded_repository(4);
    // Make the seeded sha irrelevant: the override skips sha filtering too.
    let (algorithm, _config) = test_algorithm("us-east-1", repository);
    let cancel = CancellationToken::new();

    let request = AssignRequest::new(
        "u@x",
        vec!["us-east-1".to_owned()],
        "local_dev",
        "0.0.1",
    );
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();
    assert_eq!(slot.wait().await.unwrap().error, "");
}

#[tokio::test]
async fn no_capacity_reports_no_instance_available() {
    let repository = seeded_repository(0);
    let (algorithm, _config) = test_algorithm("us-east-1", repository);
    let cancel = CancellationToken::new();

    let request = AssignRequest::new(
        "u@x",
        vec!["us-east-1".to_owned(), "us-west-1".to_owned()],
        "sha-1",
        "3.0.0",
    );
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();

    let result = slot.wait().await.unwrap();
    assert_eq!(result.error, NO_INSTANCE_AVAILABLE);
    assert!(result.mandelbox_id.is_none());
}

#[tokio::test]
async fn disabled_regions_are_annotated_but_served() {
    let repository = seeded_repository(4);
    let (algorithm, _config) = test_algorithm("us-east-1", repository);
    let cancel = CancellationToken::new();

    let request = AssignRequest::new(
        "u@x",
        vec![
            "ap-southeast-1".to_owned(),
            "ap-south-1".to_owned(),
            "us-east-1".to_owned(),
        ],
        "sha-1",
        "3.0.0",
    );
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();

    let result = slot.wait().await.unwrap();
    assert_eq!(result.error, "");
    assert_eq!(
        result.skipped_regions,
        vec!["ap-southeast-1".to_owned(), "ap-south-1".to_owned()]
    );
}

#[tokio::test]
async fn only_disabled_regions_fall_back_to_any_enabled_region() {
    let repository = seeded_repository(4);
    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    let cancel = CancellationToken::new();

    let request = AssignRequest::new(
        "u@x",
        vec!["ap-southeast-1".to_owned(), "eu-north-1".to_owned()],
        "sha-1",
        "3.0.0",
    );
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();

    let result = slot.wait().await.unwrap();
    assert_eq!(result.error, "");
    assert!(result.mandelbox_id.is_some());
    assert_eq!(repository.mandelboxes().len(), 1);
}

#[tokio::test]
async fn second_live_mandelbox_is_rejected() {
    let repository = seeded_repository(4);
    repository.seed_mandelboxes(vec![test_mandelbox(
        "test-assign-instance-1",
        "u@x",
        MandelboxStatus::Running,
    )]);
    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    let cancel = CancellationToken::new();

    let request = AssignRequest::new("u@x", vec!["us-east-1".to_owned()], "sha-1", "3.0.0");
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();

    assert_eq!(slot.wait().await.unwrap().error, USER_ALREADY_ACTIVE);
    assert_eq!(repository.mandelboxes().len(), 1);
}

#[tokio::test]
async fn ties_break_deterministically() {
    let repository = Arc::new(MemoryRepository::new());
    let now = chrono::Utc::now();
    let mut a = test_instance("instance-b", "us-east-1", InstanceStatus::Active, 2);
    let mut b = test_instance("instance-a", "us-east-1", InstanceStatus::Active, 2);
    a.updated_at = now;
    b.updated_at = now;
    repository.seed_instances(vec![a, b]);
    repository.seed_images(vec![test_image("us-east-1")]);

    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    let cancel = CancellationToken::new();

    let request = AssignRequest::new("u@x", vec!["us-east-1".to_owned()], "sha-1", "3.0.0");
    let slot = Arc::clone(&request.result);
    algorithm.mandelbox_assign(&cancel, request).await.unwrap();
    assert_eq!(slot.wait().await.unwrap().error, "");

    // Equal freshness: the lexicographically-smaller id wins.
    assert_eq!(repository.mandelboxes()[0].instance_id, "instance-a");
}
