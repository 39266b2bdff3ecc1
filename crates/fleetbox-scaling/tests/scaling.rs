//! Scale-up, scale-down, reconciliation, and image upgrade tests.

mod common;

use std::sync::Arc;

use common::{test_algorithm, test_image, test_instance, test_mandelbox};
use fleetbox_db::{InstanceStatus, MandelboxStatus, MemoryRepository, ScalerRepository};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn scale_down_drains_free_instances_only() {
    let repository = Arc::new(MemoryRepository::new());
    repository.seed_instances(vec![
        test_instance("scale-down-1", "us-east-1", InstanceStatus::Active, 2),
        test_instance("scale-down-2", "us-east-1", InstanceStatus::Active, 2),
        test_instance("scale-down-3", "us-east-1", InstanceStatus::Draining, 2),
        test_instance("scale-down-4", "us-east-1", InstanceStatus::Active, 2),
    ]);
    // Instance 4 carries a live mandelbox and must stay untouched; its
    // remaining capacity also keeps the closing capacity check quiet.
    repository.seed_mandelboxes(vec![test_mandelbox(
        "scale-down-4",
        "u@x",
        MandelboxStatus::Running,
    )]);
    repository.seed_images(vec![test_image("us-east-1")]);

    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    algorithm
        .scale_down_if_necessary(&CancellationToken::new())
        .await
        .unwrap();

    let status_of = |id: &str| {
        repository
            .instances()
            .into_iter()
            .find(|i| i.id == id)
            .unwrap()
            .status
    };
    assert_eq!(status_of("scale-down-1"), InstanceStatus::Draining);
    assert_eq!(status_of("scale-down-2"), InstanceStatus::Draining);
    assert_eq!(status_of("scale-down-3"), InstanceStatus::Draining);
    assert_eq!(status_of("scale-down-4"), InstanceStatus::Active);
}

#[tokio::test]
async fn scale_down_defers_while_rollout_buffer_is_warming() {
    let repository = Arc::new(MemoryRepository::new());
    let mut stale_free = test_instance("stale-1", "us-east-1", InstanceStatus::Active, 2);
    stale_free.image_id = "img-old".to_owned();
    let starting = test_instance("starting-1", "us-east-1", InstanceStatus::PreConnection, 1);
    repository.seed_instances(vec![stale_free, starting]);
    repository.seed_images(vec![test_image("us-east-1")]);

    let (algorithm, config) = test_algorithm("us-east-1", Arc::clone(&repository));
    config.set_desired_free_mandelboxes("us-east-1", 2);

    algorithm
        .scale_down_if_necessary(&CancellationToken::new())
        .await
        .unwrap();

    // One starting instance with capacity 1 < buffer 2: the stale free
    // instance must not drain yet.
    let stale = repository
        .instances()
        .into_iter()
        .find(|i| i.id == "stale-1")
        .unwrap();
    assert_eq!(stale.status, InstanceStatus::Active);
}

#[tokio::test]
async fn scale_down_drains_stale_instances_once_buffer_is_ready() {
    let repository = Arc::new(MemoryRepository::new());
    let mut stale_free = test_instance("stale-1", "us-east-1", InstanceStatus::Active, 2);
    stale_free.image_id = "img-old".to_owned();
    let current_free = test_instance("fresh-1", "us-east-1", InstanceStatus::Active, 2);
    let starting = test_instance("starting-1", "us-east-1", InstanceStatus::PreConnection, 2);
    repository.seed_instances(vec![stale_free, current_free, starting]);
    repository.seed_images(vec![test_image("us-east-1")]);

    let (algorithm, config) = test_algorithm("us-east-1", Arc::clone(&repository));
    config.set_desired_free_mandelboxes("us-east-1", 2);

    algorithm
        .scale_down_if_necessary(&CancellationToken::new())
        .await
        .unwrap();

    let status_of = |id: &str| {
        repository
            .instances()
            .into_iter()
            .find(|i| i.id == id)
            .unwrap()
            .status
    };
    // Stale image drains; the current-image free instance survives the
    // rollout window.
    assert_eq!(status_of("stale-1"), InstanceStatus::Draining);
    assert_eq!(status_of("fresh-1"), InstanceStatus::Active);
}

#[tokio::test]
async fn scale_up_inserts_ready_instances_with_capacity() {
    let repository = Arc::new(MemoryRepository::new());
    repository.seed_images(vec![test_image("us-east-1")]);
    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));

    algorithm
        .scale_up_if_necessary(&CancellationToken::new(), 3, &test_image("us-east-1"))
        .await
        .unwrap();

    let instances = repository.instances();
    assert_eq!(instances.len(), 3);
    for instance in instances {
        assert_eq!(instance.status, InstanceStatus::PreConnection);
        assert_eq!(instance.image_id, "img-A");
        // g4dn.2xlarge: min(1 GPU * 3, 8 vCPU / 4) = 2 mandelboxes.
        assert_eq!(instance.remaining_capacity, 2);
    }
}

#[tokio::test]
async fn verify_capacity_covers_the_shortfall() {
    let repository = Arc::new(MemoryRepository::new());
    repository.seed_images(vec![test_image("us-east-1")]);
    let (algorithm, config) = test_algorithm("us-east-1", Arc::clone(&repository));
    config.set_desired_free_mandelboxes("us-east-1", 4);

    algorithm
        .verify_capacity(&CancellationToken::new())
        .await
        .unwrap();

    // Shortfall of 4 mandelboxes at 2 per instance: two launches.
    let instances = repository.instances();
    assert_eq!(instances.len(), 2);
    let total: i32 = instances.iter().map(|i| i.remaining_capacity).sum();
    assert_eq!(total, 4);
}

#[tokio::test]
async fn verify_scale_down_removes_leftover_rows() {
    let repository = Arc::new(MemoryRepository::new());
    let draining = test_instance("gone-1", "us-east-1", InstanceStatus::Draining, 2);
    // Keep the capacity check quiet with a healthy active instance.
    let active = test_instance("alive-1", "us-east-1", InstanceStatus::Active, 2);
    repository.seed_instances(vec![draining.clone(), active]);
    repository.seed_images(vec![test_image("us-east-1")]);

    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    algorithm
        .verify_instance_scale_down(&CancellationToken::new(), draining)
        .await
        .unwrap();

    assert!(repository.instances().iter().all(|i| i.id != "gone-1"));
}

#[tokio::test]
async fn verify_scale_down_skips_instances_with_mandelboxes() {
    let repository = Arc::new(MemoryRepository::new());
    let draining = test_instance("busy-1", "us-east-1", InstanceStatus::Draining, 2);
    let active = test_instance("alive-1", "us-east-1", InstanceStatus::Active, 2);
    repository.seed_instances(vec![draining.clone(), active]);
    repository.seed_mandelboxes(vec![test_mandelbox("busy-1", "u@x", MandelboxStatus::Running)]);
    repository.seed_images(vec![test_image("us-east-1")]);

    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));
    algorithm
        .verify_instance_scale_down(&CancellationToken::new(), draining)
        .await
        .unwrap();

    // The row survives until its mandelboxes are gone.
    assert!(repository.instances().iter().any(|i| i.id == "busy-1"));
}

#[tokio::test]
async fn upgrade_image_builds_buffer_then_swaps_the_row() {
    let repository = Arc::new(MemoryRepository::new());
    repository.seed_images(vec![test_image("us-east-1")]);
    let (algorithm, config) = test_algorithm("us-east-1", Arc::clone(&repository));
    config.set_desired_free_mandelboxes("us-east-1", 2);

    algorithm
        .upgrade_image(&CancellationToken::new(), "img-B")
        .await
        .unwrap();

    // One g4dn.2xlarge covers the buffer of two mandelboxes.
    let instances = repository.instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].image_id, "img-B");
    assert_eq!(instances[0].status, InstanceStatus::PreConnection);

    let image = repository
        .latest_image("AWS", "us-east-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(image.image_id, "img-B");
}

#[tokio::test]
async fn upgrade_image_inserts_the_row_when_absent() {
    let repository = Arc::new(MemoryRepository::new());
    let (algorithm, _config) = test_algorithm("us-east-1", Arc::clone(&repository));

    algorithm
        .upgrade_image(&CancellationToken::new(), "img-B")
        .await
        .unwrap();

    let image = repository
        .latest_image("AWS", "us-east-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(image.image_id, "img-B");
}
