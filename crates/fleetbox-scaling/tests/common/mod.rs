//! Shared fixtures for scaling tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetbox_core::AppEnvironment;
use fleetbox_db::{
    FrontendVersion, Image, Instance, InstanceStatus, Mandelbox, MandelboxId, MandelboxStatus,
    MemoryRepository,
};
use fleetbox_error::Result;
use fleetbox_scaling::{DefaultScalingAlgorithm, HostHandler, ScalingConfig};
use tokio_util::sync::CancellationToken;

/// Deterministic in-memory cloud provider.
#[derive(Default)]
pub struct TestHost {
    launch_counter: AtomicU32,
}

#[async_trait]
impl HostHandler for TestHost {
    async fn initialize(&mut self, _region: &str) -> Result<()> {
        Ok(())
    }

    async fn spin_up_instances(
        &self,
        _cancel: &CancellationToken,
        count: i32,
        image: &Image,
    ) -> Result<Vec<Instance>> {
        Ok((0..count)
            .map(|_| {
                let n = self.launch_counter.fetch_add(1, Ordering::SeqCst);
                Instance {
                    id: format!("test-launched-{n}"),
                    provider: "AWS".to_owned(),
                    region: image.region.clone(),
                    image_id: image.image_id.clone(),
                    client_sha: image.client_sha.clone(),
                    ip_addr: "1.1.1.1/24".to_owned(),
                    instance_type: "g4dn.2xlarge".to_owned(),
                    remaining_capacity: 0,
                    status: InstanceStatus::PreConnection,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                }
            })
            .collect())
    }

    async fn spin_down_instances(&self, _instance_ids: &[String]) -> Result<()> {
        Ok(())
    }

    async fn wait_for_instance_ready(
        &self,
        _instance_ids: &[String],
        _deadline: Duration,
    ) -> Result<()> {
        Ok(())
    }

    async fn wait_for_instance_termination(
        &self,
        _instance_ids: &[String],
        _deadline: Duration,
    ) -> Result<()> {
        Ok(())
    }
}

pub fn test_instance(id: &str, region: &str, status: InstanceStatus, capacity: i32) -> Instance {
    Instance {
        id: id.to_owned(),
        provider: "AWS".to_owned(),
        region: region.to_owned(),
        image_id: "img-A".to_owned(),
        client_sha: "sha-1".to_owned(),
        ip_addr: "1.1.1.1/24".to_owned(),
        instance_type: "g4dn.2xlarge".to_owned(),
        remaining_capacity: capacity,
        status,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn test_image(region: &str) -> Image {
    Image {
        provider: "AWS".to_owned(),
        region: region.to_owned(),
        image_id: "img-A".to_owned(),
        client_sha: "sha-1".to_owned(),
        updated_at: Utc::now(),
    }
}

pub fn test_mandelbox(instance_id: &str, user_id: &str, status: MandelboxStatus) -> Mandelbox {
    Mandelbox {
        id: MandelboxId::new(),
        app: "CHROMIUM".to_owned(),
        instance_id: instance_id.to_owned(),
        user_id: user_id.to_owned(),
        session_id: "1650000000000".to_owned(),
        status,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn test_algorithm(
    region: &str,
    repository: Arc<MemoryRepository>,
) -> (DefaultScalingAlgorithm, Arc<ScalingConfig>) {
    let config = Arc::new(ScalingConfig::new(AppEnvironment::Dev));
    config.set_frontend_version(FrontendVersion { major: 3, minor: 0, micro: 0 });
    let algorithm = DefaultScalingAlgorithm::new(
        region,
        repository,
        Arc::new(TestHost::default()),
        Arc::clone(&config),
    );
    (algorithm, config)
}
