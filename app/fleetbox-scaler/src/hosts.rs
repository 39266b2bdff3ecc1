//! Development host provider.
//!
//! Deployments plug a real cloud provider into
//! [`fleetbox_scaling::HostHandler`]; local development runs against this
//! stub, which fabricates instance records immediately and treats every
//! wait as satisfied.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetbox_db::{Image, Instance, InstanceStatus};
use fleetbox_error::Result;
use fleetbox_scaling::HostHandler;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Stand-in provider for local development.
#[derive(Default)]
pub struct DevHost {
    region: parking_lot::Mutex<String>,
    launch_counter: AtomicU32,
}

#[async_trait]
impl HostHandler for DevHost {
    async fn initialize(&mut self, region: &str) -> Result<()> {
        *self.region.lock() = region.to_owned();
        info!(region, "dev host provider initialized");
        Ok(())
    }

    async fn spin_up_instances(
        &self,
        _cancel: &CancellationToken,
        count: i32,
        image: &Image,
    ) -> Result<Vec<Instance>> {
        let region = self.region.lock().clone();
        Ok((0..count)
            .map(|_| {
                let n = self.launch_counter.fetch_add(1, Ordering::SeqCst);
                Instance {
                    id: format!("dev-{region}-{n}"),
                    provider: "AWS".to_owned(),
                    region: region.clone(),
                    image_id: image.image_id.clone(),
                    client_sha: image.client_sha.clone(),
                    ip_addr: "127.0.0.1".to_owned(),
                    instance_type: "g4dn.2xlarge".to_owned(),
                    remaining_capacity: 0,
                    status: InstanceStatus::PreConnection,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                }
            })
            .collect())
    }

    async fn spin_down_instances(&self, instance_ids: &[String]) -> Result<()> {
        info!(?instance_ids, "dev host spin down");
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
