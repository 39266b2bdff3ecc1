//! In-memory repository.
//!
//! Backs local development (`APP_ENV=localdev`) and every test in the
//! workspace. Implements the same row semantics the remote repository
//! promises: registration is an atomic select-verify-update, allocation
//! decrements capacity together with the row insert, and instance deletion
//! cascades to mandelbox rows.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetbox_error::{CommonError, Result};
use parking_lot::Mutex;

use crate::repository::{ConfigRepository, HostRepository, RegisterOutcome, ScalerRepository};
use crate::types::{
    FrontendVersion, Image, Instance, InstanceMetrics, InstanceStatus, InstanceTakeover,
    InstanceWithMandelboxes, Mandelbox, MandelboxId, MandelboxStatus,
};

#[derive(Default)]
struct State {
    instances: Vec<Instance>,
    mandelboxes: Vec<Mandelbox>,
    images: Vec<Image>,
    frontend_version: Option<FrontendVersion>,
    configs: HashMap<String, String>,
}

/// Repository holding all rows in process memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all instance rows (test seeding).
    pub fn seed_instances(&self, rows: Vec<Instance>) {
        self.state.lock().instances = rows;
    }

    /// Replaces all image rows (test seeding).
    pub fn seed_images(&self, rows: Vec<Image>) {
        self.state.lock().images = rows;
    }

    /// Replaces all mandelbox rows (test seeding).
    pub fn seed_mandelboxes(&self, rows: Vec<Mandelbox>) {
        self.state.lock().mandelboxes = rows;
    }

    /// Sets the frontend version row (test seeding).
    pub fn seed_frontend_version(&self, version: FrontendVersion) {
        self.state.lock().frontend_version = Some(version);
    }

    /// Sets the per-environment configs (test seeding).
    pub fn seed_configs(&self, configs: HashMap<String, String>) {
        self.state.lock().configs = configs;
    }

    /// Snapshot of all instance rows.
    #[must_use]
    pub fn instances(&self) -> Vec<Instance> {
        self.state.lock().instances.clone()
    }

    /// Snapshot of all mandelbox rows.
    #[must_use]
    pub fn mandelboxes(&self) -> Vec<Mandelbox> {
        self.state.lock().mandelboxes.clone()
    }

    /// Snapshot of all image rows.
    #[must_use]
    pub fn images(&self) -> Vec<Image> {
        self.state.lock().images.clone()
    }

    fn with_mandelboxes(state: &State, instance: &Instance) -> InstanceWithMandelboxes {
        InstanceWithMandelboxes {
            instance: instance.clone(),
            mandelboxes: state
                .mandelboxes
                .iter()
                .filter(|m| m.instance_id == instance.id)
                .cloned()
                .collect(),
        }
    }
}

#[async_trait]
impl HostRepository for MemoryRepository {
    async fn find_instance(&self, instance_id: &str) -> Result<Option<Instance>> {
        Ok(self
            .state
            .lock()
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .cloned())
    }

    async fn register_instance(&self, takeover: InstanceTakeover) -> Result<RegisterOutcome> {
        let mut state = self.state.lock();
        let row = state
            .instances
            .iter_mut()
            .find(|i| i.id == takeover.instance_id)
            .ok_or_else(|| {
                CommonError::not_found(format!(
                    "no pre-created row for instance {}",
                    takeover.instance_id
                ))
            })?;

        if row.status == InstanceStatus::Draining {
            return Ok(RegisterOutcome::AlreadyDraining);
        }
        if row.image_id != takeover.image_id {
            return Err(CommonError::mismatch(format!(
                "image id: row has {}, host has {}",
                row.image_id, takeover.image_id
            )));
        }
        if row.region != takeover.region {
            return Err(CommonError::mismatch(format!(
                "region: row has {}, host has {}",
                row.region, takeover.region
            )));
        }
        // An empty sha is a prefix of everything, so require presence too.
        if row.client_sha.is_empty() || !takeover.client_commit_hash.starts_with(&row.client_sha) {
            return Err(CommonError::mismatch(format!(
                "commit sha: row has {:?}, host has {:?}",
                row.client_sha, takeover.client_commit_hash
            )));
        }
        if row.instance_type != takeover.instance_type {
            return Err(CommonError::mismatch(format!(
                "instance type: row has {}, host has {}",
                row.instance_type, takeover.instance_type
            )));
        }
        if row.status != InstanceStatus::PreConnection {
            return Err(CommonError::mismatch(format!(
                "status: row has {}, expected PRE_CONNECTION",
                row.status
            )));
        }

        row.status = InstanceStatus::Active;
        row.ip_addr = takeover.ip_addr;
        row.client_sha = takeover.client_commit_hash;
        row.remaining_capacity = takeover.remaining_capacity;
        row.updated_at = Utc::now();
        Ok(RegisterOutcome::Registered)
    }

    async fn write_heartbeat(&self, instance_id: &str, _metrics: InstanceMetrics) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| {
                CommonError::not_found(format!("heartbeat for missing instance {instance_id}"))
            })?;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_draining(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .instances
            .iter_mut()
            .find(|i| i.id == instance_id)
            .ok_or_else(|| CommonError::not_found(format!("instance {instance_id}")))?;
        row.status = InstanceStatus::Draining;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn unregister_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        let before = state.instances.len();
        state.instances.retain(|i| i.id != instance_id);
        if state.instances.len() == before {
            return Err(CommonError::not_found(format!(
                "instance {instance_id} went missing before delete"
            )));
        }
        // Cascade delete, as the foreign key does remotely.
        state.mandelboxes.retain(|m| m.instance_id != instance_id);
        Ok(())
    }

    async fn instance_capacity(&self, instance_id: &str) -> Result<i32> {
        self.state
            .lock()
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .map(|i| i.remaining_capacity)
            .ok_or_else(|| CommonError::not_found(format!("instance {instance_id}")))
    }

    async fn create_mandelbox(&self, row: Mandelbox) -> Result<()> {
        self.state.lock().mandelboxes.push(row);
        Ok(())
    }

    async fn write_mandelbox_status(&self, id: MandelboxId, status: MandelboxStatus) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .mandelboxes
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| CommonError::not_found(format!("mandelbox {id}")))?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn remove_mandelbox(&self, id: MandelboxId) -> Result<()> {
        self.state.lock().mandelboxes.retain(|m| m.id != id);
        Ok(())
    }

    async fn verify_allocated_mandelbox(&self, user_id: &str, id: MandelboxId) -> Result<()> {
        let state = self.state.lock();
        let allocated = state
            .mandelboxes
            .iter()
            .any(|m| m.id == id && m.user_id == user_id && m.status == MandelboxStatus::Allocated);
        if !allocated {
            return Err(CommonError::not_found(format!(
                "no ALLOCATED mandelbox {id} for user {user_id}"
            )));
        }
        let other_live = state
            .mandelboxes
            .iter()
            .any(|m| m.user_id == user_id && m.id != id && m.status.is_live());
        if other_live {
            return Err(CommonError::invalid_state(format!(
                "user {user_id} already has another live mandelbox"
            )));
        }
        Ok(())
    }

    async fn remove_stale_mandelboxes(
        &self,
        allocated_age: Duration,
        connecting_age: Duration,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let before = state.mandelboxes.len();
        state.mandelboxes.retain(|m| {
            let age = (now - m.updated_at).to_std().unwrap_or_default();
            let stale = (m.status == MandelboxStatus::Allocated && age > allocated_age)
                || (m.status == MandelboxStatus::Connecting && age > connecting_age);
            !stale
        });
        Ok((before - state.mandelboxes.len()) as u64)
    }
}

#[async_trait]
impl ScalerRepository for MemoryRepository {
    async fn instance_with_mandelboxes(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceWithMandelboxes>> {
        let state = self.state.lock();
        Ok(state
            .instances
            .iter()
            .find(|i| i.id == instance_id)
            .map(|i| Self::with_mandelboxes(&state, i)))
    }

    async fn instances_by_status_in_region(
        &self,
        status: InstanceStatus,
        region: &str,
    ) -> Result<Vec<InstanceWithMandelboxes>> {
        let state = self.state.lock();
        Ok(state
            .instances
            .iter()
            .filter(|i| i.status == status && i.region == region)
            .map(|i| Self::with_mandelboxes(&state, i))
            .collect())
    }

    async fn active_instances(&self) -> Result<Vec<InstanceWithMandelboxes>> {
        let state = self.state.lock();
        Ok(state
            .instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Active)
            .map(|i| Self::with_mandelboxes(&state, i))
            .collect())
    }

    async fn latest_image(&self, provider: &str, region: &str) -> Result<Option<Image>> {
        Ok(self
            .state
            .lock()
            .images
            .iter()
            .find(|img| img.provider == provider && img.region == region)
            .cloned())
    }

    async fn insert_instances(&self, rows: Vec<Instance>) -> Result<u64> {
        let mut state = self.state.lock();
        let n = rows.len() as u64;
        state.instances.extend(rows);
        Ok(n)
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<u64> {
        let mut state = self.state.lock();
        match state.instances.iter_mut().find(|i| i.id == instance_id) {
            Some(row) => {
                row.status = status;
                row.updated_at = Utc::now();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.instances.len();
        state.instances.retain(|i| i.id != instance_id);
        state.mandelboxes.retain(|m| m.instance_id != instance_id);
        Ok((before - state.instances.len()) as u64)
    }

    async fn insert_image(&self, image: Image) -> Result<u64> {
        self.state.lock().images.push(image);
        Ok(1)
    }

    async fn update_image(&self, image: Image) -> Result<u64> {
        let mut state = self.state.lock();
        match state
            .images
            .iter_mut()
            .find(|img| img.provider == image.provider && img.region == image.region)
        {
            Some(row) => {
                *row = image;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn user_mandelboxes(&self, user_id: &str) -> Result<Vec<Mandelbox>> {
        Ok(self
            .state
            .lock()
            .mandelboxes
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn allocate_mandelbox(&self, row: Mandelbox) -> Result<()> {
        let mut state = self.state.lock();
        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.id == row.instance_id)
            .ok_or_else(|| CommonError::not_found(format!("instance {}", row.instance_id)))?;
        if instance.remaining_capacity <= 0 {
            return Err(CommonError::invalid_state(format!(
                "instance {} has no remaining capacity",
                instance.id
            )));
        }
        instance.remaining_capacity -= 1;
        instance.updated_at = Utc::now();
        state.mandelboxes.push(row);
        Ok(())
    }
}

#[async_trait]
impl ConfigRepository for MemoryRepository {
    async fn frontend_version(&self) -> Result<Option<FrontendVersion>> {
        Ok(self.state.lock().frontend_version)
    }

    async fn configs(&self, _environment: &str) -> Result<HashMap<String, String>> {
        Ok(self.state.lock().configs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, status: InstanceStatus) -> Instance {
        Instance {
            id: id.to_owned(),
            provider: "AWS".to_owned(),
            region: "us-east-1".to_owned(),
            image_id: "img-A".to_owned(),
            client_sha: "sha-1".to_owned(),
            ip_addr: "1.1.1.1/24".to_owned(),
            instance_type: "g4dn.2xlarge".to_owned(),
            remaining_capacity: 4,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn takeover(id: &str) -> InstanceTakeover {
        InstanceTakeover {
            instance_id: id.to_owned(),
            image_id: "img-A".to_owned(),
            region: "us-east-1".to_owned(),
            instance_type: "g4dn.2xlarge".to_owned(),
            client_commit_hash: "sha-1-full".to_owned(),
            ip_addr: "2.2.2.2".to_owned(),
            remaining_capacity: 4,
        }
    }

    #[tokio::test]
    async fn register_takes_over_matching_row() {
        let repo = MemoryRepository::new();
        repo.seed_instances(vec![instance("i-1", InstanceStatus::PreConnection)]);

        let outcome = repo.register_instance(takeover("i-1")).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::Registered);

        let rows = repo.instances();
        assert_eq!(rows[0].status, InstanceStatus::Active);
        assert_eq!(rows[0].ip_addr, "2.2.2.2");
    }

    #[tokio::test]
    async fn register_rejects_mismatched_image() {
        let repo = MemoryRepository::new();
        let mut row = instance("i-1", InstanceStatus::PreConnection);
        row.image_id = "img-B".to_owned();
        repo.seed_instances(vec![row]);

        let err = repo.register_instance(takeover("i-1")).await.unwrap_err();
        assert!(err.is_mismatch());
    }

    #[tokio::test]
    async fn register_reports_already_draining() {
        let repo = MemoryRepository::new();
        repo.seed_instances(vec![instance("i-1", InstanceStatus::Draining)]);

        let outcome = repo.register_instance(takeover("i-1")).await.unwrap();
        assert_eq!(outcome, RegisterOutcome::AlreadyDraining);
    }

    #[tokio::test]
    async fn register_missing_row_is_not_found() {
        let repo = MemoryRepository::new();
        let err = repo.register_instance(takeover("i-1")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn allocate_decrements_capacity_and_rejects_when_exhausted() {
        let repo = MemoryRepository::new();
        let mut row = instance("i-1", InstanceStatus::Active);
        row.remaining_capacity = 1;
        repo.seed_instances(vec![row]);

        let mandelbox = Mandelbox {
            id: MandelboxId::new(),
            app: "CHROME".to_owned(),
            instance_id: "i-1".to_owned(),
            user_id: "u@x".to_owned(),
            session_id: "s".to_owned(),
            status: MandelboxStatus::Allocated,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.allocate_mandelbox(mandelbox.clone()).await.unwrap();
        assert_eq!(repo.instances()[0].remaining_capacity, 0);

        let err = repo
            .allocate_mandelbox(Mandelbox {
                id: MandelboxId::new(),
                ..mandelbox
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CommonError::InvalidState(_)));
    }

    #[tokio::test]
    async fn delete_instance_cascades_mandelboxes() {
        let repo = MemoryRepository::new();
        repo.seed_instances(vec![instance("i-1", InstanceStatus::Active)]);
        repo.seed_mandelboxes(vec![Mandelbox {
            id: MandelboxId::new(),
            app: "CHROME".to_owned(),
            instance_id: "i-1".to_owned(),
            user_id: "u@x".to_owned(),
            session_id: "s".to_owned(),
            status: MandelboxStatus::Waiting,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }]);

        assert_eq!(repo.delete_instance("i-1").await.unwrap(), 1);
        assert!(repo.mandelboxes().is_empty());
    }

    #[tokio::test]
    async fn stale_sweep_honors_both_age_cutoffs() {
        let repo = MemoryRepository::new();
        let old = Utc::now() - chrono::Duration::seconds(120);
        let recent = Utc::now() - chrono::Duration::seconds(5);
        let make = |status, updated_at| Mandelbox {
            id: MandelboxId::new(),
            app: "CHROME".to_owned(),
            instance_id: "i-1".to_owned(),
            user_id: "u".to_owned(),
            session_id: "s".to_owned(),
            status,
            created_at: updated_at,
            updated_at,
        };
        repo.seed_mandelboxes(vec![
            make(MandelboxStatus::Allocated, old),     // stale
            make(MandelboxStatus::Allocated, recent),  // fresh
            make(MandelboxStatus::Connecting, old),    // stale
            make(MandelboxStatus::Connecting, recent), // fresh at 5s < 10s
            make(MandelboxStatus::Running, old),       // never swept
        ]);

        let removed = repo
            .remove_stale_mandelboxes(Duration::from_secs(90), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.mandelboxes().len(), 3);
    }
}
