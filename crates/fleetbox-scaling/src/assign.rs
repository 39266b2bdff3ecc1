//! Mandelbox assignment.
//!
//! Matches a user's request to a warm instance: gate on the client's
//! version, scan the requested regions in order, fall back to any enabled
//! region, enforce the per-user limit, then allocate the row and decrement
//! the instance's capacity. Failures surface one short reason string; the
//! result always reaches the request's one-shot slot.

use std::sync::Arc;

use chrono::Utc;
use fleetbox_core::OnceSlot;
use fleetbox_db::{
    FrontendVersion, Instance, InstanceStatus, InstanceWithMandelboxes, Mandelbox, MandelboxId,
    MandelboxStatus,
};
use fleetbox_error::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::algorithm::DefaultScalingAlgorithm;
use crate::config::CLIENT_COMMIT_HASH_DEV_OVERRIDE;

/// The client ships a build older than the rolled-out frontend, or no
/// instance carries its commit hash.
pub const COMMIT_HASH_MISMATCH: &str = "COMMIT_HASH_MISMATCH";
/// No enabled region has a warm instance with capacity.
pub const NO_INSTANCE_AVAILABLE: &str = "NO_INSTANCE_AVAILABLE";
/// Every requested region is outside the enabled set.
pub const REGION_NOT_ENABLED: &str = "REGION_NOT_ENABLED";
/// The user already holds a live mandelbox.
pub const USER_ALREADY_ACTIVE: &str = "USER_ALREADY_ACTIVE";
/// The datastore or an internal step failed.
pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";

/// The application every assigned mandelbox runs.
const ASSIGNED_APP: &str = "CHROMIUM";

/// A user's request for a mandelbox.
pub struct AssignRequest {
    /// Requesting user.
    pub user_email: String,
    /// Regions in preference order.
    pub regions: Vec<String>,
    /// Build identifier of the client.
    pub commit_hash: String,
    /// Client frontend version, `major.minor.micro`.
    pub version: String,
    /// Where the outcome is delivered, exactly once.
    pub result: Arc<OnceSlot<AssignResult>>,
}

impl AssignRequest {
    /// Creates a request with a fresh result slot.
    #[must_use]
    pub fn new(
        user_email: impl Into<String>,
        regions: Vec<String>,
        commit_hash: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            user_email: user_email.into(),
            regions,
            commit_hash: commit_hash.into(),
            version: version.into(),
            result: Arc::new(OnceSlot::new()),
        }
    }

    fn respond(&self, result: AssignResult) {
        if self.result.set(result).is_err() {
            warn!(user = %self.user_email, "assign result already delivered");
        }
    }
}

impl std::fmt::Debug for AssignRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignRequest")
            .field("user_email", &self.user_email)
            .field("regions", &self.regions)
            .field("commit_hash", &self.commit_hash)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Outcome of an assignment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignResult {
    /// The allocated mandelbox, on success.
    pub mandelbox_id: Option<MandelboxId>,
    /// Public IP of the chosen instance, CIDR suffix stripped.
    pub ip: String,
    /// Empty on success, otherwise one of the short reason strings.
    pub error: String,
    /// Requested regions that are not enabled; the request may still have
    /// been served from another region.
    pub skipped_regions: Vec<String>,
}

impl AssignResult {
    fn failure(reason: &str, skipped_regions: Vec<String>) -> Self {
        Self {
            error: reason.to_owned(),
            skipped_regions,
            ..Self::default()
        }
    }
}

enum Pick {
    Chosen(Instance),
    /// Capacity existed but on instances built from another commit.
    WrongSha,
    None,
}

impl DefaultScalingAlgorithm {
    /// Assigns a mandelbox to the requesting user.
    ///
    /// The result slot is always written: with the allocation on success,
    /// with a reason string on rejection, and with `SERVICE_UNAVAILABLE`
    /// when the datastore fails.
    pub async fn mandelbox_assign(
        &self,
        _cancel: &CancellationToken,
        request: AssignRequest,
    ) -> Result<()> {
        match self.assign_inner(&request).await {
            Ok(result) => {
                if result.error.is_empty() {
                    info!(user = %request.user_email, mandelbox_id = ?result.mandelbox_id,
                          "assigned mandelbox");
                } else {
                    info!(user = %request.user_email, reason = %result.error,
                          "rejected mandelbox request");
                }
                request.respond(result);
                Ok(())
            }
            Err(e) => {
                request.respond(AssignResult::failure(SERVICE_UNAVAILABLE, Vec::new()));
                Err(e)
            }
        }
    }

    async fn assign_inner(&self, request: &AssignRequest) -> Result<AssignResult> {
        let dev_override = request.commit_hash == CLIENT_COMMIT_HASH_DEV_OVERRIDE;

        // Reject clients older than the rolled-out frontend before
        // touching any region state.
        if !dev_override {
            if let Some(minimum) = self.config.frontend_version() {
                let current_enough = request
                    .version
                    .parse::<FrontendVersion>()
                    .is_ok_and(|version| version >= minimum);
                if !current_enough {
                    return Ok(AssignResult::failure(COMMIT_HASH_MISMATCH, Vec::new()));
                }
            }
        }

        let mut skipped_regions = Vec::new();
        let mut saw_wrong_sha = false;
        let mut chosen: Option<Instance> = None;

        for region in &request.regions {
            if !self.config.is_region_enabled(region) {
                skipped_regions.push(region.clone());
                continue;
            }
            let active = self
                .repository
                .instances_by_status_in_region(InstanceStatus::Active, region)
                .await?;
            match pick_instance(&active, &request.commit_hash, dev_override) {
                Pick::Chosen(instance) => {
                    chosen = Some(instance);
                    break;
                }
                Pick::WrongSha => saw_wrong_sha = true,
                Pick::None => {}
            }
        }

        // No requested region had capacity: serve from any enabled region
        // rather than turning the user away.
        if chosen.is_none() {
            let everywhere: Vec<InstanceWithMandelboxes> = self
                .repository
                .active_instances()
                .await?
                .into_iter()
                .filter(|row| self.config.is_region_enabled(&row.instance.region))
                .collect();
            match pick_instance(&everywhere, &request.commit_hash, dev_override) {
                Pick::Chosen(instance) => {
                    info!(user = %request.user_email, region = %instance.region,
                          "serving from fallback region");
                    chosen = Some(instance);
                }
                Pick::WrongSha => saw_wrong_sha = true,
                Pick::None => {}
            }
        }

        let Some(instance) = chosen else {
            let reason = if saw_wrong_sha {
                COMMIT_HASH_MISMATCH
            } else if !request.regions.is_empty()
                && skipped_regions.len() == request.regions.len()
            {
                REGION_NOT_ENABLED
            } else {
                NO_INSTANCE_AVAILABLE
            };
            return Ok(AssignResult::failure(reason, skipped_regions));
        };

        let live = self
            .repository
            .user_mandelboxes(&request.user_email)
            .await?
            .iter()
            .filter(|m| m.status.is_live())
            .count();
        if live >= self.config.mandelbox_limit_per_user {
            return Ok(AssignResult::failure(USER_ALREADY_ACTIVE, skipped_regions));
        }

        let row = Mandelbox {
            id: MandelboxId::new(),
            app: ASSIGNED_APP.to_owned(),
            instance_id: instance.id.clone(),
            user_id: request.user_email.clone(),
            session_id: Utc::now().timestamp_millis().to_string(),
            status: MandelboxStatus::Allocated,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mandelbox_id = row.id;
        self.repository.allocate_mandelbox(row).await?;

        Ok(AssignResult {
            mandelbox_id: Some(mandelbox_id),
            ip: sanitize_ip(&instance.ip_addr),
            error: String::new(),
            skipped_regions,
        })
    }
}

/// Picks the best instance with capacity and a matching build: latest
/// `updated_at` first, ties broken by lexicographic id so results are
/// deterministic.
fn pick_instance(
    candidates: &[InstanceWithMandelboxes],
    commit_hash: &str,
    dev_override: bool,
) -> Pick {
    let mut with_capacity: Vec<&Instance> = candidates
        .iter()
        .map(|row| &row.instance)
        .filter(|instance| instance.remaining_capacity > 0)
        .collect();
    if with_capacity.is_empty() {
        return Pick::None;
    }

    if !dev_override {
        with_capacity.retain(|instance| instance.client_sha == commit_hash);
    }
    if with_capacity.is_empty() {
        // Capacity existed, but only on instances built from another
        // commit.
        return Pick::WrongSha;
    }

    with_capacity.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    Pick::Chosen(with_capacity[0].clone())
}

fn sanitize_ip(ip_addr: &str) -> String {
    ip_addr
        .split('/')
        .next()
        .unwrap_or(ip_addr)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_sanitization_strips_cidr_suffix() {
        assert_eq!(sanitize_ip("1.1.1.1/24"), "1.1.1.1");
        assert_eq!(sanitize_ip("1.1.1.1"), "1.1.1.1");
    }
}
