//! Mandelbox capacity math.
//!
//! Capacity per instance type is bounded by both GPUs and vCPUs:
//! `min(gpu_count * MAX_MANDELBOXES_PER_GPU, vcpu_count / VCPUS_PER_MANDELBOX)`.
//! Regional capacity sums `remaining_capacity` over instances on the
//! current image.

use fleetbox_db::InstanceWithMandelboxes;

/// Mandelboxes one GPU can drive.
pub const MAX_MANDELBOXES_PER_GPU: i32 = 3;

/// vCPUs consumed by one mandelbox.
pub const VCPUS_PER_MANDELBOX: i32 = 4;

struct InstanceTypeSpec {
    name: &'static str,
    gpu_count: i32,
    vcpu_count: i32,
}

/// The GPU instance types the controller launches.
const INSTANCE_TYPES: &[InstanceTypeSpec] = &[
    InstanceTypeSpec { name: "g4dn.xlarge", gpu_count: 1, vcpu_count: 4 },
    InstanceTypeSpec { name: "g4dn.2xlarge", gpu_count: 1, vcpu_count: 8 },
    InstanceTypeSpec { name: "g4dn.4xlarge", gpu_count: 1, vcpu_count: 16 },
    InstanceTypeSpec { name: "g4dn.8xlarge", gpu_count: 1, vcpu_count: 32 },
    InstanceTypeSpec { name: "g4dn.12xlarge", gpu_count: 4, vcpu_count: 48 },
    InstanceTypeSpec { name: "g4dn.16xlarge", gpu_count: 1, vcpu_count: 64 },
];

/// Mandelbox capacity of one instance type; `None` for unknown types.
#[must_use]
pub fn instance_capacity(instance_type: &str) -> Option<i32> {
    INSTANCE_TYPES
        .iter()
        .find(|spec| spec.name == instance_type)
        .map(|spec| {
            (spec.gpu_count * MAX_MANDELBOXES_PER_GPU)
                .min(spec.vcpu_count / VCPUS_PER_MANDELBOX)
        })
}

/// Free mandelboxes available right now: the summed remaining capacity of
/// ACTIVE instances on the current image.
#[must_use]
pub fn real_capacity(image_id: &str, active: &[InstanceWithMandelboxes]) -> i32 {
    active
        .iter()
        .filter(|row| row.instance.image_id == image_id)
        .map(|row| row.instance.remaining_capacity)
        .sum()
}

/// Free mandelboxes once starting instances come up: real capacity plus
/// the summed capacity of PRE_CONNECTION instances on the current image.
#[must_use]
pub fn expected_capacity(
    image_id: &str,
    active: &[InstanceWithMandelboxes],
    starting: &[InstanceWithMandelboxes],
) -> i32 {
    real_capacity(image_id, active)
        + starting
            .iter()
            .filter(|row| row.instance.image_id == image_id)
            .map(|row| row.instance.remaining_capacity)
            .sum::<i32>()
}

/// Instances needed to add `mandelboxes` of capacity with the given type.
#[must_use]
pub fn instances_for_capacity(mandelboxes: i32, instance_type: &str) -> i32 {
    let per_instance = instance_capacity(instance_type).unwrap_or(1).max(1);
    (mandelboxes + per_instance - 1) / per_instance
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleetbox_db::{Instance, InstanceStatus};

    fn row(image_id: &str, capacity: i32) -> InstanceWithMandelboxes {
        InstanceWithMandelboxes {
            instance: Instance {
                id: "i".to_owned(),
                provider: "AWS".to_owned(),
                region: "us-east-1".to_owned(),
                image_id: image_id.to_owned(),
                client_sha: "sha".to_owned(),
                ip_addr: "1.1.1.1".to_owned(),
                instance_type: "g4dn.2xlarge".to_owned(),
                remaining_capacity: capacity,
                status: InstanceStatus::Active,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            mandelboxes: vec![],
        }
    }

    #[test]
    fn capacity_is_bounded_by_gpus_and_vcpus() {
        // One GPU, 8 vCPUs: the vCPU bound (2) is the tighter one.
        assert_eq!(instance_capacity("g4dn.2xlarge"), Some(2));
        // One GPU, 4 vCPUs: vCPU bound is 1.
        assert_eq!(instance_capacity("g4dn.xlarge"), Some(1));
        // Four GPUs, 48 vCPUs: both bounds give 12.
        assert_eq!(instance_capacity("g4dn.12xlarge"), Some(12));
        // One GPU, 64 vCPUs: GPU bound wins.
        assert_eq!(instance_capacity("g4dn.16xlarge"), Some(3));
        assert_eq!(instance_capacity("m5.large"), None);
    }

    #[test]
    fn regional_capacity_only_counts_current_image() {
        let active = vec![row("img-A", 2), row("img-A", 1), row("img-old", 4)];
        let starting = vec![row("img-A", 2), row("img-old", 2)];
        assert_eq!(real_capacity("img-A", &active), 3);
        assert_eq!(expected_capacity("img-A", &active, &starting), 5);
    }

    #[test]
    fn instance_count_rounds_up() {
        assert_eq!(instances_for_capacity(1, "g4dn.2xlarge"), 1);
        assert_eq!(instances_for_capacity(2, "g4dn.2xlarge"), 1);
        assert_eq!(instances_for_capacity(3, "g4dn.2xlarge"), 2);
    }
}
