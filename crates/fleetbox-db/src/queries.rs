//! GraphQL documents the services send to the datastore.
//!
//! Hand-written, kept next to each other so the schema surface is auditable
//! in one place. Instance rows live in `fleet_instances`, mandelbox rows in
//! `fleet_mandelboxes` (cascade-deleted with their instance), image rows in
//! `fleet_images`, and the config datastore exposes `config_frontend_version`
//! and per-environment `config_values`.

/// Fields selected for every instance row.
pub const INSTANCE_FIELDS: &str = "id provider region image_id client_sha ip_addr \
     instance_type remaining_capacity status created_at updated_at";

/// Fields selected for every mandelbox row.
pub const MANDELBOX_FIELDS: &str =
    "id app instance_id user_id session_id status created_at updated_at";

/// One instance row by primary key.
pub const FIND_INSTANCE_BY_ID: &str = r"
query FindInstanceById($id: String!) {
  fleet_instances(where: {id: {_eq: $id}}) {
    id provider region image_id client_sha ip_addr
    instance_type remaining_capacity status created_at updated_at
  }
}";

/// One instance row with its mandelboxes.
pub const FIND_INSTANCE_WITH_MANDELBOXES: &str = r"
query FindInstanceWithMandelboxes($id: String!) {
  fleet_instances(where: {id: {_eq: $id}}) {
    id provider region image_id client_sha ip_addr
    instance_type remaining_capacity status created_at updated_at
    mandelboxes { id app instance_id user_id session_id status created_at updated_at }
  }
}";

/// Instances with a given status in a region, with their mandelboxes.
pub const INSTANCES_BY_STATUS_IN_REGION: &str = r"
query InstancesByStatusInRegion($status: String!, $region: String!) {
  fleet_instances(where: {status: {_eq: $status}, region: {_eq: $region}}) {
    id provider region image_id client_sha ip_addr
    instance_type remaining_capacity status created_at updated_at
    mandelboxes { id app instance_id user_id session_id status created_at updated_at }
  }
}";

/// All ACTIVE instances across regions (assignment fallback).
pub const ACTIVE_INSTANCES: &str = r#"
query ActiveInstances {
  fleet_instances(where: {status: {_eq: "ACTIVE"}}) {
    id provider region image_id client_sha ip_addr
    instance_type remaining_capacity status created_at updated_at
    mandelboxes { id app instance_id user_id session_id status created_at updated_at }
  }
}"#;

/// Take-over update: flips the pre-created row to ACTIVE. Guarded on the
/// status so a concurrent drain loses no information.
pub const REGISTER_INSTANCE: &str = r#"
mutation RegisterInstance($id: String!, $ip_addr: String!, $client_sha: String!,
                          $remaining_capacity: Int!, $updated_at: timestamptz!) {
  update_fleet_instances(
    where: {id: {_eq: $id}, status: {_eq: "PRE_CONNECTION"}},
    _set: {status: "ACTIVE", ip_addr: $ip_addr, client_sha: $client_sha,
           remaining_capacity: $remaining_capacity, updated_at: $updated_at}
  ) { affected_rows }
}"#;

/// Heartbeat write: bumps `updated_at` and the metrics snapshot.
pub const WRITE_HEARTBEAT: &str = r"
mutation WriteHeartbeat($id: String!, $updated_at: timestamptz!, $metrics: jsonb!) {
  update_fleet_instances(
    where: {id: {_eq: $id}},
    _set: {updated_at: $updated_at, metrics: $metrics}
  ) { affected_rows }
}";

/// Sets one instance's status.
pub const WRITE_INSTANCE_STATUS: &str = r"
mutation WriteInstanceStatus($id: String!, $status: String!, $updated_at: timestamptz!) {
  update_fleet_instances(
    where: {id: {_eq: $id}},
    _set: {status: $status, updated_at: $updated_at}
  ) { affected_rows }
}";

/// Deletes one instance row; mandelbox rows cascade.
pub const DELETE_INSTANCE: &str = r"
mutation DeleteInstance($id: String!) {
  delete_fleet_instances(where: {id: {_eq: $id}}) { affected_rows }
}";

/// Bulk insert of freshly launched instances.
pub const INSERT_INSTANCES: &str = r"
mutation InsertInstances($objects: [fleet_instances_insert_input!]!) {
  insert_fleet_instances(objects: $objects) { affected_rows }
}";

/// Inserts one mandelbox row.
pub const INSERT_MANDELBOX: &str = r"
mutation InsertMandelbox($object: fleet_mandelboxes_insert_input!) {
  insert_fleet_mandelboxes_one(object: $object) { id }
}";

/// Sets one mandelbox row's status.
pub const WRITE_MANDELBOX_STATUS: &str = r"
mutation WriteMandelboxStatus($id: uuid!, $status: String!, $updated_at: timestamptz!) {
  update_fleet_mandelboxes(
    where: {id: {_eq: $id}},
    _set: {status: $status, updated_at: $updated_at}
  ) { affected_rows }
}";

/// Deletes one mandelbox row.
pub const DELETE_MANDELBOX: &str = r"
mutation DeleteMandelbox($id: uuid!) {
  delete_fleet_mandelboxes(where: {id: {_eq: $id}}) { affected_rows }
}";

/// Deletes rows stuck in ALLOCATED or CONNECTING past their deadline.
pub const REMOVE_STALE_MANDELBOXES: &str = r#"
mutation RemoveStaleMandelboxes($allocated_before: timestamptz!, $connecting_before: timestamptz!) {
  delete_fleet_mandelboxes(where: {_or: [
    {status: {_eq: "ALLOCATED"}, updated_at: {_lt: $allocated_before}},
    {status: {_eq: "CONNECTING"}, updated_at: {_lt: $connecting_before}}
  ]}) { affected_rows }
}"#;

/// All mandelbox rows for one user.
pub const USER_MANDELBOXES: &str = r"
query UserMandelboxes($user_id: String!) {
  fleet_mandelboxes(where: {user_id: {_eq: $user_id}}) {
    id app instance_id user_id session_id status created_at updated_at
  }
}";

/// Allocation: inserts the ALLOCATED row and decrements the instance's
/// capacity in one request (Hasura runs both in one transaction).
pub const ALLOCATE_MANDELBOX: &str = r"
mutation AllocateMandelbox($object: fleet_mandelboxes_insert_input!, $instance_id: String!) {
  insert_fleet_mandelboxes_one(object: $object) { id }
  update_fleet_instances(
    where: {id: {_eq: $instance_id}, remaining_capacity: {_gt: 0}},
    _inc: {remaining_capacity: -1}
  ) { affected_rows }
}";

/// The image rolled out in one region.
pub const FIND_IMAGE: &str = r"
query FindImage($provider: String!, $region: String!) {
  fleet_images(where: {provider: {_eq: $provider}, region: {_eq: $region}}) {
    provider region image_id client_sha updated_at
  }
}";

/// Inserts the regional image row.
pub const INSERT_IMAGE: &str = r"
mutation InsertImage($object: fleet_images_insert_input!) {
  insert_fleet_images(objects: [$object]) { affected_rows }
}";

/// Swings the regional image row to a new image.
pub const UPDATE_IMAGE: &str = r"
mutation UpdateImage($provider: String!, $region: String!, $image_id: String!,
                     $client_sha: String!, $updated_at: timestamptz!) {
  update_fleet_images(
    where: {provider: {_eq: $provider}, region: {_eq: $region}},
    _set: {image_id: $image_id, client_sha: $client_sha, updated_at: $updated_at}
  ) { affected_rows }
}";

/// The minimum accepted frontend version.
pub const FRONTEND_VERSION: &str = r"
query FrontendVersion {
  config_frontend_version { major minor micro }
}";

/// Per-environment free-form configuration.
pub const CONFIG_VALUES: &str = r"
query ConfigValues($environment: String!) {
  config_values(where: {environment: {_eq: $environment}}) { key value }
}";

// Subscription documents (graphql-ws).

/// This instance entering a given status (the host agent watches its own id
/// for DRAINING).
pub const SUB_INSTANCE_BY_ID_WITH_STATUS: &str = r"
subscription InstanceByIdWithStatus($id: String!, $status: String!) {
  fleet_instances(where: {id: {_eq: $id}, status: {_eq: $status}}) {
    id provider region image_id client_sha ip_addr
    instance_type remaining_capacity status created_at updated_at
  }
}";

/// Any instance entering a given status (the scaler watches DRAINING).
pub const SUB_INSTANCES_BY_STATUS: &str = r"
subscription InstancesByStatus($status: String!) {
  fleet_instances(where: {status: {_eq: $status}}) {
    id provider region image_id client_sha ip_addr
    instance_type remaining_capacity status created_at updated_at
  }
}";

/// Mandelboxes on this instance entering a given status (the host agent
/// watches ALLOCATED).
pub const SUB_MANDELBOXES_BY_INSTANCE_ID: &str = r"
subscription MandelboxesByInstanceId($instance_id: String!, $status: String!) {
  fleet_mandelboxes(where: {instance_id: {_eq: $instance_id}, status: {_eq: $status}}) {
    id app instance_id user_id session_id status created_at updated_at
  }
}";

/// The frontend version row (the scaler watches rollouts).
pub const SUB_FRONTEND_VERSION: &str = r"
subscription FrontendVersion {
  config_frontend_version { major minor micro }
}";
