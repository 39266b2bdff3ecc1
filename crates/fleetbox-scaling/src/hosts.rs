//! The cloud host abstraction.
//!
//! The controller never talks to a cloud SDK directly; it programs against
//! [`HostHandler`]. Concrete providers implement the trait; the workspace
//! ships [`RetryingHost`], which wraps any provider with the bounded-retry
//! policy for launches, and tests use a deterministic in-memory host.

use std::time::Duration;

use async_trait::async_trait;
use fleetbox_core::retry;
use fleetbox_error::Result;
use fleetbox_db::{Image, Instance};
use tokio_util::sync::CancellationToken;

use crate::config::{MAX_RETRY_ATTEMPTS, WAIT_TIME_BEFORE_RETRY};

/// Provider-abstract instance lifecycle operations.
///
/// Every call is bounded by the caller's cancellation token; waits take an
/// explicit deadline on top.
#[async_trait]
pub trait HostHandler: Send + Sync {
    /// Prepares the provider for a region (credentials, network lookups).
    async fn initialize(&mut self, region: &str) -> Result<()>;

    /// Launches `count` instances from `image`, returning their rows with
    /// status `PRE_CONNECTION`.
    async fn spin_up_instances(
        &self,
        cancel: &CancellationToken,
        count: i32,
        image: &Image,
    ) -> Result<Vec<Instance>>;

    /// Terminates the given instances.
    async fn spin_down_instances(&self, instance_ids: &[String]) -> Result<()>;

    /// Waits until every given instance is running and passing checks.
    async fn wait_for_instance_ready(
        &self,
        instance_ids: &[String],
        deadline: Duration,
    ) -> Result<()>;

    /// Waits until every given instance is terminated.
    async fn wait_for_instance_termination(
        &self,
        instance_ids: &[String],
        deadline: Duration,
    ) -> Result<()>;
}

/// Wraps a provider with the launch retry policy: up to
/// [`MAX_RETRY_ATTEMPTS`] attempts spaced [`WAIT_TIME_BEFORE_RETRY`] apart.
pub struct RetryingHost<H> {
    inner: H,
}

impl<H: HostHandler> RetryingHost<H> {
    /// Wraps a provider.
    #[must_use]
    pub fn new(inner: H) -> Self {
        Self { inner }
    }

    /// The wrapped provider.
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: HostHandler> HostHandler for RetryingHost<H> {
    async fn initialize(&mut self, region: &str) -> Result<()> {
        self.inner.initialize(region).await
    }

    async fn spin_up_instances(
        &self,
        cancel: &CancellationToken,
        count: i32,
        image: &Image,
    ) -> Result<Vec<Instance>> {
        retry::with_spacing(MAX_RETRY_ATTEMPTS, WAIT_TIME_BEFORE_RETRY, cancel, || {
            self.inner.spin_up_instances(cancel, count, image)
        })
        .await
    }

    async fn spin_down_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.inner.spin_down_instances(instance_ids).await
    }

    async fn wait_for_instance_ready(
        &self,
        instance_ids: &[String],
        deadline: Duration,
    ) -> Result<()> {
        self.inner
            .wait_for_instance_ready(instance_ids, deadline)
            .await
    }

    async fn wait_for_instance_termination(
        &self,
        instance_ids: &[String],
        deadline: Duration,
    ) -> Result<()> {
        self.inner
            .wait_for_instance_termination(instance_ids, deadline)
            .await
    }
}
