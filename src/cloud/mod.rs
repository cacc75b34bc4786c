//! Cloud Facade Implementations
//!
//! [`Ec2Cloud`] composes the volume, attachment and snapshot managers over
//! any [`Ec2Api`](crate::provider::Ec2Api) transport. [`FakeCloud`] is an
//! in-memory stand-in for tests of facade consumers.

pub mod attachments;
pub mod fake;
pub mod snapshots;
pub mod volumes;

pub use attachments::AttachmentOrchestrator;
pub use fake::FakeCloud;
pub use snapshots::SnapshotManager;
pub use volumes::VolumeManager;

use crate::config::CloudConfig;
use crate::context::OpContext;
use crate::device::{DeviceAllocatorRef, DeviceManager};
use crate::domain::{
    AttachmentState, Cloud, Disk, DiskOptions, ListSnapshotsResponse, Outcome, Snapshot,
    SnapshotOptions,
};
use crate::error::Result;
use crate::metrics::ApiMetrics;
use crate::provider::{Ec2ApiRef, Ec2Client};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Cloud facade over a provider transport
pub struct Ec2Cloud {
    region: String,
    volumes: VolumeManager,
    attachments: AttachmentOrchestrator,
    snapshots: SnapshotManager,
}

impl Ec2Cloud {
    /// Build the HTTP transport from `config`. Fails on a malformed endpoint
    /// override instead of on first use.
    pub fn new(config: &CloudConfig, metrics: Arc<ApiMetrics>) -> Result<Self> {
        let client = Ec2Client::new(config, metrics)?;
        info!(
            "EC2 cloud for region {} using endpoint {}",
            config.region,
            client.endpoint()
        );
        Ok(Self::with_transport(
            config.region.clone(),
            Arc::new(client),
            Arc::new(DeviceManager::new()),
        ))
    }

    pub fn with_transport(region: impl Into<String>, ec2: Ec2ApiRef, devices: DeviceAllocatorRef) -> Self {
        Self {
            region: region.into(),
            volumes: VolumeManager::new(ec2.clone()),
            attachments: AttachmentOrchestrator::new(ec2.clone(), devices),
            snapshots: SnapshotManager::new(ec2),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl Cloud for Ec2Cloud {
    async fn create_disk(&self, ctx: &OpContext, name: &str, options: DiskOptions) -> Result<Disk> {
        self.volumes.create(ctx, name, options).await
    }

    async fn delete_disk(&self, ctx: &OpContext, volume_id: &str) -> Result<Outcome> {
        self.volumes.delete(ctx, volume_id).await
    }

    async fn attach_disk(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<String> {
        self.attachments.attach(ctx, volume_id, node_id).await
    }

    async fn detach_disk(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<Outcome> {
        self.attachments.detach(ctx, volume_id, node_id).await
    }

    async fn resize_disk(&self, ctx: &OpContext, volume_id: &str, new_size_bytes: i64) -> Result<i64> {
        self.volumes.resize(ctx, volume_id, new_size_bytes).await
    }

    async fn wait_for_attachment_state(
        &self,
        ctx: &OpContext,
        volume_id: &str,
        state: AttachmentState,
    ) -> Result<()> {
        self.attachments.wait_for_state(ctx, volume_id, state).await
    }

    async fn get_disk_by_name(&self, ctx: &OpContext, name: &str, capacity_bytes: i64) -> Result<Disk> {
        self.volumes.find_by_name(ctx, name, capacity_bytes).await
    }

    async fn get_disk_by_id(&self, ctx: &OpContext, volume_id: &str) -> Result<Disk> {
        self.volumes.find_by_id(ctx, volume_id).await
    }

    async fn instance_exists(&self, ctx: &OpContext, node_id: &str) -> Result<bool> {
        self.attachments.instance_exists(ctx, node_id).await
    }

    async fn create_snapshot(
        &self,
        ctx: &OpContext,
        volume_id: &str,
        options: SnapshotOptions,
    ) -> Result<Snapshot> {
        self.snapshots.create(ctx, volume_id, options).await
    }

    async fn delete_snapshot(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Outcome> {
        self.snapshots.delete(ctx, snapshot_id).await
    }

    async fn get_snapshot_by_name(&self, ctx: &OpContext, name: &str) -> Result<Snapshot> {
        self.snapshots.find_by_name(ctx, name).await
    }

    async fn get_snapshot_by_id(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshots.find_by_id(ctx, snapshot_id).await
    }

    async fn list_snapshots(
        &self,
        ctx: &OpContext,
        volume_id: Option<&str>,
        max_results: i64,
        next_token: Option<&str>,
    ) -> Result<ListSnapshotsResponse> {
        self.snapshots
            .list(ctx, volume_id, max_results, next_token)
            .await
    }
}
