//! Domain Ports - The cloud facade consumed by controller and node services
//!
//! Every operation takes an [`OpContext`] first; cancelling it or passing its
//! deadline ends the operation with `Cancelled`/`DeadlineExceeded`.

use super::models::{
    AttachmentState, Disk, DiskOptions, ListSnapshotsResponse, Outcome, Snapshot, SnapshotOptions,
};
use crate::context::OpContext;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Cloud Port
// =============================================================================

/// Port for volume, attachment and snapshot operations
#[async_trait]
pub trait Cloud: Send + Sync {
    /// Create a volume and wait until it is available. Always issues a new
    /// create; look the name up first for idempotency.
    async fn create_disk(&self, ctx: &OpContext, name: &str, options: DiskOptions) -> Result<Disk>;

    /// Delete a volume; an already deleted volume yields [`Outcome::NotFound`]
    async fn delete_disk(&self, ctx: &OpContext, volume_id: &str) -> Result<Outcome>;

    /// Attach a volume and return its device path
    async fn attach_disk(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<String>;

    /// Detach a volume; a volume not attached yields [`Outcome::NotFound`]
    async fn detach_disk(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<Outcome>;

    /// Grow a volume to at least `new_size_bytes`; returns the size in GiB
    async fn resize_disk(&self, ctx: &OpContext, volume_id: &str, new_size_bytes: i64) -> Result<i64>;

    /// Wait until an attachment of the volume reports `state`
    async fn wait_for_attachment_state(
        &self,
        ctx: &OpContext,
        volume_id: &str,
        state: AttachmentState,
    ) -> Result<()>;

    /// Volume carrying the name tag, which must have the given capacity
    async fn get_disk_by_name(&self, ctx: &OpContext, name: &str, capacity_bytes: i64) -> Result<Disk>;

    async fn get_disk_by_id(&self, ctx: &OpContext, volume_id: &str) -> Result<Disk>;

    async fn instance_exists(&self, ctx: &OpContext, node_id: &str) -> Result<bool>;

    async fn create_snapshot(
        &self,
        ctx: &OpContext,
        volume_id: &str,
        options: SnapshotOptions,
    ) -> Result<Snapshot>;

    /// Delete a snapshot; an already deleted one yields [`Outcome::NotFound`]
    async fn delete_snapshot(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Outcome>;

    async fn get_snapshot_by_name(&self, ctx: &OpContext, name: &str) -> Result<Snapshot>;

    async fn get_snapshot_by_id(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Snapshot>;

    /// One page of snapshots, optionally of a single source volume.
    /// `max_results` of 0 leaves the page size to the provider.
    async fn list_snapshots(
        &self,
        ctx: &OpContext,
        volume_id: Option<&str>,
        max_results: i64,
        next_token: Option<&str>,
    ) -> Result<ListSnapshotsResponse>;
}

pub type CloudRef = Arc<dyn Cloud>;
