//! Snapshot Lifecycle Manager

use crate::context::OpContext;
use crate::domain::{ListSnapshotsResponse, Outcome, Snapshot, SnapshotOptions, SNAPSHOT_NAME_TAG_KEY};
use crate::error::{Error, Result};
use crate::provider::{
    self, collect_pages, ApiError, CreateSnapshotRequest, DescribeRequest, Ec2ApiRef, ErrorCode,
    Filter,
};
use tracing::{debug, info};

const CREATE_SNAPSHOT: &str = "CreateSnapshot";
const DELETE_SNAPSHOT: &str = "DeleteSnapshot";
const DESCRIBE_SNAPSHOTS: &str = "DescribeSnapshots";

/// Smallest page size the provider accepts
const MIN_LIST_RESULTS: i64 = 5;

pub struct SnapshotManager {
    ec2: Ec2ApiRef,
}

impl SnapshotManager {
    pub fn new(ec2: Ec2ApiRef) -> Self {
        Self { ec2 }
    }

    pub async fn create(&self, ctx: &OpContext, volume_id: &str, options: SnapshotOptions) -> Result<Snapshot> {
        info!("Creating snapshot of volume {}", volume_id);

        let request = CreateSnapshotRequest {
            volume_id: volume_id.to_string(),
            description: format!("Created by EBS CSI driver for volume {}", volume_id),
            tags: options.tags,
        };

        let snapshot = ctx
            .run(CREATE_SNAPSHOT, self.ec2.create_snapshot(request))
            .await?
            .map_err(|e| {
                if e.is(ErrorCode::VolumeNotFound) {
                    Error::not_found("volume", volume_id)
                } else {
                    e.into_error(CREATE_SNAPSHOT, volume_id)
                }
            })?
            .ok_or_else(|| Error::malformed(CREATE_SNAPSHOT, "empty response"))?;

        let snapshot = to_snapshot(snapshot, CREATE_SNAPSHOT)?;
        info!("Snapshot {} of volume {} created", snapshot.snapshot_id, volume_id);
        Ok(snapshot)
    }

    /// Delete a snapshot; a missing one is reported as [`Outcome::NotFound`]
    pub async fn delete(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Outcome> {
        info!("Deleting snapshot {}", snapshot_id);

        match ctx.run(DELETE_SNAPSHOT, self.ec2.delete_snapshot(snapshot_id)).await? {
            Ok(()) => Ok(Outcome::Completed),
            Err(e) if e.is(ErrorCode::SnapshotNotFound) => {
                debug!("Snapshot {} already deleted", snapshot_id);
                Ok(Outcome::NotFound)
            }
            Err(e) => Err(e.into_error(DELETE_SNAPSHOT, snapshot_id)),
        }
    }

    pub async fn find_by_name(&self, ctx: &OpContext, name: &str) -> Result<Snapshot> {
        let request = DescribeRequest::by_filter(Filter::tag(SNAPSHOT_NAME_TAG_KEY, name));
        self.describe_one(ctx, request, name).await
    }

    pub async fn find_by_id(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Snapshot> {
        self.describe_one(ctx, DescribeRequest::by_id(snapshot_id), snapshot_id)
            .await
    }

    /// One page of snapshots. A `max_results` of 0 leaves the page size to
    /// the provider; 1 to 4 are rejected.
    pub async fn list(
        &self,
        ctx: &OpContext,
        volume_id: Option<&str>,
        max_results: i64,
        next_token: Option<&str>,
    ) -> Result<ListSnapshotsResponse> {
        if max_results < 0 || (max_results > 0 && max_results < MIN_LIST_RESULTS) {
            return Err(Error::InvalidArgument(format!(
                "max results must be 0 or at least {}, got {}",
                MIN_LIST_RESULTS, max_results
            )));
        }

        let mut request = DescribeRequest {
            max_results: (max_results > 0).then_some(max_results),
            next_token: next_token.filter(|t| !t.is_empty()).map(str::to_string),
            ..Default::default()
        };
        if let Some(volume_id) = volume_id.filter(|v| !v.is_empty()) {
            request.filters.push(Filter::new("volume-id", volume_id));
        }

        let page = ctx
            .run(DESCRIBE_SNAPSHOTS, self.ec2.describe_snapshots(request))
            .await?
            .map_err(|e| e.into_error(DESCRIBE_SNAPSHOTS, volume_id.unwrap_or("all")))?;

        if page.items.is_empty() {
            return Err(Error::not_found("snapshot", volume_id.unwrap_or("any")));
        }

        let snapshots = page
            .items
            .into_iter()
            .map(|s| to_snapshot(s, DESCRIBE_SNAPSHOTS))
            .collect::<Result<Vec<_>>>()?;

        debug!("Listed {} snapshots", snapshots.len());
        Ok(ListSnapshotsResponse {
            snapshots,
            next_token: page.next_token.unwrap_or_default(),
        })
    }

    async fn describe_one(&self, ctx: &OpContext, request: DescribeRequest, key: &str) -> Result<Snapshot> {
        let ec2 = &self.ec2;
        let mut snapshots = ctx
            .run(
                DESCRIBE_SNAPSHOTS,
                collect_pages(request, move |page| ec2.describe_snapshots(page)),
            )
            .await?
            .map_err(|e| snapshot_error(e, DESCRIBE_SNAPSHOTS, key))?;

        match snapshots.len() {
            0 => Err(Error::not_found("snapshot", key)),
            1 => to_snapshot(snapshots.remove(0), DESCRIBE_SNAPSHOTS),
            count => Err(Error::MultipleFound {
                kind: "snapshot",
                key: key.to_string(),
                count,
            }),
        }
    }
}

fn snapshot_error(e: ApiError, operation: &str, key: &str) -> Error {
    if e.is(ErrorCode::SnapshotNotFound) {
        Error::not_found("snapshot", key)
    } else {
        e.into_error(operation, key)
    }
}

fn to_snapshot(snapshot: provider::Snapshot, operation: &str) -> Result<Snapshot> {
    let snapshot_id = snapshot
        .snapshot_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::malformed(operation, "snapshot ID was not returned"))?;

    Ok(Snapshot::from_provider(
        snapshot_id,
        snapshot.volume_id.unwrap_or_default(),
        snapshot.volume_size_gib.unwrap_or(0),
        snapshot.start_time,
        snapshot.state.as_deref(),
    ))
}
