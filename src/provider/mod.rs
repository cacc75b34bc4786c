//! Provider Transport
//!
//! The [`Ec2Api`] port is the only way the cloud layer talks to the block
//! storage provider. Adapters implement it:
//! - [`http::Ec2Client`]: EC2 query protocol over HTTPS
//! - [`fake::FakeEc2`]: in-memory, eventually-consistent simulation for tests

pub mod errors;
pub mod fake;
pub mod http;
pub mod paginate;
mod xml;

pub use errors::*;
pub use fake::FakeEc2;
pub use http::Ec2Client;
pub use paginate::collect_pages;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Request Types
// =============================================================================

/// Name/values filter applied by describe calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }

    /// Filter on a tag value, e.g. `tag:CSIVolumeName`
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{}", key), value)
    }
}

/// Shared shape of every describe request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescribeRequest {
    /// Exact resource IDs
    pub ids: Vec<String>,
    /// Filters, AND-ed by the provider
    pub filters: Vec<Filter>,
    /// Page size; `None` leaves it to the provider
    pub max_results: Option<i64>,
    /// Continuation token from the previous page
    pub next_token: Option<String>,
}

impl DescribeRequest {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            ..Default::default()
        }
    }

    pub fn by_filter(filter: Filter) -> Self {
        Self {
            filters: vec![filter],
            ..Default::default()
        }
    }
}

/// One page of a describe call
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Empty or absent when this is the last page
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub availability_zone: String,
    pub size_gib: i64,
    pub volume_type: String,
    pub iops: Option<i64>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachVolumeRequest {
    pub instance_id: String,
    pub volume_id: String,
    /// Device name to expose the volume under; the provider picks when absent
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachVolumeRequest {
    pub instance_id: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub volume_id: String,
    pub description: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyVolumeRequest {
    pub volume_id: String,
    pub size_gib: i64,
}

// =============================================================================
// Response Types
// =============================================================================
//
// Every field the provider may omit is optional; the cloud layer decides
// which omissions are protocol violations.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Volume {
    pub volume_id: Option<String>,
    pub size_gib: Option<i64>,
    pub availability_zone: Option<String>,
    pub snapshot_id: Option<String>,
    pub state: Option<String>,
    pub attachments: Vec<VolumeAttachment>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeAttachment {
    pub volume_id: Option<String>,
    pub instance_id: Option<String>,
    pub device: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instance {
    pub instance_id: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDeviceMapping {
    pub device_name: Option<String>,
    pub volume_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: Option<String>,
    pub volume_id: Option<String>,
    pub volume_size_gib: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub state: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeModification {
    pub volume_id: Option<String>,
    pub modification_state: Option<String>,
    pub target_size_gib: Option<i64>,
    pub original_size_gib: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AvailabilityZone {
    pub zone_name: Option<String>,
    pub state: Option<String>,
}

// =============================================================================
// Transport Port
// =============================================================================

/// Port for the provider's volume, instance and snapshot API
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_volumes(&self, request: DescribeRequest) -> ApiResult<Page<Volume>>;

    async fn create_volume(&self, request: CreateVolumeRequest) -> ApiResult<Volume>;

    async fn delete_volume(&self, volume_id: &str) -> ApiResult<()>;

    async fn attach_volume(&self, request: AttachVolumeRequest) -> ApiResult<VolumeAttachment>;

    async fn detach_volume(&self, request: DetachVolumeRequest) -> ApiResult<VolumeAttachment>;

    async fn describe_instances(&self, request: DescribeRequest) -> ApiResult<Page<Instance>>;

    /// `Ok(None)` when the provider answered without a snapshot object
    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> ApiResult<Option<Snapshot>>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> ApiResult<()>;

    async fn describe_snapshots(&self, request: DescribeRequest) -> ApiResult<Page<Snapshot>>;

    /// `Ok(None)` when the provider answered without a modification record
    async fn modify_volume(
        &self,
        request: ModifyVolumeRequest,
    ) -> ApiResult<Option<VolumeModification>>;

    /// Modification records for a volume, oldest first
    async fn describe_volumes_modifications(
        &self,
        volume_id: &str,
    ) -> ApiResult<Vec<VolumeModification>>;

    async fn describe_availability_zones(&self) -> ApiResult<Vec<AvailabilityZone>>;
}

pub type Ec2ApiRef = Arc<dyn Ec2Api>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_filter_name() {
        let filter = Filter::tag("CSIVolumeName", "pvc-1");
        assert_eq!(filter.name, "tag:CSIVolumeName");
        assert_eq!(filter.values, vec!["pvc-1".to_string()]);
    }

    #[test]
    fn test_describe_by_id() {
        let request = DescribeRequest::by_id("vol-1");
        assert_eq!(request.ids, vec!["vol-1".to_string()]);
        assert!(request.filters.is_empty());
        assert!(request.next_token.is_none());
    }
}
