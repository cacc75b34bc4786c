//! Domain Models - Volumes, snapshots and their creation options

use crate::error::{Error, Result};
use crate::util::gib_to_bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Limits and Tag Keys
// =============================================================================

/// Lower bound for provisioned IOPS on io1/io2
pub const MIN_TOTAL_IOPS: i64 = 100;

/// Upper bound for provisioned IOPS on io1/io2
pub const MAX_TOTAL_IOPS: i64 = 20000;

/// Tag carrying the user-chosen volume name
pub const VOLUME_NAME_TAG_KEY: &str = "CSIVolumeName";

/// Tag carrying the user-chosen snapshot name
pub const SNAPSHOT_NAME_TAG_KEY: &str = "CSIVolumeSnapshotName";

/// Snapshot state that marks it ready to use
pub const SNAPSHOT_STATE_COMPLETED: &str = "completed";

// =============================================================================
// Volume Type
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// Provisioned IOPS SSD
    Io1,
    /// Provisioned IOPS SSD, higher durability
    Io2,
    /// General purpose SSD
    #[default]
    Gp2,
    /// Throughput optimized HDD
    St2,
    /// Previous generation magnetic
    Standard,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::Io1 => "io1",
            VolumeType::Io2 => "io2",
            VolumeType::Gp2 => "gp2",
            VolumeType::St2 => "st2",
            VolumeType::Standard => "standard",
        }
    }

    /// Whether capacity-derived IOPS are provisioned for this type
    pub fn has_provisioned_iops(&self) -> bool {
        matches!(self, VolumeType::Io1 | VolumeType::Io2)
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeType {
    type Err = Error;

    /// Empty selects the default type
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Ok(VolumeType::default()),
            "io1" => Ok(VolumeType::Io1),
            "io2" => Ok(VolumeType::Io2),
            "gp2" => Ok(VolumeType::Gp2),
            "st2" => Ok(VolumeType::St2),
            "standard" => Ok(VolumeType::Standard),
            other => Err(Error::InvalidArgument(format!(
                "invalid volume type {:?}",
                other
            ))),
        }
    }
}

/// Provisioned IOPS for `capacity_gib` at `iops_per_gb`, clamped to
/// [`MIN_TOTAL_IOPS`, `MAX_TOTAL_IOPS`]
pub fn clamp_iops(capacity_gib: i64, iops_per_gb: i64) -> i64 {
    capacity_gib
        .saturating_mul(iops_per_gb)
        .clamp(MIN_TOTAL_IOPS, MAX_TOTAL_IOPS)
}

// =============================================================================
// Disks
// =============================================================================

/// A provider block volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub volume_id: String,
    pub capacity_gib: i64,
    pub availability_zone: String,
    /// Source snapshot when restored
    pub snapshot_id: Option<String>,
}

/// Parameters for creating a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskOptions {
    pub capacity_bytes: i64,
    /// One of io1, io2, gp2, st2, standard; empty means gp2
    pub volume_type: String,
    /// Only used for io1/io2
    pub iops_per_gb: i64,
    /// Chosen by the provider listing when empty
    pub availability_zone: String,
    pub encrypted: bool,
    /// A non-empty key implies encryption
    pub kms_key_id: String,
    pub snapshot_id: String,
    pub tags: BTreeMap<String, String>,
}

impl DiskOptions {
    pub fn new(capacity_bytes: i64) -> Self {
        Self {
            capacity_bytes,
            ..Default::default()
        }
    }

    pub fn with_volume_type(mut self, volume_type: impl Into<String>) -> Self {
        self.volume_type = volume_type.into();
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = zone.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// A point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: i64,
    pub creation_time: Option<DateTime<Utc>>,
    pub ready_to_use: bool,
}

impl Snapshot {
    /// Build from provider fields; ready only in state "completed"
    pub fn from_provider(
        snapshot_id: String,
        source_volume_id: String,
        size_gib: i64,
        creation_time: Option<DateTime<Utc>>,
        state: Option<&str>,
    ) -> Self {
        Self {
            snapshot_id,
            source_volume_id,
            size_bytes: gib_to_bytes(size_gib),
            creation_time,
            ready_to_use: state == Some(SNAPSHOT_STATE_COMPLETED),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOptions {
    pub tags: BTreeMap<String, String>,
}

impl SnapshotOptions {
    /// Options carrying the snapshot name tag
    pub fn named(name: impl Into<String>) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(SNAPSHOT_NAME_TAG_KEY.to_string(), name.into());
        Self { tags }
    }
}

/// One page of snapshots; an empty `next_token` marks the last page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    pub snapshots: Vec<Snapshot>,
    pub next_token: String,
}

// =============================================================================
// Outcomes and States
// =============================================================================

/// Result of an idempotent removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The provider performed the request
    Completed,
    /// The resource was already gone
    NotFound,
}

impl Outcome {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Outcome::NotFound)
    }
}

/// Provider-reported attachment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
    Busy,
}

impl AttachmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentState::Attaching => "attaching",
            AttachmentState::Attached => "attached",
            AttachmentState::Detaching => "detaching",
            AttachmentState::Detached => "detached",
            AttachmentState::Busy => "busy",
        }
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "attaching" => Ok(AttachmentState::Attaching),
            "attached" => Ok(AttachmentState::Attached),
            "detaching" => Ok(AttachmentState::Detaching),
            "detached" => Ok(AttachmentState::Detached),
            "busy" => Ok(AttachmentState::Busy),
            other => Err(Error::InvalidArgument(format!(
                "invalid attachment state {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::GIB;
    use assert_matches::assert_matches;

    #[test]
    fn test_volume_type_parsing() {
        assert_eq!("".parse::<VolumeType>().unwrap(), VolumeType::Gp2);
        assert_eq!("io2".parse::<VolumeType>().unwrap(), VolumeType::Io2);
        assert_eq!("standard".parse::<VolumeType>().unwrap(), VolumeType::Standard);

        for bad in ["GP2", "gp3", "io9", " ", "sc1"] {
            assert_matches!(bad.parse::<VolumeType>(), Err(Error::InvalidArgument(_)), "{}", bad);
        }
    }

    #[test]
    fn test_clamp_iops() {
        assert_eq!(clamp_iops(10, 5), MIN_TOTAL_IOPS);
        assert_eq!(clamp_iops(100, 50), 5000);
        assert_eq!(clamp_iops(1000, 50), MAX_TOTAL_IOPS);
        assert_eq!(clamp_iops(0, 50), MIN_TOTAL_IOPS);
        assert_eq!(clamp_iops(i64::MAX, i64::MAX), MAX_TOTAL_IOPS);
        assert_eq!(clamp_iops(i64::MAX, -2), MIN_TOTAL_IOPS);
    }

    #[test]
    fn test_clamp_iops_grid_stays_in_bounds() {
        for capacity in [0, 1, 4, 20, 400, 16384, i64::MAX / 2] {
            for rate in [0, 1, 3, 50, 500, i64::MAX] {
                let iops = clamp_iops(capacity, rate);
                assert!((MIN_TOTAL_IOPS..=MAX_TOTAL_IOPS).contains(&iops));
            }
        }
    }

    #[test]
    fn test_snapshot_readiness() {
        let ready = Snapshot::from_provider("snap-1".into(), "vol-1".into(), 8, None, Some("completed"));
        assert!(ready.ready_to_use);
        assert_eq!(ready.size_bytes, 8 * GIB);

        for state in [Some("pending"), Some("error"), Some("COMPLETED"), None] {
            let snapshot = Snapshot::from_provider("snap-1".into(), "vol-1".into(), 8, None, state);
            assert!(!snapshot.ready_to_use);
        }
    }

    #[test]
    fn test_snapshot_options_named() {
        let options = SnapshotOptions::named("snap-a");
        assert_eq!(
            options.tags.get(SNAPSHOT_NAME_TAG_KEY).map(String::as_str),
            Some("snap-a")
        );
    }

    #[test]
    fn test_attachment_state_round_trip() {
        for state in [
            AttachmentState::Attaching,
            AttachmentState::Attached,
            AttachmentState::Detaching,
            AttachmentState::Detached,
            AttachmentState::Busy,
        ] {
            assert_eq!(state.as_str().parse::<AttachmentState>().unwrap(), state);
        }
        assert_eq!(AttachmentState::Detached.to_string(), "detached");
        assert!("gone".parse::<AttachmentState>().is_err());
    }
}
