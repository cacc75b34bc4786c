//! Volume Lifecycle Manager
//!
//! Create, delete, look up and resize volumes. Name lookups go through the
//! `CSIVolumeName` tag; every lookup drains all pages before deciding.

use crate::context::OpContext;
use crate::domain::{clamp_iops, Disk, DiskOptions, Outcome, VolumeType, VOLUME_NAME_TAG_KEY};
use crate::error::{Error, Result};
use crate::provider::{
    collect_pages, ApiError, CreateVolumeRequest, DescribeRequest, Ec2ApiRef, ErrorCode, Filter,
    ModifyVolumeRequest, Volume, VolumeModification,
};
use crate::util::{bytes_to_gib, round_up_gib};
use crate::wait::{poll, MODIFICATION_BACKOFF, VOLUME_AVAILABLE_POLL};
use tracing::{debug, info, warn};

const CREATE_VOLUME: &str = "CreateVolume";
const DELETE_VOLUME: &str = "DeleteVolume";
const DESCRIBE_VOLUMES: &str = "DescribeVolumes";
const MODIFY_VOLUME: &str = "ModifyVolume";
const DESCRIBE_MODIFICATIONS: &str = "DescribeVolumesModifications";
const DESCRIBE_ZONES: &str = "DescribeAvailabilityZones";

const VOLUME_STATE_AVAILABLE: &str = "available";
const MODIFICATION_COMPLETED: &str = "completed";
const MODIFICATION_OPTIMIZING: &str = "optimizing";
const MODIFICATION_FAILED: &str = "failed";

pub struct VolumeManager {
    ec2: Ec2ApiRef,
}

impl VolumeManager {
    pub fn new(ec2: Ec2ApiRef) -> Self {
        Self { ec2 }
    }

    // =========================================================================
    // Create / Delete
    // =========================================================================

    /// Create a volume and wait for it to become available
    pub async fn create(&self, ctx: &OpContext, name: &str, options: DiskOptions) -> Result<Disk> {
        let volume_type: VolumeType = options.volume_type.parse()?;
        let capacity_gib = bytes_to_gib(options.capacity_bytes);
        let iops = volume_type
            .has_provisioned_iops()
            .then(|| clamp_iops(capacity_gib, options.iops_per_gb));

        let mut tags = options.tags;
        tags.entry(VOLUME_NAME_TAG_KEY.to_string())
            .or_insert_with(|| name.to_string());

        let zone = if options.availability_zone.is_empty() {
            let zone = self.default_zone(ctx).await?;
            debug!("No availability zone requested for {}, using {}", name, zone);
            zone
        } else {
            options.availability_zone
        };

        let kms_key_id = Some(options.kms_key_id).filter(|k| !k.is_empty());
        let snapshot_id = Some(options.snapshot_id).filter(|s| !s.is_empty());

        info!(
            "Creating volume {}: {} GiB {} in {}",
            name, capacity_gib, volume_type, zone
        );

        let request = CreateVolumeRequest {
            availability_zone: zone.clone(),
            size_gib: capacity_gib,
            volume_type: volume_type.to_string(),
            iops,
            encrypted: options.encrypted || kms_key_id.is_some(),
            kms_key_id,
            snapshot_id: snapshot_id.clone(),
            tags,
        };

        let volume = ctx
            .run(CREATE_VOLUME, self.ec2.create_volume(request))
            .await?
            .map_err(|e| {
                if e.is(ErrorCode::SnapshotNotFound) {
                    Error::not_found("snapshot", snapshot_id.clone().unwrap_or_default())
                } else {
                    e.into_error(CREATE_VOLUME, name)
                }
            })?;

        let volume_id = volume
            .volume_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::malformed(CREATE_VOLUME, "volume ID was not returned"))?;
        let size_gib = volume
            .size_gib
            .filter(|size| *size > 0)
            .ok_or_else(|| Error::malformed(CREATE_VOLUME, "volume size was not returned"))?;

        self.wait_available(ctx, &volume_id).await?;
        info!("Volume {} created as {}", name, volume_id);

        Ok(Disk {
            volume_id,
            capacity_gib: size_gib,
            availability_zone: zone,
            snapshot_id,
        })
    }

    /// Delete a volume; a missing volume is reported as [`Outcome::NotFound`]
    pub async fn delete(&self, ctx: &OpContext, volume_id: &str) -> Result<Outcome> {
        info!("Deleting volume {}", volume_id);

        match ctx.run(DELETE_VOLUME, self.ec2.delete_volume(volume_id)).await? {
            Ok(()) => Ok(Outcome::Completed),
            Err(e) if e.is(ErrorCode::VolumeNotFound) => {
                debug!("Volume {} already deleted", volume_id);
                Ok(Outcome::NotFound)
            }
            Err(e) => Err(e.into_error(DELETE_VOLUME, volume_id)),
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Volume tagged with `name`; its size must equal `capacity_bytes`
    pub async fn find_by_name(&self, ctx: &OpContext, name: &str, capacity_bytes: i64) -> Result<Disk> {
        let request = DescribeRequest::by_filter(Filter::tag(VOLUME_NAME_TAG_KEY, name));
        let volume = self.describe_one(ctx, request, name).await?;
        let disk = to_disk(volume, name)?;

        let requested_gib = bytes_to_gib(capacity_bytes);
        if disk.capacity_gib != requested_gib {
            return Err(Error::SizeConflict {
                name: name.to_string(),
                existing_gib: disk.capacity_gib,
                requested_gib,
            });
        }
        Ok(disk)
    }

    pub async fn find_by_id(&self, ctx: &OpContext, volume_id: &str) -> Result<Disk> {
        let volume = self
            .describe_one(ctx, DescribeRequest::by_id(volume_id), volume_id)
            .await?;
        to_disk(volume, volume_id)
    }

    /// Exactly one volume matching `request`; `key` names it in errors
    pub async fn describe_one(&self, ctx: &OpContext, request: DescribeRequest, key: &str) -> Result<Volume> {
        let ec2 = &self.ec2;
        let mut volumes = ctx
            .run(
                DESCRIBE_VOLUMES,
                collect_pages(request, move |page| ec2.describe_volumes(page)),
            )
            .await?
            .map_err(|e| volume_error(e, DESCRIBE_VOLUMES, key))?;

        match volumes.len() {
            0 => Err(Error::not_found("volume", key)),
            1 => Ok(volumes.remove(0)),
            count => Err(Error::MultipleFound {
                kind: "volume",
                key: key.to_string(),
                count,
            }),
        }
    }

    // =========================================================================
    // Resize
    // =========================================================================

    /// Grow a volume to hold `new_size_bytes`; returns the resulting GiB
    pub async fn resize(&self, ctx: &OpContext, volume_id: &str, new_size_bytes: i64) -> Result<i64> {
        let volume = self
            .describe_one(ctx, DescribeRequest::by_id(volume_id), volume_id)
            .await?;

        let new_size_gib = round_up_gib(new_size_bytes);
        let current_gib = volume.size_gib.unwrap_or(0);
        if current_gib >= new_size_gib {
            debug!(
                "Volume {} is {} GiB, no resize needed for {} GiB",
                volume_id, current_gib, new_size_gib
            );
            return Ok(current_gib);
        }

        info!("Resizing volume {} from {} GiB to {} GiB", volume_id, current_gib, new_size_gib);

        let request = ModifyVolumeRequest {
            volume_id: volume_id.to_string(),
            size_gib: new_size_gib,
        };
        let modification = match ctx.run(MODIFY_VOLUME, self.ec2.modify_volume(request)).await? {
            Ok(Some(modification)) => modification,
            Ok(None) => return Err(Error::malformed(MODIFY_VOLUME, "no modification returned")),
            Err(e) if e.is(ErrorCode::IncorrectModificationState) => {
                warn!("Volume {} is already being modified, following that modification", volume_id);
                self.latest_modification(ctx, volume_id).await?
            }
            Err(e) => return Err(volume_error(e, MODIFY_VOLUME, volume_id)),
        };

        if let Some(size) = terminal_size(&modification, volume_id)? {
            return Ok(size);
        }

        poll(ctx, "volume modification", &MODIFICATION_BACKOFF, move || async move {
            let latest = self.latest_modification(ctx, volume_id).await?;
            terminal_size(&latest, volume_id)
        })
        .await
    }

    async fn latest_modification(&self, ctx: &OpContext, volume_id: &str) -> Result<VolumeModification> {
        let mut records = ctx
            .run(
                DESCRIBE_MODIFICATIONS,
                self.ec2.describe_volumes_modifications(volume_id),
            )
            .await?
            .map_err(|e| volume_error(e, DESCRIBE_MODIFICATIONS, volume_id))?;

        records
            .pop()
            .ok_or_else(|| Error::malformed(DESCRIBE_MODIFICATIONS, format!("no modification for {}", volume_id)))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn wait_available(&self, ctx: &OpContext, volume_id: &str) -> Result<()> {
        poll(ctx, "volume available", &VOLUME_AVAILABLE_POLL, move || async move {
            let volume = self
                .describe_one(ctx, DescribeRequest::by_id(volume_id), volume_id)
                .await?;
            Ok((volume.state.as_deref() == Some(VOLUME_STATE_AVAILABLE)).then_some(()))
        })
        .await
    }

    /// First zone the provider lists for the region
    async fn default_zone(&self, ctx: &OpContext) -> Result<String> {
        let zones = ctx
            .run(DESCRIBE_ZONES, self.ec2.describe_availability_zones())
            .await?
            .map_err(|e| e.into_error(DESCRIBE_ZONES, "region"))?;

        zones
            .into_iter()
            .find_map(|zone| zone.zone_name.filter(|name| !name.is_empty()))
            .ok_or_else(|| Error::malformed(DESCRIBE_ZONES, "no availability zones listed"))
    }
}

fn volume_error(e: ApiError, operation: &str, key: &str) -> Error {
    if e.is(ErrorCode::VolumeNotFound) {
        Error::not_found("volume", key)
    } else {
        e.into_error(operation, key)
    }
}

fn to_disk(volume: Volume, key: &str) -> Result<Disk> {
    let volume_id = volume
        .volume_id
        .ok_or_else(|| Error::malformed(DESCRIBE_VOLUMES, format!("volume {} has no ID", key)))?;

    Ok(Disk {
        capacity_gib: volume.size_gib.unwrap_or(0),
        availability_zone: volume.availability_zone.unwrap_or_default(),
        snapshot_id: volume.snapshot_id,
        volume_id,
    })
}

/// Target size once a modification is terminal, `None` while in progress
fn terminal_size(modification: &VolumeModification, volume_id: &str) -> Result<Option<i64>> {
    match modification.modification_state.as_deref() {
        Some(MODIFICATION_COMPLETED | MODIFICATION_OPTIMIZING) => {
            modification.target_size_gib.map(Some).ok_or_else(|| {
                Error::malformed(DESCRIBE_MODIFICATIONS, format!("no target size for {}", volume_id))
            })
        }
        Some(MODIFICATION_FAILED) => Err(Error::Provider {
            operation: MODIFY_VOLUME.to_string(),
            resource: volume_id.to_string(),
            code: None,
            message: "volume modification failed".to_string(),
        }),
        _ => Ok(None),
    }
}
