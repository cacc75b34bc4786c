//! Attachment Orchestrator
//!
//! Attach and detach volumes to instances. Each call borrows a [`Device`]
//! from the allocator for its whole duration; the guard hands it back on
//! every exit path. An attach that may have half-succeeded taints the device
//! so its path is not reused for another volume.

use super::volumes::VolumeManager;
use crate::context::OpContext;
use crate::device::{Device, DeviceAllocatorRef};
use crate::domain::{AttachmentState, Outcome};
use crate::error::{Error, Result};
use crate::provider::{
    collect_pages, AttachVolumeRequest, DescribeRequest, DetachVolumeRequest, Ec2ApiRef, ErrorCode,
    Instance,
};
use crate::wait::{poll, ATTACHMENT_BACKOFF};
use tracing::{debug, info, warn};

const ATTACH_VOLUME: &str = "AttachVolume";
const DETACH_VOLUME: &str = "DetachVolume";
const DESCRIBE_INSTANCES: &str = "DescribeInstances";

// =============================================================================
// Device Guard
// =============================================================================

/// Releases the borrowed device when dropped
struct DeviceGuard {
    device: Option<Device>,
    force: bool,
}

impl DeviceGuard {
    fn new(device: Device, force: bool) -> Self {
        Self {
            device: Some(device),
            force,
        }
    }

    fn path(&self) -> &str {
        self.device.as_ref().map_or("", Device::path)
    }

    fn is_already_assigned(&self) -> bool {
        self.device
            .as_ref()
            .map_or(false, Device::is_already_assigned)
    }

    fn taint(&mut self) {
        if let Some(device) = self.device.as_mut() {
            warn!(
                "Tainting device {} on {} for volume {}",
                device.path(),
                device.instance_id(),
                device.volume_id()
            );
            device.taint();
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        if device.is_tainted() && !self.force {
            debug!("Device {} stays reserved for volume {}", device.path(), device.volume_id());
        }
        // Failures are logged by the device itself
        let _ = device.release(self.force);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct AttachmentOrchestrator {
    ec2: Ec2ApiRef,
    volumes: VolumeManager,
    devices: DeviceAllocatorRef,
}

impl AttachmentOrchestrator {
    pub fn new(ec2: Ec2ApiRef, devices: DeviceAllocatorRef) -> Self {
        Self {
            volumes: VolumeManager::new(ec2.clone()),
            ec2,
            devices,
        }
    }

    /// Attach `volume_id` to `node_id` and return the device path
    pub async fn attach(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<String> {
        let instance = self.find_instance(ctx, node_id).await?;
        let mut device = DeviceGuard::new(self.devices.allocate(&instance, volume_id)?, false);

        if device.is_already_assigned() {
            debug!(
                "Volume {} already assigned to {} on {}",
                volume_id,
                device.path(),
                node_id
            );
        } else {
            info!("Attaching volume {} to {} as {}", volume_id, node_id, device.path());

            let request = AttachVolumeRequest {
                instance_id: node_id.to_string(),
                volume_id: volume_id.to_string(),
                device: Some(device.path().to_string()),
            };
            let accepted = match ctx.run(ATTACH_VOLUME, self.ec2.attach_volume(request)).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // The provider may have applied the attach before the context ended
                    device.taint();
                    return Err(e);
                }
            };
            match accepted {
                Ok(attachment) => debug!(
                    "AttachVolume for {} accepted in state {:?}",
                    volume_id, attachment.state
                ),
                Err(e) if e.is(ErrorCode::VolumeInUse) => {
                    return Err(Error::AlreadyExists {
                        kind: "attachment",
                        id: volume_id.to_string(),
                    });
                }
                Err(e) => {
                    device.taint();
                    return Err(e.into_error(ATTACH_VOLUME, volume_id));
                }
            }
        }

        if let Err(e) = self
            .wait_for_state(ctx, volume_id, AttachmentState::Attached)
            .await
        {
            device.taint();
            return Err(e);
        }

        info!("Volume {} attached to {} at {}", volume_id, node_id, device.path());
        Ok(device.path().to_string())
    }

    /// Detach `volume_id` from `node_id`; a volume not attached yields
    /// [`Outcome::NotFound`]
    pub async fn detach(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<Outcome> {
        let instance = self.find_instance(ctx, node_id).await?;
        let device = DeviceGuard::new(self.devices.lookup(&instance, volume_id)?, true);

        if !device.is_already_assigned() {
            warn!("Detach called on non-attached volume: {}", volume_id);
        }

        info!("Detaching volume {} from {}", volume_id, node_id);
        let request = DetachVolumeRequest {
            instance_id: node_id.to_string(),
            volume_id: volume_id.to_string(),
        };
        match ctx.run(DETACH_VOLUME, self.ec2.detach_volume(request)).await? {
            Ok(_) => {}
            Err(e)
                if e.is(ErrorCode::IncorrectState)
                    || e.is(ErrorCode::AttachmentNotFound)
                    || e.is(ErrorCode::VolumeNotFound) =>
            {
                debug!("Volume {} is not attached to {}: {}", volume_id, node_id, e);
                return Ok(Outcome::NotFound);
            }
            Err(e) => return Err(e.into_error(DETACH_VOLUME, volume_id)),
        }

        self.wait_for_state(ctx, volume_id, AttachmentState::Detached)
            .await?;
        info!("Volume {} detached from {}", volume_id, node_id);
        Ok(Outcome::Completed)
    }

    /// Poll until an attachment of the volume reports `state`
    pub async fn wait_for_state(&self, ctx: &OpContext, volume_id: &str, state: AttachmentState) -> Result<()> {
        let volumes = &self.volumes;
        poll(ctx, "attachment state", &ATTACHMENT_BACKOFF, move || async move {
            let volume = volumes
                .describe_one(ctx, DescribeRequest::by_id(volume_id), volume_id)
                .await?;

            if volume.attachments.is_empty() {
                return Ok((state == AttachmentState::Detached).then_some(()));
            }

            for attachment in &volume.attachments {
                match attachment.state.as_deref() {
                    Some(current) if current == state.as_str() => return Ok(Some(())),
                    Some(current) => debug!(
                        "Waiting for volume {} to be {}, currently {}",
                        volume_id, state, current
                    ),
                    None => warn!("Ignoring nil attachment state for volume {}", volume_id),
                }
            }
            Ok(None)
        })
        .await
    }

    // =========================================================================
    // Instances
    // =========================================================================

    pub async fn instance_exists(&self, ctx: &OpContext, node_id: &str) -> Result<bool> {
        match self.find_instance(ctx, node_id).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Exactly one instance with ID `node_id`
    async fn find_instance(&self, ctx: &OpContext, node_id: &str) -> Result<Instance> {
        let ec2 = &self.ec2;
        let mut instances = ctx
            .run(
                DESCRIBE_INSTANCES,
                collect_pages(DescribeRequest::by_id(node_id), move |page| {
                    ec2.describe_instances(page)
                }),
            )
            .await?
            .map_err(|e| {
                if e.is(ErrorCode::InstanceNotFound) {
                    Error::not_found("instance", node_id)
                } else {
                    e.into_error(DESCRIBE_INSTANCES, node_id)
                }
            })?;

        match instances.len() {
            0 => Err(Error::not_found("instance", node_id)),
            1 => Ok(instances.remove(0)),
            count => Err(Error::MultipleFound {
                kind: "instance",
                key: node_id.to_string(),
                count,
            }),
        }
    }
}
