//! Device Allocation
//!
//! Every attachment needs a device path unique on its instance. The
//! [`DeviceAllocator`] hands out [`Device`] reservations; the attachment
//! orchestrator releases them once the provider reflects the attachment.
//!
//! A reservation whose attach may have half-succeeded is *tainted*: a normal
//! release leaves it reserved so the path is not handed to another volume,
//! only a forced release frees it. The same volume may still retry its attach
//! on that path.

pub mod manager;
mod names;

pub use manager::DeviceManager;
pub use names::DEVICE_PREFIX;

use crate::error::Result;
use crate::provider::Instance;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// What releasing a [`Device`] does to its reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Return the path to the free pool
    Free,
    /// Keep the path reserved for the volume and mark it tainted
    Taint,
}

/// Settles a reservation; runs at most once
pub type ReleaseFn = Box<dyn FnOnce(Release) -> Result<()> + Send + Sync>;

/// Reserved device path for one (instance, volume) pair
pub struct Device {
    instance_id: String,
    volume_id: String,
    path: String,
    is_already_assigned: bool,
    tainted: bool,
    release_fn: Option<ReleaseFn>,
}

impl Device {
    pub fn new(
        instance_id: impl Into<String>,
        volume_id: impl Into<String>,
        path: impl Into<String>,
        is_already_assigned: bool,
        release_fn: ReleaseFn,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            volume_id: volume_id.into(),
            path: path.into(),
            is_already_assigned,
            tainted: false,
            release_fn: Some(release_fn),
        }
    }

    /// No binding exists; empty path and nothing to release
    pub fn unassigned(instance_id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            volume_id: volume_id.into(),
            path: String::new(),
            is_already_assigned: false,
            tainted: false,
            release_fn: None,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The volume was already bound to this path before the request
    pub fn is_already_assigned(&self) -> bool {
        self.is_already_assigned
    }

    pub fn taint(&mut self) {
        self.tainted = true;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Release the reservation. A tainted device stays reserved unless `force`.
    pub fn release(mut self, force: bool) -> Result<()> {
        let Some(release_fn) = self.release_fn.take() else {
            return Ok(());
        };
        let mode = if self.tainted && !force {
            Release::Taint
        } else {
            Release::Free
        };

        release_fn(mode).map_err(|e| {
            error!("Error releasing device {}: {}", self.path, e);
            e
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("instance_id", &self.instance_id)
            .field("volume_id", &self.volume_id)
            .field("path", &self.path)
            .field("is_already_assigned", &self.is_already_assigned)
            .field("tainted", &self.tainted)
            .finish()
    }
}

/// Port for per-instance device path reservation
pub trait DeviceAllocator: Send + Sync {
    /// Reserve a path for `volume_id`, or return the existing binding
    fn allocate(&self, instance: &Instance, volume_id: &str) -> Result<Device>;

    /// Existing binding for `volume_id`; [`Device::unassigned`] when none
    fn lookup(&self, instance: &Instance, volume_id: &str) -> Result<Device>;
}

pub type DeviceAllocatorRef = Arc<dyn DeviceAllocator>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_device(released: Arc<AtomicU32>) -> Device {
        Device::new(
            "i-1",
            "vol-1",
            "/dev/xvdba",
            false,
            Box::new(move |mode| {
                if mode == Release::Free {
                    released.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }),
        )
    }

    #[test]
    fn test_release_runs_release_fn() {
        let released = Arc::new(AtomicU32::new(0));
        counting_device(released.clone()).release(false).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tainted_device_needs_force() {
        let released = Arc::new(AtomicU32::new(0));

        let mut device = counting_device(released.clone());
        device.taint();
        assert!(device.is_tainted());
        device.release(false).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);

        let mut device = counting_device(released.clone());
        device.taint();
        device.release(true).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_error_is_returned() {
        let device = Device::new(
            "i-1",
            "vol-1",
            "/dev/xvdba",
            false,
            Box::new(|_| {
                Err(Error::DeviceRelease {
                    instance_id: "i-1".into(),
                    device: "/dev/xvdba".into(),
                    reason: "held by vol-2".into(),
                })
            }),
        );
        assert!(device.release(false).is_err());
    }

    #[test]
    fn test_unassigned_device() {
        let device = Device::unassigned("i-1", "vol-1");
        assert_eq!(device.path(), "");
        assert!(!device.is_already_assigned());
        device.release(true).unwrap();
    }
}
