//! Default device allocator
//!
//! Tracks in-flight reservations per instance. A name is in use when the
//! instance already maps it or an attach for it is in flight. Per-instance
//! allocation is serialised by the map entry lock; different instances never
//! contend beyond their shard.
//!
//! A tainted reservation keeps its name away from other volumes. When the
//! volume it belongs to asks again, it gets the same name back as a fresh
//! reservation so the attach is re-issued.

use super::names::{device_path, next_free, short_name};
use super::{Device, DeviceAllocator, Release};
use crate::error::{Error, Result};
use crate::provider::Instance;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reservation {
    volume_id: String,
    tainted: bool,
}

impl Reservation {
    fn new(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            tainted: false,
        }
    }
}

/// instance ID -> (short device name -> reservation)
type InFlight = DashMap<String, BTreeMap<String, Reservation>>;

#[derive(Debug, Default, Clone)]
pub struct DeviceManager {
    in_flight: Arc<InFlight>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of in-flight reservations on `instance_id`
    pub fn in_flight(&self, instance_id: &str) -> usize {
        self.in_flight
            .get(instance_id)
            .map(|names| names.len())
            .unwrap_or(0)
    }

    fn device(&self, instance_id: &str, volume_id: &str, path: String, is_already_assigned: bool) -> Device {
        let in_flight = self.in_flight.clone();
        let release_instance = instance_id.to_string();
        let release_volume = volume_id.to_string();
        let release_path = path.clone();

        Device::new(
            instance_id,
            volume_id,
            path,
            is_already_assigned,
            Box::new(move |mode| {
                release(&in_flight, &release_instance, &release_volume, &release_path, mode)
            }),
        )
    }
}

fn instance_id(instance: &Instance) -> Result<&str> {
    instance
        .instance_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::InvalidArgument("instance has no ID".to_string()))
}

fn mapped_path(instance: &Instance, volume_id: &str) -> Option<String> {
    instance
        .block_device_mappings
        .iter()
        .find(|m| m.volume_id.as_deref() == Some(volume_id))
        .and_then(|m| m.device_name.clone())
}

/// Path the volume is already bound to, from the instance or in-flight records
fn existing_path(instance: &Instance, in_flight: &BTreeMap<String, Reservation>, volume_id: &str) -> Option<String> {
    mapped_path(instance, volume_id).or_else(|| {
        in_flight
            .iter()
            .find(|(_, r)| r.volume_id == volume_id)
            .map(|(name, _)| device_path(name))
    })
}

fn names_in_use(instance: &Instance, in_flight: &BTreeMap<String, Reservation>) -> BTreeSet<String> {
    instance
        .block_device_mappings
        .iter()
        .filter_map(|m| m.device_name.as_deref())
        .map(|device| short_name(device).to_string())
        .chain(in_flight.keys().cloned())
        .collect()
}

fn release(in_flight: &InFlight, instance_id: &str, volume_id: &str, path: &str, mode: Release) -> Result<()> {
    let name = short_name(path);

    let emptied = {
        let Some(mut names) = in_flight.get_mut(instance_id) else {
            return Ok(());
        };
        let Some(existing) = names.get_mut(name) else {
            // Not in flight: nothing to release
            return Ok(());
        };
        if existing.volume_id != volume_id {
            error!(
                "Release on device {} of {} assigned to different volume: {} vs {}",
                path, instance_id, volume_id, existing.volume_id
            );
            return Err(Error::DeviceRelease {
                instance_id: instance_id.to_string(),
                device: path.to_string(),
                reason: format!("assigned to different volume {}", existing.volume_id),
            });
        }

        if mode == Release::Taint {
            debug!("Keeping tainted device {} of {} for volume {}", path, instance_id, volume_id);
            existing.tainted = true;
            return Ok(());
        }

        debug!("Releasing in-flight attachment entry: {} -> volume {}", path, volume_id);
        names.remove(name);
        names.is_empty()
    };

    if emptied {
        in_flight.remove_if(instance_id, |_, names| names.is_empty());
    }
    Ok(())
}

impl DeviceAllocator for DeviceManager {
    fn allocate(&self, instance: &Instance, volume_id: &str) -> Result<Device> {
        let instance_id = instance_id(instance)?;
        let mut in_flight = self.in_flight.entry(instance_id.to_string()).or_default();

        if let Some(path) = mapped_path(instance, volume_id) {
            drop(in_flight);
            return Ok(self.device(instance_id, volume_id, path, true));
        }

        let reserved = in_flight
            .iter_mut()
            .find(|(_, r)| r.volume_id == volume_id)
            .map(|(name, r)| (device_path(name), std::mem::replace(&mut r.tainted, false)));
        if let Some((path, retry)) = reserved {
            drop(in_flight);
            if retry {
                debug!("Retrying tainted {} on {} for volume {}", path, instance_id, volume_id);
            }
            return Ok(self.device(instance_id, volume_id, path, !retry));
        }

        let name = next_free(&names_in_use(instance, &in_flight)).ok_or_else(|| {
            Error::DeviceExhausted {
                instance_id: instance_id.to_string(),
            }
        })?;
        in_flight.insert(name.clone(), Reservation::new(volume_id));
        drop(in_flight);

        debug!("Reserved {} on {} for volume {}", device_path(&name), instance_id, volume_id);
        Ok(self.device(instance_id, volume_id, device_path(&name), false))
    }

    fn lookup(&self, instance: &Instance, volume_id: &str) -> Result<Device> {
        let instance_id = instance_id(instance)?;
        let path = match self.in_flight.get(instance_id) {
            Some(in_flight) => existing_path(instance, &in_flight, volume_id),
            None => existing_path(instance, &BTreeMap::new(), volume_id),
        };

        Ok(match path {
            Some(path) => self.device(instance_id, volume_id, path, true),
            None => Device::unassigned(instance_id, volume_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::names::candidates;
    use crate::provider::BlockDeviceMapping;
    use assert_matches::assert_matches;

    fn instance(id: &str, mappings: &[(&str, &str)]) -> Instance {
        Instance {
            instance_id: Some(id.to_string()),
            block_device_mappings: mappings
                .iter()
                .map(|(device, volume)| BlockDeviceMapping {
                    device_name: Some(device.to_string()),
                    volume_id: Some(volume.to_string()),
                })
                .collect(),
        }
    }

    #[test]
    fn test_allocate_skips_mapped_names() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[("/dev/xvda", "vol-root"), ("/dev/sdba", "vol-a")]);

        let device = manager.allocate(&node, "vol-b").unwrap();
        assert_eq!(device.path(), "/dev/xvdbb");
        assert!(!device.is_already_assigned());
        assert_eq!(manager.in_flight("i-1"), 1);
    }

    #[test]
    fn test_allocate_returns_existing_binding() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[("/dev/xvdbc", "vol-a")]);

        let device = manager.allocate(&node, "vol-a").unwrap();
        assert_eq!(device.path(), "/dev/xvdbc");
        assert!(device.is_already_assigned());
        assert_eq!(manager.in_flight("i-1"), 0);
    }

    #[test]
    fn test_in_flight_reservation_is_reused() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[]);

        let first = manager.allocate(&node, "vol-a").unwrap();
        let second = manager.allocate(&node, "vol-a").unwrap();
        assert_eq!(first.path(), second.path());
        assert!(second.is_already_assigned());

        let other = manager.allocate(&node, "vol-b").unwrap();
        assert_ne!(other.path(), first.path());
    }

    #[test]
    fn test_release_frees_name() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[]);

        let device = manager.allocate(&node, "vol-a").unwrap();
        let path = device.path().to_string();
        device.release(false).unwrap();
        assert_eq!(manager.in_flight("i-1"), 0);

        let again = manager.allocate(&node, "vol-b").unwrap();
        assert_eq!(again.path(), path);
    }

    #[test]
    fn test_tainted_release_keeps_reservation() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[]);

        let mut device = manager.allocate(&node, "vol-a").unwrap();
        device.taint();
        device.release(false).unwrap();
        assert_eq!(manager.in_flight("i-1"), 1);

        let next = manager.allocate(&node, "vol-b").unwrap();
        assert_eq!(next.path(), "/dev/xvdbb");
    }

    #[test]
    fn test_tainted_reservation_is_retried_by_its_volume() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[]);

        let mut device = manager.allocate(&node, "vol-a").unwrap();
        device.taint();
        device.release(false).unwrap();

        let retry = manager.allocate(&node, "vol-a").unwrap();
        assert_eq!(retry.path(), "/dev/xvdba");
        assert!(!retry.is_already_assigned());

        // A concurrent caller waits on the retry instead of issuing its own
        let joined = manager.allocate(&node, "vol-a").unwrap();
        assert!(joined.is_already_assigned());
        drop(joined);

        retry.release(false).unwrap();
        assert_eq!(manager.in_flight("i-1"), 0);
    }

    #[test]
    fn test_lookup_finds_tainted_reservation() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[]);

        let mut device = manager.allocate(&node, "vol-a").unwrap();
        device.taint();
        device.release(false).unwrap();

        let found = manager.lookup(&node, "vol-a").unwrap();
        assert!(found.is_already_assigned());
        found.release(true).unwrap();
        assert_eq!(manager.in_flight("i-1"), 0);
    }

    #[test]
    fn test_release_of_reassigned_name_fails() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[]);

        let device = manager.allocate(&node, "vol-a").unwrap();
        manager
            .in_flight
            .get_mut("i-1")
            .unwrap()
            .insert("ba".to_string(), Reservation::new("vol-z"));

        assert_matches!(device.release(false), Err(Error::DeviceRelease { .. }));
        assert_eq!(manager.in_flight("i-1"), 1);
    }

    #[test]
    fn test_exhaustion() {
        let manager = DeviceManager::new();
        let mappings: Vec<(String, String)> = candidates()
            .map(|name| (device_path(&name), format!("vol-{}", name)))
            .collect();
        let refs: Vec<(&str, &str)> = mappings.iter().map(|(d, v)| (d.as_str(), v.as_str())).collect();
        let node = instance("i-full", &refs);

        assert_matches!(
            manager.allocate(&node, "vol-new"),
            Err(Error::DeviceExhausted { instance_id }) if instance_id == "i-full"
        );
    }

    #[test]
    fn test_lookup() {
        let manager = DeviceManager::new();
        let node = instance("i-1", &[("/dev/xvdba", "vol-a")]);

        let found = manager.lookup(&node, "vol-a").unwrap();
        assert_eq!(found.path(), "/dev/xvdba");
        assert!(found.is_already_assigned());

        let missing = manager.lookup(&node, "vol-b").unwrap();
        assert_eq!(missing.path(), "");
        assert!(!missing.is_already_assigned());
    }

    #[test]
    fn test_missing_instance_id() {
        let manager = DeviceManager::new();
        assert_matches!(
            manager.allocate(&Instance::default(), "vol-a"),
            Err(Error::InvalidArgument(_))
        );
    }
}
