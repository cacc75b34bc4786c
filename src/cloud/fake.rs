//! In-memory cloud facade
//!
//! Transitions complete immediately, so waits either succeed or time out on
//! the first check. Device paths come from a real [`DeviceManager`].

use crate::context::OpContext;
use crate::device::{DeviceAllocator, DeviceManager};
use crate::domain::{
    AttachmentState, Cloud, Disk, DiskOptions, ListSnapshotsResponse, Outcome, Snapshot,
    SnapshotOptions, VolumeType, SNAPSHOT_NAME_TAG_KEY, VOLUME_NAME_TAG_KEY,
};
use crate::error::{Error, Result};
use crate::provider::{BlockDeviceMapping, ErrorCode, Instance};
use crate::util::{bytes_to_gib, gib_to_bytes, round_up_gib};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const DEFAULT_ZONE: &str = "us-test-1a";

#[derive(Debug, Clone)]
struct FakeDisk {
    disk: Disk,
    tags: BTreeMap<String, String>,
    /// (node ID, device path)
    attached_to: Option<(String, String)>,
}

#[derive(Debug, Clone)]
struct FakeSnapshot {
    snapshot: Snapshot,
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    disks: BTreeMap<String, FakeDisk>,
    snapshots: BTreeMap<String, FakeSnapshot>,
    instances: BTreeMap<String, Instance>,
    next_id: u64,
}

impl State {
    fn generate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:017x}", prefix, self.next_id)
    }

    fn disk_mut(&mut self, volume_id: &str) -> Result<&mut FakeDisk> {
        self.disks
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found("volume", volume_id))
    }
}

/// In-memory [`Cloud`] for consumers' tests
#[derive(Debug)]
pub struct FakeCloud {
    zone: String,
    devices: DeviceManager,
    state: Mutex<State>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            zone: DEFAULT_ZONE.to_string(),
            devices: DeviceManager::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// Zone used when a create request names none
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn add_instance(&self, node_id: &str) {
        self.state.lock().instances.insert(
            node_id.to_string(),
            Instance {
                instance_id: Some(node_id.to_string()),
                block_device_mappings: Vec::new(),
            },
        );
    }

    /// Number of volumes currently held
    pub fn disk_count(&self) -> usize {
        self.state.lock().disks.len()
    }
}

fn exactly_one<T>(mut matches: Vec<T>, kind: &'static str, key: &str) -> Result<T> {
    match matches.len() {
        0 => Err(Error::not_found(kind, key)),
        1 => Ok(matches.remove(0)),
        count => Err(Error::MultipleFound {
            kind,
            key: key.to_string(),
            count,
        }),
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn create_disk(&self, ctx: &OpContext, name: &str, options: DiskOptions) -> Result<Disk> {
        ctx.check("create disk")?;
        options.volume_type.parse::<VolumeType>()?;

        let mut state = self.state.lock();
        let snapshot_id = Some(options.snapshot_id).filter(|s| !s.is_empty());
        if let Some(snapshot_id) = &snapshot_id {
            if !state.snapshots.contains_key(snapshot_id) {
                return Err(Error::not_found("snapshot", snapshot_id.clone()));
            }
        }

        let mut tags = options.tags;
        tags.entry(VOLUME_NAME_TAG_KEY.to_string())
            .or_insert_with(|| name.to_string());

        let volume_id = state.generate_id("vol");
        let disk = Disk {
            volume_id: volume_id.clone(),
            capacity_gib: bytes_to_gib(options.capacity_bytes),
            availability_zone: if options.availability_zone.is_empty() {
                self.zone.clone()
            } else {
                options.availability_zone
            },
            snapshot_id,
        };
        state.disks.insert(
            volume_id,
            FakeDisk {
                disk: disk.clone(),
                tags,
                attached_to: None,
            },
        );
        debug!("Fake volume {} created as {}", name, disk.volume_id);
        Ok(disk)
    }

    async fn delete_disk(&self, ctx: &OpContext, volume_id: &str) -> Result<Outcome> {
        ctx.check("delete disk")?;
        let mut state = self.state.lock();

        let attached = match state.disks.get(volume_id) {
            Some(disk) => disk.attached_to.is_some(),
            None => return Ok(Outcome::NotFound),
        };
        if attached {
            return Err(Error::Provider {
                operation: "DeleteVolume".to_string(),
                resource: volume_id.to_string(),
                code: Some(ErrorCode::VolumeInUse.to_string()),
                message: "volume is attached".to_string(),
            });
        }

        state.disks.remove(volume_id);
        Ok(Outcome::Completed)
    }

    async fn attach_disk(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<String> {
        ctx.check("attach disk")?;
        let mut state = self.state.lock();

        let instance = state
            .instances
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::not_found("instance", node_id))?;

        match &state.disk_mut(volume_id)?.attached_to {
            Some((node, path)) if node == node_id => return Ok(path.clone()),
            Some(_) => {
                return Err(Error::AlreadyExists {
                    kind: "attachment",
                    id: volume_id.to_string(),
                })
            }
            None => {}
        }

        let device = self.devices.allocate(&instance, volume_id)?;
        let path = device.path().to_string();

        state.disk_mut(volume_id)?.attached_to = Some((node_id.to_string(), path.clone()));
        if let Some(instance) = state.instances.get_mut(node_id) {
            instance.block_device_mappings.push(BlockDeviceMapping {
                device_name: Some(path.clone()),
                volume_id: Some(volume_id.to_string()),
            });
        }
        device.release(false)?;
        Ok(path)
    }

    async fn detach_disk(&self, ctx: &OpContext, volume_id: &str, node_id: &str) -> Result<Outcome> {
        ctx.check("detach disk")?;
        let mut state = self.state.lock();

        let Some(disk) = state.disks.get_mut(volume_id) else {
            return Ok(Outcome::NotFound);
        };
        if !matches!(&disk.attached_to, Some((node, _)) if node == node_id) {
            return Ok(Outcome::NotFound);
        }
        disk.attached_to = None;

        if let Some(instance) = state.instances.get_mut(node_id) {
            instance
                .block_device_mappings
                .retain(|m| m.volume_id.as_deref() != Some(volume_id));
        }
        Ok(Outcome::Completed)
    }

    async fn resize_disk(&self, ctx: &OpContext, volume_id: &str, new_size_bytes: i64) -> Result<i64> {
        ctx.check("resize disk")?;
        let mut state = self.state.lock();
        let disk = &mut state.disk_mut(volume_id)?.disk;

        disk.capacity_gib = disk.capacity_gib.max(round_up_gib(new_size_bytes));
        Ok(disk.capacity_gib)
    }

    async fn wait_for_attachment_state(
        &self,
        ctx: &OpContext,
        volume_id: &str,
        state: AttachmentState,
    ) -> Result<()> {
        ctx.check("attachment state")?;
        let mut guard = self.state.lock();
        let attached = guard.disk_mut(volume_id)?.attached_to.is_some();

        match (state, attached) {
            (AttachmentState::Attached, true) | (AttachmentState::Detached, false) => Ok(()),
            _ => Err(Error::Timeout {
                operation: "attachment state".to_string(),
                attempts: 1,
                waited: Duration::ZERO,
            }),
        }
    }

    async fn get_disk_by_name(&self, ctx: &OpContext, name: &str, capacity_bytes: i64) -> Result<Disk> {
        ctx.check("get disk")?;
        let matches: Vec<Disk> = self
            .state
            .lock()
            .disks
            .values()
            .filter(|d| d.tags.get(VOLUME_NAME_TAG_KEY).map(String::as_str) == Some(name))
            .map(|d| d.disk.clone())
            .collect();

        let disk = exactly_one(matches, "volume", name)?;
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

    async fn get_disk_by_id(&self, ctx: &OpContext, volume_id: &str) -> Result<Disk> {
        ctx.check("get disk")?;
        Ok(self.state.lock().disk_mut(volume_id)?.disk.clone())
    }

    async fn instance_exists(&self, ctx: &OpContext, node_id: &str) -> Result<bool> {
        ctx.check("instance exists")?;
        Ok(self.state.lock().instances.contains_key(node_id))
    }

    async fn create_snapshot(
        &self,
        ctx: &OpContext,
        volume_id: &str,
        options: SnapshotOptions,
    ) -> Result<Snapshot> {
        ctx.check("create snapshot")?;
        let mut state = self.state.lock();
        let size_gib = state.disk_mut(volume_id)?.disk.capacity_gib;

        let snapshot_id = state.generate_id("snap");
        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            source_volume_id: volume_id.to_string(),
            size_bytes: gib_to_bytes(size_gib),
            creation_time: Some(Utc::now()),
            ready_to_use: true,
        };
        state.snapshots.insert(
            snapshot_id,
            FakeSnapshot {
                snapshot: snapshot.clone(),
                tags: options.tags,
            },
        );
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Outcome> {
        ctx.check("delete snapshot")?;
        Ok(match self.state.lock().snapshots.remove(snapshot_id) {
            Some(_) => Outcome::Completed,
            None => Outcome::NotFound,
        })
    }

    async fn get_snapshot_by_name(&self, ctx: &OpContext, name: &str) -> Result<Snapshot> {
        ctx.check("get snapshot")?;
        let matches: Vec<Snapshot> = self
            .state
            .lock()
            .snapshots
            .values()
            .filter(|s| s.tags.get(SNAPSHOT_NAME_TAG_KEY).map(String::as_str) == Some(name))
            .map(|s| s.snapshot.clone())
            .collect();
        exactly_one(matches, "snapshot", name)
    }

    async fn get_snapshot_by_id(&self, ctx: &OpContext, snapshot_id: &str) -> Result<Snapshot> {
        ctx.check("get snapshot")?;
        self.state
            .lock()
            .snapshots
            .get(snapshot_id)
            .map(|s| s.snapshot.clone())
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))
    }

    async fn list_snapshots(
        &self,
        ctx: &OpContext,
        volume_id: Option<&str>,
        max_results: i64,
        next_token: Option<&str>,
    ) -> Result<ListSnapshotsResponse> {
        ctx.check("list snapshots")?;
        if max_results < 0 || (1..5).contains(&max_results) {
            return Err(Error::InvalidArgument(format!(
                "max results must be 0 or at least 5, got {}",
                max_results
            )));
        }

        let start = match next_token.filter(|t| !t.is_empty()) {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| Error::InvalidArgument(format!("invalid next token {:?}", token)))?,
            None => 0,
        };

        let matching: Vec<Snapshot> = self
            .state
            .lock()
            .snapshots
            .values()
            .filter(|s| volume_id.map_or(true, |v| s.snapshot.source_volume_id == v))
            .map(|s| s.snapshot.clone())
            .collect();

        let total = matching.len();
        let size = if max_results > 0 { max_results as usize } else { total };
        let end = start.saturating_add(size).min(total);
        let snapshots: Vec<Snapshot> = matching
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .collect();

        if snapshots.is_empty() {
            return Err(Error::not_found("snapshot", volume_id.unwrap_or("any")));
        }
        Ok(ListSnapshotsResponse {
            snapshots,
            next_token: if end < total { end.to_string() } else { String::new() },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::GIB;
    use assert_matches::assert_matches;

    fn cloud() -> FakeCloud {
        let cloud = FakeCloud::new();
        cloud.add_instance("i-1");
        cloud.add_instance("i-2");
        cloud
    }

    #[tokio::test]
    async fn test_disk_lifecycle() {
        let cloud = cloud();
        let ctx = OpContext::new();

        let disk = cloud
            .create_disk(&ctx, "pvc-1", DiskOptions::new(10 * GIB))
            .await
            .unwrap();
        assert_eq!(disk.availability_zone, DEFAULT_ZONE);
        assert_eq!(cloud.get_disk_by_name(&ctx, "pvc-1", 10 * GIB).await.unwrap(), disk);
        assert_matches!(
            cloud.get_disk_by_name(&ctx, "pvc-1", 20 * GIB).await,
            Err(Error::SizeConflict { .. })
        );

        assert_eq!(cloud.resize_disk(&ctx, &disk.volume_id, 5 * GIB).await.unwrap(), 10);
        assert_eq!(cloud.resize_disk(&ctx, &disk.volume_id, 12 * GIB).await.unwrap(), 12);

        assert_eq!(cloud.delete_disk(&ctx, &disk.volume_id).await.unwrap(), Outcome::Completed);
        assert_eq!(cloud.delete_disk(&ctx, &disk.volume_id).await.unwrap(), Outcome::NotFound);
        assert_eq!(cloud.disk_count(), 0);
    }

    #[tokio::test]
    async fn test_attachments() {
        let cloud = cloud();
        let ctx = OpContext::new();
        let disk = cloud.create_disk(&ctx, "pvc-1", DiskOptions::new(GIB)).await.unwrap();
        let other = cloud.create_disk(&ctx, "pvc-2", DiskOptions::new(GIB)).await.unwrap();

        let path = cloud.attach_disk(&ctx, &disk.volume_id, "i-1").await.unwrap();
        assert_eq!(cloud.attach_disk(&ctx, &disk.volume_id, "i-1").await.unwrap(), path);
        let other_path = cloud.attach_disk(&ctx, &other.volume_id, "i-1").await.unwrap();
        assert_ne!(path, other_path);

        assert_matches!(
            cloud.attach_disk(&ctx, &disk.volume_id, "i-2").await,
            Err(Error::AlreadyExists { .. })
        );
        assert_matches!(
            cloud.delete_disk(&ctx, &disk.volume_id).await,
            Err(Error::Provider { .. })
        );
        cloud
            .wait_for_attachment_state(&ctx, &disk.volume_id, AttachmentState::Attached)
            .await
            .unwrap();

        assert_eq!(
            cloud.detach_disk(&ctx, &disk.volume_id, "i-1").await.unwrap(),
            Outcome::Completed
        );
        assert_eq!(
            cloud.detach_disk(&ctx, &disk.volume_id, "i-1").await.unwrap(),
            Outcome::NotFound
        );
        assert_matches!(
            cloud
                .wait_for_attachment_state(&ctx, &disk.volume_id, AttachmentState::Attached)
                .await,
            Err(Error::Timeout { .. })
        );
    }

    #[tokio::test]
    async fn test_snapshots() {
        let cloud = cloud();
        let ctx = OpContext::new();
        let disk = cloud.create_disk(&ctx, "pvc-1", DiskOptions::new(4 * GIB)).await.unwrap();

        let snapshot = cloud
            .create_snapshot(&ctx, &disk.volume_id, SnapshotOptions::named("snap-a"))
            .await
            .unwrap();
        assert!(snapshot.ready_to_use);
        assert_eq!(snapshot.size_bytes, 4 * GIB);
        assert_eq!(cloud.get_snapshot_by_name(&ctx, "snap-a").await.unwrap(), snapshot);

        let restored = cloud
            .create_disk(&ctx, "pvc-2", DiskOptions {
                snapshot_id: snapshot.snapshot_id.clone(),
                ..DiskOptions::new(4 * GIB)
            })
            .await
            .unwrap();
        assert_eq!(restored.snapshot_id, Some(snapshot.snapshot_id.clone()));

        assert_matches!(
            cloud.list_snapshots(&ctx, None, 3, None).await,
            Err(Error::InvalidArgument(_))
        );
        let listed = cloud
            .list_snapshots(&ctx, Some(disk.volume_id.as_str()), 0, None)
            .await
            .unwrap();
        assert_eq!(listed.snapshots, vec![snapshot.clone()]);
        assert_eq!(listed.next_token, "");

        assert_eq!(
            cloud.delete_snapshot(&ctx, &snapshot.snapshot_id).await.unwrap(),
            Outcome::Completed
        );
        assert_matches!(
            cloud.get_snapshot_by_id(&ctx, &snapshot.snapshot_id).await,
            Err(Error::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let cloud = cloud();
        let ctx = OpContext::new();
        ctx.cancel();

        assert_matches!(
            cloud.instance_exists(&ctx, "i-1").await,
            Err(Error::Cancelled { .. })
        );
    }
}
