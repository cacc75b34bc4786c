//! In-memory provider
//!
//! Simulates the provider's eventual consistency: every asynchronous
//! transition (volume creation, attach, detach, modification, snapshot
//! completion) becomes visible only after `lag` further describe calls for the
//! resource. Supports tag/ID filters, pagination, error injection and
//! per-action call counting.

use super::errors::{ApiError, ApiResult, ErrorCode};
use super::{
    AttachVolumeRequest, AvailabilityZone, BlockDeviceMapping, CreateSnapshotRequest,
    CreateVolumeRequest, DescribeRequest, DetachVolumeRequest, Ec2Api, Filter, Instance,
    ModifyVolumeRequest, Page, Snapshot, Volume, VolumeAttachment, VolumeModification,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

const DEFAULT_DEVICE: &str = "/dev/sdf";

#[derive(Debug)]
struct Lagged<T> {
    value: T,
    settle_in: u32,
}

#[derive(Debug, Default)]
struct State {
    volumes: BTreeMap<String, Lagged<Volume>>,
    instances: BTreeMap<String, Instance>,
    snapshots: BTreeMap<String, Lagged<Snapshot>>,
    modifications: BTreeMap<String, Vec<Lagged<VolumeModification>>>,
    zones: Vec<String>,
    failures: BTreeMap<String, VecDeque<ApiError>>,
    calls: BTreeMap<String, usize>,
    create_requests: Vec<CreateVolumeRequest>,
    next_id: u64,
    lag: u32,
    page_size: Option<usize>,
    attach_delay: Option<Duration>,
}

/// In-memory [`Ec2Api`] for tests
#[derive(Debug)]
pub struct FakeEc2 {
    state: Mutex<State>,
}

impl Default for FakeEc2 {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEc2 {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                zones: vec!["us-test-1a".to_string(), "us-test-1b".to_string()],
                ..Default::default()
            }),
        }
    }

    /// Describe calls a transition stays invisible for (default 0)
    pub fn with_lag(self, lag: u32) -> Self {
        self.state.lock().lag = lag;
        self
    }

    /// Page size used when a describe request sets no `max_results`
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.state.lock().page_size = Some(page_size.max(1));
        self
    }

    /// Hold every AttachVolume response for `delay` after the attach is applied
    pub fn with_attach_delay(self, delay: Duration) -> Self {
        self.state.lock().attach_delay = Some(delay);
        self
    }

    pub fn with_zones(self, zones: &[&str]) -> Self {
        self.state.lock().zones = zones.iter().map(|z| z.to_string()).collect();
        self
    }

    pub fn add_instance(&self, instance_id: &str) {
        self.state.lock().instances.insert(
            instance_id.to_string(),
            Instance {
                instance_id: Some(instance_id.to_string()),
                block_device_mappings: Vec::new(),
            },
        );
    }

    /// Seed an instance under an ID that already exists, e.g. to provoke
    /// duplicate matches
    pub fn insert_instance(&self, instance: Instance) {
        let mut state = self.state.lock();
        let key = format!(
            "{}#{}",
            instance.instance_id.clone().unwrap_or_default(),
            state.instances.len()
        );
        state.instances.insert(key, instance);
    }

    /// Seed a settled volume as-is; the ID is generated when absent
    pub fn insert_volume(&self, mut volume: Volume) -> String {
        let mut state = self.state.lock();
        let id = match volume.volume_id.clone() {
            Some(id) => id,
            None => state.generate_id("vol"),
        };
        volume.volume_id = Some(id.clone());
        state.volumes.insert(
            id.clone(),
            Lagged {
                value: volume,
                settle_in: 0,
            },
        );
        id
    }

    /// Seed a settled snapshot as-is; the ID is generated when absent
    pub fn insert_snapshot(&self, mut snapshot: Snapshot) -> String {
        let mut state = self.state.lock();
        let id = match snapshot.snapshot_id.clone() {
            Some(id) => id,
            None => state.generate_id("snap"),
        };
        snapshot.snapshot_id = Some(id.clone());
        state.snapshots.insert(
            id.clone(),
            Lagged {
                value: snapshot,
                settle_in: 0,
            },
        );
        id
    }

    /// Append a settled modification record to the volume's history
    pub fn insert_modification(&self, modification: VolumeModification) {
        let volume_id = modification.volume_id.clone().unwrap_or_default();
        self.state
            .lock()
            .modifications
            .entry(volume_id)
            .or_default()
            .push(Lagged {
                value: modification,
                settle_in: 0,
            });
    }

    /// Fail the next call of `action` (e.g. `"AttachVolume"`) with `error`
    pub fn fail_next(&self, action: &str, error: ApiError) {
        self.state
            .lock()
            .failures
            .entry(action.to_string())
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `action`, failed ones included
    pub fn calls(&self, action: &str) -> usize {
        self.state.lock().calls.get(action).copied().unwrap_or(0)
    }

    /// Every accepted CreateVolume request, oldest first
    pub fn create_requests(&self) -> Vec<CreateVolumeRequest> {
        self.state.lock().create_requests.clone()
    }

    /// Current view of a volume without advancing any transition
    pub fn volume(&self, volume_id: &str) -> Option<Volume> {
        self.state
            .lock()
            .volumes
            .get(volume_id)
            .map(|v| v.value.clone())
    }

    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.state.lock().instances.get(instance_id).cloned()
    }

    fn accept_attach(&self, request: AttachVolumeRequest) -> ApiResult<VolumeAttachment> {
        let mut state = self.enter("AttachVolume")?;

        if !state.instances.contains_key(&request.instance_id) {
            return Err(not_found(ErrorCode::InstanceNotFound, &request.instance_id));
        }
        let lag = state.lag;
        let entry = state.volume_mut(&request.volume_id)?;
        if entry.value.state.as_deref() == Some("creating") {
            return Err(ApiError::from_code(
                ErrorCode::IncorrectState,
                format!("vol '{}' is not 'available'", request.volume_id),
            ));
        }
        if !entry.value.attachments.is_empty() {
            return Err(ApiError::from_code(
                ErrorCode::VolumeInUse,
                format!("{} is already attached to an instance", request.volume_id),
            ));
        }

        let device = request.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string());
        let attachment = VolumeAttachment {
            volume_id: Some(request.volume_id.clone()),
            instance_id: Some(request.instance_id.clone()),
            device: Some(device.clone()),
            state: Some("attaching".to_string()),
        };
        entry.value.attachments.push(attachment.clone());
        entry.settle_in = lag;

        if let Some(instance) = state.instances.get_mut(&request.instance_id) {
            instance.block_device_mappings.push(BlockDeviceMapping {
                device_name: Some(device),
                volume_id: Some(request.volume_id),
            });
        }
        Ok(attachment)
    }

    fn enter(&self, action: &str) -> ApiResult<MutexGuard<'_, State>> {
        let mut state = self.state.lock();
        *state.calls.entry(action.to_string()).or_default() += 1;
        if let Some(err) = state.failures.get_mut(action).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

// =============================================================================
// Simulation
// =============================================================================

fn not_found(code: ErrorCode, id: &str) -> ApiError {
    ApiError::from_code(code, format!("The resource '{}' does not exist.", id))
}

fn matches_filters(filters: &[Filter], tags: &BTreeMap<String, String>, volume_id: Option<&str>) -> ApiResult<bool> {
    for filter in filters {
        let actual = if let Some(key) = filter.name.strip_prefix("tag:") {
            tags.get(key).map(String::as_str)
        } else if filter.name == "volume-id" {
            volume_id
        } else {
            return Err(ApiError::new(
                "InvalidParameterValue",
                format!("The filter '{}' is invalid", filter.name),
            ));
        };
        if !actual.map_or(false, |a| filter.values.iter().any(|v| v == a)) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn paginate<T>(items: Vec<T>, request: &DescribeRequest, page_size: Option<usize>) -> ApiResult<Page<T>> {
    let start = match request.next_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => token.parse::<usize>().map_err(|_| {
            ApiError::new("InvalidParameterValue", format!("invalid next token '{}'", token))
        })?,
        None => 0,
    };
    let size = request
        .max_results
        .filter(|n| *n > 0)
        .map(|n| n as usize)
        .or(page_size)
        .unwrap_or(usize::MAX);

    let total = items.len();
    let end = start.saturating_add(size).min(total);
    let next_token = (end < total).then(|| end.to_string());

    Ok(Page {
        items: items.into_iter().skip(start).take(end.saturating_sub(start)).collect(),
        next_token,
    })
}

impl State {
    fn generate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:017x}", prefix, self.next_id)
    }

    /// Advance a volume's pending transitions by one describe
    fn settle_volume(&mut self, volume_id: &str) {
        let Some(entry) = self.volumes.get_mut(volume_id) else {
            return;
        };
        if entry.settle_in > 0 {
            entry.settle_in -= 1;
            return;
        }

        let volume = &mut entry.value;
        let mut detached = Vec::new();
        volume.attachments.retain(|a| {
            if a.state.as_deref() == Some("detaching") {
                detached.push(a.instance_id.clone().unwrap_or_default());
                false
            } else {
                true
            }
        });
        for attachment in &mut volume.attachments {
            if attachment.state.as_deref() == Some("attaching") {
                attachment.state = Some("attached".to_string());
            }
        }
        volume.state = Some(if volume.attachments.is_empty() { "available" } else { "in-use" }.to_string());

        for instance_id in detached {
            if let Some(instance) = self.instances.get_mut(&instance_id) {
                instance
                    .block_device_mappings
                    .retain(|m| m.volume_id.as_deref() != Some(volume_id));
            }
        }
    }

    fn settle_modifications(&mut self, volume_id: &str) {
        let Some(records) = self.modifications.get_mut(volume_id) else {
            return;
        };
        let mut resized = None;
        for record in records.iter_mut() {
            if record.value.modification_state.as_deref() != Some("modifying") {
                continue;
            }
            if record.settle_in > 0 {
                record.settle_in -= 1;
                continue;
            }
            record.value.modification_state = Some("optimizing".to_string());
            resized = record.value.target_size_gib;
        }
        if let (Some(size), Some(volume)) = (resized, self.volumes.get_mut(volume_id)) {
            volume.value.size_gib = Some(size);
        }
    }

    fn settle_snapshot(&mut self, snapshot_id: &str) {
        if let Some(entry) = self.snapshots.get_mut(snapshot_id) {
            if entry.settle_in > 0 {
                entry.settle_in -= 1;
            } else if entry.value.state.as_deref() == Some("pending") {
                entry.value.state = Some("completed".to_string());
            }
        }
    }

    fn volume_mut(&mut self, volume_id: &str) -> ApiResult<&mut Lagged<Volume>> {
        self.volumes
            .get_mut(volume_id)
            .ok_or_else(|| not_found(ErrorCode::VolumeNotFound, volume_id))
    }
}

#[async_trait]
impl Ec2Api for FakeEc2 {
    async fn describe_volumes(&self, request: DescribeRequest) -> ApiResult<Page<Volume>> {
        let mut state = self.enter("DescribeVolumes")?;

        for id in &request.ids {
            if !state.volumes.contains_key(id) {
                return Err(not_found(ErrorCode::VolumeNotFound, id));
            }
        }

        let candidates: Vec<String> = if request.ids.is_empty() {
            state.volumes.keys().cloned().collect()
        } else {
            request.ids.clone()
        };

        let mut items = Vec::new();
        for id in candidates {
            let Some(entry) = state.volumes.get(&id) else {
                continue;
            };
            if matches_filters(&request.filters, &entry.value.tags, Some(id.as_str()))? {
                state.settle_volume(&id);
                if let Some(entry) = state.volumes.get(&id) {
                    items.push(entry.value.clone());
                }
            }
        }

        paginate(items, &request, state.page_size)
    }

    async fn create_volume(&self, request: CreateVolumeRequest) -> ApiResult<Volume> {
        let mut state = self.enter("CreateVolume")?;

        if !state.zones.contains(&request.availability_zone) {
            return Err(ApiError::new(
                "InvalidParameterValue",
                format!("Invalid availability zone: [{}]", request.availability_zone),
            ));
        }
        if let Some(snapshot_id) = &request.snapshot_id {
            if !state.snapshots.contains_key(snapshot_id) {
                return Err(not_found(ErrorCode::SnapshotNotFound, snapshot_id));
            }
        }

        state.create_requests.push(request.clone());
        let id = state.generate_id("vol");
        let volume = Volume {
            volume_id: Some(id.clone()),
            size_gib: Some(request.size_gib),
            availability_zone: Some(request.availability_zone),
            snapshot_id: request.snapshot_id,
            state: Some("creating".to_string()),
            attachments: Vec::new(),
            tags: request.tags,
        };
        let lag = state.lag;
        state.volumes.insert(
            id,
            Lagged {
                value: volume.clone(),
                settle_in: lag,
            },
        );
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteVolume")?;

        let entry = state.volume_mut(volume_id)?;
        if !entry.value.attachments.is_empty() {
            return Err(ApiError::from_code(
                ErrorCode::VolumeInUse,
                format!("Volume {} is currently attached", volume_id),
            ));
        }
        state.volumes.remove(volume_id);
        state.modifications.remove(volume_id);
        Ok(())
    }

    async fn attach_volume(&self, request: AttachVolumeRequest) -> ApiResult<VolumeAttachment> {
        let accepted = self.accept_attach(request);
        let delay = self.state.lock().attach_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        accepted
    }

    async fn detach_volume(&self, request: DetachVolumeRequest) -> ApiResult<VolumeAttachment> {
        let mut state = self.enter("DetachVolume")?;

        let lag = state.lag;
        let entry = state.volume_mut(&request.volume_id)?;
        let Some(attachment) = entry
            .value
            .attachments
            .iter_mut()
            .find(|a| a.instance_id.as_deref() == Some(request.instance_id.as_str()))
        else {
            return Err(ApiError::from_code(
                ErrorCode::IncorrectState,
                format!("Volume '{}' is in the 'available' state", request.volume_id),
            ));
        };

        attachment.state = Some("detaching".to_string());
        let attachment = attachment.clone();
        entry.settle_in = lag;
        Ok(attachment)
    }

    async fn describe_instances(&self, request: DescribeRequest) -> ApiResult<Page<Instance>> {
        let state = self.enter("DescribeInstances")?;

        let mut items = Vec::new();
        for id in &request.ids {
            let matching: Vec<Instance> = state
                .instances
                .values()
                .filter(|i| i.instance_id.as_deref() == Some(id.as_str()))
                .cloned()
                .collect();
            if matching.is_empty() {
                return Err(not_found(ErrorCode::InstanceNotFound, id));
            }
            items.extend(matching);
        }
        if request.ids.is_empty() {
            items.extend(state.instances.values().cloned());
        }

        paginate(items, &request, state.page_size)
    }

    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> ApiResult<Option<Snapshot>> {
        let mut state = self.enter("CreateSnapshot")?;

        let size = state.volume_mut(&request.volume_id)?.value.size_gib;
        let id = state.generate_id("snap");
        let snapshot = Snapshot {
            snapshot_id: Some(id.clone()),
            volume_id: Some(request.volume_id),
            volume_size_gib: size,
            start_time: Some(Utc::now()),
            state: Some("pending".to_string()),
            tags: request.tags,
        };
        let lag = state.lag;
        state.snapshots.insert(
            id,
            Lagged {
                value: snapshot.clone(),
                settle_in: lag,
            },
        );
        Ok(Some(snapshot))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> ApiResult<()> {
        let mut state = self.enter("DeleteSnapshot")?;

        state
            .snapshots
            .remove(snapshot_id)
            .map(|_| ())
            .ok_or_else(|| not_found(ErrorCode::SnapshotNotFound, snapshot_id))
    }

    async fn describe_snapshots(&self, request: DescribeRequest) -> ApiResult<Page<Snapshot>> {
        let mut state = self.enter("DescribeSnapshots")?;

        for id in &request.ids {
            if !state.snapshots.contains_key(id) {
                return Err(not_found(ErrorCode::SnapshotNotFound, id));
            }
        }

        let candidates: Vec<String> = if request.ids.is_empty() {
            state.snapshots.keys().cloned().collect()
        } else {
            request.ids.clone()
        };

        let mut items = Vec::new();
        for id in candidates {
            let Some(entry) = state.snapshots.get(&id) else {
                continue;
            };
            if matches_filters(&request.filters, &entry.value.tags, entry.value.volume_id.as_deref())? {
                state.settle_snapshot(&id);
                if let Some(entry) = state.snapshots.get(&id) {
                    items.push(entry.value.clone());
                }
            }
        }

        paginate(items, &request, state.page_size)
    }

    async fn modify_volume(
        &self,
        request: ModifyVolumeRequest,
    ) -> ApiResult<Option<VolumeModification>> {
        let mut state = self.enter("ModifyVolume")?;

        let original = state.volume_mut(&request.volume_id)?.value.size_gib;
        let in_flight = state
            .modifications
            .get(&request.volume_id)
            .and_then(|records| records.last())
            .map_or(false, |r| r.value.modification_state.as_deref() == Some("modifying"));
        if in_flight {
            return Err(ApiError::from_code(
                ErrorCode::IncorrectModificationState,
                format!("Volume {} is already being modified", request.volume_id),
            ));
        }

        let modification = VolumeModification {
            volume_id: Some(request.volume_id.clone()),
            modification_state: Some("modifying".to_string()),
            target_size_gib: Some(request.size_gib),
            original_size_gib: original,
        };
        let lag = state.lag;
        state
            .modifications
            .entry(request.volume_id)
            .or_default()
            .push(Lagged {
                value: modification.clone(),
                settle_in: lag,
            });
        Ok(Some(modification))
    }

    async fn describe_volumes_modifications(
        &self,
        volume_id: &str,
    ) -> ApiResult<Vec<VolumeModification>> {
        let mut state = self.enter("DescribeVolumesModifications")?;

        state.volume_mut(volume_id)?;
        state.settle_modifications(volume_id);
        Ok(state
            .modifications
            .get(volume_id)
            .map(|records| records.iter().map(|r| r.value.clone()).collect())
            .unwrap_or_default())
    }

    async fn describe_availability_zones(&self) -> ApiResult<Vec<AvailabilityZone>> {
        let state = self.enter("DescribeAvailabilityZones")?;

        Ok(state
            .zones
            .iter()
            .map(|zone| AvailabilityZone {
                zone_name: Some(zone.clone()),
                state: Some("available".to_string()),
            })
            .collect())
    }
}
