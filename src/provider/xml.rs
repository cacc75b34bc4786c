//! EC2 query-protocol response bodies
//!
//! Leaf values are read as text and parsed afterwards: the provider emits
//! empty elements (`<snapshotId/>`) for absent values, which a direct numeric
//! decode would reject.

use super::errors::{ApiError, ApiResult};
use super::{
    AvailabilityZone, BlockDeviceMapping, Instance, Page, Snapshot, Volume, VolumeAttachment,
    VolumeModification,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Decode a successful response body
pub(super) fn decode<T: DeserializeOwned>(action: &str, body: &str) -> ApiResult<T> {
    quick_xml::de::from_str(body)
        .map_err(|e| ApiError::transport(format!("failed to decode {} response: {}", action, e)))
}

/// Decode an error body; falls back to the HTTP status when the body is not
/// a provider error document
pub(super) fn decode_error(status: u16, body: &str) -> ApiError {
    let first = quick_xml::de::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|response| response.errors.errors.into_iter().next());

    match first {
        Some(ErrorItem { code, message }) => ApiError {
            code: non_empty(code),
            message: message.unwrap_or_default(),
        },
        None => ApiError::transport(format!("HTTP {}: {}", status, body.trim())),
    }
}

// =============================================================================
// Shared Shapes
// =============================================================================

/// `<xSet><item>..</item>..</xSet>` wrapper
#[derive(Debug, Deserialize)]
pub(super) struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct TagItem {
    key: Option<String>,
    value: Option<String>,
}

fn tags(set: ItemSet<TagItem>) -> BTreeMap<String, String> {
    set.items
        .into_iter()
        .filter_map(|tag| {
            let key = non_empty(tag.key)?;
            Some((key, tag.value.unwrap_or_default()))
        })
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_i64(field: &str, value: Option<String>) -> ApiResult<Option<i64>> {
    match non_empty(value) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ApiError::transport(format!("invalid {} {:?}", field, v))),
        None => Ok(None),
    }
}

fn parse_time(field: &str, value: Option<String>) -> ApiResult<Option<DateTime<Utc>>> {
    match non_empty(value) {
        Some(v) => DateTime::parse_from_rfc3339(v.trim())
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| ApiError::transport(format!("invalid {} {:?}", field, v))),
        None => Ok(None),
    }
}

fn page<T>(items: Vec<T>, next_token: Option<String>) -> Page<T> {
    Page {
        items,
        next_token: non_empty(next_token),
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Errors")]
    errors: ErrorList,
}

#[derive(Debug, Deserialize)]
struct ErrorList {
    #[serde(rename = "Error", default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

// =============================================================================
// Volumes
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VolumeItem {
    volume_id: Option<String>,
    size: Option<String>,
    availability_zone: Option<String>,
    snapshot_id: Option<String>,
    status: Option<String>,
    #[serde(default)]
    attachment_set: ItemSet<AttachmentItem>,
    #[serde(default)]
    tag_set: ItemSet<TagItem>,
}

impl VolumeItem {
    pub fn into_volume(self) -> ApiResult<Volume> {
        Ok(Volume {
            volume_id: non_empty(self.volume_id),
            size_gib: parse_i64("size", self.size)?,
            availability_zone: non_empty(self.availability_zone),
            snapshot_id: non_empty(self.snapshot_id),
            state: non_empty(self.status),
            attachments: self
                .attachment_set
                .items
                .into_iter()
                .map(AttachmentItem::into_attachment)
                .collect(),
            tags: tags(self.tag_set),
        })
    }
}

/// Also the body of AttachVolume and DetachVolume responses
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AttachmentItem {
    volume_id: Option<String>,
    instance_id: Option<String>,
    device: Option<String>,
    status: Option<String>,
}

impl AttachmentItem {
    pub fn into_attachment(self) -> VolumeAttachment {
        VolumeAttachment {
            volume_id: non_empty(self.volume_id),
            instance_id: non_empty(self.instance_id),
            device: non_empty(self.device),
            state: non_empty(self.status),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DescribeVolumesResponse {
    #[serde(default)]
    volume_set: ItemSet<VolumeItem>,
    next_token: Option<String>,
}

impl DescribeVolumesResponse {
    pub fn into_page(self) -> ApiResult<Page<Volume>> {
        let items = self
            .volume_set
            .items
            .into_iter()
            .map(VolumeItem::into_volume)
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(page(items, self.next_token))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct VolumeModificationItem {
    volume_id: Option<String>,
    modification_state: Option<String>,
    target_size: Option<String>,
    original_size: Option<String>,
}

impl VolumeModificationItem {
    pub fn into_modification(self) -> ApiResult<VolumeModification> {
        Ok(VolumeModification {
            volume_id: non_empty(self.volume_id),
            modification_state: non_empty(self.modification_state),
            target_size_gib: parse_i64("targetSize", self.target_size)?,
            original_size_gib: parse_i64("originalSize", self.original_size)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ModifyVolumeResponse {
    volume_modification: Option<VolumeModificationItem>,
}

impl ModifyVolumeResponse {
    pub fn into_modification(self) -> ApiResult<Option<VolumeModification>> {
        self.volume_modification
            .map(VolumeModificationItem::into_modification)
            .transpose()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DescribeVolumesModificationsResponse {
    #[serde(default)]
    volume_modification_set: ItemSet<VolumeModificationItem>,
}

impl DescribeVolumesModificationsResponse {
    pub fn into_modifications(self) -> ApiResult<Vec<VolumeModification>> {
        self.volume_modification_set
            .items
            .into_iter()
            .map(VolumeModificationItem::into_modification)
            .collect()
    }
}

// =============================================================================
// Instances
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DescribeInstancesResponse {
    #[serde(default)]
    reservation_set: ItemSet<ReservationItem>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReservationItem {
    #[serde(default)]
    instances_set: ItemSet<InstanceItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceItem {
    instance_id: Option<String>,
    #[serde(default)]
    block_device_mapping: ItemSet<BlockDeviceMappingItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDeviceMappingItem {
    device_name: Option<String>,
    ebs: Option<EbsItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EbsItem {
    volume_id: Option<String>,
}

impl DescribeInstancesResponse {
    pub fn into_page(self) -> Page<Instance> {
        let items = self
            .reservation_set
            .items
            .into_iter()
            .flat_map(|reservation| reservation.instances_set.items)
            .map(|instance| Instance {
                instance_id: non_empty(instance.instance_id),
                block_device_mappings: instance
                    .block_device_mapping
                    .items
                    .into_iter()
                    .map(|mapping| BlockDeviceMapping {
                        device_name: non_empty(mapping.device_name),
                        volume_id: mapping.ebs.and_then(|ebs| non_empty(ebs.volume_id)),
                    })
                    .collect(),
            })
            .collect();
        page(items, self.next_token)
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Also the body of a CreateSnapshot response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SnapshotItem {
    snapshot_id: Option<String>,
    volume_id: Option<String>,
    volume_size: Option<String>,
    start_time: Option<String>,
    status: Option<String>,
    #[serde(default)]
    tag_set: ItemSet<TagItem>,
}

impl SnapshotItem {
    pub fn into_snapshot(self) -> ApiResult<Snapshot> {
        Ok(Snapshot {
            snapshot_id: non_empty(self.snapshot_id),
            volume_id: non_empty(self.volume_id),
            volume_size_gib: parse_i64("volumeSize", self.volume_size)?,
            start_time: parse_time("startTime", self.start_time)?,
            state: non_empty(self.status),
            tags: tags(self.tag_set),
        })
    }

    /// A response that decoded but names no snapshot
    pub fn is_empty(&self) -> bool {
        self.snapshot_id.as_deref().map_or(true, |id| id.trim().is_empty())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DescribeSnapshotsResponse {
    #[serde(default)]
    snapshot_set: ItemSet<SnapshotItem>,
    next_token: Option<String>,
}

impl DescribeSnapshotsResponse {
    pub fn into_page(self) -> ApiResult<Page<Snapshot>> {
        let items = self
            .snapshot_set
            .items
            .into_iter()
            .map(SnapshotItem::into_snapshot)
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(page(items, self.next_token))
    }
}

// =============================================================================
// Availability Zones
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DescribeAvailabilityZonesResponse {
    #[serde(default)]
    availability_zone_info: ItemSet<ZoneItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ZoneItem {
    zone_name: Option<String>,
    zone_state: Option<String>,
}

impl DescribeAvailabilityZonesResponse {
    pub fn into_zones(self) -> Vec<AvailabilityZone> {
        self.availability_zone_info
            .items
            .into_iter()
            .map(|zone| AvailabilityZone {
                zone_name: non_empty(zone.zone_name),
                state: non_empty(zone.zone_state),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ErrorCode;

    const DESCRIBE_VOLUMES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeVolumesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>59dbff89-35bd-4eac-99ed-be587EXAMPLE</requestId>
    <volumeSet>
        <item>
            <volumeId>vol-1234567890abcdef0</volumeId>
            <size>80</size>
            <snapshotId/>
            <availabilityZone>us-east-1a</availabilityZone>
            <status>in-use</status>
            <createTime>2013-12-18T22:35:00.000Z</createTime>
            <attachmentSet>
                <item>
                    <volumeId>vol-1234567890abcdef0</volumeId>
                    <instanceId>i-1234567890abcdef0</instanceId>
                    <device>/dev/xvdba</device>
                    <status>attached</status>
                    <attachTime>2013-12-18T22:35:00.000Z</attachTime>
                    <deleteOnTermination>false</deleteOnTermination>
                </item>
            </attachmentSet>
            <tagSet>
                <item>
                    <key>CSIVolumeName</key>
                    <value>pvc-1</value>
                </item>
            </tagSet>
            <volumeType>gp2</volumeType>
            <encrypted>false</encrypted>
        </item>
    </volumeSet>
    <nextToken>page-2</nextToken>
</DescribeVolumesResponse>"#;

    #[test]
    fn test_decode_describe_volumes() {
        let page = decode::<DescribeVolumesResponse>("DescribeVolumes", DESCRIBE_VOLUMES)
            .unwrap()
            .into_page()
            .unwrap();

        assert_eq!(page.next_token.as_deref(), Some("page-2"));
        assert_eq!(page.items.len(), 1);

        let volume = &page.items[0];
        assert_eq!(volume.volume_id.as_deref(), Some("vol-1234567890abcdef0"));
        assert_eq!(volume.size_gib, Some(80));
        assert_eq!(volume.snapshot_id, None);
        assert_eq!(volume.state.as_deref(), Some("in-use"));
        assert_eq!(volume.attachments.len(), 1);
        assert_eq!(volume.attachments[0].state.as_deref(), Some("attached"));
        assert_eq!(volume.attachments[0].device.as_deref(), Some("/dev/xvdba"));
        assert_eq!(volume.tags.get("CSIVolumeName").map(String::as_str), Some("pvc-1"));
    }

    #[test]
    fn test_decode_empty_volume_set() {
        let body = r#"<DescribeVolumesResponse><requestId>r</requestId><volumeSet/></DescribeVolumesResponse>"#;
        let page = decode::<DescribeVolumesResponse>("DescribeVolumes", body)
            .unwrap()
            .into_page()
            .unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_token.is_none());
    }

    #[test]
    fn test_decode_instances_flattens_reservations() {
        let body = r#"<DescribeInstancesResponse>
    <reservationSet>
        <item>
            <reservationId>r-1</reservationId>
            <instancesSet>
                <item>
                    <instanceId>i-1</instanceId>
                    <blockDeviceMapping>
                        <item>
                            <deviceName>/dev/xvda</deviceName>
                            <ebs><volumeId>vol-root</volumeId><status>attached</status></ebs>
                        </item>
                        <item>
                            <deviceName>/dev/xvdba</deviceName>
                            <ebs><volumeId>vol-data</volumeId><status>attached</status></ebs>
                        </item>
                    </blockDeviceMapping>
                </item>
            </instancesSet>
        </item>
    </reservationSet>
</DescribeInstancesResponse>"#;

        let page = decode::<DescribeInstancesResponse>("DescribeInstances", body)
            .unwrap()
            .into_page();

        assert_eq!(page.items.len(), 1);
        let instance = &page.items[0];
        assert_eq!(instance.instance_id.as_deref(), Some("i-1"));
        assert_eq!(instance.block_device_mappings.len(), 2);
        assert_eq!(
            instance.block_device_mappings[1].volume_id.as_deref(),
            Some("vol-data")
        );
    }

    #[test]
    fn test_decode_snapshot_with_start_time() {
        let body = r#"<CreateSnapshotResponse>
    <requestId>r</requestId>
    <snapshotId>snap-1</snapshotId>
    <volumeId>vol-1</volumeId>
    <status>pending</status>
    <startTime>2016-08-29T20:19:04.000Z</startTime>
    <progress/>
    <volumeSize>8</volumeSize>
    <description>Created by EBS CSI driver for volume vol-1</description>
</CreateSnapshotResponse>"#;

        let item = decode::<SnapshotItem>("CreateSnapshot", body).unwrap();
        assert!(!item.is_empty());
        let snapshot = item.into_snapshot().unwrap();
        assert_eq!(snapshot.snapshot_id.as_deref(), Some("snap-1"));
        assert_eq!(snapshot.volume_size_gib, Some(8));
        assert_eq!(snapshot.state.as_deref(), Some("pending"));
        assert!(snapshot.start_time.is_some());
    }

    #[test]
    fn test_decode_modification() {
        let body = r#"<ModifyVolumeResponse>
    <volumeModification>
        <volumeId>vol-1</volumeId>
        <modificationState>modifying</modificationState>
        <targetSize>200</targetSize>
        <originalSize>100</originalSize>
    </volumeModification>
</ModifyVolumeResponse>"#;

        let modification = decode::<ModifyVolumeResponse>("ModifyVolume", body)
            .unwrap()
            .into_modification()
            .unwrap()
            .unwrap();
        assert_eq!(modification.modification_state.as_deref(), Some("modifying"));
        assert_eq!(modification.target_size_gib, Some(200));
        assert_eq!(modification.original_size_gib, Some(100));
    }

    #[test]
    fn test_decode_error_document() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response><Errors><Error><Code>InvalidVolume.NotFound</Code><Message>The volume 'vol-1' does not exist.</Message></Error></Errors><RequestID>r</RequestID></Response>"#;

        let err = decode_error(400, body);
        assert!(err.is(ErrorCode::VolumeNotFound));
        assert_eq!(err.message, "The volume 'vol-1' does not exist.");
    }

    #[test]
    fn test_decode_error_falls_back_to_status() {
        let err = decode_error(502, "Bad Gateway");
        assert_eq!(err.code, None);
        assert_eq!(err.message, "HTTP 502: Bad Gateway");
    }

    #[test]
    fn test_invalid_size_is_a_decode_failure() {
        let body = r#"<DescribeVolumesResponse><volumeSet><item><volumeId>vol-1</volumeId><size>lots</size></item></volumeSet></DescribeVolumesResponse>"#;
        let err = decode::<DescribeVolumesResponse>("DescribeVolumes", body)
            .unwrap()
            .into_page()
            .unwrap_err();
        assert_eq!(err.code, None);
    }
}
