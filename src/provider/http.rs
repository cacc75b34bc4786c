//! EC2 query-protocol transport
//!
//! Form-encoded POSTs against the configured endpoint, XML responses decoded
//! by [`super::xml`]. Requests are not signed; point the endpoint at a
//! signing proxy or an EC2-compatible service that does not require it.

use super::errors::{ApiError, ApiResult};
use super::xml;
use super::{
    AttachVolumeRequest, AvailabilityZone, CreateSnapshotRequest, CreateVolumeRequest,
    DescribeRequest, DetachVolumeRequest, Ec2Api, Filter, Instance, ModifyVolumeRequest, Page,
    Snapshot, Volume, VolumeAttachment, VolumeModification,
};
use crate::config::CloudConfig;
use crate::error::{Error, Result};
use crate::metrics::ApiMetrics;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// EC2 API version every request is pinned to
pub const API_VERSION: &str = "2016-11-15";

// =============================================================================
// Query Parameters
// =============================================================================

/// Ordered query-protocol parameters for one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueryParams {
    action: &'static str,
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new(action: &'static str) -> Self {
        Self {
            action,
            pairs: vec![
                ("Action".to_string(), action.to_string()),
                ("Version".to_string(), API_VERSION.to_string()),
            ],
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.pairs.push((key.into(), value.to_string()));
        self
    }

    pub fn set_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.set(key, value),
            None => self,
        }
    }

    /// `Prefix.1`, `Prefix.2`, ...
    pub fn list(mut self, prefix: &str, values: &[String]) -> Self {
        for (i, value) in values.iter().enumerate() {
            self.pairs.push((format!("{}.{}", prefix, i + 1), value.clone()));
        }
        self
    }

    /// `Filter.N.Name` plus `Filter.N.Value.M`
    pub fn filters(mut self, filters: &[Filter]) -> Self {
        for (i, filter) in filters.iter().enumerate() {
            let n = i + 1;
            self.pairs
                .push((format!("Filter.{}.Name", n), filter.name.clone()));
            for (j, value) in filter.values.iter().enumerate() {
                self.pairs
                    .push((format!("Filter.{}.Value.{}", n, j + 1), value.clone()));
            }
        }
        self
    }

    /// Tags applied at creation through a single tag specification
    pub fn tags(mut self, resource_type: &str, tags: &BTreeMap<String, String>) -> Self {
        if tags.is_empty() {
            return self;
        }
        self.pairs.push((
            "TagSpecification.1.ResourceType".to_string(),
            resource_type.to_string(),
        ));
        for (i, (key, value)) in tags.iter().enumerate() {
            let n = i + 1;
            self.pairs
                .push((format!("TagSpecification.1.Tag.{}.Key", n), key.clone()));
            self.pairs
                .push((format!("TagSpecification.1.Tag.{}.Value", n), value.clone()));
        }
        self
    }

    /// IDs, filters and paging of a describe call
    pub fn describe(self, id_prefix: &str, request: &DescribeRequest) -> Self {
        self.list(id_prefix, &request.ids)
            .filters(&request.filters)
            .set_opt("MaxResults", request.max_results)
            .set_opt(
                "NextToken",
                request.next_token.as_ref().filter(|t| !t.is_empty()),
            )
    }

    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

// =============================================================================
// Client
// =============================================================================

/// [`Ec2Api`] over HTTP(S)
pub struct Ec2Client {
    http: reqwest::Client,
    endpoint: String,
    metrics: Arc<ApiMetrics>,
}

impl Ec2Client {
    pub fn new(config: &CloudConfig, metrics: Arc<ApiMetrics>) -> Result<Self> {
        let endpoint = config.endpoint_url()?;
        if config.insecure {
            warn!("TLS verification disabled for endpoint {}", endpoint);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint,
            metrics,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(&self, params: QueryParams) -> ApiResult<T> {
        let action = params.action;
        let started = Instant::now();

        let result = self.send(&params).await;
        self.metrics.observe(action, started.elapsed(), &result);

        xml::decode(action, &result?)
    }

    async fn send(&self, params: &QueryParams) -> ApiResult<String> {
        debug!("{} -> {}", params.action, self.endpoint);

        let response = self
            .http
            .post(&self.endpoint)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .body(params.encode())
            .send()
            .await
            .map_err(ApiError::transport)?;

        let status = response.status();
        let body = response.text().await.map_err(ApiError::transport)?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(xml::decode_error(status.as_u16(), &body))
        }
    }

    async fn call_unit(&self, params: QueryParams) -> ApiResult<()> {
        let action = params.action;
        let started = Instant::now();

        let result = self.send(&params).await.map(|_| ());
        self.metrics.observe(action, started.elapsed(), &result);
        result
    }
}

#[async_trait]
impl Ec2Api for Ec2Client {
    async fn describe_volumes(&self, request: DescribeRequest) -> ApiResult<Page<Volume>> {
        let params = QueryParams::new("DescribeVolumes").describe("VolumeId", &request);
        self.call::<xml::DescribeVolumesResponse>(params)
            .await?
            .into_page()
    }

    async fn create_volume(&self, request: CreateVolumeRequest) -> ApiResult<Volume> {
        let mut params = QueryParams::new("CreateVolume")
            .set("AvailabilityZone", &request.availability_zone)
            .set("Size", request.size_gib)
            .set("VolumeType", &request.volume_type)
            .set_opt("Iops", request.iops)
            .set_opt("KmsKeyId", request.kms_key_id.as_ref())
            .set_opt("SnapshotId", request.snapshot_id.as_ref())
            .tags("volume", &request.tags);
        if request.encrypted {
            params = params.set("Encrypted", "true");
        }

        self.call::<xml::VolumeItem>(params).await?.into_volume()
    }

    async fn delete_volume(&self, volume_id: &str) -> ApiResult<()> {
        self.call_unit(QueryParams::new("DeleteVolume").set("VolumeId", volume_id))
            .await
    }

    async fn attach_volume(&self, request: AttachVolumeRequest) -> ApiResult<VolumeAttachment> {
        let params = QueryParams::new("AttachVolume")
            .set_opt("Device", request.device.as_ref())
            .set("InstanceId", &request.instance_id)
            .set("VolumeId", &request.volume_id);
        Ok(self
            .call::<xml::AttachmentItem>(params)
            .await?
            .into_attachment())
    }

    async fn detach_volume(&self, request: DetachVolumeRequest) -> ApiResult<VolumeAttachment> {
        let params = QueryParams::new("DetachVolume")
            .set("InstanceId", &request.instance_id)
            .set("VolumeId", &request.volume_id);
        Ok(self
            .call::<xml::AttachmentItem>(params)
            .await?
            .into_attachment())
    }

    async fn describe_instances(&self, request: DescribeRequest) -> ApiResult<Page<Instance>> {
        let params = QueryParams::new("DescribeInstances").describe("InstanceId", &request);
        Ok(self
            .call::<xml::DescribeInstancesResponse>(params)
            .await?
            .into_page())
    }

    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> ApiResult<Option<Snapshot>> {
        let params = QueryParams::new("CreateSnapshot")
            .set("VolumeId", &request.volume_id)
            .set("Description", &request.description)
            .tags("snapshot", &request.tags);

        let item = self.call::<xml::SnapshotItem>(params).await?;
        if item.is_empty() {
            return Ok(None);
        }
        item.into_snapshot().map(Some)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> ApiResult<()> {
        self.call_unit(QueryParams::new("DeleteSnapshot").set("SnapshotId", snapshot_id))
            .await
    }

    async fn describe_snapshots(&self, request: DescribeRequest) -> ApiResult<Page<Snapshot>> {
        let params = QueryParams::new("DescribeSnapshots").describe("SnapshotId", &request);
        self.call::<xml::DescribeSnapshotsResponse>(params)
            .await?
            .into_page()
    }

    async fn modify_volume(
        &self,
        request: ModifyVolumeRequest,
    ) -> ApiResult<Option<VolumeModification>> {
        let params = QueryParams::new("ModifyVolume")
            .set("VolumeId", &request.volume_id)
            .set("Size", request.size_gib);
        self.call::<xml::ModifyVolumeResponse>(params)
            .await?
            .into_modification()
    }

    async fn describe_volumes_modifications(
        &self,
        volume_id: &str,
    ) -> ApiResult<Vec<VolumeModification>> {
        let params = QueryParams::new("DescribeVolumesModifications").set("VolumeId.1", volume_id);
        self.call::<xml::DescribeVolumesModificationsResponse>(params)
            .await?
            .into_modifications()
    }

    async fn describe_availability_zones(&self) -> ApiResult<Vec<AvailabilityZone>> {
        let params = QueryParams::new("DescribeAvailabilityZones");
        Ok(self
            .call::<xml::DescribeAvailabilityZonesResponse>(params)
            .await?
            .into_zones())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_and_version_lead() {
        let params = QueryParams::new("DeleteVolume").set("VolumeId", "vol-1");
        assert_eq!(
            params.encode(),
            "Action=DeleteVolume&Version=2016-11-15&VolumeId=vol-1"
        );
    }

    #[test]
    fn test_describe_params() {
        let request = DescribeRequest {
            ids: vec!["vol-1".to_string(), "vol-2".to_string()],
            filters: vec![Filter::tag("CSIVolumeName", "pvc 1")],
            max_results: Some(5),
            next_token: Some("abc".to_string()),
        };
        let encoded = QueryParams::new("DescribeVolumes")
            .describe("VolumeId", &request)
            .encode();

        assert_eq!(
            encoded,
            "Action=DescribeVolumes&Version=2016-11-15\
             &VolumeId.1=vol-1&VolumeId.2=vol-2\
             &Filter.1.Name=tag%3ACSIVolumeName&Filter.1.Value.1=pvc%201\
             &MaxResults=5&NextToken=abc"
        );
    }

    #[test]
    fn test_empty_next_token_is_omitted() {
        let request = DescribeRequest {
            next_token: Some(String::new()),
            ..Default::default()
        };
        let encoded = QueryParams::new("DescribeSnapshots")
            .describe("SnapshotId", &request)
            .encode();
        assert!(!encoded.contains("NextToken"));
    }

    #[test]
    fn test_tag_specification() {
        let mut tags = BTreeMap::new();
        tags.insert("CSIVolumeName".to_string(), "pvc-1".to_string());
        tags.insert("team".to_string(), "storage".to_string());

        let params = QueryParams::new("CreateVolume").tags("volume", &tags);
        let pairs: Vec<(&str, &str)> = params
            .pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .skip(2)
            .collect();

        assert_eq!(
            pairs,
            vec![
                ("TagSpecification.1.ResourceType", "volume"),
                ("TagSpecification.1.Tag.1.Key", "CSIVolumeName"),
                ("TagSpecification.1.Tag.1.Value", "pvc-1"),
                ("TagSpecification.1.Tag.2.Key", "team"),
                ("TagSpecification.1.Tag.2.Value", "storage"),
            ]
        );
    }

    #[test]
    fn test_no_tags_no_specification() {
        let params = QueryParams::new("CreateSnapshot").tags("snapshot", &BTreeMap::new());
        assert_eq!(params.pairs.len(), 2);
    }

    #[test]
    fn test_client_uses_config_endpoint() {
        let config = CloudConfig::new("eu-west-1").with_endpoint("http://127.0.0.1:4566");
        let client = Ec2Client::new(&config, Arc::new(ApiMetrics::new().unwrap())).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:4566/");
    }
}
