//! Cloud connection configuration
//!
//! Constructed explicitly or from the process environment. Invalid values
//! fail construction rather than surfacing on the first provider call.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Overrides the provider endpoint (signing proxy, EC2-compatible service)
pub const ENDPOINT_ENV: &str = "AWS_EC2_ENDPOINT";

/// Skips TLS certificate verification for the endpoint override
pub const INSECURE_ENV: &str = "AWS_EC2_ENDPOINT_UNSECURE";

/// Default per-request timeout for provider calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Region all calls target, e.g. `us-east-1`
    pub region: String,
    /// Endpoint override; derived from the region when absent
    pub endpoint: Option<String>,
    /// Accept invalid TLS certificates from the endpoint
    pub insecure: bool,
    /// Timeout applied to each individual provider request
    pub request_timeout: Duration,
}

impl CloudConfig {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            endpoint: None,
            insecure: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Read `AWS_EC2_ENDPOINT` and `AWS_EC2_ENDPOINT_UNSECURE`
    pub fn from_env(region: impl Into<String>) -> Result<Self> {
        Self::from_lookup(region, |key| std::env::var(key).ok())
    }

    /// Like [`CloudConfig::from_env`] with a caller-supplied variable source
    pub fn from_lookup<F>(region: impl Into<String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(region);

        if let Some(endpoint) = lookup(ENDPOINT_ENV).filter(|v| !v.is_empty()) {
            config.endpoint = Some(endpoint);
        }

        if let Some(raw) = lookup(INSECURE_ENV).filter(|v| !v.is_empty()) {
            config.insecure = parse_bool(&raw).ok_or_else(|| {
                Error::Configuration(format!("invalid {} value {:?}", INSECURE_ENV, raw))
            })?;
        }

        config.endpoint_url()?;
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validated endpoint URL the transport posts to
    pub fn endpoint_url(&self) -> Result<String> {
        if self.region.trim().is_empty() {
            return Err(Error::Configuration("region must not be empty".to_string()));
        }

        let raw = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://ec2.{}.amazonaws.com/", self.region),
        };

        let url = reqwest::Url::parse(&raw)
            .map_err(|e| Error::Configuration(format!("invalid endpoint {:?}: {}", raw, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Configuration(format!(
                "endpoint {:?} must use http or https",
                raw
            )));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(Error::Configuration(format!("endpoint {:?} has no host", raw)));
        }

        Ok(url.to_string())
    }
}

/// Boolean spellings accepted for environment flags
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
