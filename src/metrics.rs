//! Provider API metrics
//!
//! Counters and latency histograms for every provider call, registered on a
//! caller-owned prometheus [`Registry`].

use crate::error::Result;
use crate::provider::ApiResult;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::fmt;
use std::time::Duration;

/// Label used when a failed call carries no provider code
const TRANSPORT_ERROR_CODE: &str = "transport";

#[derive(Clone)]
pub struct ApiMetrics {
    requests: IntCounterVec,
    errors: IntCounterVec,
    duration: HistogramVec,
}

impl ApiMetrics {
    pub fn new() -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "ebs_cloud_api_requests_total",
                "Provider API requests by action",
            ),
            &["action"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new(
                "ebs_cloud_api_errors_total",
                "Failed provider API requests by action and error code",
            ),
            &["action", "code"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "ebs_cloud_api_request_duration_seconds",
                "Provider API request latency",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["action"],
        )?;

        Ok(Self {
            requests,
            errors,
            duration,
        })
    }

    /// Create and register on `registry`
    pub fn registered(registry: &Registry) -> Result<Self> {
        let metrics = Self::new()?;
        registry.register(Box::new(metrics.requests.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;
        registry.register(Box::new(metrics.duration.clone()))?;
        Ok(metrics)
    }

    /// Record one finished call
    pub fn observe<T>(&self, action: &str, elapsed: Duration, result: &ApiResult<T>) {
        self.requests.with_label_values(&[action]).inc();
        self.duration
            .with_label_values(&[action])
            .observe(elapsed.as_secs_f64());

        if let Err(e) = result {
            let code = e.code.as_deref().unwrap_or(TRANSPORT_ERROR_CODE);
            self.errors.with_label_values(&[action, code]).inc();
        }
    }

    pub fn requests(&self, action: &str) -> u64 {
        self.requests.with_label_values(&[action]).get()
    }

    pub fn errors(&self, action: &str, code: &str) -> u64 {
        self.errors.with_label_values(&[action, code]).get()
    }
}

impl fmt::Debug for ApiMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiMetrics").finish_non_exhaustive()
    }
}

/// Render every metric on `registry` in the text exposition format
pub fn render(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
