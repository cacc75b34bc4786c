//! EBS Cloud - Volume Orchestration Core
//!
//! The cloud-provider layer of an EBS-compatible CSI driver: creates,
//! deletes, resizes, attaches and detaches block volumes and manages their
//! snapshots against an EC2-style API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                     Cloud Facade (domain::Cloud)                             │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │     Volume      │  │   Attachment    │  │        Snapshot             │  │
//! │  │    Lifecycle    │  │  Orchestrator   │  │        Lifecycle            │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │           ┌────────┴────────┐                │                   │
//! │           │           │ Device Allocator│                │                   │
//! │           │           └─────────────────┘                │                   │
//! │           └────────────────────┬─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Poll / Paginate      │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┴────────────────────────────────────────────┤
//! │                      Provider Transport (provider::Ec2Api)                   │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │   Ec2Client (query/XML)     │  │   FakeEc2 (in-memory, lagging)      │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cloud`]: Facade implementations and the per-resource managers
//! - [`device`]: Per-instance device path allocation
//! - [`domain`]: Disk/snapshot models and the [`Cloud`] port
//! - [`provider`]: Transport port, HTTP client and in-memory fake
//! - [`wait`] / [`context`]: Polling schedules and cancellable operations
//! - [`config`] / [`metrics`]: Connection settings and API metrics
//! - [`error`]: Error types and handling

pub mod cloud;
pub mod config;
pub mod context;
pub mod device;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod util;
pub mod wait;

// Re-export commonly used types
pub use cloud::{Ec2Cloud, FakeCloud};

pub use config::CloudConfig;

pub use context::OpContext;

pub use device::{Device, DeviceAllocator, DeviceAllocatorRef, DeviceManager};

pub use domain::{
    AttachmentState, Cloud, CloudRef, Disk, DiskOptions, ListSnapshotsResponse, Outcome,
    Snapshot, SnapshotOptions, VolumeType,
};

pub use error::{Error, ErrorKind, Result};

pub use metrics::ApiMetrics;

pub use provider::{Ec2Api, Ec2ApiRef, Ec2Client, FakeEc2};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
