//! EBS Cloud CLI
//!
//! Runs single cloud facade operations against an EC2-compatible endpoint
//! and prints the result as JSON. Useful for exercising a signing proxy or a
//! local EC2 emulator.

use clap::{Parser, Subcommand};
use prometheus::Registry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ebs_cloud::config::{parse_bool, ENDPOINT_ENV, INSECURE_ENV};
use ebs_cloud::util::GIB;
use ebs_cloud::{
    metrics, ApiMetrics, AttachmentState, Cloud, CloudConfig, DiskOptions, Ec2Cloud, Error,
    OpContext, Result, SnapshotOptions,
};

/// Exit status for failures worth retrying (EX_TEMPFAIL)
const EXIT_RETRYABLE: i32 = 75;

// =============================================================================
// CLI Arguments
// =============================================================================

/// EBS Cloud - volume, attachment and snapshot operations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Region all calls target
    #[arg(long, env = "AWS_REGION")]
    region: String,

    /// Endpoint override URL
    #[arg(long, env = ENDPOINT_ENV)]
    endpoint: Option<String>,

    /// Skip TLS certificate verification for the endpoint
    #[arg(
        long,
        env = INSECURE_ENV,
        action = clap::ArgAction::Set,
        value_parser = parse_flag,
        default_value = "false"
    )]
    insecure: bool,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30")]
    request_timeout_secs: u64,

    /// Deadline for the whole operation in seconds (0 = none)
    #[arg(long, env = "OPERATION_TIMEOUT", default_value = "0")]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print provider API metrics after the operation
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a volume and wait until it is available
    CreateDisk {
        #[arg(long)]
        name: String,
        #[arg(long)]
        size_gib: i64,
        /// io1, io2, gp2, st2 or standard
        #[arg(long, default_value = "")]
        volume_type: String,
        #[arg(long, default_value = "0")]
        iops_per_gb: i64,
        /// Picked from the region's zones when empty
        #[arg(long, default_value = "")]
        zone: String,
        #[arg(long)]
        encrypted: bool,
        #[arg(long, default_value = "")]
        kms_key_id: String,
        #[arg(long, default_value = "")]
        snapshot_id: String,
    },
    DeleteDisk {
        #[arg(long)]
        volume_id: String,
    },
    Attach {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        node_id: String,
    },
    Detach {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        node_id: String,
    },
    Resize {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        size_gib: i64,
    },
    /// Wait until an attachment of the volume reports a state
    WaitAttachment {
        #[arg(long)]
        volume_id: String,
        /// attaching, attached, detaching, detached or busy
        #[arg(long)]
        state: AttachmentState,
    },
    /// Look a volume up by ID, or by name and size
    GetDisk {
        #[arg(long, conflicts_with = "name")]
        volume_id: Option<String>,
        #[arg(long, requires = "size_gib")]
        name: Option<String>,
        #[arg(long)]
        size_gib: Option<i64>,
    },
    InstanceExists {
        #[arg(long)]
        node_id: String,
    },
    CreateSnapshot {
        #[arg(long)]
        volume_id: String,
        #[arg(long)]
        name: String,
    },
    DeleteSnapshot {
        #[arg(long)]
        snapshot_id: String,
    },
    /// Look a snapshot up by ID or by name
    GetSnapshot {
        #[arg(long, conflicts_with = "name")]
        snapshot_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    ListSnapshots {
        #[arg(long)]
        volume_id: Option<String>,
        #[arg(long, default_value = "0")]
        max_results: i64,
        #[arg(long)]
        next_token: Option<String>,
    },
}

fn parse_flag(value: &str) -> std::result::Result<bool, String> {
    parse_bool(value).ok_or_else(|| format!("invalid boolean {:?}", value))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting EBS cloud CLI");
    info!("  Version: {}", ebs_cloud::VERSION);
    info!("  Region: {}", args.region);

    let mut config = CloudConfig::new(args.region.clone())
        .with_insecure(args.insecure)
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs));
    if let Some(endpoint) = args.endpoint.clone().filter(|e| !e.is_empty()) {
        config = config.with_endpoint(endpoint);
    }

    let registry = Registry::new();
    let api_metrics = Arc::new(ApiMetrics::registered(&registry)?);
    let cloud = Ec2Cloud::new(&config, api_metrics)?;

    let mut ctx = OpContext::new();
    if args.timeout_secs > 0 {
        ctx = ctx.with_timeout(Duration::from_secs(args.timeout_secs));
    }

    let token = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling operation");
            token.cancel();
        }
    });

    let result = run(&cloud, &ctx, args.command).await;

    if args.print_metrics {
        eprintln!("{}", metrics::render(&registry)?);
    }

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            error!("Operation failed: {}", e);
            std::process::exit(if e.is_retryable() { EXIT_RETRYABLE } else { 1 });
        }
    }
}

async fn run(cloud: &dyn Cloud, ctx: &OpContext, command: Command) -> Result<String> {
    match command {
        Command::CreateDisk {
            name,
            size_gib,
            volume_type,
            iops_per_gb,
            zone,
            encrypted,
            kms_key_id,
            snapshot_id,
        } => {
            let options = DiskOptions {
                volume_type,
                iops_per_gb,
                availability_zone: zone,
                encrypted,
                kms_key_id,
                snapshot_id,
                ..DiskOptions::new(size_gib.saturating_mul(GIB))
            };
            to_json(&cloud.create_disk(ctx, &name, options).await?)
        }
        Command::DeleteDisk { volume_id } => to_json(&cloud.delete_disk(ctx, &volume_id).await?),
        Command::Attach { volume_id, node_id } => {
            let path = cloud.attach_disk(ctx, &volume_id, &node_id).await?;
            to_json(&serde_json::json!({ "device_path": path }))
        }
        Command::Detach { volume_id, node_id } => {
            to_json(&cloud.detach_disk(ctx, &volume_id, &node_id).await?)
        }
        Command::Resize { volume_id, size_gib } => {
            let size = cloud
                .resize_disk(ctx, &volume_id, size_gib.saturating_mul(GIB))
                .await?;
            to_json(&serde_json::json!({ "capacity_gib": size }))
        }
        Command::WaitAttachment { volume_id, state } => {
            cloud
                .wait_for_attachment_state(ctx, &volume_id, state)
                .await?;
            to_json(&serde_json::json!({ "volume_id": volume_id, "state": state }))
        }
        Command::GetDisk {
            volume_id,
            name,
            size_gib,
        } => match (volume_id, name, size_gib) {
            (Some(volume_id), _, _) => to_json(&cloud.get_disk_by_id(ctx, &volume_id).await?),
            (None, Some(name), Some(size_gib)) => to_json(
                &cloud
                    .get_disk_by_name(ctx, &name, size_gib.saturating_mul(GIB))
                    .await?,
            ),
            _ => Err(Error::InvalidArgument(
                "either --volume-id or --name with --size-gib is required".to_string(),
            )),
        },
        Command::InstanceExists { node_id } => {
            let exists = cloud.instance_exists(ctx, &node_id).await?;
            to_json(&serde_json::json!({ "exists": exists }))
        }
        Command::CreateSnapshot { volume_id, name } => to_json(
            &cloud
                .create_snapshot(ctx, &volume_id, SnapshotOptions::named(name))
                .await?,
        ),
        Command::DeleteSnapshot { snapshot_id } => {
            to_json(&cloud.delete_snapshot(ctx, &snapshot_id).await?)
        }
        Command::GetSnapshot { snapshot_id, name } => match (snapshot_id, name) {
            (Some(snapshot_id), _) => to_json(&cloud.get_snapshot_by_id(ctx, &snapshot_id).await?),
            (None, Some(name)) => to_json(&cloud.get_snapshot_by_name(ctx, &name).await?),
            (None, None) => Err(Error::InvalidArgument(
                "either --snapshot-id or --name is required".to_string(),
            )),
        },
        Command::ListSnapshots {
            volume_id,
            max_results,
            next_token,
        } => to_json(
            &cloud
                .list_snapshots(ctx, volume_id.as_deref(), max_results, next_token.as_deref())
                .await?,
        ),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "reqwest=warn", "rustls=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // stdout carries the JSON result
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
