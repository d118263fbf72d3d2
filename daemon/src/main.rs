use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde::Deserialize;

use vblock_daemon::config::{DiskConfig, NetConfig};
use vblock_daemon::core::backing::FileBacking;
use vblock_daemon::core::bitmap::{MemActivityLog, MemBitmap};
use vblock_daemon::core::device::{Device, DeviceRegistry};
use vblock_daemon::core::metadata::MetaStore;
use vblock_daemon::core::state::Role;
use vblock_daemon::p2p::PeerLink;

#[derive(Parser)]
#[command(name = "vblockd", about = "Synchronously replicated block device daemon")]
struct Args {
    /// Volume configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(Debug, Deserialize)]
struct VolumeConfig {
    name: String,
    /// Path of the backing file or device node
    backing: PathBuf,
    /// Device capacity in bytes
    capacity: u64,
    /// Path of the metadata superblock
    meta: PathBuf,
    role: String,
    /// Address to listen on for the peer
    listen: Option<SocketAddr>,
    /// Address of the peer to connect to
    peer: Option<SocketAddr>,
    #[serde(default)]
    net: NetConfig,
    #[serde(default)]
    disk: DiskConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let volume: VolumeConfig = serde_json::from_str(&raw).context("parsing volume config")?;

    let role = match volume.role.as_str() {
        "primary" => Role::Primary,
        "secondary" => Role::Secondary,
        other => anyhow::bail!("unknown role {:?}", other),
    };

    let backing = Arc::new(
        FileBacking::open(&volume.backing, volume.capacity)
            .with_context(|| format!("opening {}", volume.backing.display()))?,
    );
    let meta = Arc::new(MetaStore::load_or_init(&volume.meta, role));

    let device = Device::new(
        volume.name.clone(),
        role,
        volume.net,
        volume.disk,
        backing,
        Arc::new(MemBitmap::new()),
        Arc::new(MemActivityLog::new()),
        meta,
    );
    device.spawn_workers();

    let registry = DeviceRegistry::new();
    registry.insert(Arc::clone(&device));
    info!("device {} configured as {}", volume.name, role);

    let link = PeerLink::new(Arc::clone(&device), volume.listen, volume.peer);
    let link_task = tokio::spawn(Arc::clone(&link).run());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    link.stop();
    device.shutdown();
    link_task.abort();

    Ok(())
}
