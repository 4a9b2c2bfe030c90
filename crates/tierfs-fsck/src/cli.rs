use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tierfs_engine::{
    format, fsck, BlockDevice, DeviceUsage, EncryptionKey, Engine, EngineConfig, EngineStats,
    FileDevice, FixPolicy, FixPrompt, FormatOptions, FsckExit, KeyProvider,
    NoKeyProvider, StaticKeyProvider, Superblock, Tier,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tierfs-fsck")]
#[command(about = "Check, repair, format and inspect TierFS filesystems", long_about = None)]
pub struct Cli {
    /// More log output; repeat for debug.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Logs and reports as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Checks a filesystem and optionally repairs it.
    Check {
        /// Device images, in format order.
        #[arg(required = true)]
        devices: Vec<PathBuf>,
        /// Repair policy: no, yes or ask.
        #[arg(short, long, default_value = "no")]
        fix: FixPolicy,
        /// Continue when a device is unreadable.
        #[arg(long)]
        degraded: bool,
        /// Engine config as JSON.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// File holding the 32-byte filesystem key.
        #[arg(short, long)]
        key_file: Option<PathBuf>,
    },
    /// Writes an empty filesystem.
    Format {
        /// Device images; created when --size is given.
        #[arg(required = true)]
        devices: Vec<PathBuf>,
        /// Create each image with this many bytes.
        #[arg(long)]
        size: Option<u64>,
        /// Filesystem label.
        #[arg(short, long, default_value = "")]
        label: String,
        /// Allocation bucket size in bytes; a multiple of the block size.
        #[arg(long, default_value = "65536")]
        bucket_size: u32,
        /// Copies of every btree node, on distinct devices.
        #[arg(long, default_value = "1")]
        metadata_replicas: u8,
        /// Copies of every data extent, on distinct devices.
        #[arg(long, default_value = "1")]
        data_replicas: u8,
        /// Tier per device, comma separated (fast or capacity).
        #[arg(long, value_delimiter = ',', value_parser = parse_tier)]
        tiers: Vec<Tier>,
        /// Encrypt extents with the key in this file, generating it if
        /// missing.
        #[arg(long)]
        encrypt: Option<PathBuf>,
    },
    /// Mounts read-only and prints the superblock, usage and counters.
    Show {
        /// Device images, in format order.
        #[arg(required = true)]
        devices: Vec<PathBuf>,
        /// File holding the 32-byte filesystem key.
        #[arg(short, long)]
        key_file: Option<PathBuf>,
        /// Continue when a device is unreadable.
        #[arg(long)]
        degraded: bool,
    },
}

fn parse_tier(s: &str) -> Result<Tier, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "fast" => Ok(Tier::Fast),
        "capacity" | "cap" => Ok(Tier::Capacity),
        other => Err(format!("unknown tier '{other}', expected fast or capacity")),
    }
}

/// Asks on the terminal.
struct StdinPrompt;

impl FixPrompt for StdinPrompt {
    fn ask(&self, question: &str) -> bool {
        let mut stderr = io::stderr().lock();
        let _ = write!(stderr, "{question} [y/N] ");
        let _ = stderr.flush();
        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

fn read_key(path: &Path) -> Result<EncryptionKey> {
    let bytes = fs::read(path).with_context(|| format!("reading key file {}", path.display()))?;
    let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        bail!("key file {} holds {} bytes, expected 32", path.display(), bytes.len());
    };
    Ok(EncryptionKey(key))
}

fn key_provider(path: Option<&Path>) -> Result<Box<dyn KeyProvider>> {
    Ok(match path {
        Some(p) => Box::new(StaticKeyProvider::new(read_key(p)?)),
        None => Box::new(NoKeyProvider),
    })
}

fn open_devices(paths: &[PathBuf]) -> Result<Vec<Arc<dyn BlockDevice>>> {
    paths
        .iter()
        .map(|p| {
            FileDevice::open(p)
                .map(|d| Arc::new(d) as Arc<dyn BlockDevice>)
                .with_context(|| format!("opening {}", p.display()))
        })
        .collect()
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::from_file(p).with_context(|| format!("loading config {}", p.display())),
        None => Ok(EngineConfig::default()),
    }
}

#[derive(Serialize)]
struct ShowOutput {
    superblock: Superblock,
    usage: Vec<DeviceUsage>,
    stats: EngineStats,
}

impl Cli {
    /// Runs the command and returns the process exit code.
    pub fn run(&self) -> Result<i32> {
        match &self.command {
            Command::Check {
                devices,
                fix,
                degraded,
                config,
                key_file,
            } => {
                let mut engine_config = load_config(config.as_deref())?;
                engine_config.degraded |= *degraded;
                let keys = key_provider(key_file.as_deref())?;
                let devs = open_devices(devices)?;
                let report = fsck(&devs, &engine_config, keys.as_ref(), *fix, Arc::new(StdinPrompt));
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    for f in &report.findings {
                        let state = if f.fixed { "fixed" } else { "not fixed" };
                        println!("{}: {} ({state})", f.subsystem, f.message);
                    }
                    println!("{}", report.exit);
                }
                if report.exit != FsckExit::Ok {
                    warn!(exit = report.exit.code(), unfixed = report.unfixed, "check did not finish clean");
                }
                Ok(report.exit.code())
            }
            Command::Format {
                devices,
                size,
                label,
                bucket_size,
                metadata_replicas,
                data_replicas,
                tiers,
                encrypt,
            } => {
                let devs: Vec<Arc<dyn BlockDevice>> = match size {
                    Some(size) => devices
                        .iter()
                        .map(|p| {
                            FileDevice::create(p, *size)
                                .map(|d| Arc::new(d) as Arc<dyn BlockDevice>)
                                .with_context(|| format!("creating {}", p.display()))
                        })
                        .collect::<Result<_>>()?,
                    None => open_devices(devices)?,
                };
                let key = match encrypt {
                    Some(path) if path.exists() => Some(read_key(path)?),
                    Some(path) => {
                        let key = EncryptionKey::generate();
                        fs::write(path, &key.0)
                            .with_context(|| format!("writing key file {}", path.display()))?;
                        info!(path = %path.display(), "generated filesystem key");
                        Some(key)
                    }
                    None => None,
                };
                let opts = FormatOptions {
                    label: label.clone(),
                    bucket_size: *bucket_size,
                    metadata_replicas: *metadata_replicas,
                    data_replicas: *data_replicas,
                    encrypted: key.is_some(),
                    tiers: tiers.clone(),
                    ..Default::default()
                };
                let uuid = format(&devs, &opts, key.as_ref()).context("formatting")?;
                if self.json {
                    println!("{}", serde_json::json!({ "uuid": uuid, "devices": devices.len() }));
                } else {
                    println!("formatted {uuid} on {} device(s)", devices.len());
                }
                Ok(0)
            }
            Command::Show {
                devices,
                key_file,
                degraded,
            } => {
                let config = EngineConfig {
                    read_only: true,
                    degraded: *degraded,
                    ..Default::default()
                };
                let keys = key_provider(key_file.as_deref())?;
                let devs = open_devices(devices)?;
                let engine = Engine::mount(&devs, &config, keys.as_ref()).context("mounting read-only")?;
                let out = ShowOutput {
                    superblock: engine.superblock(),
                    usage: engine.usage(),
                    stats: engine.stats(),
                };
                engine.unmount().context("detaching")?;
                if self.json {
                    println!("{}", serde_json::to_string_pretty(&out)?);
                } else {
                    let sb = &out.superblock;
                    println!("uuid:        {}", sb.uuid);
                    println!("label:       {}", sb.label);
                    println!("write seq:   {}", sb.write_seq);
                    println!("mounts:      {}", sb.mount_count);
                    println!("clean:       {}", sb.clean);
                    println!("errors:      {}", sb.errors);
                    println!("fsck fixed:  {}", sb.fsck_fixed);
                    for u in &out.usage {
                        println!(
                            "device {}: {} {:?} {}/{} buckets free",
                            u.dev, u.tier, u.health, u.free_buckets, u.data_buckets
                        );
                    }
                }
                Ok(0)
            }
        }
    }
}
