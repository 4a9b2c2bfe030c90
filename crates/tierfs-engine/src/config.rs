//! Mount and format configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::compress::CompressionAlgorithm;
use crate::device::Tier;
use crate::error::{EngineError, EngineResult};
use crate::extent::MAX_EXTENT_REPLICAS;
use crate::fault::ErrorAction;
use crate::fsck::FixPolicy;
use crate::gc::GcConfig;
use crate::node_cache::NodeCacheConfig;
use crate::superblock::SB_MAX_LEN;
use crate::tiering::TieringConfig;

/// Btree tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BtreeConfig {
    /// Batches a node may carry before a commit re-sorts it into one.
    pub compact_threshold: usize,
    /// A node below this percentage of the node size is merged with a
    /// sibling.
    pub merge_threshold_percent: u32,
    /// Attempts a commit makes before giving up on lock or journal
    /// contention.
    pub commit_retries: u32,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            compact_threshold: 4,
            merge_threshold_percent: 25,
            commit_retries: 16,
        }
    }
}

/// Extent data path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Compression applied to new extents.
    pub compression: CompressionAlgorithm,
    /// Compression is kept only if it saves at least this percentage.
    pub compression_min_gain_percent: u32,
    /// Checksum over stored extent bytes and nodes.
    pub checksum: ChecksumAlgorithm,
    /// Largest logical extent.
    pub max_extent_bytes: u32,
    /// Tier new data goes to.
    pub foreground_tier: Tier,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            compression: CompressionAlgorithm::Lz4,
            compression_min_gain_percent: 10,
            checksum: ChecksumAlgorithm::Xxh3,
            max_extent_bytes: 32 * 1024,
            foreground_tier: Tier::Fast,
        }
    }
}

/// Everything a mount needs besides the devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Node cache.
    pub node_cache: NodeCacheConfig,
    /// Btree tuning.
    pub btree: BtreeConfig,
    /// Extent data path.
    pub data: DataConfig,
    /// Moving garbage collector.
    pub gc: GcConfig,
    /// Tiering mover.
    pub tiering: TieringConfig,
    /// What a runtime inconsistency does.
    pub errors: ErrorAction,
    /// Repair problems found while mounting; otherwise only report them.
    pub fsck_on_mount: bool,
    /// Policy for repairs at mount when `fsck_on_mount` is set.
    pub fix_policy: FixPolicy,
    /// Mount without writing anything.
    pub read_only: bool,
    /// Mount even if some devices are unreadable.
    pub degraded: bool,
    /// Consecutive write failures before a device is taken out of service.
    pub max_write_errors: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_cache: NodeCacheConfig::default(),
            btree: BtreeConfig::default(),
            data: DataConfig::default(),
            gc: GcConfig::default(),
            tiering: TieringConfig::default(),
            errors: ErrorAction::ReadOnly,
            fsck_on_mount: true,
            fix_policy: FixPolicy::Yes,
            read_only: false,
            degraded: false,
            max_write_errors: 3,
        }
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidConfig {
        reason: reason.into(),
    }
}

impl EngineConfig {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that would make the engine misbehave.
    pub fn validate(&self) -> EngineResult<()> {
        if self.node_cache.capacity < 16 {
            return Err(invalid("node cache must hold at least 16 nodes"));
        }
        if self.btree.compact_threshold == 0 {
            return Err(invalid("compact_threshold must be at least 1"));
        }
        if self.btree.merge_threshold_percent >= 50 {
            return Err(invalid("merge_threshold_percent must be below 50"));
        }
        if self.btree.commit_retries == 0 {
            return Err(invalid("commit_retries must be at least 1"));
        }
        if self.data.max_extent_bytes == 0 {
            return Err(invalid("max_extent_bytes must be non-zero"));
        }
        if self.data.compression_min_gain_percent > 100 {
            return Err(invalid("compression_min_gain_percent above 100"));
        }
        if self.max_write_errors == 0 {
            return Err(invalid("max_write_errors must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.gc.live_threshold) {
            return Err(invalid("gc live_threshold must be within 0..=1"));
        }
        Ok(())
    }
}

/// Parameters fixed at format time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatOptions {
    /// Filesystem label.
    pub label: String,
    /// I/O granularity.
    pub block_size: u32,
    /// Allocation unit.
    pub bucket_size: u32,
    /// Bytes per btree node.
    pub node_size: u32,
    /// Journal buckets per device.
    pub journal_buckets: u64,
    /// Replicas of every btree node.
    pub metadata_replicas: u8,
    /// Replicas of every extent.
    pub data_replicas: u8,
    /// Encrypt extent payloads.
    pub encrypted: bool,
    /// Tier of each device, by index; missing entries are fast.
    pub tiers: Vec<Tier>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            label: String::new(),
            block_size: 4096,
            bucket_size: 64 * 1024,
            node_size: 4096,
            journal_buckets: 8,
            metadata_replicas: 1,
            data_replicas: 1,
            encrypted: false,
            tiers: Vec::new(),
        }
    }
}

impl FormatOptions {
    /// Tier of device `idx`.
    pub fn tier(&self, idx: usize) -> Tier {
        self.tiers.get(idx).copied().unwrap_or(Tier::Fast)
    }

    /// Checks the options against `ndevs` devices.
    pub fn validate(&self, ndevs: usize) -> EngineResult<()> {
        if ndevs == 0 {
            return Err(invalid("at least one device is required"));
        }
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(invalid(format!("bad block size {}", self.block_size)));
        }
        if !self.node_size.is_power_of_two()
            || self.node_size < 1024
            || self.node_size % self.block_size != 0
        {
            return Err(invalid(format!("bad node size {}", self.node_size)));
        }
        if self.bucket_size % self.block_size != 0
            || (self.bucket_size as usize) < SB_MAX_LEN
            || self.bucket_size < self.node_size
        {
            return Err(invalid(format!("bad bucket size {}", self.bucket_size)));
        }
        for (what, n) in [
            ("metadata", self.metadata_replicas),
            ("data", self.data_replicas),
        ] {
            if n == 0 || usize::from(n) > MAX_EXTENT_REPLICAS || usize::from(n) > ndevs {
                return Err(invalid(format!(
                    "{what} replicas {n} impossible with {ndevs} devices"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.btree.compact_threshold, 4);
        assert_eq!(config.data.foreground_tier, Tier::Fast);
        assert_eq!(config.errors, ErrorAction::ReadOnly);
        assert!(config.fsck_on_mount);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_partial_json() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"errors": "continue", "btree": {{"compact_threshold": 2}}, "data": {{"compression": {{"zstd": {{"level": 3}}}}}}}}"#
        )
        .unwrap();
        let config = EngineConfig::from_file(f.path()).unwrap();
        assert_eq!(config.errors, ErrorAction::Continue);
        assert_eq!(config.btree.compact_threshold, 2);
        assert_eq!(config.btree.merge_threshold_percent, 25);
        assert_eq!(config.data.compression, CompressionAlgorithm::Zstd { level: 3 });
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, r#"{{"max_write_errors": 0}}"#).unwrap();
        assert!(matches!(
            EngineConfig::from_file(f.path()),
            Err(EngineError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_format_options_validate() {
        let opts = FormatOptions::default();
        opts.validate(1).unwrap();
        assert!(opts.validate(0).is_err());

        let two = FormatOptions {
            metadata_replicas: 2,
            ..FormatOptions::default()
        };
        assert!(two.validate(1).is_err());
        two.validate(2).unwrap();

        let bad_node = FormatOptions {
            node_size: 3000,
            ..FormatOptions::default()
        };
        assert!(bad_node.validate(1).is_err());
        assert_eq!(opts.tier(3), Tier::Fast);
    }
}
