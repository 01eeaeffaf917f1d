//! Store configuration
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! engine = "paging"            # or "pass-through"
//! region_size = 131072
//! max_resident_bytes = 67108864
//! max_chunk_len = 65535
//! swap_path = "chunkswap"
//! swap_limit_bytes = 1073741824 # omit for no limit
//! swap_initial_bytes = 0
//! high_water = 0.9
//! low_water = 0.75
//! verify_swap_checksums = true
//! ```

use crate::error::{ChunkError, Result};
use crate::record::{self, MAX_CHUNK_LEN, SLOT_ALIGN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default region size (128 KiB)
pub const DEFAULT_REGION_SIZE: usize = 128 * 1024;

/// Default resident memory budget (64 MiB)
pub const DEFAULT_MAX_RESIDENT_BYTES: u64 = 64 * 1024 * 1024;

/// Which storage strategy backs the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Regions in memory, cold chunks paged out to a swap file
    #[default]
    Paging,
    /// One heap allocation per chunk, nothing is ever swapped
    PassThrough,
}

impl EngineKind {
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::Paging => "paging",
            EngineKind::PassThrough => "pass-through",
        }
    }
}

/// Configuration for a [`ChunkStore`](crate::ChunkStore)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub engine: EngineKind,

    /// Bytes per region; must hold the largest chunk
    pub region_size: usize,

    /// Resident memory budget; the region count is derived from it
    pub max_resident_bytes: u64,

    /// Largest chunk accepted by `create`
    pub max_chunk_len: usize,

    /// Swap file location (truncated on start-up)
    pub swap_path: PathBuf,

    /// Cap on the swap file size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap_limit_bytes: Option<u64>,

    /// Swap space reserved when the store starts
    pub swap_initial_bytes: u64,

    /// Resident fraction above which eviction starts
    pub high_water: f64,

    /// Resident fraction eviction brings usage back down to
    pub low_water: f64,

    /// Check the CRC-32 of every swap record read back
    pub verify_swap_checksums: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            engine: EngineKind::Paging,
            region_size: DEFAULT_REGION_SIZE,
            max_resident_bytes: DEFAULT_MAX_RESIDENT_BYTES,
            max_chunk_len: MAX_CHUNK_LEN,
            swap_path: PathBuf::from("chunkswap"),
            swap_limit_bytes: None,
            swap_initial_bytes: 0,
            high_water: 0.9,
            low_water: 0.75,
            verify_swap_checksums: true,
        }
    }
}

impl StoreConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Number of regions the resident budget allows
    pub fn max_regions(&self) -> usize {
        (self.max_resident_bytes / self.region_size.max(1) as u64) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_len == 0 || self.max_chunk_len > MAX_CHUNK_LEN {
            return Err(ChunkError::InvalidConfig(format!(
                "max_chunk_len must be between 1 and {}, got {}",
                MAX_CHUNK_LEN, self.max_chunk_len
            )));
        }

        if self.region_size % SLOT_ALIGN != 0 || self.region_size > u32::MAX as usize {
            return Err(ChunkError::InvalidConfig(format!(
                "region_size must be a multiple of {} that fits in 32 bits, got {}",
                SLOT_ALIGN, self.region_size
            )));
        }

        let largest_slot = record::slot_len(self.max_chunk_len);
        if self.region_size < largest_slot {
            return Err(ChunkError::InvalidConfig(format!(
                "region_size {} cannot hold a {} byte chunk ({} byte slot)",
                self.region_size, self.max_chunk_len, largest_slot
            )));
        }

        if self.max_regions() == 0 {
            return Err(ChunkError::InvalidConfig(format!(
                "max_resident_bytes {} is smaller than one region of {} bytes",
                self.max_resident_bytes, self.region_size
            )));
        }

        if !(self.low_water > 0.0 && self.low_water <= self.high_water && self.high_water <= 1.0)
        {
            return Err(ChunkError::InvalidConfig(format!(
                "water marks must satisfy 0 < low_water <= high_water <= 1, got {} and {}",
                self.low_water, self.high_water
            )));
        }

        if self.swap_path.as_os_str().is_empty() {
            return Err(ChunkError::InvalidConfig("swap_path is empty".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_regions(), 512);
        assert_eq!(StoreConfig::from_toml_str("").unwrap(), config);
    }

    #[test]
    fn test_parse_overrides() {
        let config = StoreConfig::from_toml_str(
            r#"
            engine = "pass-through"
            region_size = 4096
            max_resident_bytes = 65536
            max_chunk_len = 1000
            swap_path = "/tmp/attrs.swap"
            swap_limit_bytes = 1048576
            high_water = 0.5
            low_water = 0.25
            verify_swap_checksums = false
            "#,
        )
        .unwrap();

        assert_eq!(config.engine, EngineKind::PassThrough);
        assert_eq!(config.max_regions(), 16);
        assert_eq!(config.swap_limit_bytes, Some(1048576));
        assert_eq!(config.swap_path, PathBuf::from("/tmp/attrs.swap"));
        assert!(!config.verify_swap_checksums);
    }

    #[test]
    fn test_region_must_hold_largest_chunk() {
        let err = StoreConfig::from_toml_str("region_size = 1024").unwrap_err();
        assert!(matches!(err, ChunkError::InvalidConfig(_)));

        let ok = StoreConfig::from_toml_str("region_size = 1024\nmax_chunk_len = 1020");
        assert!(ok.is_ok());
    }

    #[test]
    fn test_bad_water_marks_rejected() {
        assert!(StoreConfig::from_toml_str("low_water = 0.95").is_err());
        assert!(StoreConfig::from_toml_str("high_water = 1.5").is_err());
        assert!(StoreConfig::from_toml_str("low_water = 0.0").is_err());
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        let err = StoreConfig::from_toml_str("engine = ").unwrap_err();
        assert!(matches!(err, ChunkError::ConfigParse(_)));

        let err = StoreConfig::from_toml_str("engine = \"mmap\"").unwrap_err();
        assert!(matches!(err, ChunkError::ConfigParse(_)));
    }
}
