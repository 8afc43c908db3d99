//! Configuration for the device model, the guest driver, and the simulation.
//!
//! Configuration is fixed at construction time. Every struct deserializes
//! with defaults for missing fields, so a JSON file only needs to name what
//! it changes:
//!
//! ```json
//! {
//!   "disk": {
//!     "backing_path": "disk.img",
//!     "ntags": 4,
//!     "write_latency": 250
//!   },
//!   "words_per_tick": 8
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::request::SECTOR_SIZE;
use crate::tags::INVALID_TAG;

/// Default size of the tag pool.
pub const DEFAULT_NTAGS: u8 = 4;

/// Default per-request sector bound.
pub const DEFAULT_MAX_REQUEST_LENGTH: u32 = 16;

/// Default ticks between a read's last data word and its completion.
pub const DEFAULT_READ_LATENCY: u64 = 100;

/// Default ticks between a write's commit and its completion.
pub const DEFAULT_WRITE_LATENCY: u64 = 100;

/// Default guest RAM size for the simulation (1 MiB).
pub const DEFAULT_GUEST_MEMORY_BYTES: usize = 1 << 20;

/// How the disk model reaches the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Positional reads and writes on an open file.
    #[default]
    File,
    /// The whole file memory-mapped.
    Mmap,
}

/// Host-side disk model parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Backing image. `None` models an empty slot: NSECTORS reads zero.
    pub backing_path: Option<PathBuf>,

    /// Backing store implementation.
    pub backend: BackendKind,

    /// Refuse writes with an I/O error completion.
    pub read_only: bool,

    /// Number of tags in the pool.
    pub ntags: u8,

    /// Largest LEN accepted per request, in sectors.
    pub max_request_length: u32,

    /// Read completion delay in ticks.
    pub read_latency: u64,

    /// Write completion delay in ticks.
    pub write_latency: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            backing_path: None,
            backend: BackendKind::File,
            read_only: false,
            ntags: DEFAULT_NTAGS,
            max_request_length: DEFAULT_MAX_REQUEST_LENGTH,
            read_latency: DEFAULT_READ_LATENCY,
            write_latency: DEFAULT_WRITE_LATENCY,
        }
    }
}

impl DiskConfig {
    /// Default configuration backed by the image at `path`.
    pub fn with_backing<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            backing_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the tag count or request bound is unusable.
    pub fn validate(&self) -> Result<()> {
        if self.ntags == 0 || self.ntags >= INVALID_TAG {
            return Err(ConfigError::InvalidTagCount { ntags: self.ntags }.into());
        }

        if self.max_request_length == 0 {
            return Err(ConfigError::InvalidMaxRequestLength {
                max: self.max_request_length,
            }
            .into());
        }

        Ok(())
    }

    /// Bytes moved by the largest request the device accepts.
    pub fn max_transfer_bytes(&self) -> u64 {
        u64::from(self.max_request_length) * SECTOR_SIZE as u64
    }
}

/// Guest driver parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Device instance name used in diagnostics.
    pub name: String,

    /// Requests that may queue on one tag before the driver declares a
    /// desync. The host never reissues an undrained tag, so 1 is exact.
    pub max_entries_per_tag: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "simblk0".to_string(),
            max_entries_per_tag: 1,
        }
    }
}

impl DriverConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidQueueDepth`] if the per-tag depth is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries_per_tag == 0 {
            return Err(ConfigError::InvalidQueueDepth {
                depth: self.max_entries_per_tag,
            }
            .into());
        }
        Ok(())
    }
}

/// Full simulation parameters: disk model plus the fabric around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Disk model parameters.
    pub disk: DiskConfig,

    /// Data words each streaming direction carries per tick.
    pub words_per_tick: usize,

    /// Size of simulated guest RAM in bytes.
    pub guest_memory_bytes: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            disk: DiskConfig::default(),
            words_per_tick: 1,
            guest_memory_bytes: DEFAULT_GUEST_MEMORY_BYTES,
        }
    }
}

impl SimConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any part is invalid, including guest memory
    /// too small for one maximum-length transfer.
    pub fn validate(&self) -> Result<()> {
        self.disk.validate()?;

        if self.words_per_tick == 0 {
            return Err(ConfigError::InvalidWordsPerTick {
                words: self.words_per_tick,
            }
            .into());
        }

        let needed = self.disk.max_transfer_bytes();
        if (self.guest_memory_bytes as u64) < needed {
            return Err(ConfigError::GuestMemoryTooSmall {
                bytes: self.guest_memory_bytes,
                needed,
            }
            .into());
        }

        Ok(())
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON, or any validation
    /// error.
    pub fn from_json_str(json: &str, origin: &Path) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    ///
    /// A relative `backing_path` is resolved against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, or any error
    /// from [`SimConfig::from_json_str`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_json_str(&json, path)?;
        if let Some(backing) = config.disk.backing_path.as_mut()
            && backing.is_relative()
            && let Some(dir) = path.parent()
        {
            *backing = dir.join(&*backing);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimBlkError;

    #[test]
    fn test_defaults_validate() {
        assert!(DiskConfig::default().validate().is_ok());
        assert!(DriverConfig::default().validate().is_ok());
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_tag_count_bounds() {
        for ntags in [0, INVALID_TAG] {
            let config = DiskConfig {
                ntags,
                ..DiskConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(SimBlkError::Config(ConfigError::InvalidTagCount { .. }))
            ));
        }

        let config = DiskConfig {
            ntags: INVALID_TAG - 1,
            ..DiskConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let disk = DiskConfig {
            max_request_length: 0,
            ..DiskConfig::default()
        };
        assert!(matches!(
            disk.validate(),
            Err(SimBlkError::Config(ConfigError::InvalidMaxRequestLength { .. }))
        ));

        let sim = SimConfig {
            words_per_tick: 0,
            ..SimConfig::default()
        };
        assert!(matches!(
            sim.validate(),
            Err(SimBlkError::Config(ConfigError::InvalidWordsPerTick { .. }))
        ));

        let driver = DriverConfig {
            max_entries_per_tag: 0,
            ..DriverConfig::default()
        };
        assert!(driver.validate().is_err());
    }

    #[test]
    fn test_guest_memory_must_fit_one_transfer() {
        let sim = SimConfig {
            guest_memory_bytes: 1024,
            ..SimConfig::default()
        };
        assert!(matches!(
            sim.validate(),
            Err(SimBlkError::Config(ConfigError::GuestMemoryTooSmall { needed: 8192, .. }))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "disk": { "ntags": 8, "backend": "mmap" }, "words_per_tick": 16 }"#;
        let config = SimConfig::from_json_str(json, Path::new("inline")).unwrap();
        assert_eq!(config.disk.ntags, 8);
        assert_eq!(config.disk.backend, BackendKind::Mmap);
        assert_eq!(config.disk.write_latency, DEFAULT_WRITE_LATENCY);
        assert_eq!(config.words_per_tick, 16);
        assert_eq!(config.guest_memory_bytes, DEFAULT_GUEST_MEMORY_BYTES);
    }

    #[test]
    fn test_invalid_json_reports_origin() {
        let err = SimConfig::from_json_str("{ nope", Path::new("bad.json")).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }
}
