// SPDX-License-Identifier: MPL-2.0

//! Device and thread configuration.

use crate::prelude::*;

/// How many threads service each class of work queue.
///
/// When the logical, physical, and hash counts are all zero, one thread
/// services every queue (the small-device configuration).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadCountConfig {
    pub logical_zones: u32,
    pub physical_zones: u32,
    pub hash_zones: u32,
    pub bio_threads: u32,
    pub bio_ack_threads: u32,
    pub cpu_threads: u32,
    pub bio_rotation_interval: u32,
}

impl Default for ThreadCountConfig {
    fn default() -> Self {
        Self {
            logical_zones: 0,
            physical_zones: 0,
            hash_zones: 0,
            bio_threads: 1,
            bio_ack_threads: 0,
            cpu_threads: 1,
            bio_rotation_interval: 64,
        }
    }
}

impl ThreadCountConfig {
    /// Checks the documented ranges for every count.
    pub fn validate(&self) -> Result<()> {
        let zone_counts = [self.logical_zones, self.physical_zones, self.hash_zones];
        let all_zero = zone_counts.iter().all(|&count| count == 0);
        let all_nonzero = zone_counts.iter().all(|&count| count > 0);
        if !all_zero && !all_nonzero {
            return_errno_with_msg!(
                BadConfiguration,
                "logical, physical and hash zone counts must be all zero or all nonzero"
            );
        }
        if self.logical_zones > 60 {
            return_errno_with_msg!(BadConfiguration, "at most 60 logical zones");
        }
        if self.physical_zones > 16 {
            return_errno_with_msg!(BadConfiguration, "at most 16 physical zones");
        }
        if self.hash_zones > 100 {
            return_errno_with_msg!(BadConfiguration, "at most 100 hash zones");
        }
        if self.bio_threads < 1 {
            return_errno_with_msg!(BadConfiguration, "at least one bio thread");
        }
        if self.cpu_threads < 1 {
            return_errno_with_msg!(BadConfiguration, "at least one cpu thread");
        }
        if !(1..=1024).contains(&self.bio_rotation_interval) {
            return_errno_with_msg!(BadConfiguration, "bioRotationInterval must be 1..=1024");
        }
        Ok(())
    }

    /// Returns the effective zone counts (the small-device configuration
    /// still runs one zone of each kind, on a shared thread).
    pub fn effective_zones(&self) -> (u32, u32, u32) {
        if self.logical_zones == 0 {
            (1, 1, 1)
        } else {
            (self.logical_zones, self.physical_zones, self.hash_zones)
        }
    }

    /// Returns whether every queue shares one worker thread.
    pub fn is_single_threaded(&self) -> bool {
        self.logical_zones == 0
    }
}

/// The full device configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub parent_device: String,
    pub physical_blocks: u64,
    pub logical_blocks: u64,
    pub logical_block_size: u32,
    /// Block-map cache size in pages (per device, split across zones).
    pub cache_pages: u64,
    /// Era count bounding dirty block-map page age.
    pub block_map_maximum_age: u64,
    pub max_discard_blocks: u32,
    pub deduplication: bool,
    pub compression: bool,
    pub dedupe_timeout_ms: u64,
    /// The size in blocks of every slab; fixed at format time, not part
    /// of the table line.
    pub slab_blocks: u64,
    pub threads: ThreadCountConfig,
}

impl DeviceConfig {
    /// Parses a device-table line:
    /// `V<n> <parent> <physical_blocks> <logical_block_size> <cache_size>
    /// <block_map_maximum_age> [<key=value>...|.]`
    pub fn parse(table_line: &str, logical_blocks: u64) -> Result<DeviceConfig> {
        let mut words = table_line.split_whitespace();

        let version = words
            .next()
            .ok_or(Error::with_msg(BadConfiguration, "empty table line"))?;
        if !matches!(version, "V1" | "V2" | "V3" | "V4") {
            return_errno_with_msg!(BadConfiguration, "unknown table line version");
        }

        let parent_device = words
            .next()
            .ok_or(Error::with_msg(BadConfiguration, "missing parent device"))?
            .to_string();
        let physical_blocks = Self::parse_u64(words.next(), "physical block count")?;
        let logical_block_size: u32 =
            Self::parse_u64(words.next(), "logical block size")?.try_into().map_err(|_| {
                Error::with_msg(BadConfiguration, "logical block size out of range")
            })?;
        if logical_block_size != 512 && logical_block_size != 4096 {
            return_errno_with_msg!(BadConfiguration, "logical block size must be 512 or 4096");
        }
        let cache_pages = Self::parse_u64(words.next(), "cache size")?;
        let block_map_maximum_age = Self::parse_u64(words.next(), "block map maximum age")?;

        let mut config = DeviceConfig {
            parent_device,
            physical_blocks,
            logical_blocks,
            logical_block_size,
            cache_pages,
            block_map_maximum_age,
            max_discard_blocks: 1,
            deduplication: true,
            compression: false,
            dedupe_timeout_ms: 5000,
            slab_blocks: 8192,
            threads: ThreadCountConfig::default(),
        };

        for word in words {
            if word == "." {
                break;
            }
            let (key, value) = word
                .split_once('=')
                .ok_or(Error::with_msg(BadConfiguration, "malformed key=value pair"))?;
            config.apply_pair(key, value)?;
        }

        config.threads.validate()?;
        Ok(config)
    }

    fn parse_u64(word: Option<&str>, what: &'static str) -> Result<u64> {
        word.and_then(|word| word.parse().ok())
            .ok_or(Error::with_msg(BadConfiguration, what))
    }

    fn apply_pair(&mut self, key: &str, value: &str) -> Result<()> {
        let parse_u32 = |value: &str| -> Result<u32> {
            value
                .parse()
                .map_err(|_| Error::with_msg(BadConfiguration, "numeric value expected"))
        };
        match key {
            "maxDiscard" => {
                let blocks = parse_u32(value)?;
                if blocks == 0 || blocks > u32::MAX / crate::layers::bio::BLOCK_SIZE as u32 {
                    return_errno_with_msg!(BadConfiguration, "maxDiscard out of range");
                }
                self.max_discard_blocks = blocks;
            }
            "deduplication" => match value {
                "on" => self.deduplication = true,
                "off" => self.deduplication = false,
                _ => return_errno_with_msg!(BadConfiguration, "deduplication must be on or off"),
            },
            "compression" => match value {
                "on" => self.compression = true,
                "off" => self.compression = false,
                _ => return_errno_with_msg!(BadConfiguration, "compression must be on or off"),
            },
            "cpu" => {
                let count = parse_u32(value)?;
                if count < 1 {
                    return_errno_with_msg!(BadConfiguration, "cpu thread count must be >= 1");
                }
                self.threads.cpu_threads = count;
            }
            "ack" => self.threads.bio_ack_threads = parse_u32(value)?,
            "bio" => {
                let count = parse_u32(value)?;
                if count < 1 {
                    return_errno_with_msg!(BadConfiguration, "bio thread count must be >= 1");
                }
                self.threads.bio_threads = count;
            }
            "bioRotationInterval" => {
                self.threads.bio_rotation_interval = parse_u32(value)?;
            }
            "logical" => self.threads.logical_zones = parse_u32(value)?,
            "physical" => self.threads.physical_zones = parse_u32(value)?,
            "hash" => self.threads.hash_zones = parse_u32(value)?,
            _ => return_errno_with_msg!(BadConfiguration, "unrecognized table key"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceConfig, ThreadCountConfig};

    #[test]
    fn parse_minimal_line() {
        let config = DeviceConfig::parse("V4 /dev/sda 1048576 4096 128 1024 .", 1 << 20).unwrap();
        assert_eq!(config.parent_device, "/dev/sda");
        assert_eq!(config.physical_blocks, 1048576);
        assert_eq!(config.logical_block_size, 4096);
        assert_eq!(config.cache_pages, 128);
        assert_eq!(config.block_map_maximum_age, 1024);
        assert!(config.deduplication);
        assert!(config.threads.is_single_threaded());
    }

    #[test]
    fn parse_optional_pairs() {
        let line = "V2 dm-3 2048 512 64 16 maxDiscard=8 deduplication=off logical=2 physical=1 hash=1 bio=2 ack=1 cpu=2";
        let config = DeviceConfig::parse(line, 4096).unwrap();
        assert_eq!(config.max_discard_blocks, 8);
        assert!(!config.deduplication);
        assert_eq!(config.threads.logical_zones, 2);
        assert_eq!(config.threads.bio_ack_threads, 1);
        assert_eq!(config.threads.effective_zones(), (2, 1, 1));
    }

    #[test]
    fn reject_bad_lines() {
        assert!(DeviceConfig::parse("", 1).is_err());
        assert!(DeviceConfig::parse("V9 d 1 4096 1 1", 1).is_err());
        assert!(DeviceConfig::parse("V1 d 1 1024 1 1", 1).is_err());
        assert!(DeviceConfig::parse("V1 d 1 4096 1 1 maxDiscard=0", 1).is_err());
        assert!(DeviceConfig::parse("V1 d 1 4096 1 1 logical=2", 1).is_err());
        assert!(DeviceConfig::parse("V1 d 1 4096 1 1 nonsense=1", 1).is_err());
        assert!(DeviceConfig::parse("V1 d 1 4096 1 1 deduplication=maybe", 1).is_err());
    }

    #[test]
    fn zone_counts_all_or_nothing() {
        let mut threads = ThreadCountConfig::default();
        assert!(threads.validate().is_ok());
        threads.logical_zones = 2;
        assert!(threads.validate().is_err());
        threads.physical_zones = 1;
        threads.hash_zones = 1;
        assert!(threads.validate().is_ok());
        threads.logical_zones = 61;
        assert!(threads.validate().is_err());
    }

    #[test]
    fn effective_zones_for_small_devices() {
        let threads = ThreadCountConfig::default();
        assert_eq!(threads.effective_zones(), (1, 1, 1));
    }
}
