use thiserror::Error;

use crate::ring::ASG_RING_STORAGE_SIZE_BYTES;

/// Size of each host memory block that ring and buffer allocations are carved out of.
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024 * 1024;
/// Sub-allocation granularity inside a block.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;
pub const DEFAULT_WRITE_BUFFER_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_WRITE_STEP_SIZE: u32 = 4096;
pub const DEFAULT_HOST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("page size {0:#x} is not a power of two")]
    PageSizeNotPowerOfTwo(u64),

    #[error("block size {block_size:#x} is not a non-zero multiple of page size {page_size:#x}")]
    BlockSizeNotPageMultiple { block_size: u64, page_size: u64 },

    #[error("per-context buffer size {0:#x} must be non-zero and fit in 32 bits")]
    InvalidBufferSize(u64),

    #[error("ring storage plus per-context buffer ({required:#x} bytes) exceeds block size {block_size:#x}")]
    ContextExceedsBlock { required: u64, block_size: u64 },

    #[error("flush interval {flush_interval} must be in 1..={buffer_size}")]
    InvalidFlushInterval { flush_interval: u32, buffer_size: u64 },
}

/// Sizing and version parameters shared by every ASG context of one device instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsgConfig {
    pub block_size: u64,
    pub page_size: u64,
    /// Size of the per-context buffer shared with the guest (`ASG_WRITE_BUFFER_SIZE`).
    pub per_context_buffer_size: u64,
    /// Initial flush interval published in the ring config (`ASG_WRITE_STEP_SIZE`).
    pub flush_interval: u32,
    /// Highest protocol version the host speaks.
    pub host_version: u32,
}

impl Default for AsgConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            per_context_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            flush_interval: DEFAULT_WRITE_STEP_SIZE,
            host_version: DEFAULT_HOST_VERSION,
        }
    }
}

impl AsgConfig {
    /// Read overrides from `ASG_BLOCK_SIZE`, `ASG_PAGE_SIZE`, `ASG_WRITE_BUFFER_SIZE`,
    /// `ASG_WRITE_STEP_SIZE` and `ASG_HOST_VERSION`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            block_size: parse_var(&lookup, "ASG_BLOCK_SIZE", defaults.block_size)?,
            page_size: parse_var(&lookup, "ASG_PAGE_SIZE", defaults.page_size)?,
            per_context_buffer_size: parse_var(
                &lookup,
                "ASG_WRITE_BUFFER_SIZE",
                defaults.per_context_buffer_size,
            )?,
            flush_interval: parse_var(&lookup, "ASG_WRITE_STEP_SIZE", defaults.flush_interval)?,
            host_version: parse_var(&lookup, "ASG_HOST_VERSION", defaults.host_version)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSizeNotPowerOfTwo(self.page_size));
        }
        if self.block_size == 0 || self.block_size % self.page_size != 0 {
            return Err(ConfigError::BlockSizeNotPageMultiple {
                block_size: self.block_size,
                page_size: self.page_size,
            });
        }
        if self.per_context_buffer_size == 0 || self.per_context_buffer_size > u64::from(u32::MAX)
        {
            return Err(ConfigError::InvalidBufferSize(self.per_context_buffer_size));
        }
        let required = self.combined_size();
        if required > self.block_size {
            return Err(ConfigError::ContextExceedsBlock {
                required,
                block_size: self.block_size,
            });
        }
        if self.flush_interval == 0 || u64::from(self.flush_interval) > self.per_context_buffer_size
        {
            return Err(ConfigError::InvalidFlushInterval {
                flush_interval: self.flush_interval,
                buffer_size: self.per_context_buffer_size,
            });
        }
        Ok(())
    }

    /// Size of a virtio-gpu combined allocation: ring storage followed by the buffer.
    pub fn combined_size(&self) -> u64 {
        ASG_RING_STORAGE_SIZE_BYTES + self.per_context_buffer_size
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = AsgConfig::default();
        config.validate().unwrap();
        assert_eq!(config.combined_size(), 0x2000 + 1024 * 1024);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = AsgConfig::from_lookup(lookup(&[
            ("ASG_BLOCK_SIZE", "1048576"),
            ("ASG_WRITE_BUFFER_SIZE", "65536"),
            ("ASG_WRITE_STEP_SIZE", " 512 "),
        ]))
        .unwrap();
        assert_eq!(config.block_size, 1 << 20);
        assert_eq!(config.per_context_buffer_size, 1 << 16);
        assert_eq!(config.flush_interval, 512);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn unparsable_env_value_is_rejected() {
        let err = AsgConfig::from_lookup(lookup(&[("ASG_PAGE_SIZE", "4k")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                name: "ASG_PAGE_SIZE",
                value: "4k".to_string()
            }
        );
    }

    #[test]
    fn validation_rejects_bad_geometry() {
        let base = AsgConfig::default();

        let config = AsgConfig {
            page_size: 3000,
            ..base.clone()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::PageSizeNotPowerOfTwo(3000))
        );

        let config = AsgConfig {
            block_size: DEFAULT_BLOCK_SIZE + 1,
            ..base.clone()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlockSizeNotPageMultiple { .. })
        ));

        let config = AsgConfig {
            block_size: 1024 * 1024,
            ..base.clone()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ContextExceedsBlock { .. })
        ));

        let config = AsgConfig {
            flush_interval: 0,
            ..base
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFlushInterval { .. })
        ));
    }
}
