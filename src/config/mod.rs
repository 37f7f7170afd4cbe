//! Engine tuning knobs, loaded from YAML.
//!
//! Every field has a default so an empty document is a valid configuration.
//!
//! ```yaml
//! max_frames_in_flight: 3
//! memory_block_size: 134217728
//! command_pool_growth: 8
//! fence_timeout_ms: 5000
//! present_mode: Fifo
//! ```

use {
    anyhow::{Context, Result},
    ash::vk,
    serde::Deserialize,
    std::{path::Path, time::Duration},
    thiserror::Error,
};

/// The upper bound on frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: usize = 8;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "max_frames_in_flight must be in 1..={}, got {0}",
        MAX_FRAMES_IN_FLIGHT
    )]
    InvalidFrameCount(usize),

    #[error("memory_block_size must be non-zero")]
    ZeroBlockSize,

    #[error("command_pool_growth must be non-zero")]
    ZeroPoolGrowth,

    #[error("fence_timeout_ms must be non-zero")]
    ZeroFenceTimeout,
}

/// The preferred presentation mode. FIFO is used when the surface does not
/// support the preference.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum PresentModePreference {
    #[default]
    Mailbox,
    Fifo,
    Immediate,
}

impl PresentModePreference {
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self {
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// How many frames the CPU may submit before waiting on the GPU.
    pub max_frames_in_flight: usize,

    /// The size of each device memory block, in bytes.
    pub memory_block_size: u64,

    /// How many command buffers a pool allocates when it runs out.
    pub command_pool_growth: u32,

    /// The bound on every CPU-side fence wait.
    pub fence_timeout_ms: u64,

    pub present_mode: PresentModePreference,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            memory_block_size: 64 * MIB,
            command_pool_growth: 4,
            fence_timeout_ms: 10_000,
            present_mode: PresentModePreference::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .context("Unable to parse the engine config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate the YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).with_context(|| {
            format!("Unable to read the engine config at {}", path.display())
        })?;
        let config = Self::from_yaml_str(&yaml).with_context(|| {
            format!("Invalid engine config at {}", path.display())
        })?;
        log::info!("Loaded engine config from {}\n{:#?}", path.display(), config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.max_frames_in_flight) {
            return Err(ConfigError::InvalidFrameCount(
                self.max_frames_in_flight,
            ));
        }
        if self.memory_block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.command_pool_growth == 0 {
            return Err(ConfigError::ZeroPoolGrowth);
        }
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::ZeroFenceTimeout);
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_documents_use_the_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();

        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.memory_block_size, 64 * MIB);
        assert_eq!(config.fence_timeout(), Duration::from_secs(10));
        assert_eq!(config.present_mode, PresentModePreference::Mailbox);
    }

    #[test]
    fn fields_override_the_defaults() {
        let config = EngineConfig::from_yaml_str(
            "max_frames_in_flight: 3\npresent_mode: Fifo\nfence_timeout_ms: 250\n",
        )
        .unwrap();

        assert_eq!(config.max_frames_in_flight, 3);
        assert_eq!(config.present_mode.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.fence_timeout(), Duration::from_millis(250));
        assert_eq!(config.command_pool_growth, 4);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(EngineConfig::from_yaml_str("frames: 3").is_err());
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let too_many = EngineConfig {
            max_frames_in_flight: 9,
            ..Default::default()
        };
        let no_blocks = EngineConfig {
            memory_block_size: 0,
            ..Default::default()
        };

        assert_eq!(too_many.validate(), Err(ConfigError::InvalidFrameCount(9)));
        assert_eq!(no_blocks.validate(), Err(ConfigError::ZeroBlockSize));

        let err = EngineConfig::from_yaml_str("max_frames_in_flight: 0")
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::InvalidFrameCount(0))
        );
    }

    #[test]
    fn missing_files_name_the_path() {
        let err = EngineConfig::load("/definitely/not/here.yaml").unwrap_err();

        assert!(format!("{:#}", err).contains("/definitely/not/here.yaml"));
    }
}
