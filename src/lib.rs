pub mod control;
pub mod device;
pub mod frame;
pub mod panel;
pub mod pipeline;
pub mod sink;
pub mod state;
pub mod supervisor;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub sink: SinkConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Empty means auto-detect the first capture device
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Empty means auto-detect the loopback output device
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Bound on a single frame pull
    pub pull_timeout_ms: u64,
    /// Bound on joining the worker at disconnect
    pub stop_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                path: String::new(),
                width: 1920,
                height: 1080,
                fps: 30,
            },
            sink: SinkConfig {
                path: String::new(),
                width: 1920,
                height: 1080,
                fps: 30,
            },
            pipeline: PipelineConfig {
                pull_timeout_ms: 100,
                stop_timeout_ms: 1000,
            },
        }
    }
}

impl Config {
    /// Defaults layered under an optional TOML file
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_fixed_pipeline_constants() {
        let config = Config::default();
        assert_eq!((config.device.width, config.device.height), (1920, 1080));
        assert_eq!((config.sink.width, config.sink.height), (1920, 1080));
        assert_eq!(config.sink.fps, 30);
        assert_eq!(config.pipeline.pull_timeout_ms, 100);
        assert_eq!(config.pipeline.stop_timeout_ms, 1000);
    }

    #[test]
    fn load_without_a_file_matches_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.device.fps, 30);
        assert!(config.device.path.is_empty());
    }
}
