use crate::errors::{IngressError, Result};
use config::{Config, Environment, File};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const RTMP_DISABLED: i32 = -1;

pub struct ConfigManager {
    settings: Settings,
}

impl ConfigManager {
    pub fn new() -> Result<Self> {
        let settings = Self::load_config()?;
        Ok(Self { settings })
    }

    fn find_config_file() -> Option<PathBuf> {
        let possible_paths = [
            std::env::var("XINGRESS_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("conf.yaml")),
            Some(PathBuf::from("config/conf.yaml")),
            Some(PathBuf::from("/etc/xingress/conf.yaml")),
        ];

        for path in possible_paths.iter().flatten() {
            if path.exists() {
                log::info!("Using config file: {}", path.display());
                return Some(path.clone());
            }
        }
        None
    }

    fn load_config() -> Result<Settings> {
        Self::load_from(Self::find_config_file())
    }

    fn load_from(config_file: Option<PathBuf>) -> Result<Settings> {
        let mut config = Config::builder();

        // 尝试加载配置文件
        match config_file {
            Some(config_path) => {
                config = config.add_source(File::from(config_path.as_ref()));
            }
            None => {
                log::warn!("No config file found, using defaults and environment variables only")
            }
        }

        // 环境变量, 例如 XINGRESS__RTMP__PORT=1936
        config = config.add_source(
            Environment::with_prefix("XINGRESS").separator("__"),
        );

        // 默认值
        let defaults = Settings::default();
        config = config
            .set_default("rtmp.port", defaults.rtmp.port as i64)?
            .set_default("rtmp.read_timeout_secs", defaults.rtmp.read_timeout_secs as i64)?
            .set_default("rtmp.sink_capacity", defaults.rtmp.sink_capacity as i64)?
            .set_default("health_port", defaults.health_port as i64)?
            .set_default("cpu_cost.rtmp_cpu_cost", defaults.cpu_cost.rtmp_cpu_cost)?
            .set_default("cpu_cost.whip_cpu_cost", defaults.cpu_cost.whip_cpu_cost)?
            .set_default(
                "cpu_cost.whip_bypass_transcoding_cpu_cost",
                defaults.cpu_cost.whip_bypass_transcoding_cpu_cost,
            )?
            .set_default("cpu_cost.sample_interval_ms", defaults.cpu_cost.sample_interval_ms as i64)?
            .set_default("cpu_cost.reservation_hold_ms", defaults.cpu_cost.reservation_hold_ms as i64)?
            .set_default("redis", defaults.redis)?
            .set_default("recorder.data_path", defaults.recorder.data_path)?
            .set_default("log_level", defaults.log_level)?
            .set_default("node_id", defaults.node_id)?;

        let config = config.build().map_err(|e| IngressError::Config {
            message: format!("Failed to build config: {}", e),
        })?;

        config.try_deserialize().map_err(|e| IngressError::Config {
            message: format!("Failed to deserialize config: {}", e),
        })
    }

    pub fn get_settings(&self) -> &Settings {
        &self.settings
    }
}

/// Loads the node settings. A config file that exists but does not parse
/// is an error, never a silent fallback to defaults.
pub fn get_setting() -> Result<Settings> {
    Ok(ConfigManager::new()?.settings)
}

/// `NE_` followed by a random suffix.
pub fn generate_node_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("NE_{}", suffix)
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rtmp: Rtmp,
    pub health_port: u16,
    pub cpu_cost: CpuCostConfig,
    pub redis: String,
    pub recorder: Recorder,
    pub log_level: String,
    pub node_id: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rtmp: Rtmp::default(),
            health_port: 8080,
            cpu_cost: CpuCostConfig::default(),
            redis: "redis://localhost:6379".to_string(),
            recorder: Recorder::default(),
            log_level: "info".to_string(),
            node_id: generate_node_id(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rtmp {
    /// `-1` disables the listener
    pub port: i32,
    pub read_timeout_secs: u64,
    pub sink_capacity: usize,
}

impl Rtmp {
    pub fn enabled(&self) -> bool {
        self.port != RTMP_DISABLED
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for Rtmp {
    fn default() -> Self {
        Self {
            port: 1935,
            read_timeout_secs: 20,
            sink_capacity: crate::registry::DEFAULT_SINK_CAPACITY,
        }
    }
}

/// CPU cost per ingress kind, in core-equivalents.
#[derive(Debug, Deserialize, Clone)]
pub struct CpuCostConfig {
    pub rtmp_cpu_cost: f64,
    pub whip_cpu_cost: f64,
    pub whip_bypass_transcoding_cpu_cost: f64,
    pub sample_interval_ms: u64,
    pub reservation_hold_ms: u64,
}

impl CpuCostConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn reservation_hold(&self) -> Duration {
        Duration::from_millis(self.reservation_hold_ms)
    }
}

impl Default for CpuCostConfig {
    fn default() -> Self {
        Self {
            rtmp_cpu_cost: 2.0,
            whip_cpu_cost: 2.0,
            whip_bypass_transcoding_cpu_cost: 0.1,
            sample_interval_ms: 1000,
            reservation_hold_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Recorder {
    pub data_path: String,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            data_path: "data/recordings".to_string(),
        }
    }
}
