use crate::error::Result;
use crate::network::AddressScheme;
use crate::router::RouterConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub engine: EngineSettings,
    pub midi: MidiSettings,
    pub network: NetworkSettings,
    pub router: RouterConfig,
}

impl BridgeConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let ron_string = fs::read_to_string(path)?;
        Self::from_ron(&ron_string)
    }

    pub fn from_ron(source: &str) -> Result<Self> {
        Ok(ron::from_str(source)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub sample_rate: u32,
    /// Samples per realtime block.
    pub block_size: usize,
    pub default_bpm: f64,
    /// Let a locked external clock drive the transport tempo.
    pub follow_external_clock: bool,
    /// Length of one feedback-breaker counting window.
    pub breaker_window_ms: u64,
    pub inbound_queue_capacity: usize,
    pub visual_lane_capacity: usize,
    pub engine_lane_capacity: usize,
    pub rt_log_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 256,
            default_bpm: 120.0,
            follow_external_clock: true,
            breaker_window_ms: 1_000,
            inbound_queue_capacity: 1024,
            visual_lane_capacity: 1024,
            engine_lane_capacity: 1024,
            rt_log_capacity: 256,
        }
    }
}

impl EngineSettings {
    pub fn block_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::from_millis(5);
        }
        Duration::from_secs_f64(self.block_size.max(1) as f64 / self.sample_rate as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    pub enabled: bool,
    pub client_name: String,
    /// Case-insensitive substring of the input port name. Empty picks the
    /// first port.
    pub input_port: String,
    pub output_port: String,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            client_name: "pulsebridge".to_string(),
            input_port: String::new(),
            output_port: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub enabled: bool,
    pub listen: String,
    pub target: String,
    pub address_scheme: AddressScheme,
    pub burst_sleep_ms: u64,
    pub eco_sleep_ms: u64,
    pub idle_cycles_before_eco: u32,
    pub batch_size: usize,
    /// Used while the outbound lane is more than 95% full.
    pub pressure_batch_size: usize,
    pub lane_capacity: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:9000".to_string(),
            target: "127.0.0.1:9001".to_string(),
            address_scheme: AddressScheme::Compact,
            burst_sleep_ms: 1,
            eco_sleep_ms: 10,
            idle_cycles_before_eco: 10,
            batch_size: 64,
            pressure_batch_size: 256,
            lane_capacity: 4096,
        }
    }
}
