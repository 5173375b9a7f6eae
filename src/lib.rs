pub mod capture;
pub mod device;
pub mod orchestrator;
pub mod pipeline;
pub mod sim;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::scheduler::TriggerTiming;
use crate::device::{ActionKeys, DeviceConfig};

pub use capture::{CycleReport, FrameTask};
pub use orchestrator::{stdin_lines, FleetError, Orchestrator, SessionState};
pub use pipeline::{DrainReport, FrameWriter, RawFileWriter};

/// Settings file looked up in the working directory
pub const SETTINGS_FILE: &str = "synccap.toml";

/// Prefix for environment overrides, e.g. `SYNCCAP_SYNC__TIMEOUT_MS=30000`
pub const ENV_PREFIX: &str = "SYNCCAP";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
}

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceConfig,
    pub action: ActionKeys,
    pub sync: SyncSettings,
    pub trigger: TriggerSettings,
    pub output: OutputSettings,
    pub simulator: SimSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub poll_interval_ms: u64,
    /// Give up waiting for a single PTP master after this long. Unset waits forever.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// Delay between the latched clock and the scheduled exposure
    pub margin_ms: u64,
    /// Per-device bound on buffer retrieval
    pub retrieve_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    pub cameras: usize,
    pub width: u32,
    pub height: u32,
    pub pool_size: usize,
    /// Number of role polls before the simulated PTP domain elects its master
    pub settle_polls: u32,
}

impl Settings {
    /// Load defaults, then `synccap.toml` if present, then `SYNCCAP_*` variables
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(Path::new(SETTINGS_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl TriggerSettings {
    pub fn timing(&self) -> TriggerTiming {
        TriggerTiming {
            margin: Duration::from_millis(self.margin_ms),
            retrieve_timeout: Duration::from_millis(self.retrieve_timeout_ms),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            timeout_ms: None,
        }
    }
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            margin_ms: 10,
            retrieve_timeout_ms: 500,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("images"),
        }
    }
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            cameras: 3,
            width: 640,
            height: 480,
            pool_size: 4,
            settle_polls: 1,
        }
    }
}
