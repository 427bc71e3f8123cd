use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use ext_bridge::ForeignLayout;
use shared_dx::error::{HookError, Result};
use state_cache::DuplicateSlots;

use crate::engine::EngineLayout;

pub const CONF_FILE_NAME: &str = "ScopeOverlay.yaml";
pub const LOG_FILE_NAME: &str = "ScopeOverlay.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConf {
    pub enabled: bool,
    /// Index count of the draw that composites the HDR frame.  6 is the engine's full screen
    /// quad.
    pub trigger_index_count: u32,
    pub bloom_slot: usize,
    pub luminance_slot: usize,
    /// Re-issue the captured draw at present time with the captured state.
    pub replay: bool,
}

impl Default for CaptureConf {
    fn default() -> Self {
        let slots = DuplicateSlots::default();
        Self {
            enabled: true,
            trigger_index_count: 6,
            bloom_slot: slots.bloom,
            luminance_slot: slots.luminance,
            replay: true,
        }
    }
}

impl CaptureConf {
    pub fn duplicate_slots(&self) -> DuplicateSlots {
        DuplicateSlots {
            bloom: self.bloom_slot,
            luminance: self.luminance_slot,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConf {
    pub enabled: bool,
    pub use_mask: bool,
    /// Replaces the builtin layout when set.
    pub layout: Option<ForeignLayout>,
}

impl Default for BridgeConf {
    fn default() -> Self {
        Self {
            enabled: true,
            use_mask: true,
            layout: None,
        }
    }
}

impl BridgeConf {
    pub fn effective_layout(&self) -> ForeignLayout {
        self.layout.clone().unwrap_or_else(ForeignLayout::builtin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConf {
    pub log_level: String,
    pub init_poll_ms: u64,
    pub metrics_interval_secs: u64,
    pub engine: EngineLayout,
    pub capture: CaptureConf,
    pub bridge: BridgeConf,
}

impl Default for ScopeConf {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            init_poll_ms: 100,
            metrics_interval_secs: 10,
            engine: EngineLayout::default(),
            capture: CaptureConf::default(),
            bridge: BridgeConf::default(),
        }
    }
}

impl fmt::Display for ScopeConf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "ScopeConf {{")?;
        writeln!(f, "  log_level: {}", self.log_level)?;
        writeln!(f, "  init_poll_ms: {}", self.init_poll_ms)?;
        writeln!(f, "  renderer rva: {:x}", self.engine.renderer_rva)?;
        writeln!(
            f,
            "  capture: {} (trigger {} indices, srv slots {}/{}, replay {})",
            self.capture.enabled,
            self.capture.trigger_index_count,
            self.capture.bloom_slot,
            self.capture.luminance_slot,
            self.capture.replay
        )?;
        match self.bridge.layout.as_ref() {
            None => writeln!(
                f,
                "  bridge: {} (mask {}, builtin layout)",
                self.bridge.enabled, self.bridge.use_mask
            )?,
            Some(l) => writeln!(
                f,
                "  bridge: {} (mask {}, layout {} for {})",
                self.bridge.enabled, self.bridge.use_mask, l.version, l.module_name
            )?,
        }
        writeln!(f, "}}")
    }
}

/// What happened when looking for the config file.  Loading happens before logging is up (the
/// log level is in the file), so the outcome is reported afterwards with `report`.
#[derive(Debug)]
pub enum ConfSource {
    File(PathBuf),
    Missing(PathBuf),
    Invalid(PathBuf, HookError),
}

impl ScopeConf {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| HookError::SerdeError(format!("deserialize error: {}", e)))
    }

    fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(BufReader::new(file))
            .map_err(|e| HookError::ConfReadFailed(format!("{}: {}", path.display(), e)))
    }

    /// Load `dir/ScopeOverlay.yaml`.  Never fails: a missing or unreadable file gives the
    /// defaults.
    pub fn load(dir: &Path) -> (Self, ConfSource) {
        let mut path = dir.to_path_buf();
        path.push(CONF_FILE_NAME);
        if !path.is_file() {
            return (Self::default(), ConfSource::Missing(path));
        }
        match Self::read(&path) {
            Ok(conf) => (conf, ConfSource::File(path)),
            Err(e) => (Self::default(), ConfSource::Invalid(path, e)),
        }
    }
}

impl ConfSource {
    pub fn report(&self, conf: &ScopeConf) {
        match self {
            ConfSource::File(p) => info!("loaded config from {}", p.display()),
            ConfSource::Missing(p) => info!("no config at {}, using defaults", p.display()),
            ConfSource::Invalid(p, e) => {
                error!("config {} could not be read, using defaults: {}", p.display(), e)
            }
        }
        info!("{}", conf);
    }
}
