//! Configuration for the OpenVD daemon
//!
//! Loads configuration from a TOML file, by default
//! `~/.config/openvd/config.toml`. A default config file describing one
//! 1080p display is generated on first run if missing.

use anyhow::{bail, Context, Result};
use openvd_edid::Mode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default = "default_displays")]
    pub displays: Vec<DisplayConfig>,
}

fn default_displays() -> Vec<DisplayConfig> {
    vec![DisplayConfig::default()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            displays: default_displays(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file at the default location is created with defaults; a
    /// missing explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from(path)?,
            None => {
                let config_path = Self::config_path()?;
                if !config_path.exists() {
                    info!("Config file not found at {:?}, using defaults", config_path);
                    if let Err(e) = Self::save_default(&config_path) {
                        warn!("Failed to create default config file: {}", e);
                    }
                    Self::default()
                } else {
                    Self::load_from(&config_path)?
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;

        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("openvd");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    /// Reject configurations no display could be brought up with
    pub fn validate(&self) -> Result<()> {
        if self.displays.is_empty() {
            bail!("No displays configured");
        }
        if self.capture.bytes_per_pixel == 0 {
            bail!("capture.bytes_per_pixel must be positive");
        }

        for (index, display) in self.displays.iter().enumerate() {
            let label = display.label(index);
            if display.modes.is_empty() && display.edid_file.is_none() {
                bail!("Display {} has no modes and no edid_file", label);
            }
            if let Some(mode) = display.primary_mode() {
                display.limits(mode)?;
            }
            if display.fps_limit == Some(0) {
                bail!("Display {} has fps_limit = 0", label);
            }
        }
        Ok(())
    }
}

/// Capture loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Run a capture loop for every display
    pub enabled: bool,
    /// How long one wait for driver events may block, in milliseconds
    pub poll_timeout_ms: u64,
    /// Bytes per pixel of capture buffers
    pub bytes_per_pixel: u32,
}

impl CaptureConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_timeout_ms: 100,
            bytes_per_pixel: 4,
        }
    }
}

/// One virtual monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Name used in logs
    pub name: Option<String>,
    /// sysfs parent device, e.g. "usb:1-2"
    pub parent: Option<String>,
    /// Raw 128-byte EDID used instead of one generated from `modes`
    pub edid_file: Option<PathBuf>,
    /// Overrides the first mode's refresh rate as frame rate cap
    pub fps_limit: Option<u32>,
    /// Advertised modes, preferred first
    #[serde(default)]
    pub modes: Vec<Mode>,
}

impl DisplayConfig {
    pub fn label(&self, index: usize) -> String {
        match &self.name {
            Some(name) => format!("#{} ({})", index + 1, name),
            None => format!("#{}", index + 1),
        }
    }

    /// The mode resource limits are derived from
    pub fn primary_mode(&self) -> Option<&Mode> {
        self.modes.first()
    }

    /// (pixel area, fps) caps handed to the driver for a monitor whose
    /// preferred mode is `mode`
    pub fn limits(&self, mode: &Mode) -> Result<(u32, u32)> {
        let area = u32::try_from(mode.pixel_area())
            .with_context(|| format!("Mode {} is too large", mode))?;
        Ok((area, self.fps_limit.unwrap_or(mode.refresh)))
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            name: Some("primary".to_string()),
            parent: None,
            edid_file: None,
            fps_limit: None,
            modes: vec![Mode::new(1920, 1080, 60)],
        }
    }
}
