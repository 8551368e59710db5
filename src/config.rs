use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use tracing::info;

use crate::model::{OrderMode, Resolution, Settings};
use crate::tasks::display::DEFAULT_CAPACITY;
use crate::tasks::upload::{DEFAULT_THUMBNAIL_MAX_SIDE, WatchdogLimits};

/// Process configuration loaded from YAML.
///
/// Everything the user can change at runtime lives in the settings row; the
/// `defaults` block only seeds that row the first time the frame starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// The rendered frame handed to the display; overwritten in place.
    pub output_path: PathBuf,
    /// Address the HTTP API listens on.
    pub bind_address: String,
    pub display: DisplayConfig,
    /// Frames that may wait for the display before new ones are dropped.
    pub display_queue_capacity: usize,
    /// How long shutdown waits for each background loop.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub upload: UploadConfig,
    pub defaults: SettingsDefaults,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("photo_frame.db"),
            output_path: PathBuf::from("static/current.jpg"),
            bind_address: "0.0.0.0:8080".to_string(),
            display: DisplayConfig::default(),
            display_queue_capacity: DEFAULT_CAPACITY,
            shutdown_timeout: Duration::from_secs(5),
            upload: UploadConfig::default(),
            defaults: SettingsDefaults::default(),
        }
    }
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Like [`Configuration::from_yaml_file`], but a missing file yields the
    /// defaults. A file that exists and fails to parse is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        Self::from_yaml_file(path).with_context(|| format!("loading config from {}", path.display()))
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            self.display_queue_capacity > 0,
            "display-queue-capacity must be greater than zero"
        );
        ensure!(
            !self.output_path.as_os_str().is_empty(),
            "output-path must not be empty"
        );
        self.bind_address
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind-address '{}'", self.bind_address))?;
        self.display.validate()?;
        self.upload.validate()?;
        self.defaults.validate()?;
        Ok(self)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.bind_address.parse()?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisplayKind {
    /// Log frames only.
    #[default]
    Dev,
    /// Run `display.command` for every frame.
    Command,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DisplayConfig {
    pub kind: DisplayKind,
    /// Shell command for `kind: command`; `{path}` and `{saturation}` are
    /// substituted.
    pub command: Option<String>,
    pub saturation: f32,
    /// Panel resolution as `"width,height"`.
    pub resolution: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            kind: DisplayKind::Dev,
            command: None,
            saturation: 0.5,
            resolution: Resolution::DEFAULT.to_string(),
        }
    }
}

impl DisplayConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::parse_or_default(&self.resolution)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.saturation),
            "display.saturation must lie within 0.0..=1.0"
        );
        if self.kind == DisplayKind::Command {
            ensure!(
                self.command.as_deref().is_some_and(|c| !c.trim().is_empty()),
                "display.command is required when display.kind is command"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UploadConfig {
    #[serde(with = "humantime_serde")]
    pub max_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Duration,
    pub thumbnail_max_side: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        let limits = WatchdogLimits::default();
        Self {
            max_duration: limits.max_duration,
            inactivity_timeout: limits.inactivity,
            thumbnail_max_side: DEFAULT_THUMBNAIL_MAX_SIDE,
        }
    }
}

impl UploadConfig {
    pub fn watchdog(&self) -> WatchdogLimits {
        WatchdogLimits {
            max_duration: self.max_duration,
            inactivity: self.inactivity_timeout,
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.max_duration > Duration::ZERO,
            "upload.max-duration must be positive"
        );
        ensure!(
            self.inactivity_timeout > Duration::ZERO,
            "upload.inactivity-timeout must be positive"
        );
        ensure!(
            self.thumbnail_max_side > 0,
            "upload.thumbnail-max-side must be greater than zero"
        );
        Ok(())
    }
}

/// Seed values for the settings row.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SettingsDefaults {
    pub image_root: PathBuf,
    pub thumb_root: PathBuf,
    /// Falls back to the display's native resolution when unset.
    pub resolution: Option<String>,
    pub interval_ms: u64,
    pub order_mode: OrderMode,
    pub slideshow_enabled: bool,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            image_root: settings.image_root,
            thumb_root: settings.thumb_root,
            resolution: None,
            interval_ms: settings.interval_ms,
            order_mode: settings.order_mode,
            slideshow_enabled: settings.slideshow_enabled,
        }
    }
}

impl SettingsDefaults {
    /// Settings row to create, with `native` as the resolution fallback.
    pub fn to_settings(&self, native: Resolution) -> Settings {
        Settings {
            image_root: self.image_root.clone(),
            thumb_root: self.thumb_root.clone(),
            resolution: self
                .resolution
                .clone()
                .unwrap_or_else(|| native.to_string()),
            interval_ms: self.interval_ms,
            order_mode: self.order_mode,
            slideshow_enabled: self.slideshow_enabled,
        }
    }

    fn validate(&self) -> Result<()> {
        self.to_settings(Resolution::DEFAULT)
            .normalized()
            .context("invalid defaults")?;
        Ok(())
    }
}
