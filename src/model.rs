//! Core records shared by the store, the pipeline and the HTTP surface.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type ImageId = i64;

/// Shortest pause the slideshow will ever take between frames.
pub const MIN_SLIDESHOW_INTERVAL: Duration = Duration::from_secs(5);

/// Region of a source image, in percent of its width/height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropWindow {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropWindow {
    pub const FULL_FRAME: Self = Self {
        x: 0.0,
        y: 0.0,
        width: 100.0,
        height: 100.0,
    };

    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn is_full_frame(&self) -> bool {
        *self == Self::FULL_FRAME
    }

    /// Reject windows that can never select anything sensible.
    ///
    /// Offsets past the far edge are tolerated; the renderer clamps them.
    pub fn validated(self) -> Result<Self> {
        let values = [self.x, self.y, self.width, self.height];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidCrop("values must be finite".into()));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(Error::InvalidCrop("width and height must be positive".into()));
        }
        if values.iter().any(|v| !(0.0..=100.0).contains(v)) {
            return Err(Error::InvalidCrop("values must lie within 0..=100".into()));
        }
        Ok(self)
    }
}

impl Default for CropWindow {
    fn default() -> Self {
        Self::FULL_FRAME
    }
}

/// How a source image is mapped onto the display frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitMode {
    /// Crop to the image's crop window, then stretch to fill the frame.
    #[default]
    CropFill,
    /// Keep the whole image and pad with black.
    Letterbox,
}

impl FitMode {
    pub const fn from_preserve_aspect(preserve: bool) -> Self {
        if preserve { Self::Letterbox } else { Self::CropFill }
    }

    pub const fn preserves_aspect(self) -> bool {
        matches!(self, Self::Letterbox)
    }
}

/// Slideshow rotation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    #[default]
    Added,
    Random,
    Custom,
}

impl OrderMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Random => "random",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for OrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderMode {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim() {
            "added" => Ok(Self::Added),
            "random" => Ok(Self::Random),
            "custom" => Ok(Self::Custom),
            other => Err(Error::InvalidSettings(format!(
                "unknown order mode '{other}' (expected added, random or custom)"
            ))),
        }
    }
}

/// Target pixel size of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const DEFAULT: Self = Self {
        width: 800,
        height: 480,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse a `"width,height"` string. Both sides must be positive integers.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (w, h) = raw.split_once(',')?;
        let width: u32 = w.trim().parse().ok()?;
        let height: u32 = h.trim().parse().ok()?;
        (width > 0 && height > 0).then_some(Self { width, height })
    }

    /// Like [`Resolution::parse`] but falls back to 800x480.
    #[must_use]
    pub fn parse_or_default(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| {
            tracing::warn!(resolution = raw, "malformed display resolution; using 800,480");
            Self::DEFAULT
        })
    }

    #[must_use]
    pub fn aspect(&self) -> f64 {
        f64::from(self.width) / f64::from(self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.width, self.height)
    }
}

/// One uploaded photo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Image {
    pub id: ImageId,
    /// Stored basename under the image and thumbnail roots.
    pub filename: String,
    pub original_name: String,
    pub title: String,
    pub description: String,
    /// Embedded metadata extracted at upload time; opaque to the pipeline.
    pub metadata: BTreeMap<String, String>,
    pub width: u32,
    pub height: u32,
    pub enabled: bool,
    pub sort_order: i64,
    pub times_shown: u64,
    pub last_shown_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub crop: CropWindow,
    pub fit: FitMode,
}

/// Fields supplied when an upload is ingested. The store assigns the rest.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub filename: String,
    pub original_name: String,
    pub title: String,
    pub description: String,
    pub metadata: BTreeMap<String, String>,
    pub width: u32,
    pub height: u32,
    pub crop: CropWindow,
}

/// Partial edit of an image's descriptive fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i64>,
}

/// The settings singleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub image_root: PathBuf,
    pub thumb_root: PathBuf,
    /// `"width,height"` as entered by the user.
    pub resolution: String,
    pub interval_ms: u64,
    pub order_mode: OrderMode,
    pub slideshow_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            image_root: PathBuf::from("static/uploads"),
            thumb_root: PathBuf::from("static/thumbs"),
            resolution: Resolution::DEFAULT.to_string(),
            interval_ms: 600_000,
            order_mode: OrderMode::Added,
            slideshow_enabled: true,
        }
    }
}

impl Settings {
    #[must_use]
    pub fn resolution(&self) -> Resolution {
        Resolution::parse_or_default(&self.resolution)
    }

    /// Configured interval, floored at [`MIN_SLIDESHOW_INTERVAL`].
    #[must_use]
    pub fn slideshow_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms).max(MIN_SLIDESHOW_INTERVAL)
    }

    #[must_use]
    pub fn image_path(&self, filename: &str) -> PathBuf {
        self.image_root.join(filename)
    }

    #[must_use]
    pub fn thumb_path(&self, filename: &str) -> PathBuf {
        self.thumb_root.join(filename)
    }

    /// Trim user input and reject values the frame cannot run with.
    pub fn normalized(mut self) -> Result<Self> {
        self.image_root = trim_path(&self.image_root);
        self.thumb_root = trim_path(&self.thumb_root);
        self.resolution = self.resolution.trim().to_string();

        if self.image_root.as_os_str().is_empty() || self.thumb_root.as_os_str().is_empty() {
            return Err(Error::InvalidSettings("storage roots must not be blank".into()));
        }
        if Resolution::parse(&self.resolution).is_none() {
            return Err(Error::InvalidSettings(format!(
                "resolution '{}' must look like 800,480",
                self.resolution
            )));
        }
        if self.interval_ms == 0 {
            return Err(Error::InvalidSettings("interval must be positive".into()));
        }
        Ok(self)
    }
}

fn trim_path(path: &Path) -> PathBuf {
    PathBuf::from(path.to_string_lossy().trim())
}
