//! Output end of the pipeline: whatever physically shows the rendered frame.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::config::{DisplayConfig, DisplayKind};
use crate::model::Resolution;

/// A device that can show a rendered frame. Writes may block for seconds.
pub trait DisplaySink: Send + Sync {
    fn show_image(&self, path: &Path, saturation: f32) -> Result<()>;

    /// Native panel resolution.
    fn resolution(&self) -> Resolution;
}

/// Logs frames instead of driving hardware. Used on development machines.
#[derive(Debug, Clone)]
pub struct DevSink {
    resolution: Resolution,
}

impl DevSink {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }
}

impl Default for DevSink {
    fn default() -> Self {
        Self::new(Resolution::DEFAULT)
    }
}

impl DisplaySink for DevSink {
    fn show_image(&self, path: &Path, saturation: f32) -> Result<()> {
        info!(path = %path.display(), saturation, "dev display: frame shown");
        Ok(())
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Runs a shell command per frame, e.g. a vendor e-paper driver script.
///
/// `{path}` and `{saturation}` in the template are substituted; a non-zero
/// exit status is reported as a display error.
#[derive(Debug, Clone)]
pub struct CommandSink {
    template: String,
    resolution: Resolution,
}

impl CommandSink {
    pub fn new(template: impl Into<String>, resolution: Resolution) -> Result<Self> {
        let template = template.into();
        if template.trim().is_empty() {
            return Err(anyhow!("display command must not be blank"));
        }
        Ok(Self {
            template,
            resolution,
        })
    }

    fn command_for(&self, path: &Path, saturation: f32) -> String {
        self.template
            .replace("{path}", &shell_quote(&path.to_string_lossy()))
            .replace("{saturation}", &format!("{saturation:.2}"))
    }
}

impl DisplaySink for CommandSink {
    fn show_image(&self, path: &Path, saturation: f32) -> Result<()> {
        let command = self.command_for(path, saturation);
        run_command(&command)
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// Build the sink selected by `display.kind`.
pub fn from_config(config: &DisplayConfig) -> Result<Arc<dyn DisplaySink>> {
    let resolution = config.resolution();
    let sink: Arc<dyn DisplaySink> = match config.kind {
        DisplayKind::Dev => Arc::new(DevSink::new(resolution)),
        DisplayKind::Command => {
            let template = config
                .command
                .clone()
                .ok_or_else(|| anyhow!("display.command is required for the command sink"))?;
            Arc::new(CommandSink::new(template, resolution)?)
        }
    };
    info!(kind = ?config.kind, %resolution, "display sink ready");
    Ok(sink)
}

fn run_command(command: &str) -> Result<()> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("failed to spawn shell for display command: {command}"))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(anyhow!(
            "display command exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ))
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
