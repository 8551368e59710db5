//! The running frame: store, background loops and the operations the HTTP
//! surface exposes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::error::Result;
use crate::events::{DisplayRequest, UploadFile};
use crate::maintenance;
use crate::model::{CropWindow, FitMode, Image, ImageId, ImageUpdate, OrderMode, Resolution, Settings};
use crate::platform::display_sink::DisplaySink;
use crate::processing::render::render_image;
use crate::storage::{self, ImageStore};
use crate::store::Store;
use crate::tasks::display::{self, DisplayConsumer, DisplayQueue};
use crate::tasks::slideshow::{Slideshow, SlideshowContext};
use crate::tasks::upload::{
    self, DEFAULT_THUMBNAIL_MAX_SIDE, Ingest, UploadConsumer, UploadQueue, UploadStatus,
    UploadTasks, WatchdogLimits,
};

/// Startup knobs for [`PhotoFrame::start`].
#[derive(Debug, Clone)]
pub struct FrameOptions {
    pub output_path: PathBuf,
    pub saturation: f32,
    pub display_queue_capacity: usize,
    pub shutdown_timeout: Duration,
    pub watchdog: WatchdogLimits,
    pub thumbnail_max_side: u32,
    /// Seed for the settings row if it does not exist yet.
    pub defaults: Settings,
    /// Start the slideshow scheduler. Off in tests that drive the frame by hand.
    pub run_slideshow: bool,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("static/current.jpg"),
            saturation: 0.5,
            display_queue_capacity: display::DEFAULT_CAPACITY,
            shutdown_timeout: Duration::from_secs(5),
            watchdog: WatchdogLimits::default(),
            thumbnail_max_side: DEFAULT_THUMBNAIL_MAX_SIDE,
            defaults: Settings::default(),
            run_slideshow: true,
        }
    }
}

impl FrameOptions {
    /// Options from the process configuration; `native` is the display's own
    /// resolution, used when the configuration does not seed one.
    pub fn from_config(config: &Configuration, native: Resolution) -> Self {
        Self {
            output_path: config.output_path.clone(),
            saturation: config.display.saturation,
            display_queue_capacity: config.display_queue_capacity,
            shutdown_timeout: config.shutdown_timeout,
            watchdog: config.upload.watchdog(),
            thumbnail_max_side: config.upload.thumbnail_max_side,
            defaults: config.defaults.to_settings(native),
            run_slideshow: true,
        }
    }
}

/// Point-in-time view of the frame for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FrameStatus {
    pub images: u64,
    pub enabled_images: u64,
    pub slideshow_enabled: bool,
    pub order_mode: OrderMode,
    pub interval_ms: u64,
    pub resolution: String,
    pub display_resolution: String,
    pub pending_frames: usize,
    pub dropped_frames: u64,
    pub active_uploads: usize,
    pub current_frame_present: bool,
}

struct Loops {
    slideshow: Option<Slideshow>,
    uploads: UploadConsumer,
    display: DisplayConsumer,
}

pub struct PhotoFrame {
    store: Arc<Store>,
    files: Arc<dyn ImageStore>,
    display: DisplayQueue,
    uploads: UploadQueue,
    display_resolution: Resolution,
    shutdown_timeout: Duration,
    loops: Mutex<Option<Loops>>,
}

impl PhotoFrame {
    /// Seed settings, create storage directories and start the background
    /// loops.
    pub fn start(
        store: Arc<Store>,
        files: Arc<dyn ImageStore>,
        sink: Arc<dyn DisplaySink>,
        options: FrameOptions,
    ) -> Result<Self> {
        let settings = store.ensure_settings(&options.defaults)?;
        storage::ensure_dirs([&settings.image_root, &settings.thumb_root])?;
        let display_resolution = sink.resolution();

        let (display, display_consumer) = display::spawn(
            sink,
            Arc::clone(&store),
            options.output_path,
            options.saturation,
            options.display_queue_capacity,
        )?;
        let (uploads, upload_consumer) = upload::spawn(Ingest {
            store: Arc::clone(&store),
            files: Arc::clone(&files),
            tasks: UploadTasks::new(options.watchdog),
            thumbnail_max_side: options.thumbnail_max_side,
        })?;
        let slideshow = if options.run_slideshow {
            Some(Slideshow::start(SlideshowContext {
                store: Arc::clone(&store),
                files: Arc::clone(&files),
                queue: display.clone(),
            })?)
        } else {
            None
        };

        info!(
            resolution = %settings.resolution,
            order_mode = %settings.order_mode,
            slideshow = options.run_slideshow,
            "photo frame started"
        );
        Ok(Self {
            store,
            files,
            display,
            uploads,
            display_resolution,
            shutdown_timeout: options.shutdown_timeout,
            loops: Mutex::new(Some(Loops {
                slideshow,
                uploads: upload_consumer,
                display: display_consumer,
            })),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ── Uploads ──────────────────────────────────────────────────────────────

    /// Queue a batch for background ingestion and return its task id.
    pub fn trigger_upload(
        &self,
        files: Vec<UploadFile>,
        title: String,
        description: String,
    ) -> Result<String> {
        self.uploads.submit(files, title, description)
    }

    pub fn upload_status(&self, task_id: &str) -> Result<UploadStatus> {
        self.uploads.tasks().poll(task_id)
    }

    // ── Display ──────────────────────────────────────────────────────────────

    /// Render `id` now and queue it for the display.
    ///
    /// Returns `false` if the display queue was full and the frame dropped.
    pub fn show_now(&self, id: ImageId) -> Result<bool> {
        let settings = self.store.settings()?;
        let image = self.store.image(id)?;
        let staged = self.display.stage_path();
        render_image(&settings, &image, self.files.as_ref(), &staged)?;
        Ok(self.display.try_enqueue(DisplayRequest {
            image_id: Some(id),
            path: staged,
        }))
    }

    pub fn display_resolution(&self) -> Resolution {
        self.display_resolution
    }

    // ── Images ───────────────────────────────────────────────────────────────

    pub fn list_images(&self) -> Result<Vec<Image>> {
        self.store.list_images()
    }

    pub fn image(&self, id: ImageId) -> Result<Image> {
        self.store.image(id)
    }

    pub fn update_image(&self, id: ImageId, update: &ImageUpdate) -> Result<Image> {
        self.store.update_image(id, update)
    }

    pub fn set_crop(&self, id: ImageId, crop: CropWindow, fit: FitMode) -> Result<Image> {
        self.store.set_crop(id, crop.validated()?, fit)
    }

    pub fn toggle_image(&self, id: ImageId) -> Result<bool> {
        self.store.toggle_enabled(id)
    }

    /// Remove the original, the thumbnail and then the record.
    pub fn delete_image(&self, id: ImageId) -> Result<()> {
        let image = self.store.image(id)?;
        let settings = self.store.settings()?;
        for path in [
            settings.image_path(&image.filename),
            settings.thumb_path(&image.filename),
        ] {
            if let Err(err) = self.files.delete(&path) {
                warn!(image_id = id, path = %path.display(), error = %err, "could not remove image file");
            }
        }
        self.store.delete_image(id)?;
        info!(image_id = id, filename = %image.filename, "image deleted");
        Ok(())
    }

    /// Recompute the crop of every image still showing its full frame.
    /// Returns how many crops changed.
    pub fn recalculate_crops(&self) -> Result<usize> {
        maintenance::recalculate_crops(&self.store)
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn settings(&self) -> Result<Settings> {
        self.store.settings()
    }

    /// Apply `change` to the stored settings, then validate, create the
    /// storage roots and persist, all under one store transaction.
    pub fn modify_settings<F>(&self, change: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let stored = self.store.update_settings_with(|settings| {
            change(settings);
            let normalized = settings.clone().normalized()?;
            storage::ensure_dirs([&normalized.image_root, &normalized.thumb_root])?;
            *settings = normalized;
            Ok(())
        })?;
        info!(
            order_mode = %stored.order_mode,
            interval_ms = stored.interval_ms,
            enabled = stored.slideshow_enabled,
            "settings updated"
        );
        Ok(stored)
    }

    /// Replace the settings wholesale.
    pub fn update_settings(&self, settings: Settings) -> Result<Settings> {
        self.modify_settings(|current| *current = settings)
    }

    pub fn status(&self) -> Result<FrameStatus> {
        let settings = self.store.settings()?;
        Ok(FrameStatus {
            images: self.store.count_images()?,
            enabled_images: self.store.count_enabled()?,
            slideshow_enabled: settings.slideshow_enabled,
            order_mode: settings.order_mode,
            interval_ms: settings.interval_ms,
            resolution: settings.resolution,
            display_resolution: self.display_resolution.to_string(),
            pending_frames: self.display.pending(),
            dropped_frames: self.display.dropped(),
            active_uploads: self.uploads.tasks().active(),
            current_frame_present: self.files.exists(self.display.output_path()),
        })
    }

    /// Stop the background loops: scheduler first, then uploads, then the
    /// display. Safe to call more than once.
    pub fn shutdown(&self) {
        let loops = self
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(loops) = loops else {
            return;
        };
        let timeout = self.shutdown_timeout;
        let mut clean = true;
        if let Some(slideshow) = loops.slideshow {
            clean &= slideshow.shutdown(timeout);
        }
        clean &= loops.uploads.shutdown(timeout);
        clean &= loops.display.shutdown(timeout);
        if clean {
            info!("photo frame stopped");
        } else {
            warn!("photo frame stopped with detached workers");
        }
    }
}

impl Drop for PhotoFrame {
    fn drop(&mut self) {
        self.shutdown();
    }
}
