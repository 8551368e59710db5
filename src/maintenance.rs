//! Offline housekeeping behind the `status` and `purge` commands.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::processing::crop::smart_crop;
use crate::storage::{ImageStore, list_files};
use crate::store::Store;

/// What is on disk and in the database.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    pub images: u64,
    pub enabled_images: u64,
    pub original_files: usize,
    pub thumbnail_files: usize,
    pub current_frame_present: bool,
    /// Records whose original file is gone.
    pub missing_originals: Vec<String>,
}

impl Inventory {
    pub fn is_empty(&self) -> bool {
        self.images == 0
            && self.original_files == 0
            && self.thumbnail_files == 0
            && !self.current_frame_present
    }
}

pub fn inventory(store: &Store, files: &dyn ImageStore, output_path: &Path) -> Result<Inventory> {
    let settings = store.settings()?;
    let missing_originals = store
        .list_images()?
        .into_iter()
        .filter(|img| !files.exists(&settings.image_path(&img.filename)))
        .map(|img| img.filename)
        .collect();
    Ok(Inventory {
        images: store.count_images()?,
        enabled_images: store.count_enabled()?,
        original_files: list_files(&settings.image_root).len(),
        thumbnail_files: list_files(&settings.thumb_root).len(),
        current_frame_present: files.exists(output_path),
        missing_originals,
    })
}

/// Re-run the smart crop for images still at the full frame, against the
/// current resolution setting. Hand-made crops are never touched.
pub fn recalculate_crops(store: &Store) -> Result<usize> {
    let settings = store.settings()?;
    let mut updated = 0;
    for image in store.list_images()? {
        if !image.crop.is_full_frame() {
            continue;
        }
        let crop = smart_crop(image.width, image.height, &settings.resolution);
        if crop.is_full_frame() {
            continue;
        }
        store.set_crop(image.id, crop, image.fit)?;
        updated += 1;
    }
    info!(updated, resolution = %settings.resolution, "recalculated crops");
    Ok(updated)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub records: usize,
    pub files: usize,
}

/// Delete every image record, every stored original and thumbnail, and the
/// current frame. Settings are kept.
pub fn purge(store: &Store, files: &dyn ImageStore, output_path: &Path) -> Result<PurgeReport> {
    let settings = store.settings()?;
    let mut targets: Vec<PathBuf> = list_files(&settings.image_root);
    targets.extend(list_files(&settings.thumb_root));
    if files.exists(output_path) {
        targets.push(output_path.to_path_buf());
    }

    let mut removed = 0;
    for path in &targets {
        match files.delete(path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), error = %err, "purge: could not remove"),
        }
    }
    let records = store.purge_images()?;
    info!(records, files = removed, "purged image library");
    Ok(PurgeReport {
        records,
        files: removed,
    })
}
