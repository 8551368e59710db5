//! SQLite-backed metadata store for the settings singleton and image records.
//!
//! Every public method runs as one short transaction on a shared connection;
//! nothing is held open across calls.

pub mod migrations;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{CropWindow, FitMode, Image, ImageId, ImageUpdate, NewImage, OrderMode, Settings};

const IMAGE_COLUMNS: &str = "id, filename, original_name, title, description, metadata_json, \
     width, height, enabled, sort_order, times_shown, last_shown_at, created_at, \
     crop_x, crop_y, crop_width, crop_height, preserve_aspect_ratio";

const SETTINGS_COLUMNS: &str =
    "image_root, thumb_root, resolution, interval_ms, order_mode, slideshow_enabled";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    /// Create the settings row from `defaults` if it does not exist yet and
    /// return the stored row.
    pub fn ensure_settings(&self, defaults: &Settings) -> Result<Settings> {
        let conn = self.conn();
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO settings (id, {SETTINGS_COLUMNS})
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            params![
                path_text(&defaults.image_root),
                path_text(&defaults.thumb_root),
                defaults.resolution,
                millis(defaults.interval_ms),
                defaults.order_mode.as_str(),
                defaults.slideshow_enabled,
            ],
        )?;
        if inserted > 0 {
            tracing::info!("created default settings row");
        }
        read_settings(&conn)
    }

    /// The settings singleton; [`Error::SettingsMissing`] if it was never created.
    pub fn settings(&self) -> Result<Settings> {
        read_settings(&self.conn())
    }

    pub fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        let conn = self.conn();
        write_settings(&conn, settings)?;
        read_settings(&conn)
    }

    /// Read, modify and write the settings row in one immediate transaction,
    /// so concurrent partial updates cannot lose each other's fields. Nothing
    /// is written if `change` fails.
    pub fn update_settings_with<F>(&self, change: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings) -> Result<()>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut settings = read_settings(&tx)?;
        change(&mut settings)?;
        write_settings(&tx, &settings)?;
        let stored = read_settings(&tx)?;
        tx.commit()?;
        Ok(stored)
    }

    // ── Images ───────────────────────────────────────────────────────────────

    /// Insert a freshly uploaded image at the end of the custom order.
    pub fn insert_image(&self, new: &NewImage) -> Result<Image> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if filename_taken(&tx, &new.filename)? {
            return Err(Error::DuplicateFilename(new.filename.clone()));
        }
        let count: i64 = tx.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        let metadata = serde_json::to_string(&new.metadata)?;
        tx.execute(
            "INSERT INTO images (filename, original_name, title, description, metadata_json,
                 width, height, enabled, sort_order, times_shown, created_at,
                 crop_x, crop_y, crop_width, crop_height, preserve_aspect_ratio)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, 0, ?9, ?10, ?11, ?12, ?13, 0)",
            params![
                new.filename,
                new.original_name,
                new.title,
                new.description,
                metadata,
                new.width,
                new.height,
                count + 1,
                timestamp(Utc::now()),
                new.crop.x,
                new.crop.y,
                new.crop.width,
                new.crop.height,
            ],
        )
        .map_err(|err| duplicate_on_constraint(err, &new.filename))?;
        let id = tx.last_insert_rowid();
        let image = read_image(&tx, id)?;
        tx.commit()?;
        Ok(image)
    }

    pub fn image(&self, id: ImageId) -> Result<Image> {
        read_image(&self.conn(), id)
    }

    /// All images in display-list order (sort order, then upload time).
    pub fn list_images(&self) -> Result<Vec<Image>> {
        collect_images(
            &self.conn(),
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images
                 ORDER BY sort_order ASC, created_at ASC, id ASC"
            ),
        )
    }

    pub fn list_enabled(&self) -> Result<Vec<Image>> {
        collect_images(
            &self.conn(),
            &format!(
                "SELECT {IMAGE_COLUMNS} FROM images WHERE enabled = 1
                 ORDER BY sort_order ASC, created_at ASC, id ASC"
            ),
        )
    }

    /// Apply the fields present in `update`.
    pub fn update_image(&self, id: ImageId, update: &ImageUpdate) -> Result<Image> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read_image(&tx, id)?;
        tx.execute(
            "UPDATE images SET title = ?2, description = ?3, sort_order = ?4 WHERE id = ?1",
            params![
                id,
                update.title.as_deref().unwrap_or(&current.title),
                update.description.as_deref().unwrap_or(&current.description),
                update.sort_order.unwrap_or(current.sort_order),
            ],
        )?;
        let image = read_image(&tx, id)?;
        tx.commit()?;
        Ok(image)
    }

    pub fn set_crop(&self, id: ImageId, crop: CropWindow, fit: FitMode) -> Result<Image> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE images SET crop_x = ?2, crop_y = ?3, crop_width = ?4, crop_height = ?5,
                 preserve_aspect_ratio = ?6
             WHERE id = ?1",
            params![
                id,
                crop.x,
                crop.y,
                crop.width,
                crop.height,
                fit.preserves_aspect()
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        read_image(&conn, id)
    }

    /// Flip the enabled flag and return the new value.
    ///
    /// Display history is left untouched, so a re-enabled image keeps its
    /// place in the rotation.
    pub fn toggle_enabled(&self, id: ImageId) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE images SET enabled = NOT enabled WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(conn.query_row(
            "SELECT enabled FROM images WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?)
    }

    pub fn delete_image(&self, id: ImageId) -> Result<()> {
        let changed = self
            .conn()
            .execute("DELETE FROM images WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    /// Record that `id` reached the display at `at`.
    pub fn mark_shown(&self, id: ImageId, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE images SET times_shown = times_shown + 1, last_shown_at = ?2 WHERE id = ?1",
            params![id, timestamp(at)],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(id));
        }
        Ok(())
    }

    pub fn filename_exists(&self, filename: &str) -> Result<bool> {
        Ok(filename_taken(&self.conn(), filename)?)
    }

    pub fn count_images(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    pub fn count_enabled(&self) -> Result<u64> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM images WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u64)
    }

    /// Delete every image record. Files are the caller's business.
    pub fn purge_images(&self) -> Result<usize> {
        Ok(self.conn().execute("DELETE FROM images", [])?)
    }
}

// ── Private helpers ──────────────────────────────────────────────────────────

fn read_settings(conn: &Connection) -> Result<Settings> {
    conn.query_row(
        &format!("SELECT {SETTINGS_COLUMNS} FROM settings WHERE id = 1"),
        [],
        settings_from_row,
    )
    .optional()?
    .ok_or(Error::SettingsMissing)
}

fn write_settings(conn: &Connection, settings: &Settings) -> Result<()> {
    let changed = conn.execute(
        "UPDATE settings SET image_root = ?1, thumb_root = ?2, resolution = ?3,
             interval_ms = ?4, order_mode = ?5, slideshow_enabled = ?6
         WHERE id = 1",
        params![
            path_text(&settings.image_root),
            path_text(&settings.thumb_root),
            settings.resolution,
            millis(settings.interval_ms),
            settings.order_mode.as_str(),
            settings.slideshow_enabled,
        ],
    )?;
    if changed == 0 {
        return Err(Error::SettingsMissing);
    }
    Ok(())
}

fn settings_from_row(row: &Row<'_>) -> rusqlite::Result<Settings> {
    let image_root: String = row.get(0)?;
    let thumb_root: String = row.get(1)?;
    let interval_ms: i64 = row.get(3)?;
    let order_raw: String = row.get(4)?;
    let order_mode = order_raw.parse::<OrderMode>().unwrap_or_else(|_| {
        warn!(order_mode = %order_raw, "unknown order mode in settings; using added");
        OrderMode::Added
    });
    Ok(Settings {
        image_root: PathBuf::from(image_root),
        thumb_root: PathBuf::from(thumb_root),
        resolution: row.get(2)?,
        interval_ms: interval_ms.max(0) as u64,
        order_mode,
        slideshow_enabled: row.get(5)?,
    })
}

fn read_image(conn: &Connection, id: ImageId) -> Result<Image> {
    conn.query_row(
        &format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = ?1"),
        params![id],
        image_from_row,
    )
    .optional()?
    .ok_or(Error::NotFound(id))
}

/// Prepare `sql`, map every row to an [`Image`] and collect.
fn collect_images(conn: &Connection, sql: &str) -> Result<Vec<Image>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], image_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<Image> {
    let metadata_json: String = row.get(5)?;
    let last_shown_at: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let times_shown: i64 = row.get(10)?;
    Ok(Image {
        id: row.get(0)?,
        filename: row.get(1)?,
        original_name: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        // opaque blob; a corrupt one is not worth failing a listing over
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        width: row.get(6)?,
        height: row.get(7)?,
        enabled: row.get(8)?,
        sort_order: row.get(9)?,
        times_shown: times_shown.max(0) as u64,
        last_shown_at: last_shown_at
            .as_deref()
            .map(|raw| parse_timestamp(11, raw))
            .transpose()?,
        created_at: parse_timestamp(12, &created_at)?,
        crop: CropWindow::new(row.get(13)?, row.get(14)?, row.get(15)?, row.get(16)?),
        fit: FitMode::from_preserve_aspect(row.get(17)?),
    })
}

fn filename_taken(conn: &Connection, filename: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM images WHERE filename = ?1)",
        params![filename],
        |row| row.get(0),
    )
}

fn duplicate_on_constraint(err: rusqlite::Error, filename: &str) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            Error::DuplicateFilename(filename.to_string())
        }
        other => Error::Store(other),
    }
}

/// Fixed-width RFC 3339 so lexical order matches chronological order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}
