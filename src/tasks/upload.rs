//! Batch upload processor.
//!
//! Batches are accepted by [`UploadQueue::submit`], which hands back a task id
//! immediately. A single consumer thread ingests the files one by one while
//! [`UploadTasks`] keeps a pollable status per batch. A per-file failure lands
//! in the task's error list and the batch moves on.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{UploadFile, UploadJob, UploadMsg};
use crate::meta;
use crate::model::{Image, ImageId, NewImage, Settings};
use crate::processing::crop::smart_crop;
use crate::processing::render::{THUMBNAIL_QUALITY, encode_jpeg, thumbnail};
use crate::storage::{self, ImageStore};
use crate::store::Store;
use crate::tasks::worker::{StopFlag, Worker};

pub const TASK_ID_LEN: usize = 16;
pub const DEFAULT_THUMBNAIL_MAX_SIDE: u32 = 480;
/// Finished tasks are forgotten this long after their last activity.
pub const TASK_RETENTION: Duration = Duration::from_secs(60 * 60);
const QUEUE_CAPACITY: usize = 16;
const POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Snapshot of one upload batch.
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub task_id: String,
    pub status: TaskStatus,
    pub total: usize,
    pub uploaded: usize,
    /// `"<filename>: <reason>"` per failed file.
    pub errors: Vec<String>,
    pub current_file: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message: Option<String>,
    pub image_ids: Vec<ImageId>,
}

impl UploadStatus {
    fn new(task_id: String, total: usize, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Queued,
            total,
            uploaded: 0,
            errors: Vec::new(),
            current_file: None,
            started_at: now,
            last_activity: now,
            message: None,
            image_ids: Vec::new(),
        }
    }
}

/// Limits after which a processing batch is declared stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogLimits {
    pub max_duration: Duration,
    pub inactivity: Duration,
}

impl Default for WatchdogLimits {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(10 * 60),
            inactivity: Duration::from_secs(2 * 60),
        }
    }
}

/// Reason the watchdog would fail `status` at `now`, if any.
///
/// Only batches being processed are judged; a batch waiting behind another
/// one is not stalled.
pub fn check_watchdog(
    status: &UploadStatus,
    limits: &WatchdogLimits,
    now: DateTime<Utc>,
) -> Option<String> {
    if status.status != TaskStatus::Processing {
        return None;
    }
    let running = (now - status.started_at).to_std().unwrap_or_default();
    if running > limits.max_duration {
        return Some(format!(
            "upload timed out after {}",
            humantime::format_duration(limits.max_duration)
        ));
    }
    let idle = (now - status.last_activity).to_std().unwrap_or_default();
    if idle > limits.inactivity {
        return Some(format!(
            "upload stalled: no progress for {}",
            humantime::format_duration(limits.inactivity)
        ));
    }
    None
}

/// In-memory registry of upload batches.
#[derive(Debug, Clone, Default)]
pub struct UploadTasks {
    inner: Arc<RwLock<HashMap<String, UploadStatus>>>,
    limits: WatchdogLimits,
}

impl UploadTasks {
    pub fn new(limits: WatchdogLimits) -> Self {
        Self {
            inner: Arc::default(),
            limits,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, UploadStatus>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, UploadStatus>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new queued batch of `total` files and return its id.
    ///
    /// Finished batches past [`TASK_RETENTION`] are pruned on the way.
    pub fn create(&self, total: usize) -> String {
        let now = Utc::now();
        self.prune(now, TASK_RETENTION);
        let mut tasks = self.write();
        let task_id = loop {
            let candidate = generate_task_id();
            if !tasks.contains_key(&candidate) {
                break candidate;
            }
        };
        tasks.insert(task_id.clone(), UploadStatus::new(task_id.clone(), total, now));
        task_id
    }

    /// Current status, after applying the watchdog.
    pub fn poll(&self, task_id: &str) -> Result<UploadStatus> {
        let now = Utc::now();
        let mut tasks = self.write();
        let status = tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?;
        if let Some(reason) = check_watchdog(status, &self.limits, now) {
            warn!(task_id, %reason, "upload task failed by watchdog");
            status.status = TaskStatus::Error;
            status.current_file = None;
            status.message = Some(reason);
        }
        Ok(status.clone())
    }

    /// Apply `f` to the task's status. Returns `false` for unknown tasks.
    pub fn update<F>(&self, task_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut UploadStatus),
    {
        match self.write().get_mut(task_id) {
            Some(status) => {
                f(status);
                true
            }
            None => false,
        }
    }

    pub fn touch(&self, task_id: &str) {
        self.update(task_id, |s| s.last_activity = Utc::now());
    }

    /// Drop finished tasks idle for longer than `retention`.
    pub fn prune(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut tasks = self.write();
        let before = tasks.len();
        tasks.retain(|_, s| {
            let idle = (now - s.last_activity).to_std().unwrap_or_default();
            !(s.status.is_terminal() && idle > retention)
        });
        let pruned = before - tasks.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished upload tasks");
        }
        pruned
    }

    fn remove(&self, task_id: &str) {
        self.write().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn active(&self) -> usize {
        self.read()
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }
}

fn generate_task_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TASK_ID_LEN)
        .map(char::from)
        .collect()
}

/// Title for an uploaded file: the shared title if given, else the file stem.
pub fn derive_title(shared: &str, filename: &str) -> String {
    let shared = shared.trim();
    if !shared.is_empty() {
        return shared.to_string();
    }
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Turns uploaded bytes into stored files and image records.
#[derive(Clone)]
pub struct Ingest {
    pub store: Arc<Store>,
    pub files: Arc<dyn ImageStore>,
    pub tasks: UploadTasks,
    pub thumbnail_max_side: u32,
}

impl Ingest {
    /// Process a whole batch, recording progress under its task id.
    pub fn process(&self, job: UploadJob) {
        let task_id = job.task_id.as_str();
        self.tasks.update(task_id, |s| {
            let now = Utc::now();
            s.status = TaskStatus::Processing;
            s.started_at = now;
            s.last_activity = now;
        });
        info!(task_id, files = job.files.len(), "upload batch started");

        let settings = match self.store.settings() {
            Ok(settings) => settings,
            Err(err) => {
                warn!(task_id, error = %err, "upload batch aborted");
                self.tasks.update(task_id, |s| {
                    s.status = TaskStatus::Error;
                    s.message = Some(err.to_string());
                    s.errors = job
                        .files
                        .iter()
                        .map(|f| format!("{}: {err}", f.filename))
                        .collect();
                });
                return;
            }
        };

        for file in &job.files {
            self.tasks.update(task_id, |s| {
                s.current_file = Some(file.filename.clone());
                s.last_activity = Utc::now();
            });
            match self.ingest_file(task_id, &settings, file, &job.title, &job.description) {
                Ok(image) => {
                    debug!(task_id, image_id = image.id, filename = %image.filename, "ingested");
                    self.tasks.update(task_id, |s| {
                        s.uploaded += 1;
                        s.image_ids.push(image.id);
                        s.last_activity = Utc::now();
                    });
                }
                Err(err) => {
                    warn!(task_id, file = %file.filename, error = %err, "upload file failed");
                    self.tasks.update(task_id, |s| {
                        s.errors.push(format!("{}: {err}", file.filename));
                        s.last_activity = Utc::now();
                    });
                }
            }
        }

        self.tasks.update(task_id, |s| {
            s.current_file = None;
            s.last_activity = Utc::now();
            if s.status == TaskStatus::Error {
                // already failed by the watchdog
                return;
            }
            if s.uploaded == 0 && !s.errors.is_empty() {
                s.status = TaskStatus::Error;
                s.message = Some(format!("all {} files failed", s.errors.len()));
            } else {
                s.status = TaskStatus::Completed;
            }
        });
        info!(task_id, "upload batch finished");
    }

    fn ingest_file(
        &self,
        task_id: &str,
        settings: &Settings,
        file: &UploadFile,
        title: &str,
        description: &str,
    ) -> Result<Image> {
        let source = meta::decode_oriented(&file.bytes)?;
        let filename = storage::unique_name(&file.filename, Utc::now());
        if self.store.filename_exists(&filename)? {
            return Err(Error::DuplicateFilename(filename));
        }

        let mut written = Rollback::new(self.files.as_ref());
        let original_path = settings.image_path(&filename);
        self.files.write(&original_path, &file.bytes)?;
        written.track(original_path);
        self.tasks.touch(task_id);

        let metadata = meta::extract_metadata(&file.bytes);
        let thumb = thumbnail(&source, self.thumbnail_max_side)?;
        let thumb_path = settings.thumb_path(&filename);
        self.files
            .write(&thumb_path, &encode_jpeg(&thumb, THUMBNAIL_QUALITY)?)?;
        written.track(thumb_path);
        self.tasks.touch(task_id);

        let (width, height) = (source.width(), source.height());
        let image = self.store.insert_image(&NewImage {
            filename,
            original_name: file.filename.clone(),
            title: derive_title(title, &file.filename),
            description: description.trim().to_string(),
            metadata,
            width,
            height,
            crop: smart_crop(width, height, &settings.resolution),
        })?;
        written.keep();
        Ok(image)
    }
}

/// Removes files written for an upload unless the ingest went through.
struct Rollback<'a> {
    files: &'a dyn ImageStore,
    paths: Vec<PathBuf>,
}

impl<'a> Rollback<'a> {
    fn new(files: &'a dyn ImageStore) -> Self {
        Self {
            files,
            paths: Vec::new(),
        }
    }

    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    fn keep(mut self) {
        self.paths.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(err) = self.files.delete(&path) {
                warn!(path = %path.display(), error = %err, "could not remove partial upload");
            }
        }
    }
}

/// Producer handle for upload batches.
#[derive(Clone)]
pub struct UploadQueue {
    tx: Sender<UploadMsg>,
    tasks: UploadTasks,
}

impl UploadQueue {
    /// Accept a batch and return its task id without waiting for processing.
    pub fn submit(
        &self,
        files: Vec<UploadFile>,
        title: String,
        description: String,
    ) -> Result<String> {
        if files.is_empty() {
            return Err(Error::EmptyUpload);
        }
        let task_id = self.tasks.create(files.len());
        let job = UploadJob {
            task_id: task_id.clone(),
            files,
            title,
            description,
        };
        match self.tx.try_send(UploadMsg::Job(job)) {
            Ok(()) => {
                debug!(task_id = %task_id, "upload batch queued");
                Ok(task_id)
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.tasks.remove(&task_id);
                Err(Error::QueueFull)
            }
        }
    }

    pub fn tasks(&self) -> &UploadTasks {
        &self.tasks
    }
}

pub struct UploadConsumer {
    worker: Worker,
    tx: Sender<UploadMsg>,
}

impl UploadConsumer {
    /// Stop once the batch in progress, if any, is done.
    pub fn shutdown(self, timeout: Duration) -> bool {
        self.worker.request_stop();
        let _ = self.tx.try_send(UploadMsg::Quit);
        self.worker.join_timeout(timeout)
    }
}

/// Start the upload consumer thread.
pub fn spawn(ingest: Ingest) -> io::Result<(UploadQueue, UploadConsumer)> {
    let (tx, rx) = bounded(QUEUE_CAPACITY);
    let queue = UploadQueue {
        tx: tx.clone(),
        tasks: ingest.tasks.clone(),
    };
    let worker = Worker::spawn("uploads", move |stop| run(&rx, &ingest, &stop))?;
    Ok((queue, UploadConsumer { worker, tx }))
}

fn run(rx: &Receiver<UploadMsg>, ingest: &Ingest, stop: &StopFlag) {
    info!("upload consumer started");
    while !stop.is_set() {
        match rx.recv_timeout(POLL) {
            Ok(UploadMsg::Job(job)) => ingest.process(job),
            Ok(UploadMsg::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    info!("upload consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn processing(started_ago: i64, idle_for: i64) -> UploadStatus {
        let now = Utc::now();
        let mut status = UploadStatus::new("t".into(), 3, now);
        status.status = TaskStatus::Processing;
        status.started_at = now - ChronoDuration::seconds(started_ago);
        status.last_activity = now - ChronoDuration::seconds(idle_for);
        status
    }

    #[test]
    fn watchdog_flags_long_and_idle_batches() {
        let limits = WatchdogLimits::default();
        let now = Utc::now();
        assert!(check_watchdog(&processing(30, 5), &limits, now).is_none());

        let slow = check_watchdog(&processing(11 * 60, 1), &limits, now).unwrap();
        assert!(slow.contains("timed out"), "{slow}");

        let idle = check_watchdog(&processing(200, 150), &limits, now).unwrap();
        assert!(idle.contains("no progress"), "{idle}");
    }

    #[test]
    fn watchdog_ignores_queued_and_finished_batches() {
        let limits = WatchdogLimits::default();
        let now = Utc::now();
        for status in [TaskStatus::Queued, TaskStatus::Completed, TaskStatus::Error] {
            let mut s = processing(3600, 3600);
            s.status = status;
            assert!(check_watchdog(&s, &limits, now).is_none());
        }
    }

    #[test]
    fn poll_applies_the_watchdog_once() {
        let tasks = UploadTasks::new(WatchdogLimits {
            max_duration: Duration::from_secs(600),
            inactivity: Duration::from_secs(1),
        });
        let id = tasks.create(2);
        assert_eq!(id.len(), TASK_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(tasks.poll(&id).unwrap().status, TaskStatus::Queued);

        tasks.update(&id, |s| {
            s.status = TaskStatus::Processing;
            s.last_activity = Utc::now() - ChronoDuration::seconds(5);
        });
        let polled = tasks.poll(&id).unwrap();
        assert_eq!(polled.status, TaskStatus::Error);
        assert!(polled.message.is_some());
        assert!(matches!(tasks.poll("missing"), Err(Error::UnknownTask(_))));
    }

    #[test]
    fn prune_only_drops_old_finished_tasks() {
        let tasks = UploadTasks::default();
        let old_done = tasks.create(1);
        let old_running = tasks.create(1);
        let fresh_done = tasks.create(1);
        let hour_ago = Utc::now() - ChronoDuration::minutes(61);
        tasks.update(&old_done, |s| {
            s.status = TaskStatus::Completed;
            s.last_activity = hour_ago;
        });
        tasks.update(&old_running, |s| {
            s.status = TaskStatus::Processing;
            s.last_activity = hour_ago;
        });
        tasks.update(&fresh_done, |s| s.status = TaskStatus::Error);

        assert_eq!(tasks.prune(Utc::now(), TASK_RETENTION), 1);
        assert!(tasks.poll(&old_done).is_err());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks.active(), 1);
    }

    #[test]
    fn titles_fall_back_to_the_file_stem() {
        assert_eq!(derive_title("  Summer ", "a.jpg"), "Summer");
        assert_eq!(derive_title("", "beach day.JPG"), "beach day");
        assert_eq!(derive_title("   ", "noext"), "noext");
    }
}
