use std::path::PathBuf;

use crate::model::ImageId;

/// A rendered frame waiting for the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRequest {
    /// Image the frame was rendered from; `None` for ad-hoc frames that must
    /// not touch display history.
    pub image_id: Option<ImageId>,
    /// Staged frame file, usually from `DisplayQueue::stage_path`. Owned by
    /// the queue once enqueued.
    pub path: PathBuf,
}

#[derive(Debug)]
pub enum DisplayMsg {
    Show(DisplayRequest),
    /// Stop the display consumer.
    Quit,
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Name supplied by the client.
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One accepted upload batch.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub task_id: String,
    pub files: Vec<UploadFile>,
    /// Shared title; blank means "derive from the filename".
    pub title: String,
    pub description: String,
}

#[derive(Debug)]
pub enum UploadMsg {
    Job(UploadJob),
    Quit,
}
