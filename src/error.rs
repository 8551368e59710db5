use thiserror::Error;

use crate::model::ImageId;

/// Library error type for photo frame operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No image with this id exists in the store.
    #[error("image {0} not found")]
    NotFound(ImageId),

    /// The settings singleton is missing; the frame cannot operate without it.
    #[error("settings row missing")]
    SettingsMissing,

    /// Another image is already stored under this filename.
    #[error("an image named {0} already exists")]
    DuplicateFilename(String),

    /// Rejected settings update.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Rejected crop window update.
    #[error("invalid crop window: {0}")]
    InvalidCrop(String),

    /// Poll for an upload task that was never created or has been pruned.
    #[error("upload task {0} not found")]
    UnknownTask(String),

    /// An upload batch without any files.
    #[error("upload contains no files")]
    EmptyUpload,

    /// The upload queue cannot accept another batch right now.
    #[error("upload queue is full")]
    QueueFull,

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Decode/encode failure from the `image` crate.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// SQLite error from the metadata store.
    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    /// Metadata blob (de)serialisation error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),

    /// Rendering error from the frame pipeline.
    #[error("render error: {0}")]
    Render(anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
