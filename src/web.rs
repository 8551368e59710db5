//! JSON HTTP API over [`PhotoFrame`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::events::UploadFile;
use crate::model::{CropWindow, FitMode, Image, ImageId, ImageUpdate, OrderMode, Settings};
use crate::service::{FrameStatus, PhotoFrame};
use crate::tasks::upload::UploadStatus;

/// Largest accepted request body; uploads carry whole batches of photos.
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    frame: Arc<PhotoFrame>,
}

pub fn router(frame: Arc<PhotoFrame>) -> Router {
    Router::new()
        .route("/api/images", get(list_images))
        .route(
            "/api/images/{id}",
            get(get_image).post(update_image).delete(delete_image),
        )
        .route("/api/images/{id}/crop", post(set_crop))
        .route("/api/images/{id}/toggle", post(toggle_image))
        .route("/api/images/{id}/show", post(show_now))
        .route("/api/uploads", post(upload))
        .route("/api/uploads/{task_id}", get(upload_status))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/recalculate-crops", post(recalculate_crops))
        .route("/api/status", get(status))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(AppState { frame })
}

/// Serve the API on `bind_addr` until `cancel` fires.
pub async fn serve(
    frame: Arc<PhotoFrame>,
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(%bind_addr, "http api listening");
    axum::serve(listener, router(frame))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;
    info!("http api stopped");
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::NotFound(_) | Error::UnknownTask(_) => StatusCode::NOT_FOUND,
            Error::InvalidSettings(_) | Error::InvalidCrop(_) | Error::EmptyUpload => {
                StatusCode::BAD_REQUEST
            }
            Error::DuplicateFilename(_) => StatusCode::CONFLICT,
            Error::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run a blocking frame operation off the async runtime.
async fn blocking<T, F>(state: &AppState, op: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&PhotoFrame) -> crate::Result<T> + Send + 'static,
{
    let frame = Arc::clone(&state.frame);
    let result = task::spawn_blocking(move || op(frame.as_ref()))
        .await
        .map_err(|err| ApiError::internal(format!("request worker failed: {err}")))?;
    Ok(Json(result?))
}

// ── Images ───────────────────────────────────────────────────────────────────

async fn list_images(State(state): State<AppState>) -> ApiResult<Vec<Image>> {
    blocking(&state, |frame| frame.list_images()).await
}

async fn get_image(State(state): State<AppState>, Path(id): Path<ImageId>) -> ApiResult<Image> {
    blocking(&state, move |frame| frame.image(id)).await
}

async fn update_image(
    State(state): State<AppState>,
    Path(id): Path<ImageId>,
    Json(update): Json<ImageUpdate>,
) -> ApiResult<Image> {
    blocking(&state, move |frame| frame.update_image(id, &update)).await
}

#[derive(Debug, Deserialize)]
struct CropRequest {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    #[serde(default)]
    preserve_aspect_ratio: bool,
}

async fn set_crop(
    State(state): State<AppState>,
    Path(id): Path<ImageId>,
    Json(req): Json<CropRequest>,
) -> ApiResult<Image> {
    let crop = CropWindow::new(req.x, req.y, req.width, req.height);
    let fit = FitMode::from_preserve_aspect(req.preserve_aspect_ratio);
    blocking(&state, move |frame| frame.set_crop(id, crop, fit)).await
}

async fn toggle_image(State(state): State<AppState>, Path(id): Path<ImageId>) -> ApiResult<Value> {
    blocking(&state, move |frame| {
        let enabled = frame.toggle_image(id)?;
        Ok(json!({ "id": id, "enabled": enabled }))
    })
    .await
}

async fn show_now(State(state): State<AppState>, Path(id): Path<ImageId>) -> ApiResult<Value> {
    blocking(&state, move |frame| {
        let queued = frame.show_now(id)?;
        Ok(json!({ "ok": true, "queued": queued }))
    })
    .await
}

async fn delete_image(State(state): State<AppState>, Path(id): Path<ImageId>) -> ApiResult<Value> {
    blocking(&state, move |frame| {
        frame.delete_image(id)?;
        Ok(json!({ "ok": true }))
    })
    .await
}

// ── Uploads ──────────────────────────────────────────────────────────────────

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut files = Vec::new();
    let mut title = String::new();
    let mut description = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed upload: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "files" | "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("reading {filename}: {err}")))?;
                if bytes.is_empty() {
                    warn!(%filename, "skipping empty upload part");
                    continue;
                }
                files.push(UploadFile {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            "title" | "description" => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("reading {name}: {err}")))?;
                if name == "title" {
                    title = text;
                } else {
                    description = text;
                }
            }
            other => warn!(field = other, "ignoring unknown upload field"),
        }
    }

    let count = files.len();
    let Json(task_id) = blocking(&state, move |frame| {
        frame.trigger_upload(files, title, description)
    })
    .await?;
    info!(%task_id, files = count, "upload accepted");
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

async fn upload_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<UploadStatus> {
    blocking(&state, move |frame| frame.upload_status(&task_id)).await
}

// ── Settings & maintenance ───────────────────────────────────────────────────

async fn get_settings(State(state): State<AppState>) -> ApiResult<Settings> {
    blocking(&state, |frame| frame.settings()).await
}

/// Partial settings edit; absent fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
struct SettingsUpdate {
    image_root: Option<PathBuf>,
    thumb_root: Option<PathBuf>,
    resolution: Option<String>,
    interval_ms: Option<u64>,
    order_mode: Option<OrderMode>,
    slideshow_enabled: Option<bool>,
}

impl SettingsUpdate {
    fn apply(self, settings: &mut Settings) {
        if let Some(v) = self.image_root {
            settings.image_root = v;
        }
        if let Some(v) = self.thumb_root {
            settings.thumb_root = v;
        }
        if let Some(v) = self.resolution {
            settings.resolution = v;
        }
        if let Some(v) = self.interval_ms {
            settings.interval_ms = v;
        }
        if let Some(v) = self.order_mode {
            settings.order_mode = v;
        }
        if let Some(v) = self.slideshow_enabled {
            settings.slideshow_enabled = v;
        }
    }
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResult<Settings> {
    blocking(&state, move |frame| frame.modify_settings(|s| update.apply(s))).await
}

async fn recalculate_crops(State(state): State<AppState>) -> ApiResult<Value> {
    blocking(&state, |frame| {
        let updated = frame.recalculate_crops()?;
        Ok(json!({ "updated": updated }))
    })
    .await
}

async fn status(State(state): State<AppState>) -> ApiResult<FrameStatus> {
    blocking(&state, |frame| frame.status()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_errors_map_to_status_codes() {
        let cases = [
            (Error::NotFound(3), StatusCode::NOT_FOUND),
            (Error::UnknownTask("abc".into()), StatusCode::NOT_FOUND),
            (Error::InvalidCrop("w".into()), StatusCode::BAD_REQUEST),
            (Error::EmptyUpload, StatusCode::BAD_REQUEST),
            (Error::DuplicateFilename("a.jpg".into()), StatusCode::CONFLICT),
            (Error::QueueFull, StatusCode::SERVICE_UNAVAILABLE),
            (Error::SettingsMissing, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn partial_settings_update_keeps_other_fields() {
        let update: SettingsUpdate =
            serde_json::from_str(r#"{"order_mode":"custom","interval_ms":30000}"#).unwrap();
        let mut merged = Settings::default();
        update.apply(&mut merged);
        assert_eq!(merged.order_mode, OrderMode::Custom);
        assert_eq!(merged.interval_ms, 30_000);
        assert_eq!(merged.resolution, Settings::default().resolution);
        assert!(merged.slideshow_enabled);
    }

    #[test]
    fn crop_request_defaults_to_crop_fill() {
        let req: CropRequest =
            serde_json::from_str(r#"{"x":0,"y":10,"width":100,"height":80}"#).unwrap();
        assert!(!req.preserve_aspect_ratio);
        assert_eq!(req.y, 10.0);
    }
}
