//! Display queue: bounded hand-off from the renderers to the one thread that
//! talks to the display sink.
//!
//! Every request carries its own staged frame. The consumer moves it onto the
//! shared frame path just before writing it, so a queued request always shows
//! the image it was rendered from.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, error, info, warn};

use crate::events::{DisplayMsg, DisplayRequest};
use crate::platform::display_sink::DisplaySink;
use crate::store::Store;
use crate::tasks::worker::{StopFlag, Worker};

pub const DEFAULT_CAPACITY: usize = 4;
const POLL: Duration = Duration::from_secs(1);

/// Producer handle. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct DisplayQueue {
    tx: Sender<DisplayMsg>,
    dropped: Arc<AtomicU64>,
    staged: Arc<AtomicU64>,
    output_path: Arc<PathBuf>,
}

impl DisplayQueue {
    /// Fresh path next to the shared frame for a producer to render into.
    /// `current.jpg` stages as `current-<n>.jpg`.
    pub fn stage_path(&self) -> PathBuf {
        let n = self.staged.fetch_add(1, Ordering::Relaxed);
        staged_name(&self.output_path, n)
    }

    /// The frame file the display reads from.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Queue a frame for display. A full queue drops the frame, removes its
    /// staged file and returns `false`.
    ///
    /// The queue takes ownership of `request.path`: it is moved onto the
    /// shared frame path when shown and deleted if the frame is dropped.
    pub fn try_enqueue(&self, request: DisplayRequest) -> bool {
        match self.tx.try_send(DisplayMsg::Show(request)) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if let DisplayMsg::Show(req) = msg {
                    warn!(image_id = ?req.image_id, dropped = total, "display queue full; frame dropped");
                    discard(&req, &self.output_path);
                }
                false
            }
            Err(TrySendError::Disconnected(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("display consumer is gone; frame dropped");
                if let DisplayMsg::Show(req) = msg {
                    discard(&req, &self.output_path);
                }
                false
            }
        }
    }

    /// Frames dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames waiting for the display.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

/// The consumer thread; owns the only path to the sink.
pub struct DisplayConsumer {
    worker: Worker,
    tx: Sender<DisplayMsg>,
}

impl DisplayConsumer {
    /// Stop after the frame currently being written, if any.
    pub fn shutdown(self, timeout: Duration) -> bool {
        self.worker.request_stop();
        let _ = self.tx.try_send(DisplayMsg::Quit);
        self.worker.join_timeout(timeout)
    }
}

/// Start the display consumer and return its producer handle.
///
/// Frames are written to the sink from `output_path`. After a frame is shown
/// successfully the source image's display history is updated in `store`.
pub fn spawn(
    sink: Arc<dyn DisplaySink>,
    store: Arc<Store>,
    output_path: PathBuf,
    saturation: f32,
    capacity: usize,
) -> io::Result<(DisplayQueue, DisplayConsumer)> {
    let (tx, rx) = bounded(capacity.max(1));
    let output_path = Arc::new(output_path);
    let consumer_output = Arc::clone(&output_path);
    let worker = Worker::spawn("display", move |stop| {
        run(&rx, sink.as_ref(), &store, &consumer_output, saturation, &stop)
    })?;
    let queue = DisplayQueue {
        tx: tx.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
        staged: Arc::new(AtomicU64::new(0)),
        output_path,
    };
    Ok((queue, DisplayConsumer { worker, tx }))
}

fn run(
    rx: &Receiver<DisplayMsg>,
    sink: &dyn DisplaySink,
    store: &Store,
    output_path: &Path,
    saturation: f32,
    stop: &StopFlag,
) {
    info!(output = %output_path.display(), "display consumer started");
    while !stop.is_set() {
        match rx.recv_timeout(POLL) {
            Ok(DisplayMsg::Show(request)) => show(sink, store, output_path, saturation, &request),
            Ok(DisplayMsg::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    // frames still queued are never shown
    for msg in rx.try_iter() {
        if let DisplayMsg::Show(request) = msg {
            discard(&request, output_path);
        }
    }
    info!("display consumer stopped");
}

fn show(
    sink: &dyn DisplaySink,
    store: &Store,
    output_path: &Path,
    saturation: f32,
    request: &DisplayRequest,
) {
    debug!(image_id = ?request.image_id, path = %request.path.display(), "writing frame");
    if request.path != output_path {
        if let Err(err) = fs::rename(&request.path, output_path) {
            error!(
                image_id = ?request.image_id,
                path = %request.path.display(),
                error = %err,
                "could not move staged frame into place"
            );
            discard(request, output_path);
            return;
        }
    }
    let started = Instant::now();
    if let Err(err) = sink.show_image(output_path, saturation) {
        error!(image_id = ?request.image_id, error = ?err, "display write failed");
        return;
    }
    info!(
        image_id = ?request.image_id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "displayed"
    );
    if let Some(id) = request.image_id {
        if let Err(err) = store.mark_shown(id, Utc::now()) {
            warn!(image_id = id, error = %err, "could not record display");
        }
    }
}

fn staged_name(output_path: &Path, n: u64) -> PathBuf {
    let stem = output_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("frame");
    let name = match output_path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}-{n}.{ext}"),
        None => format!("{stem}-{n}"),
    };
    output_path.with_file_name(name)
}

/// Remove a staged frame that will not be shown.
fn discard(request: &DisplayRequest, output_path: &Path) {
    if request.path == output_path {
        return;
    }
    match fs::remove_file(&request.path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %request.path.display(), error = %err, "could not remove staged frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_names_sit_next_to_the_frame() {
        let out = Path::new("/srv/static/current.jpg");
        assert_eq!(staged_name(out, 0), PathBuf::from("/srv/static/current-0.jpg"));
        assert_eq!(staged_name(out, 12), PathBuf::from("/srv/static/current-12.jpg"));
        assert_eq!(staged_name(Path::new("frame"), 3), PathBuf::from("frame-3"));
    }
}
