//! Slideshow scheduler: periodically pick, render and queue the next image.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rand::Rng;
use tracing::{debug, error, info};

use crate::events::DisplayRequest;
use crate::model::ImageId;
use crate::processing::render::render_image;
use crate::selection;
use crate::storage::ImageStore;
use crate::store::Store;
use crate::tasks::display::DisplayQueue;
use crate::tasks::worker::{StopFlag, Worker};

/// Pause after a failed iteration.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(10);
const SLICE: Duration = Duration::from_secs(1);

/// Everything one iteration needs.
#[derive(Clone)]
pub struct SlideshowContext {
    pub store: Arc<Store>,
    /// Where originals are read from.
    pub files: Arc<dyn ImageStore>,
    pub queue: DisplayQueue,
}

/// Outcome of a single iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Disabled,
    /// Enabled but there is nothing to show.
    Idle,
    Queued(ImageId),
    /// Rendered, but the display queue was full.
    Dropped(ImageId),
}

/// Run one iteration and return its outcome with the pause before the next.
pub fn tick<R>(ctx: &SlideshowContext, rng: &mut R) -> Result<(Tick, Duration)>
where
    R: Rng + ?Sized,
{
    let settings = ctx.store.settings().context("reading settings")?;
    let interval = settings.slideshow_interval();
    if !settings.slideshow_enabled {
        debug!("slideshow disabled");
        return Ok((Tick::Disabled, interval));
    }

    let images = ctx
        .store
        .list_enabled()
        .context("listing enabled images")?;
    let Some(image) = selection::select_next(&images, settings.order_mode, rng) else {
        debug!(order_mode = %settings.order_mode, "no enabled images");
        return Ok((Tick::Idle, interval));
    };

    let staged = ctx.queue.stage_path();
    render_image(&settings, image, ctx.files.as_ref(), &staged)
        .with_context(|| format!("rendering image {} ({})", image.id, image.filename))?;
    let queued = ctx.queue.try_enqueue(DisplayRequest {
        image_id: Some(image.id),
        path: staged,
    });
    let outcome = if queued {
        Tick::Queued(image.id)
    } else {
        Tick::Dropped(image.id)
    };
    debug!(image_id = image.id, ?outcome, next_in = ?interval, "slideshow tick");
    Ok((outcome, interval))
}

pub struct Slideshow {
    worker: Worker,
    wake: Sender<()>,
}

impl Slideshow {
    /// Start the scheduler. The first iteration runs immediately.
    pub fn start(ctx: SlideshowContext) -> io::Result<Self> {
        let (wake_tx, wake_rx) = bounded(1);
        let worker = Worker::spawn("slideshow", move |stop| run(&ctx, &wake_rx, &stop))?;
        Ok(Self {
            worker,
            wake: wake_tx,
        })
    }

    pub fn shutdown(self, timeout: Duration) -> bool {
        self.worker.request_stop();
        let _ = self.wake.try_send(());
        self.worker.join_timeout(timeout)
    }
}

fn run(ctx: &SlideshowContext, wake: &Receiver<()>, stop: &StopFlag) {
    info!(output = %ctx.queue.output_path().display(), "slideshow started");
    let mut rng = rand::rng();
    while !stop.is_set() {
        if !pause(wake, stop, next_pause(tick(ctx, &mut rng))) {
            break;
        }
    }
    info!("slideshow stopped");
}

/// How long to wait after an iteration: its interval, or the fixed back-off
/// if it failed.
fn next_pause(outcome: Result<(Tick, Duration)>) -> Duration {
    match outcome {
        Ok((_, interval)) => interval,
        Err(err) => {
            error!(error = ?err, "slideshow iteration failed");
            ERROR_BACKOFF
        }
    }
}

/// Sleep for `total` in short slices. Returns `false` when the loop should end.
fn pause(wake: &Receiver<()>, stop: &StopFlag, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.is_set() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        match wake.recv_timeout(remaining.min(SLICE)) {
            Ok(()) => return !stop.is_set(),
            Err(RecvTimeoutError::Disconnected) => return false,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn failed_iterations_back_off_regardless_of_interval() {
        let failed = next_pause(Err(anyhow!("display unreachable")));
        assert_eq!(failed, ERROR_BACKOFF);

        let ok = next_pause(Ok((Tick::Idle, Duration::from_secs(300))));
        assert_eq!(ok, Duration::from_secs(300));
        let short = next_pause(Ok((Tick::Queued(1), Duration::from_secs(5))));
        assert_eq!(short, Duration::from_secs(5));
    }

    #[test]
    fn pause_runs_to_the_deadline() {
        let (_tx, rx) = bounded::<()>(1);
        let start = Instant::now();
        assert!(pause(&rx, &StopFlag::new(), Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn pause_ends_early_on_stop() {
        let (tx, rx) = bounded::<()>(1);
        let stop = StopFlag::new();
        stop.request();
        tx.send(()).unwrap();
        let start = Instant::now();
        assert!(!pause(&rx, &stop, Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn pause_gives_up_when_the_owner_is_gone() {
        let (tx, rx) = bounded::<()>(1);
        drop(tx);
        assert!(!pause(&rx, &StopFlag::new(), Duration::from_secs(30)));
    }
}
