//! Named background threads with a cooperative stop flag and a bounded join.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use tracing::{debug, warn};

/// Shared "please stop" signal observed by a loop between work items.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Worker {
    name: String,
    stop: StopFlag,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl Worker {
    /// Spawn `body` on a dedicated thread named `name`.
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let stop = StopFlag::new();
        let flag = stop.clone();
        // the sender is dropped when the thread exits, panicking or not
        let (done_tx, done_rx) = bounded::<()>(0);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _done = done_tx;
            body(flag);
        })?;
        debug!(worker = name, "started");
        Ok(Self {
            name: name.to_string(),
            stop,
            handle: Some(handle),
            done: done_rx,
        })
    }

    pub fn request_stop(&self) {
        self.stop.request();
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Wait up to `timeout` for the thread to finish.
    ///
    /// Returns `false` if the thread is still running; it is then detached.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                if handle.join().is_err() {
                    warn!(worker = %self.name, "worker panicked");
                }
                debug!(worker = %self.name, "stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, ?timeout, "worker did not stop in time; detaching");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn stops_when_asked() {
        let worker = Worker::spawn("test-loop", |stop| {
            while !stop.is_set() {
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();
        worker.request_stop();
        assert!(worker.join_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn stragglers_are_detached() {
        let worker = Worker::spawn("stuck", |_| thread::sleep(Duration::from_millis(500))).unwrap();
        let start = Instant::now();
        assert!(!worker.join_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn a_panicking_body_still_joins() {
        let worker = Worker::spawn("boom", |_| panic!("boom")).unwrap();
        assert!(worker.join_timeout(Duration::from_secs(2)));
    }
}
