//! Wake/stop signalling for the frame worker thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Condition-variable backed signal shared between the manager, the
/// render-side producer and the worker thread.
///
/// The worker blocks in [`WorkerSignal::wait`] until either work is
/// announced (a successful enqueue) or a stop is requested. Stop is sticky
/// until [`WorkerSignal::reset`], which is called between capture sessions.
#[derive(Debug, Clone)]
pub struct WorkerSignal {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<bool>,
    condvar: Condvar,
    stopping: AtomicBool,
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(false),
                condvar: Condvar::new(),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Announce that the queue has work; wakes the worker if it is waiting.
    pub fn notify_work(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        *pending = true;
        self.shared.condvar.notify_one();
    }

    /// Ask the worker to finish up and exit. Wakes any waiter.
    pub fn request_stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        let _pending = self.shared.pending.lock().unwrap();
        self.shared.condvar.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Block until work is announced or stop is requested, consuming the
    /// pending-work flag.
    pub fn wait(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        while !*pending && !self.stop_requested() {
            pending = self.shared.condvar.wait(pending).unwrap();
        }
        *pending = false;
    }

    /// Clear both flags so the signal can serve a new session.
    pub fn reset(&self) {
        let mut pending = self.shared.pending.lock().unwrap();
        *pending = false;
        self.shared.stopping.store(false, Ordering::Release);
    }
}

impl Default for WorkerSignal {
    fn default() -> Self {
        Self::new()
    }
}
