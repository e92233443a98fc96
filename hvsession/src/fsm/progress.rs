use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

/// A node in an external progress tree.
///
/// The FSM only ever pushes notifications; it never reads progress values.
pub trait Progress: Send + Sync {
    /// Open a child task under this one.
    fn begin(&self, message: &str) -> Arc<dyn Progress>;
    fn doing(&self, message: &str);
    fn done(&self, message: &str);
    fn fail(&self, message: &str, code: i32);
    /// Reset to zero ahead of a new route.
    fn restart(&self, message: &str);
    /// Number of steps the current route will report.
    fn set_max(&self, max: usize);
}

/// Progress sink that reports through `tracing`.
#[derive(Debug)]
pub struct LogProgress {
    label: String,
    completed: AtomicUsize,
    max: AtomicUsize,
}

impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            completed: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        }
    }
}

impl Progress for LogProgress {
    fn begin(&self, message: &str) -> Arc<dyn Progress> {
        debug!(task = %self.label, %message, "progress: begin");
        Arc::new(LogProgress::new(format!("{}/{}", self.label, message)))
    }

    fn doing(&self, message: &str) {
        debug!(task = %self.label, %message, "progress: doing");
    }

    fn done(&self, message: &str) {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let max = self.max.load(Ordering::Relaxed);
        info!(task = %self.label, %message, step = completed, of = max, "progress: done");
    }

    fn fail(&self, message: &str, code: i32) {
        warn!(task = %self.label, %message, code, "progress: failed");
    }

    fn restart(&self, message: &str) {
        self.completed.store(0, Ordering::Relaxed);
        debug!(task = %self.label, %message, "progress: restart");
    }

    fn set_max(&self, max: usize) {
        self.max.store(max, Ordering::Relaxed);
    }
}
