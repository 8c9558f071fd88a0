#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex, Once},
    time::Duration,
};

use taskline::{Outcome, Task};

static INIT_LOGGING: Once = Once::new();

/// Installs a test-writer subscriber once per test binary. The maximum level
/// is read from `TASKLINE_TEST_LOG` (e.g. `trace`) and defaults to `warn`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let level = std::env::var("TASKLINE_TEST_LOG")
            .ok()
            .and_then(|l| l.parse().ok())
            .unwrap_or(tracing::Level::WARN);
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(level)
            .with_thread_names(true)
            .try_init();
    });
}

/// Shared, thread-safe event log for asserting on ordering.
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn push(&self, event: T) {
        self.events.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }
}

/// Polls `task` until it finishes or `limit` elapses.
pub fn wait_finished<T>(task: &Task<T>, limit: Duration) -> Option<Outcome<T>>
where
    T: Clone + Send + 'static,
{
    let deadline = std::time::Instant::now() + limit;
    while std::time::Instant::now() < deadline {
        if let Some(outcome) = task.try_result() {
            return Some(outcome);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    None
}
