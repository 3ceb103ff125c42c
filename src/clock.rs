use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Source of settle delays for the sweep
pub trait Clock: Send {
    /// Block until `duration` has passed
    fn settle(&self, duration: Duration);
}

/// Wall-clock delays for real instruments
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn settle(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Returns immediately and remembers every requested delay.
///
/// Used with mock instruments so runs finish instantly.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<Duration> {
        self.requested.lock().clone()
    }

    /// Sum of all requested delays
    pub fn total(&self) -> Duration {
        self.requested.lock().iter().sum()
    }
}

impl Clock for ManualClock {
    fn settle(&self, duration: Duration) {
        self.requested.lock().push(duration);
    }
}
