//! Interaction back-off and per-category I/O throttling.
//!
//! Both use monotonic clocks only; wall-clock time never reaches the
//! scheduler.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Records external interaction events (scroll, hover, click) and decides
/// when background work should yield to them. Once the event rate within
/// the trailing window reaches the threshold, the monitor reports
/// backing-off until `duration` has elapsed past the trigger and the rate
/// has fallen below the threshold again.
pub struct InteractionMonitor {
    threshold: usize,
    window: Duration,
    duration: Duration,
    inner: Mutex<MonitorInner>,
}

#[derive(Default)]
struct MonitorInner {
    events: VecDeque<Instant>,
    backing_off_since: Option<Instant>,
}

impl InteractionMonitor {
    pub fn new(threshold: u32, window_seconds: f64, duration_seconds: f64) -> Self {
        Self {
            threshold: threshold.max(1) as usize,
            window: Duration::from_secs_f64(window_seconds),
            duration: Duration::from_secs_f64(duration_seconds),
            inner: Mutex::new(MonitorInner::default()),
        }
    }

    pub fn record_interaction(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let window = self.window;
        inner.events.push_back(now);
        while let Some(&front) = inner.events.front() {
            if now.duration_since(front) > window {
                inner.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn should_back_off(&self) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let window = self.window;
        while let Some(&front) = inner.events.front() {
            if now.duration_since(front) > window {
                inner.events.pop_front();
            } else {
                break;
            }
        }

        if let Some(since) = inner.backing_off_since {
            if now.duration_since(since) < self.duration {
                return true;
            }
            inner.backing_off_since = None;
        }

        if inner.events.len() >= self.threshold {
            inner.backing_off_since = Some(now);
            return true;
        }
        false
    }

    pub fn back_off_sleep(&self) -> Duration {
        self.duration
    }
}

/// Enforces a minimum interval between task starts within one I/O
/// category. A rate of zero disables throttling entirely.
pub struct ThrottleController {
    min_interval: Option<Duration>,
    last_start: Mutex<HashMap<String, Instant>>,
}

impl ThrottleController {
    pub fn new(ops_per_sec: f64) -> Self {
        let min_interval = if ops_per_sec > 0.0 {
            Some(Duration::from_secs_f64(1.0 / ops_per_sec))
        } else {
            None
        };
        Self {
            min_interval,
            last_start: Mutex::new(HashMap::new()),
        }
    }

    /// How long the caller must still sleep before starting a task in this
    /// category, given the category's last start time.
    pub fn required_delay(&self, category: &str) -> Option<Duration> {
        let min_interval = self.min_interval?;
        let last_start = self.last_start.lock().unwrap();
        let last = last_start.get(category)?;
        let elapsed = last.elapsed();
        if elapsed < min_interval {
            Some(min_interval - elapsed)
        } else {
            None
        }
    }

    pub fn record_start(&self, category: &str) {
        if self.min_interval.is_some() {
            self.last_start
                .lock()
                .unwrap()
                .insert(category.to_string(), Instant::now());
        }
    }
}
