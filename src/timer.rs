use std::time::{Duration, Instant};

use itertools::Itertools;

/// Wall-clock stopwatch used for progress logging and ESS per second.
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Seconds since creation or the last reset.
    pub fn time(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Human readable duration like `"0.25 seconds"` or
    /// `"1 hour, 0 minutes, 3 seconds"`.
    ///
    /// Durations of a minute or more are rounded to whole seconds.
    pub fn format(seconds: f64) -> String {
        fn plural(count: u64, unit: &str) -> String {
            if count == 1 {
                format!("1 {unit}")
            } else {
                format!("{count} {unit}s")
            }
        }

        if seconds < 60. {
            if seconds == 1. {
                return "1 second".to_string();
            }
            return format!("{seconds} seconds");
        }

        const UNITS: [(u64, &str); 4] = [
            (604800, "week"),
            (86400, "day"),
            (3600, "hour"),
            (60, "minute"),
        ];

        let mut rest = seconds.round() as u64;
        let mut parts = Vec::new();
        for (size, unit) in UNITS {
            let count = rest / size;
            if count > 0 || !parts.is_empty() {
                parts.push(plural(count, unit));
            }
            rest -= count * size;
        }
        parts.push(plural(rest, "second"));
        parts.into_iter().join(", ")
    }
}
