//! Progress reporting for long-running loops.
//!
//! Model synthesis and the slower residual tiers can run for hours on large
//! grids, so they report through a [`ProgressSink`]. The default sink logs a
//! line every `increment` steps rather than on every step.

/// Default number of steps between two progress reports.
pub const DEFAULT_PROGRESS_INCREMENT: u64 = 1000;

pub trait ProgressSink {
    fn start(&mut self, label: &str, total: u64);
    fn advance(&mut self, steps: u64);
    fn finish(&mut self);
}

/// Discards all progress updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn start(&mut self, _label: &str, _total: u64) {}
    fn advance(&mut self, _steps: u64) {}
    fn finish(&mut self) {}
}

/// Logs `label: done/total (pct%)` whenever another `increment` steps have passed.
#[derive(Debug, Clone)]
pub struct LogProgress {
    increment: u64,
    label: String,
    total: u64,
    done: u64,
    next_report: u64,
}

impl LogProgress {
    pub fn new(increment: u64) -> Self {
        Self {
            increment: increment.max(1),
            label: String::new(),
            total: 0,
            done: 0,
            next_report: 0,
        }
    }

    pub fn done(&self) -> u64 {
        self.done
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INCREMENT)
    }
}

impl ProgressSink for LogProgress {
    fn start(&mut self, label: &str, total: u64) {
        self.label = label.to_string();
        self.total = total;
        self.done = 0;
        self.next_report = self.increment;
        log::info!("{label}: 0/{total}");
    }

    fn advance(&mut self, steps: u64) {
        self.done = self.done.saturating_add(steps);
        if self.done >= self.next_report {
            let pct = if self.total > 0 {
                100.0 * self.done as f64 / self.total as f64
            } else {
                100.0
            };
            log::info!("{}: {}/{} ({pct:.1}%)", self.label, self.done, self.total);
            while self.next_report <= self.done {
                self.next_report = self.next_report.saturating_add(self.increment);
            }
        }
    }

    fn finish(&mut self) {
        log::info!("{}: done ({} steps)", self.label, self.done);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::ProgressSink;

    /// Records every call, for asserting on progress behaviour in tests.
    #[derive(Debug, Default)]
    pub struct RecordingProgress {
        pub started: Vec<(String, u64)>,
        pub advanced: u64,
        pub calls: usize,
        pub finished: usize,
    }

    impl ProgressSink for RecordingProgress {
        fn start(&mut self, label: &str, total: u64) {
            self.started.push((label.to_string(), total));
        }

        fn advance(&mut self, steps: u64) {
            self.advanced += steps;
            self.calls += 1;
        }

        fn finish(&mut self) {
            self.finished += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_progress_counts_steps() {
        let mut p = LogProgress::new(10);
        p.start("test", 25);
        for _ in 0..25 {
            p.advance(1);
        }
        p.finish();
        assert_eq!(p.done(), 25);
    }

    #[test]
    fn zero_increment_is_clamped() {
        let mut p = LogProgress::new(0);
        p.start("test", 3);
        p.advance(3);
        assert_eq!(p.done(), 3);
    }
}
