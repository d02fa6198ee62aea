use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// File count above which a sync run warns about throughput.
pub const MASSIVE_FILE_THRESHOLD: u64 = 300_000;
const MASSIVE_WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Snapshot of the sync counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressStats {
    /// Files seen so far.
    pub total: u64,
    /// Files skipped or copied.
    pub finished: u64,
    pub copied: u64,
    /// Set on the single report issued after all workers have drained.
    pub last: bool,
}

pub type ProgressCallback<'a> = Box<dyn Fn(ProgressStats) + Send + Sync + 'a>;

/// Shared counters of one sync run.
pub(crate) struct Progress<'a> {
    total: AtomicU64,
    finished: AtomicU64,
    copied: AtomicU64,
    callback: Option<&'a ProgressCallback<'a>>,
    last_massive_warn: Mutex<Option<Instant>>,
}

impl<'a> Progress<'a> {
    pub(crate) fn new(callback: Option<&'a ProgressCallback<'a>>) -> Self {
        Self {
            total: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            copied: AtomicU64::new(0),
            callback,
            last_massive_warn: Mutex::new(None),
        }
    }

    pub(crate) fn file_seen(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.report(false);
    }

    pub(crate) fn file_skipped(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.report(false);
    }

    pub(crate) fn file_copied(&self) {
        self.copied.fetch_add(1, Ordering::Relaxed);
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.report(false);
    }

    pub(crate) fn snapshot(&self, last: bool) -> ProgressStats {
        ProgressStats {
            total: self.total.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            copied: self.copied.load(Ordering::Relaxed),
            last,
        }
    }

    pub(crate) fn report(&self, last: bool) {
        let stats = self.snapshot(last);
        if stats.total >= MASSIVE_FILE_THRESHOLD {
            let mut guard = self
                .last_massive_warn
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.map_or(true, |t| t.elapsed() >= MASSIVE_WARN_INTERVAL) {
                *guard = Some(Instant::now());
                warn!(
                    finished = stats.finished,
                    total = stats.total,
                    "decreased performance due to massive files"
                );
            }
        }
        if let Some(callback) = self.callback {
            callback(stats);
        }
    }
}

/// Rate-limited progress reporting through `tracing`.
#[derive(Debug)]
pub struct ProgressLogger {
    interval: Duration,
    /// Report intermediate progress, not only the final summary.
    enabled: bool,
    last: Mutex<Option<Instant>>,
}

impl ProgressLogger {
    pub fn new(interval: Duration, enabled: bool) -> Self {
        Self {
            interval,
            enabled,
            last: Mutex::new(None),
        }
    }

    /// Whether `stats` passes the rate limit; updates the last report time.
    pub fn should_log(&self, stats: &ProgressStats) -> bool {
        if !self.enabled && !stats.last {
            return false;
        }
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if !stats.last && last.is_some_and(|t| now.duration_since(t) < self.interval) {
            return false;
        }
        *last = Some(now);
        true
    }

    pub fn log(&self, stats: ProgressStats) {
        if !self.should_log(&stats) {
            return;
        }
        let percent = if stats.total > 0 {
            stats.finished as f64 / stats.total as f64 * 100.0
        } else {
            0.0
        };
        info!(
            "copy {percent:.2}% total:{:>4}, finished:{:>4}, changed:{:>4}",
            stats.total, stats.finished, stats.copied
        );
        if stats.last {
            info!("copy finished");
        }
    }

    pub fn into_callback<'a>(self) -> ProgressCallback<'a> {
        Box::new(move |stats| self.log(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn logger_rate_limits_intermediate_reports() {
        let logger = ProgressLogger::new(Duration::from_secs(3600), true);
        let stats = ProgressStats::default();
        assert!(logger.should_log(&stats));
        assert!(!logger.should_log(&stats));

        let last = ProgressStats {
            last: true,
            ..stats
        };
        assert!(logger.should_log(&last));
    }

    #[test]
    fn disabled_logger_reports_only_last() {
        let logger = ProgressLogger::new(Duration::ZERO, false);
        assert!(!logger.should_log(&ProgressStats::default()));
        assert!(logger.should_log(&ProgressStats {
            last: true,
            ..Default::default()
        }));
    }

    #[test]
    fn counters_feed_callback() {
        let calls = AtomicUsize::new(0);
        let callback: ProgressCallback<'_> = Box::new(|_| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        let progress = Progress::new(Some(&callback));
        progress.file_seen();
        progress.file_seen();
        progress.file_copied();
        progress.file_skipped();

        let stats = progress.snapshot(true);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.finished, 2);
        assert_eq!(stats.copied, 1);
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }
}
