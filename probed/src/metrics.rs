use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Process-wide counters for the probe engine (spec.md §8).
///
/// Updated from reader hot paths, so every field is atomic — mirrors the
/// teacher's all-atomic `Metrics` struct rather than a mutex-guarded one.
pub struct Metrics {
    pub start_time: SystemTime,
    events_total: AtomicU64,
    rate_limited_events: AtomicU64,
    merge_pushed_total: AtomicU64,
    merge_ok_total: AtomicU64,
    merge_error_evicted_partial: AtomicU64,
    merge_error_orphaned_arrival: AtomicU64,
    merge_error_same_direction: AtomicU64,
    stack_lookup_failures_kernel: AtomicU64,
    stack_lookup_failures_user: AtomicU64,
    funcid_miss_total: AtomicU64,
    dns_lookup_errors: AtomicU64,
    get_url_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            events_total: AtomicU64::new(0),
            rate_limited_events: AtomicU64::new(0),
            merge_pushed_total: AtomicU64::new(0),
            merge_ok_total: AtomicU64::new(0),
            merge_error_evicted_partial: AtomicU64::new(0),
            merge_error_orphaned_arrival: AtomicU64::new(0),
            merge_error_same_direction: AtomicU64::new(0),
            stack_lookup_failures_kernel: AtomicU64::new(0),
            stack_lookup_failures_user: AtomicU64::new(0),
            funcid_miss_total: AtomicU64::new(0),
            dns_lookup_errors: AtomicU64::new(0),
            get_url_errors: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn inc_events_total(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_total(&self) -> u64 {
        self.events_total.load(Ordering::Relaxed)
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited_events(&self) -> u64 {
        self.rate_limited_events.load(Ordering::Relaxed)
    }

    pub fn inc_merge_pushed(&self) {
        self.merge_pushed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn merge_pushed_total(&self) -> u64 {
        self.merge_pushed_total.load(Ordering::Relaxed)
    }

    pub fn inc_merge_ok(&self) {
        self.merge_ok_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn merge_ok_total(&self) -> u64 {
        self.merge_ok_total.load(Ordering::Relaxed)
    }

    /// Records the outcome of [`crate::pending::MergeOutcome::Error`]
    /// (spec.md §8 invariant #3 / E6): either the two sides disagreed
    /// (both-enter or both-return), a stored partial was evicted before
    /// its counterpart showed up, or an arrival found nothing because its
    /// counterpart had already been evicted.
    pub fn record_merge_error(&self, err: &crate::pending::MergeError) {
        use crate::pending::MergeError;
        match err {
            MergeError::SameDirection { .. } => {
                self.merge_error_same_direction.fetch_add(1, Ordering::Relaxed);
            }
            MergeError::Evicted { prev: Some(_), .. } => {
                self.merge_error_evicted_partial.fetch_add(1, Ordering::Relaxed);
            }
            MergeError::Evicted { .. } => {
                self.merge_error_orphaned_arrival.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn merge_error_total(&self) -> u64 {
        self.merge_error_evicted_partial.load(Ordering::Relaxed)
            + self.merge_error_orphaned_arrival.load(Ordering::Relaxed)
            + self.merge_error_same_direction.load(Ordering::Relaxed)
    }

    pub fn inc_stack_lookup_failure(&self, kernel_side: bool) {
        if kernel_side {
            self.stack_lookup_failures_kernel.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stack_lookup_failures_user.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stack_lookup_failures_kernel(&self) -> u64 {
        self.stack_lookup_failures_kernel.load(Ordering::Relaxed)
    }

    pub fn stack_lookup_failures_user(&self) -> u64 {
        self.stack_lookup_failures_user.load(Ordering::Relaxed)
    }

    pub fn inc_funcid_miss(&self) {
        self.funcid_miss_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn funcid_miss_total(&self) -> u64 {
        self.funcid_miss_total.load(Ordering::Relaxed)
    }

    pub fn inc_dns_lookup_error(&self) {
        self.dns_lookup_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dns_lookup_errors(&self) -> u64 {
        self.dns_lookup_errors.load(Ordering::Relaxed)
    }

    pub fn inc_get_url_error(&self) {
        self.get_url_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_url_errors(&self) -> u64 {
        self.get_url_errors.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{Direction, MergeError};

    #[test]
    fn merge_error_split_by_side() {
        let m = Metrics::new();
        m.record_merge_error(&MergeError::Evicted {
            prev: Some(Direction::Enter),
            curr: None,
        });
        m.record_merge_error(&MergeError::Evicted {
            prev: None,
            curr: Some(Direction::Return),
        });
        m.record_merge_error(&MergeError::SameDirection {
            prev: Direction::Enter,
            curr: Direction::Enter,
        });
        assert_eq!(m.merge_error_total(), 3);
    }

    #[test]
    fn stack_lookup_failures_are_tracked_per_side() {
        let m = Metrics::new();
        m.inc_stack_lookup_failure(true);
        m.inc_stack_lookup_failure(false);
        m.inc_stack_lookup_failure(false);
        assert_eq!(m.stack_lookup_failures_kernel(), 1);
        assert_eq!(m.stack_lookup_failures_user(), 2);
    }
}
