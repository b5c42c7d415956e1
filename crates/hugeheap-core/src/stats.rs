//! Heap statistics.
//!
//! `BackingStats` is the per-component used/free/unmapped triple; the
//! policy engine sums component stats and then overwrites `system_bytes`
//! with the raw allocator's figure, since every byte passes through more
//! than one component. `AllocInfo` is the policy engine's own running
//! account of demand: live small pages, live donation slack, and the
//! release log.

use std::ops::{Add, AddAssign};

use serde::Serialize;

use crate::pages::{Length, PAGES_PER_HUGEPAGE};

/// Used/free/unmapped byte counts for one component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackingStats {
    /// Address space managed by the component.
    pub system_bytes: usize,
    /// Bytes backed but not handed out.
    pub free_bytes: usize,
    /// Bytes whose backing has been returned to the OS.
    pub unmapped_bytes: usize,
}

impl BackingStats {
    /// Bytes currently in use by callers.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.system_bytes - self.free_bytes - self.unmapped_bytes
    }
}

impl Add for BackingStats {
    type Output = BackingStats;
    fn add(self, rhs: BackingStats) -> BackingStats {
        BackingStats {
            system_bytes: self.system_bytes + rhs.system_bytes,
            free_bytes: self.free_bytes + rhs.free_bytes,
            unmapped_bytes: self.unmapped_bytes + rhs.unmapped_bytes,
        }
    }
}

impl AddAssign for BackingStats {
    fn add_assign(&mut self, rhs: BackingStats) {
        *self = *self + rhs;
    }
}

/// Free spans shorter than a hugepage, bucketed by exact length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmallSpanStats {
    /// Backed free spans; index = length in pages.
    pub normal: Vec<usize>,
    /// Unbacked free spans; index = length in pages.
    pub returned: Vec<usize>,
}

impl SmallSpanStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            normal: vec![0; PAGES_PER_HUGEPAGE],
            returned: vec![0; PAGES_PER_HUGEPAGE],
        }
    }

    /// Record a free span of `len` pages; lengths at or above a hugepage
    /// belong in [`LargeSpanStats`] and are ignored here.
    pub fn record(&mut self, len: Length, released: bool) {
        if len.raw() == 0 || len.raw() >= PAGES_PER_HUGEPAGE {
            return;
        }
        if released {
            self.returned[len.raw()] += 1;
        } else {
            self.normal[len.raw()] += 1;
        }
    }
}

impl Default for SmallSpanStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Free spans at least a hugepage long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LargeSpanStats {
    pub spans: usize,
    /// Backed free pages in such spans.
    pub normal_pages: Length,
    /// Unbacked free pages in such spans.
    pub returned_pages: Length,
}

impl LargeSpanStats {
    pub fn record(&mut self, len: Length, released: bool) {
        if len.raw() < PAGES_PER_HUGEPAGE {
            return;
        }
        self.spans += 1;
        if released {
            self.returned_pages += len;
        } else {
            self.normal_pages += len;
        }
    }
}

/// The policy engine's demand account.
///
/// `slack` approximates the hugepage slack of live over-half-hugepage
/// allocations; `small` is the live page count of at-most-half-hugepage
/// allocations. The slack heuristic in the large-allocation path compares
/// the two.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocInfo {
    small_pages: Length,
    slack: Length,
    small_allocs: u64,
    large_allocs: u64,
    release_calls: u64,
    released_requested: Length,
    released_actual: Length,
}

impl AllocInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slack_of(n: Length) -> Length {
        let rounded = n.raw().next_multiple_of(PAGES_PER_HUGEPAGE);
        Length(rounded - n.raw())
    }

    pub fn record_alloc(&mut self, n: Length) {
        if n.raw() <= PAGES_PER_HUGEPAGE / 2 {
            self.small_pages += n;
            self.small_allocs += 1;
        } else {
            self.slack += Self::slack_of(n);
            self.large_allocs += 1;
        }
    }

    pub fn record_free(&mut self, n: Length) {
        if n.raw() <= PAGES_PER_HUGEPAGE / 2 {
            self.small_pages -= n;
        } else {
            self.slack -= Self::slack_of(n);
        }
    }

    pub fn record_release(&mut self, requested: Length, actual: Length) {
        self.release_calls += 1;
        self.released_requested += requested;
        self.released_actual += actual;
    }

    /// Live hugepage slack of over-half-hugepage allocations.
    #[must_use]
    pub fn slack(&self) -> Length {
        self.slack
    }

    /// Live pages of at-most-half-hugepage allocations.
    #[must_use]
    pub fn small(&self) -> Length {
        self.small_pages
    }

    #[must_use]
    pub fn small_allocs(&self) -> u64 {
        self.small_allocs
    }

    #[must_use]
    pub fn large_allocs(&self) -> u64 {
        self.large_allocs
    }

    #[must_use]
    pub fn release_calls(&self) -> u64 {
        self.release_calls
    }

    #[must_use]
    pub fn released_requested(&self) -> Length {
        self.released_requested
    }

    #[must_use]
    pub fn released_actual(&self) -> Length {
        self.released_actual
    }
}

/// Megabyte rendering used by the human-readable printer.
#[must_use]
pub fn bytes_to_mib(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_stats_sum() {
        let a = BackingStats {
            system_bytes: 100,
            free_bytes: 10,
            unmapped_bytes: 5,
        };
        let b = BackingStats {
            system_bytes: 50,
            free_bytes: 20,
            unmapped_bytes: 0,
        };
        let sum = a + b;
        assert_eq!(sum.system_bytes, 150);
        assert_eq!(sum.free_bytes, 30);
        assert_eq!(sum.unmapped_bytes, 5);
        assert_eq!(sum.used_bytes(), 115);
    }

    #[test]
    fn small_span_stats_ignore_hugepage_sized_spans() {
        let mut s = SmallSpanStats::new();
        s.record(Length(3), false);
        s.record(Length(3), true);
        s.record(Length(PAGES_PER_HUGEPAGE), false);
        assert_eq!(s.normal[3], 1);
        assert_eq!(s.returned[3], 1);
        assert_eq!(s.normal.iter().sum::<usize>(), 1);
    }

    #[test]
    fn large_span_stats_accumulate_pages() {
        let mut l = LargeSpanStats::default();
        l.record(Length(PAGES_PER_HUGEPAGE), false);
        l.record(Length(2 * PAGES_PER_HUGEPAGE), true);
        l.record(Length(4), false); // too small, ignored
        assert_eq!(l.spans, 2);
        assert_eq!(l.normal_pages, Length(PAGES_PER_HUGEPAGE));
        assert_eq!(l.returned_pages, Length(2 * PAGES_PER_HUGEPAGE));
    }

    #[test]
    fn alloc_info_tracks_small_and_slack() {
        let mut info = AllocInfo::new();
        info.record_alloc(Length(10));
        assert_eq!(info.small(), Length(10));
        assert_eq!(info.slack(), Length(0));

        // 513 pages round to 1024; slack 511.
        info.record_alloc(Length(513));
        assert_eq!(info.slack(), Length(511));

        // Exact multiples contribute no slack.
        info.record_alloc(Length(1024));
        assert_eq!(info.slack(), Length(511));

        info.record_free(Length(513));
        assert_eq!(info.slack(), Length(0));
        info.record_free(Length(10));
        assert_eq!(info.small(), Length(0));
    }

    #[test]
    fn release_log_accumulates() {
        let mut info = AllocInfo::new();
        info.record_release(Length(100), Length(40));
        info.record_release(Length(10), Length(10));
        assert_eq!(info.release_calls(), 2);
        assert_eq!(info.released_requested(), Length(110));
        assert_eq!(info.released_actual(), Length(50));
    }
}
