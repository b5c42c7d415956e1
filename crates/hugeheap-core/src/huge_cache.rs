//! Cache of free, backed hugepage ranges.
//!
//! The cache interposes on [`HugeAllocator`]: allocations prefer a cached
//! (still-backed) range and only fall through to raw address space on a
//! miss, in which case the caller is told the result needs backing. Free
//! ranges beyond the cache limit are eagerly unbacked and pushed down to
//! the huge allocator. The limit follows the demand swing observed over a
//! short window, so a phase that churns hugepages keeps them backed while
//! a quiet heap gives them up.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::huge_alloc::HugeAllocator;
use crate::pages::{HugeLength, HugePage, HugeRange};
use crate::stats::{BackingStats, LargeSpanStats, SmallSpanStats};
use crate::vm::{Clock, VirtualMemory};

/// Hugepages the cache will retain even with no observed demand swing.
const MIN_CACHE_LIMIT: HugeLength = HugeLength(10);

/// How far back demand samples count toward the limit.
const DEMAND_WINDOW: Duration = Duration::from_secs(2);

pub struct HugeCache {
    alloc: HugeAllocator,
    vm: Arc<dyn VirtualMemory>,
    clock: Arc<dyn Clock>,
    /// Backed free ranges, keyed by start, coalesced.
    cache: BTreeMap<HugePage, HugeLength>,
    size: HugeLength,
    /// Hugepages currently handed out through `get`.
    usage: HugeLength,
    /// Recent `(when, usage)` samples driving the limit.
    samples: VecDeque<(Duration, HugeLength)>,
    hits: u64,
    misses: u64,
}

impl HugeCache {
    #[must_use]
    pub fn new(alloc: HugeAllocator, vm: Arc<dyn VirtualMemory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            alloc,
            vm,
            clock,
            cache: BTreeMap::new(),
            size: HugeLength::zero(),
            usage: HugeLength::zero(),
            samples: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Reserve `n` contiguous hugepages. `from_released` reports whether the
    /// range needs backing before use.
    pub fn get(&mut self, n: HugeLength, from_released: &mut bool) -> Option<HugeRange> {
        if let Some(r) = self.take_best_fit(n) {
            *from_released = false;
            self.hits += 1;
            self.usage += n;
            self.sample();
            return Some(r);
        }
        let r = self.alloc.get(n)?;
        *from_released = true;
        self.misses += 1;
        self.usage += n;
        self.sample();
        Some(r)
    }

    /// Return a backed range. Overflow beyond the cache limit is unbacked
    /// and handed down to the huge allocator.
    pub fn release(&mut self, r: HugeRange) {
        self.usage -= r.len;
        self.insert_coalesced(r);
        self.size += r.len;
        self.sample();
        let limit = self.limit();
        if self.size > limit {
            let excess = self.size - limit;
            self.unback_from_top(excess);
        }
    }

    /// Return a range whose pages are already unbacked; it bypasses the
    /// cache entirely.
    pub fn release_unbacked(&mut self, r: HugeRange) {
        self.usage -= r.len;
        self.alloc.release(r);
    }

    /// Proactively unback up to `n` cached hugepages. Returns the amount
    /// actually released.
    pub fn release_cached_pages(&mut self, n: HugeLength) -> HugeLength {
        let take = if n < self.size { n } else { self.size };
        if take > HugeLength::zero() {
            self.unback_from_top(take);
        }
        take
    }

    /// The current retention limit.
    #[must_use]
    pub fn limit(&self) -> HugeLength {
        let mut max = self.usage;
        let mut min = self.usage;
        for &(_, u) in &self.samples {
            max = max.max(u);
            min = min.min(u);
        }
        (max - min).max(MIN_CACHE_LIMIT)
    }

    /// Backed hugepages currently cached.
    #[must_use]
    pub fn size(&self) -> HugeLength {
        self.size
    }

    /// Hugepages handed out and not yet returned.
    #[must_use]
    pub fn usage(&self) -> HugeLength {
        self.usage
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// The underlying address-space allocator.
    #[must_use]
    pub fn allocator(&self) -> &HugeAllocator {
        &self.alloc
    }

    #[must_use]
    pub fn allocator_mut(&mut self) -> &mut HugeAllocator {
        &mut self.alloc
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: (self.usage + self.size).in_bytes(),
            free_bytes: self.size.in_bytes(),
            unmapped_bytes: 0,
        }
    }

    pub fn add_span_stats(&self, small: Option<&mut SmallSpanStats>, large: Option<&mut LargeSpanStats>) {
        let _ = small; // cached ranges are whole hugepages
        if let Some(large) = large {
            for (_, &len) in &self.cache {
                large.record(len.in_pages(), false);
            }
        }
    }

    fn sample(&mut self) {
        let now = self.clock.now();
        self.samples.push_back((now, self.usage));
        let horizon = now.saturating_sub(DEMAND_WINDOW);
        while let Some(&(t, _)) = self.samples.front() {
            if t < horizon {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn take_best_fit(&mut self, n: HugeLength) -> Option<HugeRange> {
        let (&start, &len) = self
            .cache
            .iter()
            .filter(|(_, &len)| len >= n)
            .min_by_key(|(&start, &len)| (len, start))?;
        self.cache.remove(&start);
        self.size -= n;
        if len > n {
            self.cache.insert(start + n, len - n);
        }
        Some(HugeRange::new(start, n))
    }

    fn insert_coalesced(&mut self, r: HugeRange) {
        let mut start = r.start;
        let mut len = r.len;

        if let Some((&prev_start, &prev_len)) = self.cache.range(..start).next_back() {
            let prev = HugeRange::new(prev_start, prev_len);
            assert!(prev.end() <= start, "overlapping cached ranges");
            if prev.end() == start {
                self.cache.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some((&next_start, &next_len)) = self.cache.range(r.start..).next() {
            assert!(r.end() <= next_start, "overlapping cached ranges");
            if r.end() == next_start {
                self.cache.remove(&next_start);
                len += next_len;
            }
        }
        self.cache.insert(start, len);
    }

    /// Unback `amount` hugepages, taking from the highest-addressed cached
    /// ranges first, and hand them to the huge allocator.
    fn unback_from_top(&mut self, amount: HugeLength) {
        let mut remaining = amount;
        while remaining > HugeLength::zero() {
            let Some((&start, &len)) = self.cache.iter().next_back() else {
                break;
            };
            self.cache.remove(&start);
            let take = remaining.min(len);
            let keep = len - take;
            if keep > HugeLength::zero() {
                self.cache.insert(start, keep);
            }
            let evicted = HugeRange::new(start + keep, take);
            let ok = self.vm.release(evicted.start.addr(), evicted.len.in_bytes());
            assert!(ok, "provider refused to unback a cached range");
            self.alloc.release(evicted);
            self.size -= take;
            remaining -= take;
        }
    }
}
