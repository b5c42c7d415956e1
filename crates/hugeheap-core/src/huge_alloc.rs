//! Hugepage-aligned address-space reservation.
//!
//! `HugeAllocator` owns every byte the heap ever gets from the virtual
//! memory provider. It grows by whole hugepages, keeps returned ranges in
//! an address-ordered, coalesced free map, and serves requests best-fit.
//! Everything in the free map is unbacked: callers that pull from here must
//! back the range before use.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::pages::{HugeLength, HugePage, HugeRange, HUGE_PAGE_SHIFT, HUGE_PAGE_SIZE};
use crate::stats::{BackingStats, LargeSpanStats, SmallSpanStats};
use crate::vm::{MemoryTag, VirtualMemory};

pub struct HugeAllocator {
    vm: Arc<dyn VirtualMemory>,
    tag: MemoryTag,
    /// Free ranges, keyed by start, coalesced with neighbors on insert.
    free: BTreeMap<HugePage, HugeLength>,
    free_total: HugeLength,
    /// Total hugepages ever reserved from the provider.
    system: HugeLength,
}

impl HugeAllocator {
    #[must_use]
    pub fn new(vm: Arc<dyn VirtualMemory>, tag: MemoryTag) -> Self {
        Self {
            vm,
            tag,
            free: BTreeMap::new(),
            free_total: HugeLength::zero(),
            system: HugeLength::zero(),
        }
    }

    /// Reserve `n` contiguous hugepages. Returns `None` when the free map
    /// cannot satisfy the request and the provider refuses to grow.
    pub fn get(&mut self, n: HugeLength) -> Option<HugeRange> {
        assert!(n > HugeLength::zero(), "empty reservation");
        if let Some(r) = self.take_best_fit(n) {
            return Some(r);
        }
        self.grow(n)
    }

    /// Return `r` to the free map.
    pub fn release(&mut self, r: HugeRange) {
        assert!(r.len > HugeLength::zero(), "empty release");
        self.free_total += r.len;

        let mut start = r.start;
        let mut len = r.len;

        // Merge with the predecessor if adjacent.
        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            let prev = HugeRange::new(prev_start, prev_len);
            assert!(prev.end() <= start, "overlapping free ranges");
            if prev.end() == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        // Merge with the successor if adjacent.
        if let Some((&next_start, &next_len)) = self.free.range(r.start..).next() {
            assert!(r.end() <= next_start, "overlapping free ranges");
            if r.end() == next_start {
                self.free.remove(&next_start);
                len += next_len;
            }
        }

        self.free.insert(start, len);
    }

    /// Total hugepages reserved from the provider.
    #[must_use]
    pub fn system(&self) -> HugeLength {
        self.system
    }

    /// Hugepages sitting in the free map.
    #[must_use]
    pub fn size(&self) -> HugeLength {
        self.free_total
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.system.in_bytes(),
            free_bytes: 0,
            unmapped_bytes: self.free_total.in_bytes(),
        }
    }

    pub fn add_span_stats(&self, small: Option<&mut SmallSpanStats>, large: Option<&mut LargeSpanStats>) {
        let _ = small; // free ranges here are never sub-hugepage
        if let Some(large) = large {
            for (_, &len) in &self.free {
                large.record(len.in_pages(), true);
            }
        }
    }

    fn take_best_fit(&mut self, n: HugeLength) -> Option<HugeRange> {
        let (&start, &len) = self
            .free
            .iter()
            .filter(|(_, &len)| len >= n)
            .min_by_key(|(&start, &len)| (len, start))?;
        self.free.remove(&start);
        self.free_total -= n;
        if len > n {
            self.free.insert(start + n, len - n);
        }
        Some(HugeRange::new(start, n))
    }

    fn grow(&mut self, n: HugeLength) -> Option<HugeRange> {
        let range = self
            .vm
            .alloc(n.in_bytes(), HUGE_PAGE_SIZE, self.tag)
            .ok()?;
        assert_eq!(range.addr % HUGE_PAGE_SIZE, 0, "provider broke alignment");
        assert!(range.bytes >= n.in_bytes(), "provider returned short range");
        let start = HugePage(range.addr >> HUGE_PAGE_SHIFT);
        let got = HugeLength(range.bytes >> HUGE_PAGE_SHIFT);
        self.system += got;
        if got > n {
            self.free_total += got - n;
            self.free.insert(start + n, got - n);
        }
        Some(HugeRange::new(start, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::SimVirtualMemory;

    fn alloc() -> (Arc<SimVirtualMemory>, HugeAllocator) {
        let vm = Arc::new(SimVirtualMemory::new());
        let a = HugeAllocator::new(vm.clone(), MemoryTag::Normal);
        (vm, a)
    }

    #[test]
    fn grows_by_exactly_the_request() {
        let (vm, mut a) = alloc();
        let r = a.get(HugeLength(1)).expect("reserve");
        assert_eq!(r.len, HugeLength(1));
        assert_eq!(a.system(), HugeLength(1));
        assert_eq!(vm.reserved_bytes(), HUGE_PAGE_SIZE);
        assert_eq!(a.size(), HugeLength::zero());
    }

    #[test]
    fn released_ranges_are_reused_before_growing() {
        let (vm, mut a) = alloc();
        let r = a.get(HugeLength(2)).expect("reserve");
        a.release(r);
        let again = a.get(HugeLength(2)).expect("reuse");
        assert_eq!(again, r);
        assert_eq!(vm.alloc_calls(), 1);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_range() {
        let (_, mut a) = alloc();
        let big = a.get(HugeLength(8)).expect("reserve");
        let small = a.get(HugeLength(3)).expect("reserve");
        a.release(big);
        a.release(small);
        // A 2-hugepage request should carve the 3-range, not the 8-range.
        let got = a.get(HugeLength(2)).expect("fit");
        assert_eq!(got.start, small.start);
    }

    #[test]
    fn adjacent_releases_coalesce() {
        let (vm, mut a) = alloc();
        let r = a.get(HugeLength(4)).expect("reserve");
        let left = HugeRange::new(r.start, HugeLength(2));
        let right = HugeRange::new(r.start + HugeLength(2), HugeLength(2));
        a.release(left);
        a.release(right);
        let whole = a.get(HugeLength(4)).expect("coalesced");
        assert_eq!(whole, r);
        assert_eq!(vm.alloc_calls(), 1);
    }

    #[test]
    fn stats_count_free_ranges_as_unmapped() {
        let (_, mut a) = alloc();
        let r = a.get(HugeLength(2)).expect("reserve");
        a.release(r);
        let s = a.stats();
        assert_eq!(s.system_bytes, 2 * HUGE_PAGE_SIZE);
        assert_eq!(s.unmapped_bytes, 2 * HUGE_PAGE_SIZE);
        assert_eq!(s.free_bytes, 0);

        let mut large = LargeSpanStats::default();
        a.add_span_stats(None, Some(&mut large));
        assert_eq!(large.spans, 1);
        assert_eq!(large.returned_pages, HugeLength(2).in_pages());
    }
}
