//! Multi-hugepage linear regions.
//!
//! A region is a fixed-size run of hugepages packed with large spans that
//! would otherwise each strand slack on their own hugepages. Free space is
//! an interval map over pages; hugepages inside a region are backed lazily
//! on first use and unbacked again when `release_pages` finds them fully
//! free.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::pages::{
    HugeLength, HugeRange, Length, PageId, PAGES_PER_HUGEPAGE, PAGE_SHIFT,
};
use crate::stats::{BackingStats, LargeSpanStats, SmallSpanStats};
use crate::vm::VirtualMemory;

/// Hugepages per region (1 GiB of 2 MiB hugepages).
pub const HUGE_PAGES_PER_REGION: usize = 512;

/// The region size every region in the set is created with.
#[must_use]
pub fn region_size() -> HugeLength {
    HugeLength(HUGE_PAGES_PER_REGION)
}

/// One linear region.
pub struct HugeRegion {
    range: HugeRange,
    vm: Arc<dyn VirtualMemory>,
    /// Free intervals, keyed by first page, coalesced.
    free: BTreeMap<PageId, Length>,
    used_pages: Length,
    /// Pages in use per hugepage of the region.
    hp_used: Vec<usize>,
    /// Whether each hugepage is currently backed.
    hp_backed: Vec<bool>,
}

impl HugeRegion {
    #[must_use]
    pub fn new(range: HugeRange, vm: Arc<dyn VirtualMemory>) -> Self {
        let hugepages = range.len.raw();
        let mut free = BTreeMap::new();
        free.insert(range.start.first_page(), range.in_pages());
        Self {
            range,
            vm,
            free,
            used_pages: Length::zero(),
            hp_used: vec![0; hugepages],
            hp_backed: vec![false; hugepages],
        }
    }

    #[must_use]
    pub fn range(&self) -> HugeRange {
        self.range
    }

    #[must_use]
    pub fn used_pages(&self) -> Length {
        self.used_pages
    }

    #[must_use]
    pub fn contains(&self, p: PageId) -> bool {
        let first = self.range.start.first_page();
        p >= first && p < first + self.range.in_pages()
    }

    /// Best-fit allocation from the free intervals. `from_released` reports
    /// whether any covered hugepage needed backing.
    pub fn alloc(&mut self, n: Length, from_released: &mut bool) -> Option<PageId> {
        let (&start, &len) = self
            .free
            .iter()
            .filter(|(_, &len)| len >= n)
            .min_by_key(|(&start, &len)| (len, start))?;
        self.free.remove(&start);
        if len > n {
            self.free.insert(start + n, len - n);
        }
        self.used_pages += n;

        let mut needed_backing = false;
        for hp_idx in self.covered_hugepages(start, n) {
            let overlap = self.overlap(start, n, hp_idx);
            self.hp_used[hp_idx] += overlap;
            if !self.hp_backed[hp_idx] {
                needed_backing = true;
                self.hp_backed[hp_idx] = true;
            }
        }
        *from_released = needed_backing;
        Some(start)
    }

    /// Return `[p, p + n)` to the region.
    pub fn put(&mut self, p: PageId, n: Length) {
        assert!(self.contains(p), "page outside region");
        self.insert_coalesced(p, n);
        self.used_pages -= n;
        for hp_idx in self.covered_hugepages(p, n) {
            let overlap = self.overlap(p, n, hp_idx);
            self.hp_used[hp_idx] -= overlap;
        }
    }

    /// Unback every fully-free backed hugepage. Returns pages released.
    pub fn release_free_hugepages(&mut self) -> Length {
        let mut released = Length::zero();
        for hp_idx in 0..self.range.len.raw() {
            if self.hp_backed[hp_idx] && self.hp_used[hp_idx] == 0 {
                let hp = self.range.start + HugeLength(hp_idx);
                let ok = self.vm.release(hp.addr(), PAGES_PER_HUGEPAGE << PAGE_SHIFT);
                assert!(ok, "provider refused to unback a region hugepage");
                self.hp_backed[hp_idx] = false;
                released += Length(PAGES_PER_HUGEPAGE);
            }
        }
        released
    }

    /// Free pages on backed hugepages.
    #[must_use]
    pub fn backed_free_pages(&self) -> Length {
        let mut total = 0;
        for hp_idx in 0..self.range.len.raw() {
            if self.hp_backed[hp_idx] {
                total += PAGES_PER_HUGEPAGE - self.hp_used[hp_idx];
            }
        }
        Length(total)
    }

    /// Free pages on unbacked hugepages.
    #[must_use]
    pub fn unbacked_free_pages(&self) -> Length {
        let mut total = 0;
        for hp_idx in 0..self.range.len.raw() {
            if !self.hp_backed[hp_idx] {
                debug_assert_eq!(self.hp_used[hp_idx], 0);
                total += PAGES_PER_HUGEPAGE;
            }
        }
        Length(total)
    }

    fn covered_hugepages(&self, p: PageId, n: Length) -> std::ops::Range<usize> {
        let first = self.range.start.first_page();
        let lo = (p - first).raw() / PAGES_PER_HUGEPAGE;
        let hi = ((p + n - Length(1)) - first).raw() / PAGES_PER_HUGEPAGE;
        lo..hi + 1
    }

    /// Pages of `[p, p + n)` that fall on hugepage `hp_idx` of the region.
    fn overlap(&self, p: PageId, n: Length, hp_idx: usize) -> usize {
        let first = self.range.start.first_page();
        let hp_lo = hp_idx * PAGES_PER_HUGEPAGE;
        let hp_hi = hp_lo + PAGES_PER_HUGEPAGE;
        let lo = (p - first).raw().max(hp_lo);
        let hi = ((p - first).raw() + n.raw()).min(hp_hi);
        hi - lo
    }

    fn insert_coalesced(&mut self, p: PageId, n: Length) {
        let mut start = p;
        let mut len = n;

        if let Some((&prev_start, &prev_len)) = self.free.range(..start).next_back() {
            assert!(prev_start + prev_len <= start, "overlapping free intervals");
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some((&next_start, &next_len)) = self.free.range(p..).next() {
            assert!(p + n <= next_start, "overlapping free intervals");
            if p + n == next_start {
                self.free.remove(&next_start);
                len += next_len;
            }
        }
        self.free.insert(start, len);
    }

    fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        for (&start, &len) in &self.free {
            // Split each interval into chunks of uniform backing state.
            let mut chunk_start = start;
            let mut chunk_released = {
                let idx = (start - self.range.start.first_page()).raw() / PAGES_PER_HUGEPAGE;
                !self.hp_backed[idx]
            };
            let mut offset = Length::zero();
            while offset < len {
                let p = start + offset;
                let idx = (p - self.range.start.first_page()).raw() / PAGES_PER_HUGEPAGE;
                let released = !self.hp_backed[idx];
                if released != chunk_released {
                    let chunk = p - chunk_start;
                    small.record(chunk, chunk_released);
                    large.record(chunk, chunk_released);
                    chunk_start = p;
                    chunk_released = released;
                }
                let step = PAGES_PER_HUGEPAGE - p.index_in_hugepage();
                offset += Length(step.min((len - offset).raw()));
            }
            let chunk = (start + len) - chunk_start;
            small.record(chunk, chunk_released);
            large.record(chunk, chunk_released);
        }
    }
}

/// The set of regions, plus the policy bit for how eagerly to grow it.
pub struct HugeRegionSet {
    regions: Vec<HugeRegion>,
    use_huge_region_more_often: bool,
}

impl HugeRegionSet {
    #[must_use]
    pub fn new(use_huge_region_more_often: bool) -> Self {
        Self {
            regions: Vec::new(),
            use_huge_region_more_often,
        }
    }

    #[must_use]
    pub fn use_huge_region_more_often(&self) -> bool {
        self.use_huge_region_more_often
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn contribute(&mut self, region: HugeRegion) {
        self.regions.push(region);
    }

    /// Try to place `n` pages in an existing region.
    pub fn maybe_get(&mut self, n: Length, page: &mut PageId, from_released: &mut bool) -> bool {
        for region in &mut self.regions {
            if let Some(p) = region.alloc(n, from_released) {
                *page = p;
                return true;
            }
        }
        false
    }

    /// Take back `[p, p + n)` if it belongs to one of our regions.
    pub fn maybe_put(&mut self, p: PageId, n: Length) -> bool {
        for region in &mut self.regions {
            if region.contains(p) {
                region.put(p, n);
                return true;
            }
        }
        false
    }

    /// Unback fully-free backed hugepages across all regions.
    pub fn release_pages(&mut self) -> Length {
        let mut released = Length::zero();
        for region in &mut self.regions {
            released += region.release_free_hugepages();
        }
        released
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        let mut s = BackingStats::default();
        for region in &self.regions {
            s.system_bytes += region.range.len.in_bytes();
            s.free_bytes += region.backed_free_pages().in_bytes();
            s.unmapped_bytes += region.unbacked_free_pages().in_bytes();
        }
        s
    }

    pub fn add_span_stats(&self, small: Option<&mut SmallSpanStats>, large: Option<&mut LargeSpanStats>) {
        let mut scratch_small = SmallSpanStats::new();
        let mut scratch_large = LargeSpanStats::default();
        for region in &self.regions {
            region.add_span_stats(&mut scratch_small, &mut scratch_large);
        }
        if let Some(s) = small {
            for len in 0..scratch_small.normal.len() {
                s.normal[len] += scratch_small.normal[len];
                s.returned[len] += scratch_small.returned[len];
            }
        }
        if let Some(l) = large {
            l.spans += scratch_large.spans;
            l.normal_pages += scratch_large.normal_pages;
            l.returned_pages += scratch_large.returned_pages;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::HugePage;
    use crate::vm::{MemoryTag, SimVirtualMemory};

    fn region() -> (Arc<SimVirtualMemory>, HugeRegion) {
        let vm = Arc::new(SimVirtualMemory::new());
        // Reserve real address space so unbacking validates.
        let r = vm
            .alloc(region_size().in_bytes(), 1 << 21, MemoryTag::Normal)
            .expect("reserve");
        let start = HugePage(r.addr >> 21);
        let region = HugeRegion::new(
            HugeRange::new(start, region_size()),
            vm.clone(),
        );
        (vm, region)
    }

    #[test]
    fn alloc_reports_backing_needs() {
        let (_, mut r) = region();
        let mut fr = false;
        let p = r.alloc(Length(300), &mut fr).expect("fits");
        assert_eq!(p, r.range().start.first_page());
        assert!(fr, "fresh region hugepage needs backing");

        // The next 100 pages land on the same (now backed) hugepage.
        let p2 = r.alloc(Length(100), &mut fr).expect("fits");
        assert_eq!(p2, p + Length(300));
        assert!(!fr);
        assert_eq!(r.used_pages(), Length(400));
    }

    #[test]
    fn put_coalesces_intervals() {
        let (_, mut r) = region();
        let mut fr = false;
        let a = r.alloc(Length(300), &mut fr).expect("fits");
        let b = r.alloc(Length(300), &mut fr).expect("fits");
        r.put(a, Length(300));
        r.put(b, Length(300));
        // Everything coalesced back: a full-region allocation fits again.
        let whole = r.alloc(region_size().in_pages(), &mut fr).expect("fits");
        assert_eq!(whole, r.range().start.first_page());
    }

    #[test]
    fn release_unbacks_only_fully_free_hugepages() {
        let (vm, mut r) = region();
        let mut fr = false;
        // 600 pages cover hugepages 0 and 1 (partially).
        let p = r.alloc(Length(600), &mut fr).expect("fits");
        r.put(p, Length(600));
        let released = r.release_free_hugepages();
        assert_eq!(released, Length(2 * PAGES_PER_HUGEPAGE));
        assert_eq!(
            vm.released_bytes(),
            (2 * PAGES_PER_HUGEPAGE << PAGE_SHIFT) as u64
        );
        // A second pass finds nothing backed.
        assert_eq!(r.release_free_hugepages(), Length::zero());
    }

    #[test]
    fn set_routes_puts_to_owning_region() {
        let vm = Arc::new(SimVirtualMemory::new());
        let mut set = HugeRegionSet::new(false);
        let res = vm
            .alloc(region_size().in_bytes(), 1 << 21, MemoryTag::Normal)
            .expect("reserve");
        let start = HugePage(res.addr >> 21);
        set.contribute(HugeRegion::new(
            HugeRange::new(start, region_size()),
            vm.clone(),
        ));

        let mut page = PageId(0);
        let mut fr = false;
        assert!(set.maybe_get(Length(400), &mut page, &mut fr));
        assert!(set.maybe_put(page, Length(400)));
        assert!(!set.maybe_put(PageId(3), Length(1)), "foreign page refused");
    }

    #[test]
    fn set_stats_split_backed_and_unbacked_free_space() {
        let vm = Arc::new(SimVirtualMemory::new());
        let mut set = HugeRegionSet::new(true);
        let res = vm
            .alloc(region_size().in_bytes(), 1 << 21, MemoryTag::Normal)
            .expect("reserve");
        let start = HugePage(res.addr >> 21);
        set.contribute(HugeRegion::new(
            HugeRange::new(start, region_size()),
            vm.clone(),
        ));

        let mut page = PageId(0);
        let mut fr = false;
        assert!(set.maybe_get(Length(300), &mut page, &mut fr));
        let s = set.stats();
        assert_eq!(s.system_bytes, region_size().in_bytes());
        // Hugepage 0 is backed: its 212 free pages are "free"; the rest of
        // the region is unbacked free space.
        assert_eq!(s.free_bytes, Length(212).in_bytes());
        assert_eq!(
            s.unmapped_bytes,
            (region_size().in_pages() - Length(512)).in_bytes()
        );
    }
}
