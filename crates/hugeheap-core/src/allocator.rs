//! The hugepage-aware policy engine.
//!
//! Coordinates four backends: the filler packs sub-hugepage spans onto
//! shared hugepages, regions pack large spans linearly, the cache recycles
//! whole free hugepages, and the raw allocator grows address space. This
//! module owns the two decisions that tie them together: routing a request
//! to a backend by size, and the donation protocol that lends the slack
//! tail of a multi-hugepage allocation to the filler without giving up the
//! ability to reassemble the range.
//!
//! Locking: one mutex guards all backend state. The lifetime context is
//! collected before the lock is taken, and backing a freshly allocated span
//! happens after it is dropped.

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::filler::{Filler, TrackerId};
use crate::huge_alloc::HugeAllocator;
use crate::huge_cache::HugeCache;
use crate::lifetime::{
    self, AllocationResult, LifetimeContext, LifetimePredictor, RegionAlloc,
};
use crate::pagemap::PageMap;
use crate::pages::{
    hl_from_pages, HugeLength, HugePage, HugeRange, Length, PageId, PAGES_PER_HUGEPAGE,
};
use crate::params::{Forwarder, Options, SkipSubreleaseIntervals, StaticForwarder};
use crate::region::{region_size, HugeRegion, HugeRegionSet};
use crate::span::Span;
use crate::stats::{bytes_to_mib, AllocInfo, BackingStats, LargeSpanStats, SmallSpanStats};
use crate::vm::{Clock, MemoryTag, MonotonicClock, VirtualMemory};

/// Donation slack below this many pages is always acceptable; regions are
/// not considered until a binary has at least this much at stake.
const REGION_SLACK_THRESHOLD: Length = Length((64 * 1024 * 1024) >> crate::pages::PAGE_SHIFT);

/// Hugepage-packing page heap.
///
/// Allocations are phrased in pages; results are [`Span`]s tagged with the
/// heap's [`MemoryTag`]. Out of memory surfaces as `None`, never a panic;
/// misuse (double free, foreign span) panics.
pub struct HugePageAwareAllocator<F: Forwarder = StaticForwarder> {
    state: Mutex<PageHeap<F>>,
    vm: Arc<dyn VirtualMemory>,
    options: Options,
}

struct PageHeap<F: Forwarder> {
    forwarder: F,
    options: Options,
    vm: Arc<dyn VirtualMemory>,
    pagemap: PageMap,
    filler: Filler,
    regions: HugeRegionSet,
    cache: HugeCache,
    lifetime: LifetimePredictor,
    /// Hugepages currently lent to the filler by live donations.
    donated_huge_pages: HugeLength,
    /// Pages still pinned by donations whose parent allocation died.
    abandoned_pages: Length,
    info: AllocInfo,
    /// Lifetime attachments skipped because the tail lost its donated
    /// status before the lock was re-examined.
    lifetime_attach_skips: u64,
}

/// Serializable structured report, the machine-readable form of
/// [`HugePageAwareAllocator::print`].
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorReport {
    pub using_hpaa_subrelease: bool,
    pub use_huge_region_more_often: bool,
    pub filler_usage: UsageBreakdown,
    pub region_usage: UsageBreakdown,
    pub lifetime_region_usage: Option<UsageBreakdown>,
    pub cache_usage: UsageBreakdown,
    pub alloc_usage: UsageBreakdown,
    pub donated_huge_pages: usize,
    pub abandoned_pages: usize,
    pub live_spans: usize,
    pub lifetime_attach_skips: u64,
    pub stats: BackingStats,
}

/// Used/free/unmapped triple for one component of the report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageBreakdown {
    pub used: usize,
    pub free: usize,
    pub unmapped: usize,
}

impl From<BackingStats> for UsageBreakdown {
    fn from(s: BackingStats) -> Self {
        UsageBreakdown {
            used: s.used_bytes(),
            free: s.free_bytes,
            unmapped: s.unmapped_bytes,
        }
    }
}

impl<F: Forwarder> HugePageAwareAllocator<F> {
    #[must_use]
    pub fn new(options: Options, vm: Arc<dyn VirtualMemory>, forwarder: F) -> Self {
        Self::with_clock(options, vm, Arc::new(MonotonicClock::new()), forwarder)
    }

    #[must_use]
    pub fn with_clock(
        options: Options,
        vm: Arc<dyn VirtualMemory>,
        clock: Arc<dyn Clock>,
        forwarder: F,
    ) -> Self {
        let alloc = HugeAllocator::new(vm.clone(), options.tag);
        let cache = HugeCache::new(alloc, vm.clone(), clock.clone());
        let filler = Filler::new(
            vm.clone(),
            clock.clone(),
            options.separate_allocs_for_few_and_many_objects_spans,
        );
        let lifetime = LifetimePredictor::new(options.lifetime, clock.clone());
        Self {
            state: Mutex::new(PageHeap {
                forwarder,
                options,
                vm: vm.clone(),
                pagemap: PageMap::new(),
                filler,
                regions: HugeRegionSet::new(options.use_huge_region_more_often),
                cache,
                lifetime,
                donated_huge_pages: HugeLength::zero(),
                abandoned_pages: Length::zero(),
                info: AllocInfo::new(),
                lifetime_attach_skips: 0,
            }),
            vm,
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> Options {
        self.options
    }

    /// Allocate a run of `n` pages. Returns `None` when out of memory.
    pub fn new_span(&self, n: Length, objects_per_span: usize) -> Option<Span> {
        assert!(n > Length::zero(), "empty allocation");
        // Context collection happens before the lock is taken.
        let ctx = self
            .options
            .lifetime
            .enabled
            .then(|| lifetime::collect_context(n));

        let mut from_released = false;
        let span = {
            let mut state = self.state.lock();
            state.alloc(n, objects_per_span, ctx.as_ref(), &mut from_released)?
        };
        if from_released {
            self.back_span(&span);
        }
        debug_assert_eq!(
            MemoryTag::of_address(span.start_address()),
            Some(self.options.tag)
        );
        Some(span)
    }

    /// As [`HugePageAwareAllocator::new_span`], but the result starts on an
    /// `align`-page boundary. `align` must be a power of two no larger than
    /// a hugepage.
    pub fn new_aligned(&self, n: Length, align: Length, objects_per_span: usize) -> Option<Span> {
        if align <= Length(1) {
            return self.new_span(n, objects_per_span);
        }
        assert!(n > Length::zero(), "empty allocation");
        assert!(align.raw().is_power_of_two(), "alignment not a power of two");
        assert!(
            align.raw() <= PAGES_PER_HUGEPAGE,
            "alignment beyond a hugepage"
        );
        let mut from_released = false;
        let span = {
            let mut state = self.state.lock();
            state.alloc_raw_hugepages(n, objects_per_span, &mut from_released)?
        };
        if from_released {
            self.back_span(&span);
        }
        debug_assert_eq!(
            MemoryTag::of_address(span.start_address()),
            Some(self.options.tag)
        );
        Some(span)
    }

    /// Return a span produced by this heap.
    ///
    /// Panics on a span the heap does not know (double free, foreign span).
    pub fn delete(&self, span: Span, objects_per_span: usize) {
        self.state.lock().delete(span, objects_per_span);
    }

    /// Release at least `n` pages back to the OS where possible. Returns
    /// the pages actually released.
    pub fn release_at_least_n_pages(&self, n: Length) -> Length {
        self.state.lock().release_at_least_n_pages(n)
    }

    /// Emergency release: break otherwise-full hugepages, ignoring the
    /// demand guard.
    pub fn release_at_least_n_pages_breaking_hugepages(&self, n: Length) -> Length {
        let mut state = self.state.lock();
        state
            .filler
            .release_pages(n, SkipSubreleaseIntervals::default(), false, true)
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        self.state.lock().stats()
    }

    pub fn get_small_span_stats(&self, result: &mut SmallSpanStats) {
        *result = SmallSpanStats::new();
        self.state.lock().add_span_stats(Some(result), None);
    }

    pub fn get_large_span_stats(&self, result: &mut LargeSpanStats) {
        *result = LargeSpanStats::default();
        self.state.lock().add_span_stats(None, Some(result));
    }

    #[must_use]
    pub fn filler_stats(&self) -> BackingStats {
        self.state.lock().filler.stats()
    }

    /// Hugepages currently lent to the filler by live donations.
    #[must_use]
    pub fn donated_huge_pages(&self) -> HugeLength {
        self.state.lock().donated_huge_pages
    }

    /// Pages retained on donated hugepages after their parent allocation
    /// died.
    #[must_use]
    pub fn abandoned_pages(&self) -> Length {
        self.state.lock().abandoned_pages
    }

    /// Lifetime attachments skipped because the donated tail had already
    /// lost its donated status.
    #[must_use]
    pub fn lifetime_attach_skips(&self) -> u64 {
        self.state.lock().lifetime_attach_skips
    }

    /// Pages the filler currently has handed out.
    #[must_use]
    pub fn filler_used_pages(&self) -> Length {
        self.state.lock().filler.used_pages()
    }

    /// Hugepages under filler management.
    #[must_use]
    pub fn filler_size(&self) -> HugeLength {
        self.state.lock().filler.size()
    }

    /// Number of regions in the region set.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Backed hugepages sitting in the cache.
    #[must_use]
    pub fn cache_size(&self) -> HugeLength {
        self.state.lock().cache.size()
    }

    /// Human-readable component breakdown.
    pub fn print(&self, out: &mut String, everything: bool) {
        let state = self.state.lock();
        let bstats = state.stats();
        writeln!(out, "HugePageAware: breakdown of used / free / unmapped space:").unwrap();

        let fstats = state.filler.stats();
        breakdown(out, &fstats, "HugePageAware: filler  ");

        let rstats = state.regions.stats();
        breakdown(out, &rstats, "HugePageAware: region  ");

        let lstats = state.lifetime.region_stats();
        if let Some(ls) = lstats {
            breakdown(out, &ls, "HugePageAware: lifetime");
        }

        // Everything in the filler came from the cache; show only what the
        // mutator sees from the cache itself.
        let mut cstats = state.cache.stats();
        cstats.system_bytes -= fstats.system_bytes;
        breakdown(out, &cstats, "HugePageAware: cache   ");

        // Every component's bytes came from the raw allocator; same again.
        let mut astats = state.cache.allocator().stats();
        astats.system_bytes -=
            (fstats + rstats + lstats.unwrap_or_default() + cstats).system_bytes;
        breakdown(out, &astats, "HugePageAware: alloc   ");
        writeln!(out).unwrap();

        writeln!(
            out,
            "HugePageAware: filler donations {} ({} pages from abandoned donations)",
            state.donated_huge_pages.raw(),
            state.abandoned_pages.raw()
        )
        .unwrap();
        writeln!(
            out,
            "HugePageAware: {:.1} MiB system, {:.1} MiB free, {:.1} MiB unmapped",
            bytes_to_mib(bstats.system_bytes),
            bytes_to_mib(bstats.free_bytes),
            bytes_to_mib(bstats.unmapped_bytes)
        )
        .unwrap();

        if everything {
            writeln!(
                out,
                "HugePageAware: filler {} hugepages, {} used pages, {} free, {} released",
                state.filler.size().raw(),
                state.filler.used_pages().raw(),
                state.filler.free_pages().raw(),
                state.filler.released_pages().raw()
            )
            .unwrap();
            writeln!(
                out,
                "HugePageAware: cache {} hugepages cached, limit {}, {} hits, {} misses",
                state.cache.size().raw(),
                state.cache.limit().raw(),
                state.cache.hits(),
                state.cache.misses()
            )
            .unwrap();
            writeln!(
                out,
                "HugePageAware: {} live spans, {} regions, {} lifetime attach skips",
                state.pagemap.live_spans(),
                state.regions.len(),
                state.lifetime_attach_skips
            )
            .unwrap();
            writeln!(
                out,
                "HugePageAware: {} small allocs, {} large allocs, {} release calls ({} pages asked, {} released)",
                state.info.small_allocs(),
                state.info.large_allocs(),
                state.info.release_calls(),
                state.info.released_requested().raw(),
                state.info.released_actual().raw()
            )
            .unwrap();
        }

        writeln!(
            out,
            "PARAMETER use_huge_region_more_often {}",
            i32::from(state.regions.use_huge_region_more_often())
        )
        .unwrap();
        writeln!(
            out,
            "PARAMETER hpaa_subrelease {}",
            i32::from(state.forwarder.hpaa_subrelease())
        )
        .unwrap();
    }

    /// Structured form of [`HugePageAwareAllocator::print`].
    #[must_use]
    pub fn report(&self) -> AllocatorReport {
        let state = self.state.lock();
        let fstats = state.filler.stats();
        let rstats = state.regions.stats();
        let lstats = state.lifetime.region_stats();
        let mut cstats = state.cache.stats();
        cstats.system_bytes -= fstats.system_bytes;
        let mut astats = state.cache.allocator().stats();
        astats.system_bytes -=
            (fstats + rstats + lstats.unwrap_or_default() + cstats).system_bytes;
        AllocatorReport {
            using_hpaa_subrelease: state.forwarder.hpaa_subrelease(),
            use_huge_region_more_often: state.regions.use_huge_region_more_often(),
            filler_usage: fstats.into(),
            region_usage: rstats.into(),
            lifetime_region_usage: lstats.map(UsageBreakdown::from),
            cache_usage: cstats.into(),
            alloc_usage: astats.into(),
            donated_huge_pages: state.donated_huge_pages.raw(),
            abandoned_pages: state.abandoned_pages.raw(),
            live_spans: state.pagemap.live_spans(),
            lifetime_attach_skips: state.lifetime_attach_skips,
            stats: state.stats(),
        }
    }

    fn back_span(&self, span: &Span) {
        let ok = self.vm.back(span.start_address(), span.bytes_in_span());
        assert!(ok, "provider failed to back a span");
    }
}

fn breakdown(out: &mut String, s: &BackingStats, label: &str) {
    writeln!(
        out,
        "{label} {:6.1} MiB used, {:6.1} MiB free, {:6.1} MiB unmapped",
        bytes_to_mib(s.used_bytes()),
        bytes_to_mib(s.free_bytes),
        bytes_to_mib(s.unmapped_bytes)
    )
    .unwrap();
}

/// Region allocation capability handed to the lifetime predictor; it
/// carves fresh regions straight from the raw allocator.
struct CacheRegionAlloc<'a> {
    cache: &'a mut HugeCache,
    vm: &'a Arc<dyn VirtualMemory>,
}

impl RegionAlloc for CacheRegionAlloc<'_> {
    fn alloc_region(&mut self, n: HugeLength) -> Option<HugeRegion> {
        let range = self.cache.allocator_mut().get(n)?;
        Some(HugeRegion::new(range, self.vm.clone()))
    }
}

impl<F: Forwarder> PageHeap<F> {
    fn alloc(
        &mut self,
        n: Length,
        objects_per_span: usize,
        ctx: Option<&LifetimeContext>,
        from_released: &mut bool,
    ) -> Option<Span> {
        // Small things pack onto shared hugepages; large things get a
        // region or raw hugepages; enormous things always go raw.
        if n.raw() <= PAGES_PER_HUGEPAGE / 2 {
            self.alloc_small(n, objects_per_span, from_released)
        } else if n <= region_size().in_pages() {
            self.alloc_large(n, objects_per_span, ctx, from_released)
        } else {
            self.alloc_enormous(n, objects_per_span, from_released)
        }
    }

    fn alloc_small(
        &mut self,
        n: Length,
        objects_per_span: usize,
        from_released: &mut bool,
    ) -> Option<Span> {
        if let Some((_, page)) = self.filler.try_get(n, objects_per_span) {
            *from_released = false;
            return Some(self.finalize(n, page));
        }
        let page = self.refill_filler(n, objects_per_span, from_released)?;
        Some(self.finalize(n, page))
    }

    fn alloc_large(
        &mut self,
        n: Length,
        objects_per_span: usize,
        ctx: Option<&LifetimeContext>,
        from_released: &mut bool,
    ) -> Option<Span> {
        // An exact hugepage multiple never has slack; skip the filler so
        // whole hugepages stay whole.
        let hl = hl_from_pages(n);
        if hl.in_pages() == n {
            return self.alloc_raw_hugepages(n, objects_per_span, from_released);
        }

        if n.raw() < PAGES_PER_HUGEPAGE {
            if let Some((_, page)) = self.filler.try_get(n, objects_per_span) {
                *from_released = false;
                return Some(self.finalize(n, page));
            }
        }

        let lifetime_alloc = self.lifetime.maybe_get(
            n,
            from_released,
            ctx,
            &mut CacheRegionAlloc {
                cache: &mut self.cache,
                vm: &self.vm,
            },
        );
        if let Some(page) = lifetime_alloc.try_get_allocation() {
            return Some(self.finalize(n, page));
        }

        let mut page = PageId(0);
        if self.regions.maybe_get(n, &mut page, from_released) {
            return Some(self.finalize(n, page));
        }

        // Either add a region or accept the slack of a raw allocation.
        // Slack is harmless while small allocations outnumber it; regions
        // only pay off once enough donated slack is at stake.
        let slack = self.info.slack();
        let donated = if self.regions.use_huge_region_more_often() {
            self.abandoned_pages + slack
        } else {
            slack
        };
        if donated < REGION_SLACK_THRESHOLD {
            return self.alloc_raw_and_maybe_track(n, objects_per_span, &lifetime_alloc, from_released);
        }
        let small = self.info.small();
        if slack < small && !self.regions.use_huge_region_more_often() {
            return self.alloc_raw_and_maybe_track(n, objects_per_span, &lifetime_alloc, from_released);
        }
        if !self.add_region() {
            return self.alloc_raw_and_maybe_track(n, objects_per_span, &lifetime_alloc, from_released);
        }

        let ok = self.regions.maybe_get(n, &mut page, from_released);
        assert!(ok, "fresh region must satisfy the request");
        Some(self.finalize(n, page))
    }

    fn alloc_enormous(
        &mut self,
        n: Length,
        objects_per_span: usize,
        from_released: &mut bool,
    ) -> Option<Span> {
        self.alloc_raw_hugepages(n, objects_per_span, from_released)
    }

    /// Pull whole hugepages from the cache. Slack, if any, is donated to
    /// the filler through a tracker on the last hugepage.
    fn alloc_raw_hugepages(
        &mut self,
        n: Length,
        objects_per_span: usize,
        from_released: &mut bool,
    ) -> Option<Span> {
        let hl = hl_from_pages(n);
        let r = self.cache.get(hl, from_released)?;

        let total = hl.in_pages();
        let slack = total - n;
        let first = r.start;
        self.pagemap.set_tracker(first, None);
        let last = r.last();
        if slack == Length::zero() {
            self.pagemap.set_tracker(last, None);
            return Some(self.finalize(total, first.first_page()));
        }

        self.donated_huge_pages += HugeLength(1);

        let here = Length(PAGES_PER_HUGEPAGE) - slack;
        assert!(here > Length::zero());
        self.alloc_and_contribute(last, here, objects_per_span, true);
        // The tracker remembers the full donor size, not just the tail
        // portion, so abandoned accounting reports what the donation cost.
        let id = self.pagemap.tracker(last).expect("tail tracker just installed");
        self.filler.tracker_mut(id).set_abandoned_count(n);
        let mut span = self.finalize(n, first.first_page());
        span.set_donated(true);
        Some(span)
    }

    /// Raw-hugepage allocation plus, when the request carried a lifetime
    /// prediction, a tracker on the donated tail. The tail is re-read after
    /// the allocation: the usage-limit hook may have subreleased it, in
    /// which case attachment is skipped and counted.
    fn alloc_raw_and_maybe_track(
        &mut self,
        n: Length,
        objects_per_span: usize,
        lifetime_alloc: &AllocationResult,
        from_released: &mut bool,
    ) -> Option<Span> {
        let span = self.alloc_raw_hugepages(n, objects_per_span, from_released)?;
        let hp = HugePage::containing(span.last_page());
        if let Some(id) = self.pagemap.tracker(hp) {
            if self.filler.tracker(id).donated() {
                if let Some(lt) = self.lifetime.maybe_add_tracker(lifetime_alloc, n) {
                    self.filler.tracker_mut(id).set_lifetime_tracker(Some(lt));
                }
            } else if self.lifetime.enabled() {
                self.lifetime_attach_skips += 1;
            }
        }
        Some(span)
    }

    /// Pull one hugepage from the cache and hand it to the filler with the
    /// first `n` pages carved out.
    fn refill_filler(
        &mut self,
        n: Length,
        objects_per_span: usize,
        from_released: &mut bool,
    ) -> Option<PageId> {
        let r = self.cache.get(HugeLength(1), from_released)?;
        // Trim to the limit before carving: releasing from the fresh
        // hugepage afterwards would fragment it immediately.
        self.forwarder.shrink_to_usage_limit(n);
        Some(self.alloc_and_contribute(r.start, n, objects_per_span, false))
    }

    fn alloc_and_contribute(
        &mut self,
        hp: HugePage,
        n: Length,
        objects_per_span: usize,
        donated: bool,
    ) -> PageId {
        let id = self.filler.new_tracker(hp, donated);
        // A donated tracker remembers the size of its donor so the pages
        // can be accounted abandoned if the donor dies first.
        if donated {
            self.filler.tracker_mut(id).set_abandoned_count(n);
        }
        let page = self.filler.alloc_first(id, n);
        self.pagemap.set_tracker(hp, Some(id));
        self.filler.contribute(id, donated, objects_per_span);
        page
    }

    fn add_region(&mut self) -> bool {
        let Some(range) = self.cache.allocator_mut().get(region_size()) else {
            return false;
        };
        self.regions
            .contribute(HugeRegion::new(range, self.vm.clone()));
        true
    }

    fn finalize(&mut self, n: Length, page: PageId) -> Span {
        self.pagemap.insert_span(page, n);
        self.info.record_alloc(n);
        self.forwarder.shrink_to_usage_limit(n);
        Span::new(page, n)
    }

    fn delete(&mut self, span: Span, objects_per_span: usize) {
        debug_assert_eq!(
            MemoryTag::of_address(span.start_address()),
            Some(self.options.tag)
        );
        let p = span.first_page();
        let hp = HugePage::containing(p);
        let n = span.num_pages();
        self.info.record_free(n);

        let might_abandon = span.donated();
        // Clearing the registry entry first turns a second delete of the
        // same span into a loud failure instead of silent corruption.
        let rec = self
            .pagemap
            .remove_span(p)
            .expect("delete of a span the heap does not know");
        assert_eq!(rec.len, n, "span length does not match the registry");

        // Where did this span come from?
        // a) The filler packed it onto a single hugepage.
        if let Some(id) = self.pagemap.tracker(hp) {
            assert_eq!(
                hp,
                HugePage::containing(p + n - Length(1)),
                "filler span crosses hugepages"
            );
            self.delete_from_hugepage(id, p, n, objects_per_span, might_abandon);
            return;
        }

        // b) A region (possibly crossing hugepages) owns it.
        if self.regions.maybe_put(p, n) {
            return;
        }
        if self.lifetime.maybe_put(p, n) {
            return;
        }

        // c) Straight from the cache; a slack tail may still sit in the
        //    filler and has to be reclaimed as a virtual allocation.
        assert!(
            n.raw() >= PAGES_PER_HUGEPAGE,
            "unowned span below hugepage size"
        );
        let mut hl = hl_from_pages(n);
        let last = hp + hl - HugeLength(1);
        let slack = hl.in_pages() - n;
        if slack == Length::zero() {
            assert!(
                self.pagemap.tracker(last).is_none(),
                "exact-multiple span must not have a tail tracker"
            );
        } else {
            let id = self
                .pagemap
                .tracker(last)
                .expect("donated tail tracker missing");
            let lt = self.filler.tracker_mut(id).take_lifetime_tracker();
            self.lifetime.maybe_put_tracker(lt, n);
            assert!(self.filler.tracker(id).was_donated());
            // The donated portion was a virtual allocation on the last
            // hugepage; put it back like any other filler free.
            let virt = last.first_page();
            let virt_len = Length(PAGES_PER_HUGEPAGE) - slack;
            if self.filler.put(id, virt, virt_len, objects_per_span).is_none() {
                // The slack got used; the tail stays behind, abandoned. The
                // donation is over either way.
                hl -= HugeLength(1);
                self.donated_huge_pages -= HugeLength(1);
                self.abandoned_pages += self.filler.tracker(id).abandoned_count();
                self.filler.tracker_mut(id).set_abandoned(true);
            } else {
                self.donated_huge_pages -= HugeLength(1);
                assert!(!self.filler.tracker(id).abandoned());
                if self.filler.tracker(id).released() {
                    // Subreleased tail: split it off and return it unbacked.
                    hl -= HugeLength(1);
                    self.release_hugepage(id);
                } else {
                    // Drop the tracker but keep the hugepage in the range.
                    self.pagemap.set_tracker(last, None);
                    let pt = self.filler.destroy_tracker(id);
                    assert!(pt.lifetime_tracker().is_none());
                }
            }
        }
        self.cache.release(HugeRange::new(hp, hl));
    }

    fn delete_from_hugepage(
        &mut self,
        id: TrackerId,
        p: PageId,
        n: Length,
        objects_per_span: usize,
        might_abandon: bool,
    ) {
        if self.filler.put(id, p, n, objects_per_span).is_none() {
            // The hugepage is still in use. If this free was the donor of
            // the hugepage's slack, the donation ends here and the pages it
            // pinned are now abandoned.
            if might_abandon {
                assert!(self.filler.tracker(id).was_donated());
                self.donated_huge_pages -= HugeLength(1);
                self.abandoned_pages += self.filler.tracker(id).abandoned_count();
                self.filler.tracker_mut(id).set_abandoned(true);
            }
            return;
        }
        if self.filler.tracker(id).was_donated() {
            if self.filler.tracker(id).abandoned() {
                // The donor died earlier and already settled the donation
                // count; only the abandoned pages come back now.
                self.abandoned_pages -= self.filler.tracker(id).abandoned_count();
                self.filler.tracker_mut(id).set_abandoned(false);
            } else {
                self.donated_huge_pages -= HugeLength(1);
            }
        } else {
            assert_eq!(self.filler.tracker(id).abandoned_count(), Length::zero());
        }
        let lt = self.filler.tracker_mut(id).take_lifetime_tracker();
        self.lifetime.maybe_put_tracker(lt, n);
        self.release_hugepage(id);
    }

    /// Hand an entirely-free hugepage back to the cache and retire its
    /// tracker.
    fn release_hugepage(&mut self, id: TrackerId) {
        assert_eq!(self.filler.tracker(id).used_pages(), Length::zero());
        let location = self.filler.tracker(id).location();
        self.pagemap.set_tracker(location, None);
        let pt = self.filler.destroy_tracker(id);
        assert!(pt.lifetime_tracker().is_none());

        let r = HugeRange::new(location, HugeLength(1));
        if pt.released() {
            // Unback the remaining backed pages so the whole hugepage goes
            // down uniformly unbacked.
            for (start, len) in pt.backed_free_runs() {
                let addr = (location.first_page() + Length(start)).addr();
                let ok = self.vm.release(addr, Length(len).in_bytes());
                assert!(ok, "provider refused to unback");
            }
            self.cache.release_unbacked(r);
        } else {
            self.cache.release(r);
        }
    }

    fn release_at_least_n_pages(&mut self, n: Length) -> Length {
        let mut released = self.cache.release_cached_pages(hl_from_pages(n)).in_pages();

        if self.forwarder.hpaa_subrelease() && released < n {
            released += self.filler.release_pages(
                n - released,
                self.forwarder.skip_subrelease_intervals(),
                self.forwarder.release_partial_alloc_pages(),
                false,
            );
        }

        if self.regions.use_huge_region_more_often() {
            released += self.regions.release_pages();
        }

        self.info.record_release(n, released);
        released
    }

    fn stats(&self) -> BackingStats {
        let mut stats = self.cache.allocator().stats();
        let actual_system = stats.system_bytes;
        stats += self.cache.stats();
        stats += self.filler.stats();
        stats += self.regions.stats();
        stats += self.lifetime.region_stats().unwrap_or_default();
        // Every byte came from the raw allocator and shows up again in the
        // component that holds it; the raw figure is the canonical total.
        stats.system_bytes = actual_system;
        stats
    }

    fn add_span_stats(
        &self,
        mut small: Option<&mut SmallSpanStats>,
        mut large: Option<&mut LargeSpanStats>,
    ) {
        self.cache
            .allocator()
            .add_span_stats(small.as_deref_mut(), large.as_deref_mut());
        self.filler
            .add_span_stats(small.as_deref_mut(), large.as_deref_mut());
        self.regions
            .add_span_stats(small.as_deref_mut(), large.as_deref_mut());
        self.cache.add_span_stats(small, large);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::SimVirtualMemory;

    fn heap() -> (Arc<SimVirtualMemory>, HugePageAwareAllocator) {
        heap_with(Options::default())
    }

    fn heap_with(options: Options) -> (Arc<SimVirtualMemory>, HugePageAwareAllocator) {
        let vm = Arc::new(SimVirtualMemory::new());
        let heap = HugePageAwareAllocator::new(options, vm.clone(), StaticForwarder);
        (vm, heap)
    }

    #[test]
    fn small_allocation_goes_to_filler() {
        let (vm, heap) = heap();
        let s = heap.new_span(Length(1), 1).expect("alloc");
        assert_eq!(heap.filler_used_pages(), Length(1));
        assert_eq!(heap.filler_size(), HugeLength(1));
        assert_eq!(vm.alloc_calls(), 1);
        assert!(!s.donated());
        heap.delete(s, 1);
        assert_eq!(heap.filler_size(), HugeLength::zero());
    }

    #[test]
    fn exact_multiple_bypasses_filler() {
        let (_, heap) = heap();
        let s = heap.new_span(Length(1024), 1).expect("alloc");
        assert_eq!(heap.filler_size(), HugeLength::zero());
        assert_eq!(heap.donated_huge_pages(), HugeLength::zero());
        heap.delete(s, 1);
    }

    #[test]
    fn slack_is_donated() {
        let (_, heap) = heap();
        let s = heap.new_span(Length(513), 1).expect("alloc");
        assert!(s.donated());
        assert_eq!(heap.donated_huge_pages(), HugeLength(1));
        assert_eq!(heap.filler_used_pages(), Length(1));
        assert_eq!(heap.filler_size(), HugeLength(1));
        heap.delete(s, 1);
        assert_eq!(heap.donated_huge_pages(), HugeLength::zero());
        assert_eq!(heap.abandoned_pages(), Length::zero());
        assert_eq!(heap.filler_size(), HugeLength::zero());
    }

    #[test]
    fn memory_is_tagged() {
        let (_, heap) = heap_with(Options {
            tag: MemoryTag::Cold,
            ..Options::default()
        });
        let s = heap.new_span(Length(2), 1).expect("alloc");
        assert_eq!(
            MemoryTag::of_address(s.start_address()),
            Some(MemoryTag::Cold)
        );
        heap.delete(s, 1);
    }

    #[test]
    #[should_panic(expected = "does not know")]
    fn double_delete_panics() {
        let (_, heap) = heap();
        let s = heap.new_span(Length(1), 1).expect("alloc");
        heap.delete(s, 1);
        heap.delete(s, 1);
    }

    #[test]
    #[should_panic(expected = "empty allocation")]
    fn zero_length_allocation_panics() {
        let (_, heap) = heap();
        let _ = heap.new_span(Length::zero(), 1);
    }

    #[test]
    fn print_and_report_agree_on_donations() {
        let (_, heap) = heap();
        let s = heap.new_span(Length(513), 1).expect("alloc");
        let mut out = String::new();
        heap.print(&mut out, true);
        assert!(out.contains("filler donations 1"));
        let report = heap.report();
        assert_eq!(report.donated_huge_pages, 1);
        assert_eq!(report.abandoned_pages, 0);
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["donated_huge_pages"], 1);
        heap.delete(s, 1);
    }

    #[test]
    fn report_component_totals_match_canonical_system_bytes() {
        let (_, heap) = heap();
        let spans: Vec<_> = (0..4)
            .map(|_| heap.new_span(Length(100), 1).expect("alloc"))
            .collect();
        let report = heap.report();
        let component_system = report.filler_usage.used
            + report.filler_usage.free
            + report.filler_usage.unmapped
            + report.region_usage.used
            + report.region_usage.free
            + report.region_usage.unmapped
            + report.cache_usage.used
            + report.cache_usage.free
            + report.cache_usage.unmapped
            + report.alloc_usage.used
            + report.alloc_usage.free
            + report.alloc_usage.unmapped;
        assert_eq!(component_system, report.stats.system_bytes);
        for s in spans {
            heap.delete(s, 1);
        }
    }
}
