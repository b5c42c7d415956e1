//! Per-hugepage packing engine.
//!
//! The filler owns a slab of [`PageTracker`]s, one per hugepage it manages,
//! and an index of those trackers keyed by longest free range. Requests are
//! served best-fit: the hugepage with the smallest sufficient longest free
//! range wins, which keeps large gaps intact for large requests. Hugepages
//! donated as the slack tail of a multi-hugepage allocation sit in a
//! separate list and are used only when nothing else fits, so they keep a
//! chance of reassembling.
//!
//! Subrelease un-backs free pages from still-used hugepages. A demand peak
//! observed within the configured skip intervals puts a floor under how
//! deep release may cut, unless the caller hit its usage limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::bitmap::PageBitmap;
use crate::lifetime::LifetimeTrackerId;
use crate::pages::{HugeLength, HugePage, Length, PageId, PAGES_PER_HUGEPAGE};
use crate::params::SkipSubreleaseIntervals;
use crate::stats::{BackingStats, LargeSpanStats, SmallSpanStats};
use crate::vm::{Clock, VirtualMemory};

/// Spans expecting at most this many objects count as "few-object" spans
/// for density bucketing.
pub const FEW_OBJECTS_LIMIT: usize = 16;

/// Handle to a tracker in the filler's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerId(pub usize);

/// Where a tracker currently sits in the packing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Not indexed (fully allocated, or ownership is with the caller).
    None,
    /// Regular list for the given density bucket.
    Regular(usize),
    /// Pristine donated-tail list.
    Donated,
}

/// Per-hugepage descriptor.
#[derive(Debug)]
pub struct PageTracker {
    location: HugePage,
    used: PageBitmap,
    /// Free pages whose backing has been returned to the OS.
    released: PageBitmap,
    released_count: usize,
    created_at: Duration,
    was_donated: bool,
    /// Still the untouched tail of a live multi-hugepage allocation.
    donated: bool,
    abandoned_count: Length,
    abandoned: bool,
    lifetime_tracker: Option<LifetimeTrackerId>,
    placement: Placement,
}

impl PageTracker {
    fn new(location: HugePage, created_at: Duration, donated: bool) -> Self {
        Self {
            location,
            used: PageBitmap::new(),
            released: PageBitmap::new(),
            released_count: 0,
            created_at,
            was_donated: donated,
            donated,
            abandoned_count: Length::zero(),
            abandoned: false,
            lifetime_tracker: None,
            placement: Placement::None,
        }
    }

    #[must_use]
    pub fn location(&self) -> HugePage {
        self.location
    }

    #[must_use]
    pub fn longest_free_range(&self) -> Length {
        Length(self.used.longest_free_range())
    }

    #[must_use]
    pub fn used_pages(&self) -> Length {
        Length(self.used.used())
    }

    #[must_use]
    pub fn free_pages(&self) -> Length {
        Length(PAGES_PER_HUGEPAGE - self.used.used())
    }

    /// Free pages that are still backed.
    #[must_use]
    pub fn backed_free_pages(&self) -> Length {
        self.free_pages() - Length(self.released_count)
    }

    #[must_use]
    pub fn was_donated(&self) -> bool {
        self.was_donated
    }

    /// True while the hugepage remains the untouched tail of a live
    /// donation; cleared the first time the filler reuses it or releases
    /// from it.
    #[must_use]
    pub fn donated(&self) -> bool {
        self.donated
    }

    #[must_use]
    pub fn abandoned_count(&self) -> Length {
        self.abandoned_count
    }

    pub fn set_abandoned_count(&mut self, n: Length) {
        self.abandoned_count = n;
    }

    #[must_use]
    pub fn abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn set_abandoned(&mut self, v: bool) {
        self.abandoned = v;
    }

    /// True once any page of this hugepage has been unbacked.
    #[must_use]
    pub fn released(&self) -> bool {
        self.released_count > 0
    }

    #[must_use]
    pub fn lifetime_tracker(&self) -> Option<LifetimeTrackerId> {
        self.lifetime_tracker
    }

    pub fn set_lifetime_tracker(&mut self, id: Option<LifetimeTrackerId>) {
        self.lifetime_tracker = id;
    }

    pub fn take_lifetime_tracker(&mut self) -> Option<LifetimeTrackerId> {
        self.lifetime_tracker.take()
    }

    #[must_use]
    pub fn created_at(&self) -> Duration {
        self.created_at
    }

    /// Maximal free runs that are still backed, as `(start, len)` pairs.
    #[must_use]
    pub fn backed_free_runs(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (start, len) in self.used.free_runs() {
            let mut s = start;
            for idx in start..start + len {
                if self.released.is_set(idx) {
                    if idx > s {
                        out.push((s, idx - s));
                    }
                    s = idx + 1;
                }
            }
            if start + len > s {
                out.push((s, start + len - s));
            }
        }
        out
    }

    /// Carve a free run of `n` pages, returning its first page and how many
    /// of the pages were previously unbacked.
    fn get(&mut self, n: Length) -> (PageId, Length) {
        let start = self
            .used
            .find_free_run(n.raw())
            .expect("tracker has no run of the requested length");
        self.used.mark_used(start, n.raw());
        let mut rebacked = 0;
        for idx in start..start + n.raw() {
            if self.released.is_set(idx) {
                self.released.clear_bit(idx);
                rebacked += 1;
            }
        }
        self.released_count -= rebacked;
        (self.location.first_page() + Length(start), Length(rebacked))
    }

    /// Return the run `[p, p + n)`.
    fn put(&mut self, p: PageId, n: Length) {
        let start = p.index_in_hugepage();
        self.used.mark_free(start, n.raw());
    }
}

/// Packing engine over all filler-managed hugepages.
pub struct Filler {
    vm: Arc<dyn VirtualMemory>,
    clock: Arc<dyn Clock>,
    separate_buckets: bool,
    trackers: Vec<Option<PageTracker>>,
    free_ids: Vec<usize>,
    /// `lists[bucket][lfr]` holds indexed trackers, FIFO within a list.
    lists: [Vec<Vec<TrackerId>>; 2],
    /// Pristine donated tails, indexed by longest free range.
    donated_lists: Vec<Vec<TrackerId>>,
    size: HugeLength,
    used_pages: Length,
    free_backed: Length,
    released_pages: Length,
    /// `(when, used_pages)` samples backing the skip-subrelease guard.
    demand: VecDeque<(Duration, Length)>,
}

/// Longest demand history retained for the subrelease guard.
const DEMAND_HISTORY: Duration = Duration::from_secs(600);

impl Filler {
    #[must_use]
    pub fn new(vm: Arc<dyn VirtualMemory>, clock: Arc<dyn Clock>, separate_buckets: bool) -> Self {
        let empty_lists = || vec![Vec::new(); PAGES_PER_HUGEPAGE + 1];
        Self {
            vm,
            clock,
            separate_buckets,
            trackers: Vec::new(),
            free_ids: Vec::new(),
            lists: [empty_lists(), empty_lists()],
            donated_lists: empty_lists(),
            size: HugeLength::zero(),
            used_pages: Length::zero(),
            free_backed: Length::zero(),
            released_pages: Length::zero(),
            demand: VecDeque::new(),
        }
    }

    fn bucket_of(&self, objects_per_span: usize) -> usize {
        if self.separate_buckets && objects_per_span > FEW_OBJECTS_LIMIT {
            1
        } else {
            0
        }
    }

    /// Construct a tracker for `hp`. It is not yet part of the filler;
    /// callers carve the initial allocation with [`Filler::alloc_first`] and
    /// then [`Filler::contribute`] it.
    pub fn new_tracker(&mut self, hp: HugePage, donated: bool) -> TrackerId {
        let pt = PageTracker::new(hp, self.clock.now(), donated);
        match self.free_ids.pop() {
            Some(idx) => {
                self.trackers[idx] = Some(pt);
                TrackerId(idx)
            }
            None => {
                self.trackers.push(Some(pt));
                TrackerId(self.trackers.len() - 1)
            }
        }
    }

    #[must_use]
    pub fn tracker(&self, id: TrackerId) -> &PageTracker {
        self.trackers[id.0].as_ref().expect("stale tracker id")
    }

    pub fn tracker_mut(&mut self, id: TrackerId) -> &mut PageTracker {
        self.trackers[id.0].as_mut().expect("stale tracker id")
    }

    /// Destroy a tracker the filler no longer indexes.
    pub fn destroy_tracker(&mut self, id: TrackerId) -> PageTracker {
        let pt = self.trackers[id.0].take().expect("stale tracker id");
        assert_eq!(pt.placement, Placement::None, "tracker still indexed");
        self.free_ids.push(id.0);
        pt
    }

    /// Carve the first `n` pages of a fresh, not-yet-contributed tracker.
    pub fn alloc_first(&mut self, id: TrackerId, n: Length) -> PageId {
        let pt = self.tracker_mut(id);
        assert_eq!(pt.placement, Placement::None);
        assert!(pt.longest_free_range() >= n, "fresh tracker too small");
        let (page, rebacked) = pt.get(n);
        assert_eq!(rebacked, Length::zero());
        assert_eq!(page, pt.location.first_page());
        page
    }

    /// Insert a tracker into the packing index.
    pub fn contribute(&mut self, id: TrackerId, donated: bool, objects_per_span: usize) {
        let bucket = self.bucket_of(objects_per_span);
        let pt = self.tracker_mut(id);
        assert_eq!(pt.placement, Placement::None);
        assert_eq!(pt.donated(), donated);
        let used = pt.used_pages();
        let backed_free = pt.backed_free_pages();
        let released = Length(pt.released_count);
        self.size += HugeLength(1);
        self.used_pages += used;
        self.free_backed += backed_free;
        self.released_pages += released;
        self.index(id, if donated { None } else { Some(bucket) });
        self.record_demand();
    }

    /// Best-fit allocation: the indexed hugepage with the smallest
    /// sufficient longest free range. Donated tails are used only when no
    /// regular hugepage fits.
    pub fn try_get(&mut self, n: Length, objects_per_span: usize) -> Option<(TrackerId, PageId)> {
        assert!(n > Length::zero());
        let bucket = self.bucket_of(objects_per_span);
        let id = Self::pop_from(&mut self.lists[bucket], n)
            .or_else(|| Self::pop_from(&mut self.donated_lists, n))?;
        let pt = self.trackers[id.0].as_mut().expect("stale tracker id");
        pt.placement = Placement::None;
        pt.donated = false;
        let (page, rebacked) = pt.get(n);
        self.used_pages += n;
        self.free_backed -= n - rebacked;
        self.released_pages -= rebacked;
        self.index(id, Some(bucket));
        self.record_demand();
        Some((id, page))
    }

    /// Return `[p, p + n)` to the tracker's hugepage. If that empties the
    /// hugepage the tracker is unlinked and its id handed back to the
    /// caller, who now owns the hugepage.
    pub fn put(
        &mut self,
        id: TrackerId,
        p: PageId,
        n: Length,
        objects_per_span: usize,
    ) -> Option<TrackerId> {
        let bucket = self.bucket_of(objects_per_span);
        self.unlink(id);
        let pt = self.trackers[id.0].as_mut().expect("stale tracker id");
        pt.put(p, n);
        self.used_pages -= n;
        self.free_backed += n;
        self.record_demand();
        let pt = self.trackers[id.0].as_ref().expect("stale tracker id");
        if pt.used_pages() == Length::zero() {
            self.size -= HugeLength(1);
            self.free_backed -= pt.backed_free_pages();
            self.released_pages -= Length(pt.released_count);
            return Some(id);
        }
        let donated = pt.donated();
        self.index(id, if donated { None } else { Some(bucket) });
        None
    }

    /// Un-back up to `target` free pages. A demand peak within the skip
    /// intervals limits how deep the cut may go unless `hit_limit` is set.
    /// Returns the pages actually released.
    pub fn release_pages(
        &mut self,
        target: Length,
        intervals: SkipSubreleaseIntervals,
        release_partial_alloc_pages: bool,
        hit_limit: bool,
    ) -> Length {
        let cap = self.releasable(intervals, hit_limit);
        let mut budget = target.min(cap);
        let mut released = Length::zero();

        // Hugepages that already lost pages release their remaining free
        // pages first; with the partial-alloc policy they do so even beyond
        // the requested target.
        let mut candidates = self.indexed_trackers();
        candidates.sort_by_key(|&id| {
            let pt = self.tracker(id);
            (
                !pt.released(),
                std::cmp::Reverse(pt.backed_free_pages()),
                pt.created_at(),
            )
        });

        for id in candidates {
            let pt = self.tracker(id);
            let available = pt.backed_free_pages();
            if available == Length::zero() {
                continue;
            }
            let eager_partial = release_partial_alloc_pages && pt.released();
            if budget == Length::zero() && !eager_partial {
                break;
            }
            let want = if eager_partial {
                available
            } else {
                available.min(budget)
            };
            let got = self.release_from_tracker(id, want);
            released += got;
            budget = budget.saturating_sub(got);
        }

        released
    }

    /// Free backed pages currently available for subrelease, after the
    /// demand-peak guard.
    fn releasable(&self, intervals: SkipSubreleaseIntervals, hit_limit: bool) -> Length {
        if hit_limit {
            return self.free_backed;
        }
        let window = intervals.longest();
        if window.is_zero() {
            return self.free_backed;
        }
        let now = self.clock.now();
        let horizon = now.saturating_sub(window);
        let mut peak = self.used_pages;
        for &(t, used) in &self.demand {
            if t >= horizon {
                peak = peak.max(used);
            }
        }
        let headroom = peak.saturating_sub(self.used_pages);
        self.free_backed.saturating_sub(headroom)
    }

    /// Hugepages under filler management.
    #[must_use]
    pub fn size(&self) -> HugeLength {
        self.size
    }

    /// Pages handed out across all filler hugepages.
    #[must_use]
    pub fn used_pages(&self) -> Length {
        self.used_pages
    }

    /// Free pages still backed.
    #[must_use]
    pub fn free_pages(&self) -> Length {
        self.free_backed
    }

    /// Free pages whose backing has been returned.
    #[must_use]
    pub fn released_pages(&self) -> Length {
        self.released_pages
    }

    #[must_use]
    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: self.size.in_bytes(),
            free_bytes: self.free_backed.in_bytes(),
            unmapped_bytes: self.released_pages.in_bytes(),
        }
    }

    pub fn add_span_stats(&self, small: Option<&mut SmallSpanStats>, large: Option<&mut LargeSpanStats>) {
        let Some(small) = small else { return };
        let _ = large; // filler free runs never reach a whole hugepage
        for id in self.indexed_trackers() {
            let pt = self.tracker(id);
            let mut run_start = None;
            let mut run_released = false;
            for idx in 0..=PAGES_PER_HUGEPAGE {
                let state = if idx < PAGES_PER_HUGEPAGE && !pt.used.is_set(idx) {
                    Some(pt.released.is_set(idx))
                } else {
                    None
                };
                match (state, run_start) {
                    (Some(rel), None) => {
                        run_start = Some(idx);
                        run_released = rel;
                    }
                    (Some(rel), Some(s)) if rel != run_released => {
                        small.record(Length(idx - s), run_released);
                        run_start = Some(idx);
                        run_released = rel;
                    }
                    (None, Some(s)) => {
                        small.record(Length(idx - s), run_released);
                        run_start = None;
                    }
                    _ => {}
                }
            }
        }
    }

    fn indexed_trackers(&self) -> Vec<TrackerId> {
        let mut out = Vec::new();
        for lists in self.lists.iter().chain(std::iter::once(&self.donated_lists)) {
            for list in lists {
                out.extend_from_slice(list);
            }
        }
        out
    }

    fn release_from_tracker(&mut self, id: TrackerId, want: Length) -> Length {
        if want == Length::zero() {
            return Length::zero();
        }
        let location = self.tracker(id).location();
        let runs = self.tracker(id).backed_free_runs();

        let mut taken = Length::zero();
        for (start, len) in runs {
            if taken >= want {
                break;
            }
            let take = (want - taken).min(Length(len)).raw();
            let addr = (location.first_page() + Length(start)).addr();
            let ok = self.vm.release(addr, take << crate::pages::PAGE_SHIFT);
            assert!(ok, "provider refused to unback filler pages");
            let pt = self.trackers[id.0].as_mut().expect("stale tracker id");
            for idx in start..start + take {
                pt.released.set_bit(idx);
            }
            pt.released_count += take;
            pt.donated = false;
            taken += Length(take);
        }
        self.free_backed -= taken;
        self.released_pages += taken;
        taken
    }

    fn index(&mut self, id: TrackerId, bucket: Option<usize>) {
        let lfr = self.tracker(id).longest_free_range().raw();
        if lfr == 0 {
            // Fully allocated hugepages stay out of the index; `put` will
            // re-index them when pages come back.
            self.tracker_mut(id).placement = Placement::None;
            return;
        }
        match bucket {
            Some(b) => {
                self.lists[b][lfr].push(id);
                self.tracker_mut(id).placement = Placement::Regular(b);
            }
            None => {
                self.donated_lists[lfr].push(id);
                self.tracker_mut(id).placement = Placement::Donated;
            }
        }
    }

    fn unlink(&mut self, id: TrackerId) {
        let placement = self.tracker(id).placement;
        let lfr = self.tracker(id).longest_free_range().raw();
        let list = match placement {
            Placement::None => return,
            Placement::Regular(b) => &mut self.lists[b][lfr],
            Placement::Donated => &mut self.donated_lists[lfr],
        };
        let pos = list
            .iter()
            .position(|&x| x == id)
            .expect("tracker missing from its list");
        list.remove(pos);
        self.tracker_mut(id).placement = Placement::None;
    }

    fn pop_from(lists: &mut [Vec<TrackerId>], n: Length) -> Option<TrackerId> {
        for lfr in n.raw()..lists.len() {
            if let Some(&id) = lists[lfr].first() {
                lists[lfr].remove(0);
                return Some(id);
            }
        }
        None
    }

    fn record_demand(&mut self) {
        let now = self.clock.now();
        self.demand.push_back((now, self.used_pages));
        let horizon = now.saturating_sub(DEMAND_HISTORY);
        while let Some(&(t, _)) = self.demand.front() {
            if t < horizon {
                self.demand.pop_front();
            } else {
                break;
            }
        }
    }
}
