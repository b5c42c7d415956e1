//! Lifetime-predicted placement of large spans.
//!
//! Large spans that die quickly are worth segregating: if they land on
//! donated hugepage tails they pin those hugepages; in their own region the
//! whole hugepage cycles back quickly. The predictor keeps per-size-bucket
//! lifetime statistics, fed by two sources: frees of spans it placed
//! itself, and trackers attached to donated tails so a wrong "long-lived"
//! call still produces a sample.
//!
//! The predictor cannot own the allocator that owns it; it grows its region
//! set through the narrow [`RegionAlloc`] capability handed in per call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::pages::{HugeLength, Length, PageId};
use crate::params::LifetimeOptions;
use crate::region::{region_size, HugeRegion, HugeRegionSet};
use crate::stats::BackingStats;
use crate::vm::Clock;

/// Handle to a donated-tail lifetime tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimeTrackerId(pub usize);

/// Context collected before the pageheap lock is taken.
#[derive(Debug, Clone, Copy)]
pub struct LifetimeContext {
    bucket: usize,
    requested: Length,
}

/// Size bucket by power of two, so nearby sizes share statistics.
fn bucket_of(n: Length) -> usize {
    (usize::BITS - n.raw().leading_zeros()) as usize
}

const BUCKETS: usize = usize::BITS as usize + 1;

/// Collect the allocation context for a request of `n` pages.
///
/// Deliberately cheap and lock-free; the prediction itself happens later,
/// under the pageheap lock.
#[must_use]
pub fn collect_context(n: Length) -> LifetimeContext {
    LifetimeContext {
        bucket: bucket_of(n),
        requested: n,
    }
}

/// Outcome of asking the predictor for an allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationResult {
    page: Option<PageId>,
    predicted_short: bool,
}

impl AllocationResult {
    const MISS: AllocationResult = AllocationResult {
        page: None,
        predicted_short: false,
    };

    /// The page the predictor placed the span at, if it did.
    #[must_use]
    pub fn try_get_allocation(&self) -> Option<PageId> {
        self.page
    }

    /// Whether the request was classified short-lived.
    #[must_use]
    pub fn predicted_short(&self) -> bool {
        self.predicted_short
    }
}

/// Capability to allocate a fresh region, implemented by the policy engine.
pub trait RegionAlloc {
    fn alloc_region(&mut self, n: HugeLength) -> Option<HugeRegion>;
}

#[derive(Debug, Default, Clone, Copy)]
struct BucketStats {
    samples: u64,
    total: Duration,
}

impl BucketStats {
    fn record(&mut self, lifetime: Duration) {
        self.samples += 1;
        self.total += lifetime;
    }

    fn mean(&self) -> Option<Duration> {
        if self.samples == 0 {
            None
        } else {
            Some(self.total / self.samples as u32)
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveAlloc {
    bucket: usize,
    since: Duration,
}

#[derive(Debug, Clone, Copy)]
struct TrackedDonation {
    bucket: usize,
    since: Duration,
}

pub struct LifetimePredictor {
    options: LifetimeOptions,
    clock: Arc<dyn Clock>,
    buckets: [BucketStats; BUCKETS],
    regions: HugeRegionSet,
    /// Spans live in the lifetime regions.
    live: HashMap<PageId, LiveAlloc>,
    /// Donated-tail trackers.
    tracked: Vec<Option<TrackedDonation>>,
    free_ids: Vec<usize>,
    attaches: u64,
    short_predictions: u64,
}

impl LifetimePredictor {
    #[must_use]
    pub fn new(options: LifetimeOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            clock,
            buckets: [BucketStats::default(); BUCKETS],
            regions: HugeRegionSet::new(false),
            live: HashMap::new(),
            tracked: Vec::new(),
            free_ids: Vec::new(),
            attaches: 0,
            short_predictions: 0,
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    /// Serve `n` from the lifetime region when the context predicts a
    /// short-lived span.
    pub fn maybe_get(
        &mut self,
        n: Length,
        from_released: &mut bool,
        ctx: Option<&LifetimeContext>,
        region_alloc: &mut dyn RegionAlloc,
    ) -> AllocationResult {
        let Some(ctx) = ctx else {
            return AllocationResult::MISS;
        };
        if !self.options.enabled || !self.predicts_short(ctx.bucket) {
            return AllocationResult::MISS;
        }
        self.short_predictions += 1;
        debug_assert_eq!(ctx.requested, n);

        let mut page = PageId(0);
        if !self.regions.maybe_get(n, &mut page, from_released) {
            let Some(region) = region_alloc.alloc_region(region_size()) else {
                return AllocationResult {
                    page: None,
                    predicted_short: true,
                };
            };
            self.regions.contribute(region);
            let ok = self.regions.maybe_get(n, &mut page, from_released);
            assert!(ok, "fresh lifetime region must satisfy the request");
        }
        self.live.insert(
            page,
            LiveAlloc {
                bucket: ctx.bucket,
                since: self.clock.now(),
            },
        );
        AllocationResult {
            page: Some(page),
            predicted_short: true,
        }
    }

    /// Take back `[p, p + n)` if the lifetime regions own it, recording the
    /// observed lifetime.
    pub fn maybe_put(&mut self, p: PageId, n: Length) -> bool {
        let Some(live) = self.live.remove(&p) else {
            return false;
        };
        let lifetime = self.clock.now().saturating_sub(live.since);
        self.buckets[live.bucket].record(lifetime);
        let owned = self.regions.maybe_put(p, n);
        assert!(owned, "live lifetime span must belong to a region");
        true
    }

    /// Attach a tracker to a donated tail so the donation's lifetime feeds
    /// the statistics. Only predicted allocations are worth tracking.
    pub fn maybe_add_tracker(&mut self, result: &AllocationResult, n: Length) -> Option<LifetimeTrackerId> {
        if !self.options.enabled || result.try_get_allocation().is_some() {
            return None;
        }
        let donation = TrackedDonation {
            bucket: bucket_of(n),
            since: self.clock.now(),
        };
        self.attaches += 1;
        let idx = match self.free_ids.pop() {
            Some(idx) => {
                self.tracked[idx] = Some(donation);
                idx
            }
            None => {
                self.tracked.push(Some(donation));
                self.tracked.len() - 1
            }
        };
        Some(LifetimeTrackerId(idx))
    }

    /// Record the end of a tracked donation and retire the tracker.
    pub fn maybe_put_tracker(&mut self, id: Option<LifetimeTrackerId>, _n: Length) {
        let Some(LifetimeTrackerId(idx)) = id else {
            return;
        };
        let donation = self.tracked[idx].take().expect("stale lifetime tracker");
        self.free_ids.push(idx);
        let lifetime = self.clock.now().saturating_sub(donation.since);
        self.buckets[donation.bucket].record(lifetime);
    }

    /// Stats for the lifetime regions; `None` while prediction is disabled.
    #[must_use]
    pub fn region_stats(&self) -> Option<BackingStats> {
        if !self.options.enabled {
            return None;
        }
        Some(self.regions.stats())
    }

    #[must_use]
    pub fn attaches(&self) -> u64 {
        self.attaches
    }

    #[must_use]
    pub fn short_predictions(&self) -> u64 {
        self.short_predictions
    }

    fn predicts_short(&self, bucket: usize) -> bool {
        let stats = &self.buckets[bucket];
        if stats.samples < self.options.min_samples {
            return false;
        }
        match stats.mean() {
            Some(mean) => mean < self.options.short_lived_threshold,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huge_alloc::HugeAllocator;
    use crate::vm::{ManualClock, MemoryTag, SimVirtualMemory};

    struct TestRegionAlloc {
        alloc: HugeAllocator,
        vm: Arc<SimVirtualMemory>,
        refuse: bool,
    }

    impl RegionAlloc for TestRegionAlloc {
        fn alloc_region(&mut self, n: HugeLength) -> Option<HugeRegion> {
            if self.refuse {
                return None;
            }
            let range = self.alloc.get(n)?;
            Some(HugeRegion::new(range, self.vm.clone()))
        }
    }

    fn setup(enabled: bool) -> (Arc<ManualClock>, LifetimePredictor, TestRegionAlloc) {
        let vm = Arc::new(SimVirtualMemory::new());
        let clock = Arc::new(ManualClock::new());
        let options = LifetimeOptions {
            enabled,
            short_lived_threshold: Duration::from_millis(500),
            min_samples: 2,
        };
        let predictor = LifetimePredictor::new(options, clock.clone());
        let region_alloc = TestRegionAlloc {
            alloc: HugeAllocator::new(vm.clone(), MemoryTag::Normal),
            vm,
            refuse: false,
        };
        (clock, predictor, region_alloc)
    }

    fn feed_short_samples(predictor: &mut LifetimePredictor, clock: &ManualClock, n: Length) {
        for _ in 0..2 {
            let result = AllocationResult::MISS;
            let id = predictor.maybe_add_tracker(&result, n);
            clock.advance(Duration::from_millis(10));
            predictor.maybe_put_tracker(id, n);
        }
    }

    #[test]
    fn disabled_predictor_never_hits() {
        let (_, mut p, mut ra) = setup(false);
        let ctx = collect_context(Length(300));
        let mut fr = false;
        let result = p.maybe_get(Length(300), &mut fr, Some(&ctx), &mut ra);
        assert!(result.try_get_allocation().is_none());
        assert!(!result.predicted_short());
        assert!(p.region_stats().is_none());
    }

    #[test]
    fn cold_buckets_are_not_predicted() {
        let (_, mut p, mut ra) = setup(true);
        let ctx = collect_context(Length(300));
        let mut fr = false;
        let result = p.maybe_get(Length(300), &mut fr, Some(&ctx), &mut ra);
        assert!(result.try_get_allocation().is_none());
        assert!(!result.predicted_short());
    }

    #[test]
    fn short_lived_bucket_routes_to_region() {
        let (clock, mut p, mut ra) = setup(true);
        feed_short_samples(&mut p, &clock, Length(300));

        let ctx = collect_context(Length(300));
        let mut fr = false;
        let result = p.maybe_get(Length(300), &mut fr, Some(&ctx), &mut ra);
        let page = result.try_get_allocation().expect("routed to region");
        assert!(result.predicted_short());
        assert!(fr, "fresh region needs backing");
        assert_eq!(p.short_predictions(), 1);

        // The free is claimed by the predictor and feeds the stats.
        clock.advance(Duration::from_millis(5));
        assert!(p.maybe_put(page, Length(300)));
        assert!(!p.maybe_put(page, Length(300)), "span no longer live");
    }

    #[test]
    fn long_lifetimes_turn_prediction_off_again() {
        let (clock, mut p, mut ra) = setup(true);
        feed_short_samples(&mut p, &clock, Length(300));

        // Two slow deaths drag the mean above the threshold.
        for _ in 0..2 {
            let id = p.maybe_add_tracker(&AllocationResult::MISS, Length(300));
            clock.advance(Duration::from_secs(10));
            p.maybe_put_tracker(id, Length(300));
        }
        let ctx = collect_context(Length(300));
        let mut fr = false;
        let result = p.maybe_get(Length(300), &mut fr, Some(&ctx), &mut ra);
        assert!(result.try_get_allocation().is_none());
    }

    #[test]
    fn refused_region_keeps_the_prediction_flag() {
        let (clock, mut p, mut ra) = setup(true);
        feed_short_samples(&mut p, &clock, Length(300));
        ra.refuse = true;

        let ctx = collect_context(Length(300));
        let mut fr = false;
        let result = p.maybe_get(Length(300), &mut fr, Some(&ctx), &mut ra);
        assert!(result.try_get_allocation().is_none());
        assert!(result.predicted_short());
    }

    #[test]
    fn trackers_only_attach_for_unserved_requests() {
        let (clock, mut p, mut ra) = setup(true);
        feed_short_samples(&mut p, &clock, Length(300));

        let ctx = collect_context(Length(300));
        let mut fr = false;
        let served = p.maybe_get(Length(300), &mut fr, Some(&ctx), &mut ra);
        assert!(p.maybe_add_tracker(&served, Length(300)).is_none());
        assert!(p.maybe_add_tracker(&AllocationResult::MISS, Length(300)).is_some());
    }
}
