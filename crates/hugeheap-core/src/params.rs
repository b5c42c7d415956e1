//! Construction options, process-global parameters, and the forwarder seam.
//!
//! `Options` is fixed at heap construction. Tunables that may change while
//! the process runs live in the atomic [`Parameters`] block and are read
//! per-call through a [`Forwarder`], so tests can substitute their own
//! forwarder without touching process-global state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pages::Length;
use crate::vm::MemoryTag;

/// Lifetime predictor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeOptions {
    pub enabled: bool,
    /// A size bucket whose mean observed lifetime stays below this counts
    /// as short-lived.
    pub short_lived_threshold: Duration,
    /// Samples required in a bucket before its prediction is trusted.
    pub min_samples: u64,
}

impl Default for LifetimeOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            short_lived_threshold: Duration::from_millis(500),
            min_samples: 16,
        }
    }
}

/// Heap construction options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// Tag applied to every range this heap reserves.
    pub tag: MemoryTag,
    /// Prefer growing regions over accepting donation slack.
    pub use_huge_region_more_often: bool,
    pub lifetime: LifetimeOptions,
    /// Bucket filler hugepages by object density.
    pub separate_allocs_for_few_and_many_objects_spans: bool,
}

/// Time windows during which recent demand peaks inhibit subrelease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipSubreleaseIntervals {
    pub peak_interval: Duration,
    pub short_interval: Duration,
    pub long_interval: Duration,
}

impl SkipSubreleaseIntervals {
    /// The widest configured window; zero when skipping is disabled.
    #[must_use]
    pub fn longest(&self) -> Duration {
        self.peak_interval
            .max(self.short_interval)
            .max(self.long_interval)
    }
}

static SKIP_PEAK_MS: AtomicU64 = AtomicU64::new(0);
static SKIP_SHORT_MS: AtomicU64 = AtomicU64::new(60_000);
static SKIP_LONG_MS: AtomicU64 = AtomicU64::new(300_000);
static RELEASE_PARTIAL_ALLOC_PAGES: AtomicBool = AtomicBool::new(false);
static HPAA_SUBRELEASE: AtomicBool = AtomicBool::new(true);

/// Process-global runtime tunables.
pub struct Parameters;

impl Parameters {
    #[must_use]
    pub fn filler_skip_subrelease_interval() -> Duration {
        Duration::from_millis(SKIP_PEAK_MS.load(Ordering::Relaxed))
    }

    pub fn set_filler_skip_subrelease_interval(d: Duration) {
        SKIP_PEAK_MS.store(d.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn filler_skip_subrelease_short_interval() -> Duration {
        Duration::from_millis(SKIP_SHORT_MS.load(Ordering::Relaxed))
    }

    pub fn set_filler_skip_subrelease_short_interval(d: Duration) {
        SKIP_SHORT_MS.store(d.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn filler_skip_subrelease_long_interval() -> Duration {
        Duration::from_millis(SKIP_LONG_MS.load(Ordering::Relaxed))
    }

    pub fn set_filler_skip_subrelease_long_interval(d: Duration) {
        SKIP_LONG_MS.store(d.as_millis() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn release_partial_alloc_pages() -> bool {
        RELEASE_PARTIAL_ALLOC_PAGES.load(Ordering::Relaxed)
    }

    pub fn set_release_partial_alloc_pages(v: bool) {
        RELEASE_PARTIAL_ALLOC_PAGES.store(v, Ordering::Relaxed);
    }

    #[must_use]
    pub fn hpaa_subrelease() -> bool {
        HPAA_SUBRELEASE.load(Ordering::Relaxed)
    }

    pub fn set_hpaa_subrelease(v: bool) {
        HPAA_SUBRELEASE.store(v, Ordering::Relaxed);
    }
}

/// Per-call parameter and hook seam between the policy engine and its host.
pub trait Forwarder: Send {
    fn skip_subrelease_intervals(&self) -> SkipSubreleaseIntervals;
    fn release_partial_alloc_pages(&self) -> bool;
    fn hpaa_subrelease(&self) -> bool;

    /// Usage-limit hook, called with the size of the in-flight allocation.
    /// The host may react by releasing memory elsewhere; the default does
    /// nothing.
    fn shrink_to_usage_limit(&mut self, n: Length) {
        let _ = n;
    }
}

/// Forwarder reading the process-global [`Parameters`].
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticForwarder;

impl Forwarder for StaticForwarder {
    fn skip_subrelease_intervals(&self) -> SkipSubreleaseIntervals {
        SkipSubreleaseIntervals {
            peak_interval: Parameters::filler_skip_subrelease_interval(),
            short_interval: Parameters::filler_skip_subrelease_short_interval(),
            long_interval: Parameters::filler_skip_subrelease_long_interval(),
        }
    }

    fn release_partial_alloc_pages(&self) -> bool {
        Parameters::release_partial_alloc_pages()
    }

    fn hpaa_subrelease(&self) -> bool {
        Parameters::hpaa_subrelease()
    }
}
