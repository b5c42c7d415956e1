//! Live-span registry and per-hugepage tracker slots.
//!
//! The free path has only a page id to work with; this map answers the two
//! questions it asks: "which live span starts here?" and "does the filler
//! own this hugepage?". Tracker slots are kept in an explicit
//! hugepage-indexed map rather than a per-page side channel.

use std::collections::{BTreeMap, HashMap};

use crate::filler::TrackerId;
use crate::pages::{HugePage, Length, PageId};

/// What the registry remembers about a live span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanRecord {
    pub len: Length,
}

/// Page-indexed metadata for everything the heap has handed out.
#[derive(Default)]
pub struct PageMap {
    /// Live spans keyed by first page, ordered so containment queries work.
    spans: BTreeMap<PageId, SpanRecord>,
    /// Filler tracker slot per hugepage.
    trackers: HashMap<HugePage, TrackerId>,
}

impl PageMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live span. The first page must not already be registered.
    pub fn insert_span(&mut self, first_page: PageId, len: Length) {
        let prev = self.spans.insert(first_page, SpanRecord { len });
        assert!(prev.is_none(), "span already registered at {first_page:?}");
    }

    /// Unregister the span starting at `first_page`.
    #[must_use]
    pub fn remove_span(&mut self, first_page: PageId) -> Option<SpanRecord> {
        self.spans.remove(&first_page)
    }

    /// The live span starting exactly at `first_page`, if any.
    #[must_use]
    pub fn span_at(&self, first_page: PageId) -> Option<SpanRecord> {
        self.spans.get(&first_page).copied()
    }

    /// The live span covering `page`, if any, with its first page.
    #[must_use]
    pub fn span_containing(&self, page: PageId) -> Option<(PageId, SpanRecord)> {
        let (&first, &rec) = self.spans.range(..=page).next_back()?;
        if page.0 < first.0 + rec.len.raw() {
            Some((first, rec))
        } else {
            None
        }
    }

    /// Number of live spans.
    #[must_use]
    pub fn live_spans(&self) -> usize {
        self.spans.len()
    }

    /// The filler tracker owning hugepage `hp`, if any.
    #[must_use]
    pub fn tracker(&self, hp: HugePage) -> Option<TrackerId> {
        self.trackers.get(&hp).copied()
    }

    /// Install or clear the tracker slot for `hp`.
    pub fn set_tracker(&mut self, hp: HugePage, id: Option<TrackerId>) {
        match id {
            Some(id) => {
                self.trackers.insert(hp, id);
            }
            None => {
                self.trackers.remove(&hp);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_registration_roundtrip() {
        let mut pm = PageMap::new();
        pm.insert_span(PageId(100), Length(5));
        assert_eq!(pm.span_at(PageId(100)), Some(SpanRecord { len: Length(5) }));
        assert_eq!(pm.span_at(PageId(101)), None);
        assert_eq!(
            pm.span_containing(PageId(104)),
            Some((PageId(100), SpanRecord { len: Length(5) }))
        );
        assert_eq!(pm.span_containing(PageId(105)), None);
        assert_eq!(pm.remove_span(PageId(100)), Some(SpanRecord { len: Length(5) }));
        assert_eq!(pm.remove_span(PageId(100)), None);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_span_panics() {
        let mut pm = PageMap::new();
        pm.insert_span(PageId(7), Length(1));
        pm.insert_span(PageId(7), Length(2));
    }

    #[test]
    fn tracker_slots_install_and_clear() {
        let mut pm = PageMap::new();
        assert_eq!(pm.tracker(HugePage(3)), None);
        pm.set_tracker(HugePage(3), Some(TrackerId(9)));
        assert_eq!(pm.tracker(HugePage(3)), Some(TrackerId(9)));
        pm.set_tracker(HugePage(3), None);
        assert_eq!(pm.tracker(HugePage(3)), None);
    }
}
