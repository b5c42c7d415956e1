//! # hugeheap-core
//!
//! A hugepage-aware page heap: requests phrased in fixed-size pages are
//! packed onto host hugepages to keep TLB coverage high and resident-set
//! bloat low.
//!
//! The crate is the policy and metadata layer. It allocates address space
//! through the [`vm::VirtualMemory`] trait and never issues system calls
//! itself; [`vm::SimVirtualMemory`] is the bookkeeping provider the tests
//! and benchmarks run against. The central type is
//! [`allocator::HugePageAwareAllocator`], which routes each request across
//! four backends: the [`filler`] (per-hugepage packing), the [`region`] set
//! (multi-hugepage linear packing), the [`huge_cache`] (free backed
//! hugepages) and the [`huge_alloc`] raw reservation layer.

#![forbid(unsafe_code)]

pub mod allocator;
pub mod bitmap;
pub mod filler;
pub mod huge_alloc;
pub mod huge_cache;
pub mod lifetime;
pub mod pagemap;
pub mod pages;
pub mod params;
pub mod region;
pub mod span;
pub mod stats;
pub mod vm;

pub use allocator::HugePageAwareAllocator;
pub use pages::{HugeLength, HugePage, Length, PageId, PAGES_PER_HUGEPAGE};
pub use params::{Options, Parameters, StaticForwarder};
pub use span::Span;
pub use vm::{MemoryTag, SimVirtualMemory};
