//! Virtual-memory provider interface.
//!
//! The heap never issues system calls itself; it asks a [`VirtualMemory`]
//! implementation for address ranges and for backing transitions. This crate
//! ships [`SimVirtualMemory`], a bookkeeping-only provider over a simulated
//! address space, which is what the tests and benchmarks run against. A
//! production provider wraps mmap/madvise and lives outside this crate.
//!
//! Providers are internally synchronized and independent of the pageheap
//! lock, so the heap may call out to them from locked regions without
//! deadlock risk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag applied to every range reserved by one heap instance.
///
/// The tag is encoded in the high address bits, so the process-level free
/// path can route a pointer back to the heap that produced it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTag {
    /// Ordinary heap memory.
    #[default]
    Normal,
    /// Sampled-allocation memory.
    Sampled,
    /// Infrequently accessed memory.
    Cold,
}

impl MemoryTag {
    const fn address_base(self) -> usize {
        match self {
            MemoryTag::Normal => 0x1000_0000_0000,
            MemoryTag::Sampled => 0x2000_0000_0000,
            MemoryTag::Cold => 0x3000_0000_0000,
        }
    }

    /// Decode the tag from an address, if the address belongs to a tagged
    /// region.
    #[must_use]
    pub const fn of_address(addr: usize) -> Option<MemoryTag> {
        match addr >> 44 {
            0x1 => Some(MemoryTag::Normal),
            0x2 => Some(MemoryTag::Sampled),
            0x3 => Some(MemoryTag::Cold),
            _ => None,
        }
    }
}

/// A reserved address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub addr: usize,
    pub bytes: usize,
}

/// Provider failures.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("address space exhausted reserving {bytes} bytes")]
    Exhausted { bytes: usize },
    #[error("alignment {align} is not a power of two")]
    BadAlignment { align: usize },
    #[error("range {addr:#x}+{bytes} is not part of any reservation")]
    UnknownRange { addr: usize, bytes: usize },
}

/// Abstract virtual-memory provider.
pub trait VirtualMemory: Send + Sync {
    /// Reserve `bytes` of address space aligned to `align`, tagged `tag`.
    ///
    /// The returned range is reserved but not yet resident; callers must
    /// [`VirtualMemory::back`] it before first use.
    fn alloc(&self, bytes: usize, align: usize, tag: MemoryTag) -> Result<AddressRange, VmError>;

    /// Return the physical pages behind `[addr, addr + bytes)` to the OS,
    /// keeping the address range reserved. Returns false if the provider
    /// could not honor the request.
    fn release(&self, addr: usize, bytes: usize) -> bool;

    /// Ensure `[addr, addr + bytes)` is resident. Returns false on failure.
    fn back(&self, addr: usize, bytes: usize) -> bool;
}

/// Simulated provider: a tagged bump reservation over a flat address space.
///
/// Reservations are tracked but carry no actual memory; `back`/`release`
/// only move the resident-byte counters. Counters are exposed so tests can
/// assert exactly how much address space a scenario consumed.
#[derive(Default)]
pub struct SimVirtualMemory {
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    /// Next free address per tag.
    cursors: BTreeMap<usize, usize>,
    /// Reserved ranges: start -> length in bytes.
    reservations: BTreeMap<usize, usize>,
    reserved_bytes: usize,
    backed_bytes: u64,
    released_bytes: u64,
    alloc_calls: u64,
}

impl SimVirtualMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total address space reserved so far.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().reserved_bytes
    }

    /// Number of successful `alloc` calls.
    #[must_use]
    pub fn alloc_calls(&self) -> u64 {
        self.state.lock().alloc_calls
    }

    /// Cumulative bytes passed to `back`.
    #[must_use]
    pub fn backed_bytes(&self) -> u64 {
        self.state.lock().backed_bytes
    }

    /// Cumulative bytes passed to `release`.
    #[must_use]
    pub fn released_bytes(&self) -> u64 {
        self.state.lock().released_bytes
    }

    fn covered(state: &SimState, addr: usize, bytes: usize) -> bool {
        match state.reservations.range(..=addr).next_back() {
            Some((&start, &len)) => addr >= start && addr + bytes <= start + len,
            None => false,
        }
    }
}

impl VirtualMemory for SimVirtualMemory {
    fn alloc(&self, bytes: usize, align: usize, tag: MemoryTag) -> Result<AddressRange, VmError> {
        if !align.is_power_of_two() {
            return Err(VmError::BadAlignment { align });
        }
        let mut state = self.state.lock();
        let cursor = state
            .cursors
            .entry(tag.address_base())
            .or_insert(tag.address_base());
        let addr = cursor.next_multiple_of(align);
        let end = addr.checked_add(bytes).ok_or(VmError::Exhausted { bytes })?;
        *cursor = end;
        state.reservations.insert(addr, bytes);
        state.reserved_bytes += bytes;
        state.alloc_calls += 1;
        Ok(AddressRange { addr, bytes })
    }

    fn release(&self, addr: usize, bytes: usize) -> bool {
        let mut state = self.state.lock();
        if !Self::covered(&state, addr, bytes) {
            return false;
        }
        state.released_bytes += bytes as u64;
        true
    }

    fn back(&self, addr: usize, bytes: usize) -> bool {
        let mut state = self.state.lock();
        if !Self::covered(&state, addr, bytes) {
            return false;
        }
        state.backed_bytes += bytes as u64;
        true
    }
}

/// Monotonic time source used for age-based release decisions.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall-clock implementation.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-advanced clock for deterministic tests.
#[derive(Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::Relaxed))
    }
}
