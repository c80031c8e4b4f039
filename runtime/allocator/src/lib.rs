//! Redzone Heap - first-fit allocator with allocation provenance
//!
//! # Purpose
//! Carves dynamic memory out of a raw address range for freestanding
//! programs that have no platform allocator. Every block carries a header
//! recording who allocated it, guard zones that catch overruns, and a
//! ledger entry used for leak reports.
//!
//! # Integration Points
//! - Depends on: `redzone-unwind` (provenance capture and name resolution)
//! - Provides to: freestanding binaries (directly or through [`LockedHeap`])
//! - Reports go to a caller-supplied `core::fmt::Write` sink (a console)
//!
//! # Architecture
//! ```text
//!   allocate(size)
//!     │
//!     ├─► first-fit scan from region start ──► split if worthwhile
//!     │         │ (no fit)
//!     │         └─► HeapRegion::grow
//!     ├─► Backtrace::capture ──► header.frames
//!     └─► Ledger::record
//!
//!   deallocate(ptr)
//!     ├─► header at ptr - (HEADER_SIZE + guard_len)
//!     ├─► guard check ──► Reporter::guard_damage (block is still released)
//!     ├─► Ledger::mark_freed(serial)
//!     └─► forward coalesce
//! ```
//!
//! The search restarts at the region start on every call: O(n) per
//! allocation, O(n²) for n allocations. Freed blocks merge only with the
//! blocks that follow them.
//!
//! # Testing Strategy
//! - Unit tests: configuration, headers, region growth, ledger, reports,
//!   split and coalesce edge cases
//! - Integration tests: partition invariant, reuse, coalescing, corruption
//!   and leak reports (`tests/integration_test.rs`)
//! - Benchmarks: first-fit scan cost (`benches/first_fit.rs`)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

mod config;
mod global;
mod heap;
mod ledger;
mod record;
mod region;
mod report;

pub use config::{
    round_up, Diagnostics, HeapConfig, LedgerPolicy, DEFAULT_GUARD_BYTE, DEFAULT_GUARD_LEN,
    MIN_BLOCK_SIZE, PROVENANCE_DEPTH,
};
pub use global::LockedHeap;
pub use heap::{BlockInfo, Blocks, Heap, HeapStats};
pub use ledger::{Ledger, LedgerEntry};
pub use record::{BlockStatus, HEADER_SIZE};
pub use region::HeapRegion;
pub use report::{FixedSink, GuardDamage, NullSink, Reporter};

pub use redzone_unwind::{Backtrace, CallFrame, NoBacktrace, RawFrame, Unwinder};

use thiserror::Error;

/// Error types for heap operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("Invalid allocation size: {size}")]
    InvalidSize { size: usize },

    #[error("Out of heap memory (requested: {requested} bytes, available: {available})")]
    OutOfMemory { requested: usize, available: usize },

    #[error("Allocation ledger full ({capacity} entries)")]
    LedgerOverflow { capacity: usize },

    #[error("Pointer {address:#x} was not allocated by this heap")]
    ForeignPointer { address: usize },

    #[error("Block at {address:#x} released twice")]
    DoubleFree { address: usize },

    #[error("Invalid heap configuration: {reason}")]
    InvalidConfig { reason: &'static str },

    #[error("Heap partition broken at offset {offset:#x}")]
    BrokenPartition { offset: usize },
}

pub type Result<T> = core::result::Result<T, HeapError>;
