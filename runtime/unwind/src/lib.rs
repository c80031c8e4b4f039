//! Redzone Unwind - call-site provenance without a symbol table
//!
//! # Purpose
//! Walks the chain of active call frames through the frame-pointer linkage
//! and names every frame from the tag the toolchain leaves in front of each
//! function entry. The heap uses it to record who made each allocation.
//!
//! # Integration Points
//! - Depends on: nothing (no allocator, no formatting beyond `core::fmt`)
//! - Provides to: `redzone-heap` (allocation provenance), panic handlers
//!
//! # Architecture
//! ```text
//!   frame_pointer()  ──► Unwinder::walk ──► RawFrame { resume_addr, entry }
//!                              │                         │
//!                         Memory window             name_of(entry)
//!                      (LiveMemory/ImageMemory)          │
//!                                                        ▼
//!                                   CallFrame { resume_addr, offset, name }
//! ```
//!
//! Capturing stores only [`RawFrame`]s (two words). Names are resolved when
//! a report is written, so a capture costs a handful of loads per frame.
//!
//! # Testing Strategy
//! - Unit tests: tag decoding, window bounds, chain walking over a stack image
//! - The live path ([`frame_pointer`]) only exists on ARM targets

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

use core::fmt;

use static_assertions::const_assert_eq;

mod layout;
mod memory;
mod name;
mod unwinder;

pub use layout::FrameLayout;
pub use memory::{ImageMemory, LiveMemory, Memory};
pub use name::{name_of, MAX_NAME_LEN, NAME_MARKER, UNKNOWN_NAME};
pub use unwinder::{frame_pointer, Unwinder};

/// One captured frame before name resolution
///
/// Plain words, so it can be stored in-band next to heap data and read
/// back whatever the bytes hold.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrame {
    /// Address execution resumes at in the caller
    pub resume_addr: usize,

    /// Entry point of the function containing `resume_addr`
    pub entry: usize,
}

const_assert_eq!(core::mem::size_of::<RawFrame>(), 2 * core::mem::size_of::<usize>());

impl RawFrame {
    pub const EMPTY: Self = Self {
        resume_addr: 0,
        entry: 0,
    };
}

/// One level of the caller chain, resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    /// Address execution resumes at in the caller
    pub resume_addr: usize,

    /// `resume_addr` minus the function entry (0 when the name is unknown)
    pub offset: usize,

    /// Function name, or [`UNKNOWN_NAME`]
    pub name: &'static str,
}

impl CallFrame {
    pub const EMPTY: Self = Self {
        resume_addr: 0,
        offset: 0,
        name: UNKNOWN_NAME,
    };

    /// Whether the name came from a tag
    pub fn is_resolved(&self) -> bool {
        self.name != UNKNOWN_NAME
    }
}

impl fmt::Display for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} at {}+{}", self.resume_addr, self.name, self.offset)
    }
}

/// Source of allocation provenance
///
/// Implemented by [`Unwinder`]; heaps take it as a parameter so provenance
/// can be switched off ([`NoBacktrace`]) or scripted in tests.
pub trait Backtrace {
    /// Capture the caller chain into `out`, innermost first
    ///
    /// Returns the number of frames written.
    fn capture(&self, out: &mut [RawFrame]) -> usize;

    /// Resolve a captured frame
    fn symbolize(&self, frame: RawFrame) -> CallFrame;
}

/// Provenance disabled: captures nothing, resolves to the placeholder
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBacktrace;

impl Backtrace for NoBacktrace {
    fn capture(&self, _out: &mut [RawFrame]) -> usize {
        0
    }

    fn symbolize(&self, frame: RawFrame) -> CallFrame {
        CallFrame {
            resume_addr: frame.resume_addr,
            offset: 0,
            name: UNKNOWN_NAME,
        }
    }
}
