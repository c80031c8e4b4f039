//! In-band allocation records
//!
//! Every block starts with a fixed-size header. The header, both guard zones
//! and the payload are contiguous and the next record follows immediately:
//!
//! ```text
//!   ┌──────────┬────────┬───────┬────────┬──────────┬─────────┬─────────────┐
//!   │ capacity │ status │ depth │ reqsz  │ serial   │ K frames│ lead guard  │
//!   └──────────┴────────┴───────┴────────┴──────────┴─────────┴─────────────┘
//!   ┌─────────────────────────────────────┬─────────────┬────────────────────┐
//!   │ payload (capacity bytes)            │ trail guard │ next record header │
//!   └─────────────────────────────────────┴─────────────┴────────────────────┘
//! ```
//!
//! The trailing guard starts right after the *requested* bytes, so it sits
//! inside the rounding slack when there is any and catches one-byte overruns.
//!
//! All header fields are plain integers: reading a header back from memory
//! user code may have scribbled on yields garbage values, never an invalid
//! Rust value.

use redzone_unwind::RawFrame;
use static_assertions::const_assert;

use crate::config::{MIN_BLOCK_SIZE, PROVENANCE_DEPTH};

/// Allocation state of a block
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Free = 0,
    Used = 1,
}

impl BlockStatus {
    /// Decode a raw header status word
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Free),
            1 => Some(Self::Used),
            _ => None,
        }
    }
}

/// Block header stored immediately before the leading guard zone
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordHeader {
    /// Payload bytes available (multiple of `MIN_BLOCK_SIZE`)
    pub capacity: usize,

    /// Raw [`BlockStatus`]
    pub status: u32,

    /// Valid entries in `frames`
    pub depth: u32,

    /// Size the caller asked for
    pub requested: usize,

    /// Allocation serial number (ledger key)
    pub serial: u64,

    /// Provenance, innermost frame first
    pub frames: [RawFrame; PROVENANCE_DEPTH],
}

/// Size of [`RecordHeader`] in bytes
pub const HEADER_SIZE: usize = core::mem::size_of::<RecordHeader>();

const_assert!(HEADER_SIZE % MIN_BLOCK_SIZE == 0);
const_assert!(core::mem::align_of::<RecordHeader>() <= MIN_BLOCK_SIZE);

impl RecordHeader {
    /// Header of a free block
    pub const fn free(capacity: usize) -> Self {
        Self {
            capacity,
            status: BlockStatus::Free as u32,
            depth: 0,
            requested: 0,
            serial: 0,
            frames: [RawFrame::EMPTY; PROVENANCE_DEPTH],
        }
    }

    pub fn status(&self) -> Option<BlockStatus> {
        BlockStatus::from_raw(self.status)
    }

    pub fn set_status(&mut self, status: BlockStatus) {
        self.status = status as u32;
    }

    /// Recorded frames (clamped, the depth word may be damaged)
    pub fn provenance(&self) -> &[RawFrame] {
        let depth = (self.depth as usize).min(PROVENANCE_DEPTH);
        &self.frames[..depth]
    }
}
