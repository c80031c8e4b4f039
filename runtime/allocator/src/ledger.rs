//! Allocation ledger
//!
//! Append-only history of allocations, one snapshot per `allocate`. Entries
//! are never removed; releasing a block only flips its status. Storage is
//! supplied by the caller (usually a static array) because the heap cannot
//! allocate its own bookkeeping.
//!
//! Entries are keyed by the allocation serial. Serials are handed out in
//! increasing order and entries are appended in that order, so lookups are a
//! binary search.

use redzone_unwind::RawFrame;

use crate::config::PROVENANCE_DEPTH;
use crate::record::{BlockStatus, RecordHeader};
use crate::{HeapError, Result};

/// Snapshot of one allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Allocation serial number
    pub serial: u64,

    /// Payload address handed to the caller
    pub address: usize,

    /// Size the caller asked for
    pub requested: usize,

    /// `Used` until the block is released
    pub status: BlockStatus,

    pub(crate) depth: usize,
    pub(crate) frames: [RawFrame; PROVENANCE_DEPTH],
}

impl LedgerEntry {
    pub const EMPTY: Self = Self {
        serial: 0,
        address: 0,
        requested: 0,
        status: BlockStatus::Free,
        depth: 0,
        frames: [RawFrame::EMPTY; PROVENANCE_DEPTH],
    };

    pub(crate) fn snapshot(header: &RecordHeader, address: usize) -> Self {
        let provenance = header.provenance();
        let mut frames = [RawFrame::EMPTY; PROVENANCE_DEPTH];
        frames[..provenance.len()].copy_from_slice(provenance);

        Self {
            serial: header.serial,
            address,
            requested: header.requested,
            status: BlockStatus::Used,
            depth: provenance.len(),
            frames,
        }
    }

    /// Frames captured when the block was allocated
    pub fn provenance(&self) -> &[RawFrame] {
        &self.frames[..self.depth]
    }
}

impl Default for LedgerEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Fixed-capacity allocation history
#[derive(Debug)]
pub struct Ledger<'l> {
    entries: &'l mut [LedgerEntry],
    len: usize,
}

impl<'l> Ledger<'l> {
    /// Create an empty ledger over `storage`
    pub fn new(storage: &'l mut [LedgerEntry]) -> Self {
        Self {
            entries: storage,
            len: 0,
        }
    }

    /// A ledger that can hold nothing
    pub fn disabled() -> Self {
        Self {
            entries: &mut [],
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.entries.len()
    }

    /// Append a snapshot
    ///
    /// # Errors
    /// `LedgerOverflow` when every slot is taken; the ledger is unchanged.
    pub fn record(&mut self, entry: LedgerEntry) -> Result<()> {
        let capacity = self.entries.len();
        debug_assert!(self.len == 0 || self.entries[self.len - 1].serial < entry.serial);

        let Some(slot) = self.entries.get_mut(self.len) else {
            return Err(HeapError::LedgerOverflow { capacity });
        };
        *slot = entry;
        self.len += 1;
        Ok(())
    }

    /// Mark the entry for `serial` released
    ///
    /// Returns `false` if the allocation was never recorded.
    pub fn mark_freed(&mut self, serial: u64) -> bool {
        match self.position(serial) {
            Some(index) => {
                self.entries[index].status = BlockStatus::Free;
                true
            }
            None => false,
        }
    }

    /// Entry for `serial`
    pub fn get(&self, serial: u64) -> Option<&LedgerEntry> {
        self.position(serial).map(|index| &self.entries[index])
    }

    /// Every recorded entry, oldest first
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries[..self.len]
    }

    /// Entries whose block was never released
    pub fn outstanding(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries().iter().filter(|entry| entry.status == BlockStatus::Used)
    }

    fn position(&self, serial: u64) -> Option<usize> {
        self.entries()
            .binary_search_by_key(&serial, |entry| entry.serial)
            .ok()
    }
}
