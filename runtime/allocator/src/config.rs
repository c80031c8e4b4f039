//! Heap configuration
//!
//! Layout constants are compile-time; diagnostics and guard zones are chosen
//! per heap through [`HeapConfig`].

use bitflags::bitflags;

use crate::{HeapError, Result};

/// Allocation granularity and smallest block a split may leave behind
pub const MIN_BLOCK_SIZE: usize = 8;

/// Call frames recorded per allocation (K)
pub const PROVENANCE_DEPTH: usize = 3;

/// Default guard zone length in bytes
pub const DEFAULT_GUARD_LEN: usize = 8;

/// Default guard sentinel (`'~'`)
pub const DEFAULT_GUARD_BYTE: u8 = 0x7e;

bitflags! {
    /// Diagnostic features enabled on a heap
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Diagnostics: u8 {
        /// Capture call frames for every allocation
        const PROVENANCE    = 1 << 0;

        /// Record every allocation in the ledger
        const LEDGER        = 1 << 1;

        /// Check guard zones when a block is released
        const VERIFY_GUARDS = 1 << 2;
    }
}

/// What `allocate` does once the ledger is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerPolicy {
    /// Allocate anyway; the block keeps in-band provenance but is left out
    /// of leak reports, which state how many went untracked
    #[default]
    Untracked,

    /// Fail with [`HeapError::LedgerOverflow`]
    Reject,
}

/// Per-heap configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Guard zone length on each side of a payload (0 disables guards)
    pub guard_len: usize,

    /// Sentinel written into guard zones
    pub guard_byte: u8,

    /// Behaviour on ledger overflow
    pub ledger_policy: LedgerPolicy,

    /// Enabled diagnostics
    pub diagnostics: Diagnostics,
}

impl HeapConfig {
    pub const DEFAULT: Self = Self {
        guard_len: DEFAULT_GUARD_LEN,
        guard_byte: DEFAULT_GUARD_BYTE,
        ledger_policy: LedgerPolicy::Untracked,
        diagnostics: Diagnostics::all(),
    };

    pub const fn with_guard_len(mut self, guard_len: usize) -> Self {
        self.guard_len = guard_len;
        self
    }

    pub const fn with_guard_byte(mut self, guard_byte: u8) -> Self {
        self.guard_byte = guard_byte;
        self
    }

    pub const fn with_ledger_policy(mut self, policy: LedgerPolicy) -> Self {
        self.ledger_policy = policy;
        self
    }

    pub const fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Bytes of header and guard zones around every payload
    pub const fn overhead(&self) -> usize {
        crate::record::HEADER_SIZE + 2 * self.guard_len
    }

    /// Check the configuration keeps every record header aligned
    pub fn validate(&self) -> Result<()> {
        if self.guard_len % MIN_BLOCK_SIZE != 0 {
            return Err(HeapError::InvalidConfig {
                reason: "guard length must be a multiple of the block granularity",
            });
        }
        let overhead = self
            .guard_len
            .checked_mul(2)
            .and_then(|guards| guards.checked_add(crate::record::HEADER_SIZE));
        if overhead.is_none() {
            return Err(HeapError::InvalidConfig {
                reason: "guard length too large",
            });
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Round `size` up to the block granularity
pub const fn round_up(size: usize) -> Option<usize> {
    match size.checked_add(MIN_BLOCK_SIZE - 1) {
        Some(padded) => Some(padded & !(MIN_BLOCK_SIZE - 1)),
        None => None,
    }
}
