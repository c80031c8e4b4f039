//! Block store
//!
//! The heap region is tiled by records, each a header, a leading guard
//! zone, the payload and a trailing guard zone. A record's footprint is
//! `overhead + capacity`, so the next header is found by arithmetic alone.
//!
//! Allocation is first fit from the region start. A fit is split when the
//! remainder can hold a whole record with at least `MIN_BLOCK_SIZE` of
//! payload; otherwise the caller gets the whole block. When nothing fits
//! the region grows by exactly one footprint.
//!
//! Release merges the block with the Free records that follow it. Records
//! before it are never merged, so freeing neighbours back to front leaves
//! them separate.

use core::fmt::Write;
use core::ptr::NonNull;

use log::{debug, error, trace, warn};
use redzone_unwind::Backtrace;

use crate::config::{round_up, Diagnostics, HeapConfig, LedgerPolicy, MIN_BLOCK_SIZE};
use crate::ledger::{Ledger, LedgerEntry};
use crate::record::{BlockStatus, RecordHeader, HEADER_SIZE};
use crate::region::HeapRegion;
use crate::report::{GuardDamage, Reporter};
use crate::{HeapError, Result};

/// Running counters, reported at the top of every leak report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful `allocate` calls
    pub allocations: u64,

    /// Successful `deallocate` calls (null excluded)
    pub frees: u64,

    /// Sum of requested sizes
    pub bytes_requested: u64,

    /// Releases that found damaged guard zones
    pub corruptions: u64,

    /// Allocations left out of a full ledger
    pub untracked: u64,
}

/// One record as seen by [`Heap::blocks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the region start
    pub offset: usize,

    /// Payload address
    pub payload: usize,

    /// Payload bytes available
    pub capacity: usize,

    pub status: BlockStatus,

    /// Size last requested for this block
    pub requested: usize,

    /// Serial of the last allocation that used this block
    pub serial: u64,
}

/// Decode the record at `offset`
///
/// Returns the header, its status and the offset of the following record,
/// or `None` if the record does not tile the used part of the region.
fn step(
    region: &HeapRegion,
    overhead: usize,
    offset: usize,
) -> Option<(RecordHeader, BlockStatus, usize)> {
    let header = region.header(offset)?;
    let status = header.status()?;
    if header.capacity % MIN_BLOCK_SIZE != 0 {
        return None;
    }
    let next = offset.checked_add(overhead)?.checked_add(header.capacity)?;
    (next <= region.len()).then_some((header, status, next))
}

/// Iterator over the records of a heap, in address order
///
/// Stops early at the first record that does not tile the region; use
/// [`Heap::check_partition`] to tell the two cases apart.
pub struct Blocks<'h> {
    region: &'h HeapRegion,
    overhead: usize,
    lead: usize,
    offset: usize,
}

impl<'h> Blocks<'h> {
    fn new(region: &'h HeapRegion, config: &HeapConfig) -> Self {
        Self {
            region,
            overhead: config.overhead(),
            lead: HEADER_SIZE + config.guard_len,
            offset: 0,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        if self.offset >= self.region.len() {
            return None;
        }
        let Some((header, status, next)) = step(self.region, self.overhead, self.offset) else {
            self.offset = self.region.len();
            return None;
        };

        let info = BlockInfo {
            offset: self.offset,
            payload: self.region.start() + self.offset + self.lead,
            capacity: header.capacity,
            status,
            requested: header.requested,
            serial: header.serial,
        };
        self.offset = next;
        Some(info)
    }
}

/// A heap instance: region, ledger, diagnostics and report sink
///
/// Every piece of mutable state lives here, so independent heaps can run
/// side by side. Not thread-safe; wrap it in [`LockedHeap`](crate::LockedHeap)
/// to share it.
pub struct Heap<'l, B: Backtrace, W: Write> {
    region: HeapRegion,
    ledger: Ledger<'l>,
    config: HeapConfig,
    backtrace: B,
    reporter: Reporter<W>,
    stats: HeapStats,
    next_serial: u64,
}

impl<'l, B: Backtrace, W: Write> Heap<'l, B, W> {
    /// Create a heap over an empty region
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration is rejected or the region has
    /// already grown.
    pub fn new(
        region: HeapRegion,
        ledger: Ledger<'l>,
        config: HeapConfig,
        backtrace: B,
        sink: W,
    ) -> Result<Self> {
        config.validate()?;
        if !region.is_empty() {
            return Err(HeapError::InvalidConfig {
                reason: "heap region must start empty",
            });
        }

        debug!(
            "heap: {:#x} ceiling {} bytes, guard {} bytes, ledger {} entries",
            region.start(),
            region.ceiling(),
            config.guard_len,
            ledger.capacity()
        );

        Ok(Self {
            region,
            ledger,
            config,
            backtrace,
            reporter: Reporter::new(sink),
            stats: HeapStats::default(),
            next_serial: 1,
        })
    }

    /// Allocate `size` bytes
    ///
    /// The payload is aligned to `MIN_BLOCK_SIZE` and flanked by guard zones.
    ///
    /// # Errors
    /// - `InvalidSize` for a zero size or one too large to round
    /// - `LedgerOverflow` if the ledger is full under [`LedgerPolicy::Reject`]
    /// - `OutOfMemory` if no block fits and the region cannot grow
    /// - `BrokenPartition` if the search runs into a damaged header
    ///
    /// Nothing is changed when an error is returned.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let invalid = HeapError::InvalidSize { size };
        if size == 0 {
            return Err(invalid);
        }
        let rounded = round_up(size).ok_or(invalid)?;
        let overhead = self.config.overhead();
        let footprint = rounded.checked_add(overhead).ok_or(invalid)?;

        let tracked = self.config.diagnostics.contains(Diagnostics::LEDGER);
        if tracked && self.ledger.is_full() && self.config.ledger_policy == LedgerPolicy::Reject {
            return Err(HeapError::LedgerOverflow {
                capacity: self.ledger.capacity(),
            });
        }

        let (offset, capacity) = match self.find_fit(rounded)? {
            Some((offset, capacity)) => (offset, self.split(offset, capacity, rounded)),
            None => (self.region.grow(footprint)?, rounded),
        };

        let mut header = RecordHeader::free(capacity);
        header.set_status(BlockStatus::Used);
        header.requested = size;
        header.serial = self.next_serial;
        self.next_serial += 1;
        if self.config.diagnostics.contains(Diagnostics::PROVENANCE) {
            let depth = self.backtrace.capture(&mut header.frames);
            header.depth = depth.min(header.frames.len()) as u32;
        }
        self.region.write_header(offset, &header);
        self.write_guards(offset, size);

        let payload = offset + HEADER_SIZE + self.config.guard_len;
        let address = self.region.start() + payload;

        if tracked && self.ledger.record(LedgerEntry::snapshot(&header, address)).is_err() {
            self.stats.untracked += 1;
            if self.stats.untracked == 1 {
                warn!(
                    "heap: ledger full ({} entries), further allocations are not tracked",
                    self.ledger.capacity()
                );
            }
        }

        self.stats.allocations += 1;
        self.stats.bytes_requested += size as u64;
        trace!("heap: allocate({}) -> {:#x} (#{})", size, address, header.serial);

        Ok(self.region.ptr_at(payload))
    }

    /// Release the block whose payload starts at `ptr`
    ///
    /// A null pointer is ignored. Damaged guard zones are reported to the
    /// sink and the block is released anyway.
    ///
    /// # Errors
    /// - `ForeignPointer` if `ptr` is not the payload of a record in this heap
    /// - `DoubleFree` if the block is already free
    pub fn deallocate(&mut self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let address = ptr as usize;
        let (offset, mut header) = self.owning_record(address).ok_or_else(|| {
            error!("heap: release of foreign pointer {:#x}", address);
            HeapError::ForeignPointer { address }
        })?;

        if header.status() == Some(BlockStatus::Free) {
            error!("heap: double release of {:#x} (#{})", address, header.serial);
            return Err(HeapError::DoubleFree { address });
        }

        if self.config.diagnostics.contains(Diagnostics::VERIFY_GUARDS) {
            self.check_guards(offset, &header, address);
        }

        header.set_status(BlockStatus::Free);
        self.region.write_header(offset, &header);
        self.ledger.mark_freed(header.serial);
        self.stats.frees += 1;
        trace!("heap: deallocate({:#x}) (#{})", address, header.serial);

        self.coalesce(offset);
        Ok(())
    }

    /// Write the leak report to the sink
    ///
    /// Returns the number of tracked blocks still allocated.
    pub fn report_leaks(&mut self) -> usize {
        self.reporter.summary(&self.stats);

        let mut leaks = 0;
        for entry in self.ledger.outstanding() {
            self.reporter.leak(entry, &self.backtrace);
            leaks += 1;
        }
        if self.stats.untracked > 0 {
            self.reporter.untracked(self.stats.untracked);
        }
        leaks
    }

    /// Ledger entries for blocks never released
    pub fn leaks(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.ledger.outstanding()
    }

    /// Write every record to the sink between labelled banners
    pub fn dump(&mut self, label: &str) {
        self.reporter
            .dump_begin(label, self.region.start(), self.region.end_addr());
        for block in Blocks::new(&self.region, &self.config) {
            self.reporter.dump_block(&block);
        }
        self.reporter.dump_end(label);
    }

    /// Records in address order
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(&self.region, &self.config)
    }

    /// Check that records tile the region from start to end
    ///
    /// Returns the number of records.
    ///
    /// # Errors
    /// `BrokenPartition` with the offset of the first bad record.
    pub fn check_partition(&self) -> Result<usize> {
        let overhead = self.config.overhead();
        let mut offset = 0;
        let mut count = 0;
        while offset < self.region.len() {
            let (_, _, next) =
                step(&self.region, overhead, offset).ok_or(HeapError::BrokenPartition { offset })?;
            offset = next;
            count += 1;
        }
        Ok(count)
    }

    /// Report leaks and hand back the sink
    pub fn shutdown(mut self) -> W {
        let leaks = self.report_leaks();
        debug!("heap: shutdown with {} outstanding blocks", leaks);
        self.reporter.into_sink()
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn region(&self) -> &HeapRegion {
        &self.region
    }

    pub fn ledger(&self) -> &Ledger<'l> {
        &self.ledger
    }

    pub fn backtrace(&self) -> &B {
        &self.backtrace
    }

    pub fn sink(&self) -> &W {
        self.reporter.sink()
    }

    pub fn sink_mut(&mut self) -> &mut W {
        self.reporter.sink_mut()
    }

    /// First Free record with at least `rounded` bytes of payload
    fn find_fit(&self, rounded: usize) -> Result<Option<(usize, usize)>> {
        let overhead = self.config.overhead();
        let mut offset = 0;
        while offset < self.region.len() {
            let Some((header, status, next)) = step(&self.region, overhead, offset) else {
                error!("heap: damaged record at offset {:#x}", offset);
                return Err(HeapError::BrokenPartition { offset });
            };
            if status == BlockStatus::Free && header.capacity >= rounded {
                return Ok(Some((offset, header.capacity)));
            }
            offset = next;
        }
        Ok(None)
    }

    /// Carve a Free remainder off the record at `offset` if it is worth it
    ///
    /// Returns the capacity left to the record.
    fn split(&mut self, offset: usize, capacity: usize, rounded: usize) -> usize {
        let overhead = self.config.overhead();
        let spare = capacity - rounded;
        if spare < overhead + MIN_BLOCK_SIZE {
            return capacity;
        }

        let remainder = offset + overhead + rounded;
        self.region
            .write_header(remainder, &RecordHeader::free(spare - overhead));
        debug!(
            "heap: split record at {:#x}, {} bytes free at {:#x}",
            offset,
            spare - overhead,
            remainder
        );
        rounded
    }

    /// Merge the Free records following `offset` into it
    fn coalesce(&mut self, offset: usize) {
        let overhead = self.config.overhead();
        let Some(mut header) = self.region.header(offset) else {
            return;
        };

        let mut merged = 0;
        while let Some((next, BlockStatus::Free, _)) =
            step(&self.region, overhead, offset + overhead + header.capacity)
        {
            header.capacity += overhead + next.capacity;
            merged += 1;
        }

        if merged > 0 {
            self.region.write_header(offset, &header);
            debug!(
                "heap: merged {} record(s) into {:#x}, capacity {}",
                merged, offset, header.capacity
            );
        }
    }

    /// Header offset and header for a payload address
    fn owning_record(&self, address: usize) -> Option<(usize, RecordHeader)> {
        let lead = HEADER_SIZE + self.config.guard_len;
        let offset = self.region.offset_of(address)?.checked_sub(lead)?;
        let (header, _, _) = step(&self.region, self.config.overhead(), offset)?;
        (header.requested <= header.capacity).then_some((offset, header))
    }

    fn write_guards(&mut self, offset: usize, requested: usize) {
        let guard_len = self.config.guard_len;
        if guard_len == 0 {
            return;
        }
        let lead = offset + HEADER_SIZE;
        let trail = lead + guard_len + requested;
        self.region.fill(lead, guard_len, self.config.guard_byte);
        self.region.fill(trail, guard_len, self.config.guard_byte);
    }

    fn check_guards(&mut self, offset: usize, header: &RecordHeader, address: usize) {
        let guard_len = self.config.guard_len;
        if guard_len == 0 {
            return;
        }
        let lead = offset + HEADER_SIZE;
        let leading = self.region.bytes(lead, guard_len);
        let trailing = self.region.bytes(lead + guard_len + header.requested, guard_len);

        let sentinel = self.config.guard_byte;
        if leading.iter().chain(trailing).all(|&byte| byte == sentinel) {
            return;
        }

        self.stats.corruptions += 1;
        warn!(
            "heap: guard zone damaged around {:#x} ({} bytes, #{})",
            address, header.requested, header.serial
        );
        let damage = GuardDamage {
            address,
            requested: header.requested,
            serial: header.serial,
            leading,
            trailing,
            provenance: header.provenance(),
        };
        self.reporter.guard_damage(&damage, &self.backtrace);
    }
}
