//! Corruption and leak reports
//!
//! Reports are plain text written to any `core::fmt::Write` sink, usually a
//! console writer. Write errors are ignored: a report that cannot be shown
//! must not disturb the allocator.

use core::fmt::{self, Write};

use redzone_unwind::{Backtrace, RawFrame};

use crate::heap::{BlockInfo, HeapStats};
use crate::ledger::LedgerEntry;

const RULE: &str = "=============================================";

/// Sink that discards every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl Write for NullSink {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

/// Sink that keeps reports in a fixed buffer
///
/// Never allocates, so it can sit behind a global allocator. Output past
/// the capacity is dropped.
#[derive(Debug, Clone)]
pub struct FixedSink<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> FixedSink<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    /// Everything written so far
    pub fn as_str(&self) -> &str {
        // Only whole characters are ever copied in.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for FixedSink<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for FixedSink<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;

        if take == s.len() {
            Ok(())
        } else {
            Err(fmt::Error)
        }
    }
}

/// A block whose guard zones no longer hold the sentinel
#[derive(Debug, Clone, Copy)]
pub struct GuardDamage<'a> {
    /// Payload address passed to `deallocate`
    pub address: usize,

    /// Size the caller asked for
    pub requested: usize,

    /// Allocation serial number
    pub serial: u64,

    /// Leading guard bytes as found
    pub leading: &'a [u8],

    /// Trailing guard bytes as found
    pub trailing: &'a [u8],

    /// Frames recorded when the block was allocated
    pub provenance: &'a [RawFrame],
}

/// Formats diagnostics into a sink
#[derive(Debug)]
pub struct Reporter<W: Write> {
    sink: W,
}

impl<W: Write> Reporter<W> {
    pub const fn new(sink: W) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Report a released block with damaged guard zones
    pub fn guard_damage<B: Backtrace>(&mut self, damage: &GuardDamage<'_>, backtrace: &B) {
        let out = &mut self.sink;
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(out, "          heap corruption detected");
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(
            out,
            "release of {:#x} (allocation #{}) found damaged guard zone(s):",
            damage.address, damage.serial
        );
        let _ = write!(out, "  leading  ");
        let _ = write_hex(out, damage.leading);
        let _ = write!(out, "  trailing ");
        let _ = write_hex(out, damage.trailing);
        let _ = writeln!(out, "block of {} bytes, allocated by:", damage.requested);
        self.frames(damage.provenance, backtrace);
    }

    /// Opening line of a leak report
    pub fn summary(&mut self, stats: &HeapStats) {
        let out = &mut self.sink;
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(out, "             heap memory report");
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(
            out,
            "{} allocs, {} frees, {} bytes allocated",
            stats.allocations, stats.frees, stats.bytes_requested
        );
    }

    /// One block that was never released
    pub fn leak<B: Backtrace>(&mut self, entry: &LedgerEntry, backtrace: &B) {
        let _ = writeln!(
            self.sink,
            "{} bytes lost at {:#x}, allocated by:",
            entry.requested, entry.address
        );
        self.frames(entry.provenance(), backtrace);
    }

    /// Allocations made after the ledger filled up
    pub fn untracked(&mut self, count: u64) {
        let _ = writeln!(
            self.sink,
            "{} allocations not tracked (ledger full), leaks among them are not shown",
            count
        );
    }

    pub fn dump_begin(&mut self, label: &str, start: usize, end: usize) {
        let _ = writeln!(self.sink);
        let _ = writeln!(self.sink, "---------- heap dump ({}) ----------", label);
        let _ = writeln!(self.sink, "region {:#x} - {:#x}", start, end);
    }

    pub fn dump_block(&mut self, block: &BlockInfo) {
        let _ = writeln!(
            self.sink,
            "{:#x}: capacity {}, {:?}",
            block.payload, block.capacity, block.status
        );
    }

    pub fn dump_end(&mut self, label: &str) {
        let _ = writeln!(self.sink, "----------  end dump ({})  ----------", label);
    }

    fn frames<B: Backtrace>(&mut self, frames: &[RawFrame], backtrace: &B) {
        if frames.is_empty() {
            let _ = writeln!(self.sink, "  (no frames recorded)");
            return;
        }
        for (index, frame) in frames.iter().enumerate() {
            let _ = writeln!(self.sink, "  #{} {}", index, backtrace.symbolize(*frame));
        }
    }
}

fn write_hex<W: Write>(out: &mut W, bytes: &[u8]) -> fmt::Result {
    write!(out, "[")?;
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            write!(out, " ")?;
        }
        write!(out, "{:02x}", byte)?;
    }
    writeln!(out, "]")
}
