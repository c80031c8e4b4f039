//! Frame-pointer stack walking
//!
//! Starting from a frame pointer, follow the saved-fp chain outward. For
//! every frame whose caller is known the walk yields the resume address (the
//! saved return address) and the caller's entry point (from the pc the
//! caller's prologue stored). The chain ends at a saved fp of zero, which
//! marks the outermost frame.
//!
//! Reading the live frame pointer is the only architecture-specific step and
//! lives in [`frame_pointer`]. Everything else goes through a [`Memory`]
//! window and is plain arithmetic, so it can be exercised on any host.

use core::fmt;

use crate::layout::FrameLayout;
use crate::memory::Memory;
use crate::name::name_of;
use crate::{Backtrace, CallFrame, RawFrame};

/// Read the frame pointer of the calling function
///
/// Returns `None` on targets that do not follow the APCS frame convention.
#[inline(always)]
pub fn frame_pointer() -> Option<usize> {
    #[cfg(target_arch = "arm")]
    {
        let fp: usize;
        // SAFETY: copies r11 (the ARM-mode frame pointer) into a register.
        unsafe {
            core::arch::asm!("mov {}, r11", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        return Some(fp);
    }

    #[cfg(not(target_arch = "arm"))]
    None
}

/// Stack unwinder over a memory window
#[derive(Debug, Clone)]
pub struct Unwinder<M: Memory> {
    memory: M,
    layout: FrameLayout,
    skip: usize,
}

impl<M: Memory> Unwinder<M> {
    /// Create an unwinder for `layout` frames readable through `memory`
    pub const fn new(memory: M, layout: FrameLayout) -> Self {
        Self {
            memory,
            layout,
            skip: 0,
        }
    }

    /// Omit the `skip` innermost frames from every capture
    ///
    /// Frame 0 of a capture is the function that called the capturing
    /// method; wrappers around the unwinder use this to hide themselves.
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Memory window used for reads
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Frame layout being followed
    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// Walk the chain starting at frame pointer `fp`
    ///
    /// Calls `visit` for each frame, innermost first, until it returns
    /// `false` or the chain ends. Returns the number of frames visited.
    ///
    /// The chain ends when:
    /// - the saved frame pointer is zero (program entry)
    /// - a linkage word cannot be read through the window
    /// - the saved frame pointer does not move outward (the stack grows
    ///   down, so callers sit at higher addresses)
    pub fn walk<F>(&self, fp: usize, mut visit: F) -> usize
    where
        F: FnMut(RawFrame) -> bool,
    {
        let mut fp = fp;
        let mut visited = 0;

        loop {
            let Some(caller_fp) = self.read(fp, self.layout.saved_fp) else {
                break;
            };
            if caller_fp == 0 {
                break;
            }
            if caller_fp <= fp {
                log::trace!("unwind: saved fp {:#x} does not ascend from {:#x}", caller_fp, fp);
                break;
            }
            let Some(resume_addr) = self.read(fp, self.layout.return_address) else {
                break;
            };
            let Some(caller_pc) = self.read(caller_fp, self.layout.saved_pc) else {
                break;
            };

            visited += 1;
            let frame = RawFrame {
                resume_addr,
                entry: self.layout.entry_for(caller_pc),
            };
            if !visit(frame) {
                break;
            }
            fp = caller_fp;
        }

        visited
    }

    /// Fill `out` with frames starting at `fp`, after skipping `skip`
    pub fn walk_into(&self, fp: usize, skip: usize, out: &mut [RawFrame]) -> usize {
        let mut skipped = 0;
        let mut count = 0;
        if out.is_empty() {
            return 0;
        }

        self.walk(fp, |frame| {
            if skipped < skip {
                skipped += 1;
                return true;
            }
            out[count] = frame;
            count += 1;
            count < out.len()
        });

        count
    }

    /// Resolve frames starting at `fp` into `out`
    pub fn unwind_from(&self, fp: usize, out: &mut [CallFrame]) -> usize {
        let mut count = 0;
        if out.is_empty() {
            return 0;
        }

        let mut skipped = 0;
        self.walk(fp, |frame| {
            if skipped < self.skip {
                skipped += 1;
                return true;
            }
            out[count] = self.symbolize(frame);
            count += 1;
            count < out.len()
        });

        count
    }

    /// Capture the live call chain without resolving names
    ///
    /// Returns the number of frames written; 0 where the frame pointer
    /// cannot be read.
    #[inline(never)]
    pub fn capture_raw(&self, out: &mut [RawFrame]) -> usize {
        match frame_pointer() {
            Some(fp) => self.walk_into(fp, self.skip, out),
            None => 0,
        }
    }

    /// Capture up to `out.len()` resolved frames of the live call chain
    #[inline(never)]
    pub fn capture_frames(&self, out: &mut [CallFrame]) -> usize {
        match frame_pointer() {
            Some(fp) => self.unwind_from(fp, out),
            None => 0,
        }
    }

    /// Resolve a captured frame
    ///
    /// Without a name tag the placeholder name is used and the offset is 0.
    pub fn symbolize(&self, frame: RawFrame) -> CallFrame {
        let name = self.name_of(frame.entry);
        let offset = if name == crate::UNKNOWN_NAME {
            0
        } else {
            frame.resume_addr.wrapping_sub(frame.entry)
        };

        CallFrame {
            resume_addr: frame.resume_addr,
            offset,
            name,
        }
    }

    /// Name of the function starting at `entry`
    pub fn name_of(&self, entry: usize) -> &'static str {
        name_of(&self.memory, entry)
    }

    /// Write the live call chain, one `#i <frame>` line per frame
    ///
    /// Starts at the function that called `write_backtrace`.
    #[inline(never)]
    pub fn write_backtrace<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        let Some(fp) = frame_pointer() else {
            return Ok(());
        };
        self.write_chain(fp, out)
    }

    /// Write the chain starting at `fp`
    pub fn write_chain<W: fmt::Write>(&self, fp: usize, out: &mut W) -> fmt::Result {
        let mut result = Ok(());
        let mut index = 0;

        self.walk(fp, |frame| {
            result = writeln!(out, "#{} {}", index, self.symbolize(frame));
            index += 1;
            result.is_ok()
        });

        result
    }

    fn read(&self, fp: usize, offset: isize) -> Option<usize> {
        let addr = self.layout.slot(fp, offset)?;
        self.memory.word(addr, self.layout.word_size)
    }
}

impl<M: Memory> Backtrace for Unwinder<M> {
    #[inline(always)]
    fn capture(&self, out: &mut [RawFrame]) -> usize {
        self.capture_raw(out)
    }

    fn symbolize(&self, frame: RawFrame) -> CallFrame {
        Unwinder::symbolize(self, frame)
    }
}
