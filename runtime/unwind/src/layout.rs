//! Call frame layout for the frame-pointer convention
//!
//! Each active frame keeps three words at fixed offsets from its frame
//! pointer: the caller's frame pointer, the return (resume) address, and the
//! program counter captured by the prologue's store. The last one leads the
//! function's first instruction by a pipeline-dependent constant.

/// Where a frame keeps its linkage, relative to the frame pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Size of a stack word in bytes
    pub word_size: usize,

    /// Offset of the caller's saved frame pointer
    pub saved_fp: isize,

    /// Offset of the saved return address
    pub return_address: isize,

    /// Offset of the program counter stored by the prologue
    pub saved_pc: isize,

    /// Bytes by which the stored program counter leads the function entry
    pub pc_lead: usize,
}

impl FrameLayout {
    /// 32-bit ARM APCS frame
    ///
    /// The prologue is `mov ip, sp; push {fp, ip, lr, pc}; sub fp, ip, #4`,
    /// leaving fp pointing at the stored pc:
    ///
    /// ```text
    ///   fp + 0   saved pc   (push address + 8 = entry + 12)
    ///   fp - 4   saved lr   (resume address in the caller)
    ///   fp - 8   saved sp
    ///   fp - 12  saved fp   (caller's frame, 0 at program entry)
    /// ```
    pub const APCS: Self = Self {
        word_size: 4,
        saved_fp: -12,
        return_address: -4,
        saved_pc: 0,
        pc_lead: 12,
    };

    /// Address of a slot at `offset` from frame pointer `fp`
    pub fn slot(&self, fp: usize, offset: isize) -> Option<usize> {
        fp.checked_add_signed(offset)
    }

    /// Function entry for a stored program counter
    pub fn entry_for(&self, saved_pc: usize) -> usize {
        saved_pc.wrapping_sub(self.pc_lead)
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::APCS
    }
}
