//! Memory windows - bounded reads for the unwinder
//!
//! The unwinder never dereferences an address directly. Every read goes
//! through a [`Memory`] window, so a bogus saved frame pointer or a smashed
//! name tag ends the walk instead of faulting.
//!
//! - [`LiveMemory`]: the running image (stack and text), bounded by a range
//!   the caller vouches for
//! - [`ImageMemory`]: a captured byte image placed at a base address

use core::ops::Range;

/// A readable view of an address space
pub trait Memory {
    /// Borrow `len` bytes starting at `addr`
    ///
    /// Returns `None` if any byte of the range lies outside the window.
    fn bytes(&self, addr: usize, len: usize) -> Option<&'static [u8]>;

    /// Read a little-endian word of `size` bytes (at most 8)
    fn word(&self, addr: usize, size: usize) -> Option<usize> {
        if size > core::mem::size_of::<u64>() {
            return None;
        }
        let raw = self.bytes(addr, size)?;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(raw);
        usize::try_from(u64::from_le_bytes(buf)).ok()
    }
}

/// Window over the memory of the running program
///
/// Reads are plain loads, so the window must not cover MMIO.
#[derive(Debug, Clone)]
pub struct LiveMemory {
    window: Range<usize>,
}

impl LiveMemory {
    /// Create a window over `window`
    ///
    /// # Safety
    /// Every address in `window` must be mapped, readable and never written
    /// by anyone else while a returned slice is alive (text and the
    /// already-pushed part of the stack satisfy this during a walk).
    pub const unsafe fn new(window: Range<usize>) -> Self {
        Self { window }
    }

    /// Readable range
    pub fn window(&self) -> Range<usize> {
        self.window.clone()
    }
}

impl Memory for LiveMemory {
    fn bytes(&self, addr: usize, len: usize) -> Option<&'static [u8]> {
        let end = addr.checked_add(len)?;
        if addr < self.window.start || end > self.window.end {
            return None;
        }
        // SAFETY: the range lies inside the window promised readable in `new`.
        Some(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
    }
}

/// A captured byte image that lived at `base`
///
/// Used to symbolize snapshots taken elsewhere (a stack dump plus the text
/// section) with the same code that walks the live stack.
#[derive(Debug, Clone, Copy)]
pub struct ImageMemory {
    base: usize,
    image: &'static [u8],
}

impl ImageMemory {
    /// Map `image` at address `base`
    pub const fn new(base: usize, image: &'static [u8]) -> Self {
        Self { base, image }
    }

    /// Address one past the last byte of the image
    pub fn end(&self) -> usize {
        self.base + self.image.len()
    }
}

impl Memory for ImageMemory {
    fn bytes(&self, addr: usize, len: usize) -> Option<&'static [u8]> {
        let start = addr.checked_sub(self.base)?;
        let end = start.checked_add(len)?;
        self.image.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec;

    fn leak(bytes: std::vec::Vec<u8>) -> &'static [u8] {
        Box::leak(bytes.into_boxed_slice())
    }

    #[test]
    fn test_image_bounds() {
        let mem = ImageMemory::new(0x1000, leak(vec![1, 2, 3, 4]));

        assert_eq!(mem.bytes(0x1000, 4), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(mem.bytes(0x1002, 2), Some(&[3u8, 4][..]));
        assert_eq!(mem.bytes(0x0fff, 1), None);
        assert_eq!(mem.bytes(0x1003, 2), None);
        assert_eq!(mem.end(), 0x1004);
    }

    #[test]
    fn test_word_is_little_endian() {
        let mem = ImageMemory::new(0x2000, leak(vec![0x78, 0x56, 0x34, 0x12, 0xff]));

        assert_eq!(mem.word(0x2000, 4), Some(0x1234_5678));
        assert_eq!(mem.word(0x2001, 4), Some(0xff12_3456));
        assert_eq!(mem.word(0x2002, 4), None);
        assert_eq!(mem.word(0x2000, 9), None);
    }

    #[test]
    fn test_live_memory_window() {
        let data: &'static [u8] = leak(vec![9, 8, 7, 6]);
        let start = data.as_ptr() as usize;
        let mem = unsafe { LiveMemory::new(start..start + data.len()) };

        assert_eq!(mem.bytes(start + 1, 2), Some(&[8u8, 7][..]));
        assert_eq!(mem.bytes(start + 3, 2), None);
        assert_eq!(mem.bytes(start.wrapping_sub(1), 1), None);
        assert_eq!(mem.window(), start..start + 4);
    }
}
