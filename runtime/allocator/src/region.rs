//! Heap region - the byte range backing every allocation
//!
//! The region starts empty and grows monotonically toward a fixed ceiling
//! (typically the stack reservation below the stack pointer). It never
//! shrinks. All bookkeeping inside the heap uses offsets from `start`, so
//! the partition invariant can be checked by plain arithmetic.
//!
//! ```text
//!   start                       end                     ceiling
//!     │◄──── records ──────────►│◄──── growable ───────►│
//!     ▼                         ▼                       ▼
//!     ┌──────┬──────┬──────┬────┬───────────────────────┐
//!     │ rec  │ rec  │ rec  │rec │                       │
//!     └──────┴──────┴──────┴────┴───────────────────────┘
//! ```

use core::ptr::NonNull;

use crate::config::MIN_BLOCK_SIZE;
use crate::record::{RecordHeader, HEADER_SIZE};
use crate::{HeapError, Result};

/// Contiguous, growable byte range owned by one heap
pub struct HeapRegion {
    /// First byte (aligned to `MIN_BLOCK_SIZE`)
    base: NonNull<u8>,

    /// Bytes in use
    end: usize,

    /// Bytes that may ever be used
    ceiling: usize,
}

// SAFETY: the region exclusively owns its range; moving it between threads
// moves that ownership with it.
unsafe impl Send for HeapRegion {}

impl HeapRegion {
    /// Create an empty region over `len` bytes at `start`
    ///
    /// `start` is aligned up to `MIN_BLOCK_SIZE` and the ceiling rounded down
    /// to a multiple of it. Returns `None` for a null `start`.
    ///
    /// # Safety
    /// `[start, start + len)` must be valid for reads and writes and must not
    /// be accessed other than through this region (and the payloads it hands
    /// out) for as long as the region exists.
    pub unsafe fn from_raw_parts(start: *mut u8, len: usize) -> Option<Self> {
        let start = NonNull::new(start)?;
        // SAFETY: forwarded to the caller.
        Some(unsafe { Self::from_non_null(start, len) })
    }

    /// Create an empty region over a static buffer
    pub fn from_static(memory: &'static mut [u8]) -> Self {
        let len = memory.len();
        let start = NonNull::from(memory).cast::<u8>();
        // SAFETY: the buffer is exclusively borrowed for 'static.
        unsafe { Self::from_non_null(start, len) }
    }

    unsafe fn from_non_null(start: NonNull<u8>, len: usize) -> Self {
        let pad = start.as_ptr().align_offset(MIN_BLOCK_SIZE);
        let ceiling = len.saturating_sub(pad) & !(MIN_BLOCK_SIZE - 1);
        let base = if ceiling == 0 {
            start
        } else {
            // SAFETY: pad < len, so the aligned pointer is inside the range.
            unsafe { NonNull::new_unchecked(start.as_ptr().add(pad)) }
        };

        Self {
            base,
            end: 0,
            ceiling,
        }
    }

    /// Append `n` bytes to the region
    ///
    /// Returns the previous end (as an offset), which is where the new span
    /// begins.
    ///
    /// # Errors
    /// `OutOfMemory` if the new end would pass the ceiling; nothing changes.
    pub fn grow(&mut self, n: usize) -> Result<usize> {
        let available = self.available();
        if n > available {
            return Err(HeapError::OutOfMemory {
                requested: n,
                available,
            });
        }

        let prev = self.end;
        self.end += n;
        log::debug!("heap: grew by {} bytes to {:#x}", n, self.end_addr());
        Ok(prev)
    }

    /// Address of the first byte
    pub fn start(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Address one past the last byte in use
    pub fn end_addr(&self) -> usize {
        self.start() + self.end
    }

    /// Bytes in use
    pub fn len(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Largest size the region may reach
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Bytes still available for growth
    pub fn available(&self) -> usize {
        self.ceiling - self.end
    }

    /// Offset of `addr` if it lies inside the used range
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        addr.checked_sub(self.start()).filter(|&offset| offset < self.end)
    }

    /// Pointer to the byte at `offset`
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.end);
        // SAFETY: offset is within the region.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Header of the record at `offset`
    ///
    /// `None` if a header would not fit before `end` or `offset` is not
    /// aligned.
    pub(crate) fn header(&self, offset: usize) -> Option<RecordHeader> {
        if offset % MIN_BLOCK_SIZE != 0 || offset.checked_add(HEADER_SIZE)? > self.end {
            return None;
        }
        // SAFETY: aligned, in bounds, and every bit pattern is a valid header.
        Some(unsafe { self.ptr_at(offset).cast::<RecordHeader>().as_ptr().read() })
    }

    pub(crate) fn write_header(&mut self, offset: usize, header: &RecordHeader) {
        assert!(offset % MIN_BLOCK_SIZE == 0 && offset + HEADER_SIZE <= self.end);
        // SAFETY: checked above.
        unsafe { self.ptr_at(offset).cast::<RecordHeader>().as_ptr().write(*header) }
    }

    /// Borrow `len` bytes at `offset`
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.end);
        // SAFETY: checked above.
        unsafe { core::slice::from_raw_parts(self.ptr_at(offset).as_ptr(), len) }
    }

    /// Set `len` bytes at `offset` to `byte`
    pub(crate) fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.end);
        // SAFETY: checked above.
        unsafe { self.ptr_at(offset).as_ptr().write_bytes(byte, len) }
    }
}

impl core::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("end", &format_args!("{:#x}", self.end_addr()))
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec;

    /// Region over a leaked, 8-byte aligned buffer of `len` bytes
    pub(crate) fn region(len: usize) -> HeapRegion {
        let words: &'static mut [u64] = Box::leak(vec![0u64; len / 8].into_boxed_slice());
        unsafe { HeapRegion::from_raw_parts(words.as_mut_ptr().cast::<u8>(), len / 8 * 8) }.unwrap()
    }

    #[test]
    fn test_grow_returns_previous_end() {
        let mut region = region(256);
        assert!(region.is_empty());

        assert_eq!(region.grow(64).unwrap(), 0);
        assert_eq!(region.grow(32).unwrap(), 64);
        assert_eq!(region.len(), 96);
        assert_eq!(region.end_addr(), region.start() + 96);
        assert_eq!(region.available(), 160);
    }

    #[test]
    fn test_grow_past_ceiling_fails_without_change() {
        let mut region = region(128);
        region.grow(100).unwrap();

        let result = region.grow(29);
        assert!(matches!(
            result,
            Err(HeapError::OutOfMemory {
                requested: 29,
                available: 28
            })
        ));
        assert_eq!(region.len(), 100);

        assert_eq!(region.grow(28).unwrap(), 100);
        assert_eq!(region.available(), 0);
    }

    #[test]
    fn test_unaligned_start_is_aligned() {
        let words: &'static mut [u64] = Box::leak(vec![0u64; 8].into_boxed_slice());
        let start = words.as_mut_ptr().cast::<u8>();
        let region = unsafe { HeapRegion::from_raw_parts(start.add(3), 61) }.unwrap();

        assert_eq!(region.start() % MIN_BLOCK_SIZE, 0);
        assert_eq!(region.start(), start as usize + 8);
        assert_eq!(region.ceiling(), 56);
    }

    #[test]
    fn test_null_start_rejected() {
        assert!(unsafe { HeapRegion::from_raw_parts(core::ptr::null_mut(), 64) }.is_none());
    }

    #[test]
    fn test_offset_of() {
        let mut region = region(128);
        region.grow(64).unwrap();

        assert_eq!(region.offset_of(region.start()), Some(0));
        assert_eq!(region.offset_of(region.start() + 63), Some(63));
        assert_eq!(region.offset_of(region.start() + 64), None);
        assert_eq!(region.offset_of(region.start() - 1), None);
    }

    #[test]
    fn test_header_bounds() {
        let mut region = region(512);
        region.grow(HEADER_SIZE + 8).unwrap();

        region.write_header(0, &RecordHeader::free(8));
        assert_eq!(region.header(0).unwrap().capacity, 8);
        assert!(region.header(4).is_none());
        assert!(region.header(16).is_none());
    }
}
