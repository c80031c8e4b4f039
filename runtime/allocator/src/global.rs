//! Global allocator adapter
//!
//! Serializes every call through one spin lock. The heap installed with
//! [`LockedHeap::init`] lives for the rest of the program.
//!
//! Reports and `log` records are produced while the lock is held. The sink
//! and the installed logger must not allocate through this allocator or the
//! lock is taken twice and spins forever; [`FixedSink`](crate::FixedSink)
//! and console writers are safe.
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: LockedHeap<Unwinder<LiveMemory>, FixedSink<4096>> = LockedHeap::empty();
//!
//! fn init_heap(memory: LiveMemory, region: HeapRegion, ledger: Ledger<'static>) -> Result<()> {
//!     // Frames 0 and 1 are `Heap::allocate` and `LockedHeap::alloc`
//!     let unwinder = Unwinder::new(memory, FrameLayout::APCS).with_skip(2);
//!     let heap = Heap::new(region, ledger, HeapConfig::DEFAULT, unwinder, FixedSink::new())?;
//!     HEAP.init(heap);
//!     Ok(())
//! }
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::fmt::Write;
use core::ptr::{null_mut, NonNull};

use redzone_unwind::Backtrace;
use spin::{Mutex, MutexGuard};

use crate::config::MIN_BLOCK_SIZE;
use crate::heap::Heap;

/// A [`Heap`] behind a spin lock, usable as `#[global_allocator]`
///
/// Layouts aligned beyond `MIN_BLOCK_SIZE` are refused (null), as is every
/// request made before [`init`](Self::init).
pub struct LockedHeap<B: Backtrace, W: Write> {
    inner: Mutex<Option<Heap<'static, B, W>>>,
}

impl<B: Backtrace, W: Write> LockedHeap<B, W> {
    /// Allocator with no heap installed yet
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install `heap`, returning the one it replaces
    pub fn init(&self, heap: Heap<'static, B, W>) -> Option<Heap<'static, B, W>> {
        self.inner.lock().replace(heap)
    }

    /// Lock the heap for diagnostics (leak report, dump)
    pub fn lock(&self) -> MutexGuard<'_, Option<Heap<'static, B, W>>> {
        self.inner.lock()
    }
}

unsafe impl<B: Backtrace, W: Write> GlobalAlloc for LockedHeap<B, W> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_BLOCK_SIZE {
            return null_mut();
        }
        match self.inner.lock().as_mut() {
            Some(heap) => heap.allocate(layout.size()).map_or(null_mut(), NonNull::as_ptr),
            None => null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(heap) = self.inner.lock().as_mut() {
            // Rejected releases are logged by the heap.
            let _ = heap.deallocate(ptr);
        }
    }
}
