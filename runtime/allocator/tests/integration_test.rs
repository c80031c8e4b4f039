//! Integration tests for the heap and its diagnostics
//!
//! These tests drive whole allocate/release workflows:
//! - Partition invariant under a mixed workload
//! - Block reuse, splitting and forward coalescing
//! - Guard corruption and leak reports with named provenance
//! - Growth limits and ledger overflow

use std::ptr::NonNull;

use redzone_heap::*;
use redzone_unwind::{FrameLayout, ImageMemory};

const OVERHEAD: usize = HEADER_SIZE + 2 * DEFAULT_GUARD_LEN;
const IMAGE_BASE: usize = 0x1_0000;

/// Region over a leaked, 8-byte aligned buffer
fn region(len: usize) -> HeapRegion {
    let words: &'static mut [u64] = Box::leak(vec![0u64; len / 8].into_boxed_slice());
    unsafe { HeapRegion::from_raw_parts(words.as_mut_ptr().cast::<u8>(), len / 8 * 8) }
        .expect("buffer is not null")
}

fn ledger(capacity: usize) -> Ledger<'static> {
    Ledger::new(Box::leak(vec![LedgerEntry::EMPTY; capacity].into_boxed_slice()))
}

fn heap(len: usize) -> Heap<'static, NoBacktrace, String> {
    Heap::new(region(len), ledger(64), HeapConfig::default(), NoBacktrace, String::new())
        .expect("default config is valid")
}

/// Code image with a name tag in front of each function
///
/// Returns the image and the entry address of every function.
fn image(names: &[&str]) -> (ImageMemory, Vec<usize>) {
    let mut bytes = Vec::new();
    let mut entries = Vec::new();

    for name in names {
        let padded = (name.len() + 1 + 3) & !3;
        let start = bytes.len();
        bytes.extend_from_slice(name.as_bytes());
        bytes.resize(start + padded, 0);
        bytes.extend_from_slice(&(0xff00_0000u32 | padded as u32).to_le_bytes());
        entries.push(IMAGE_BASE + bytes.len());
        bytes.resize(bytes.len() + 0x40, 0);
    }

    let image = ImageMemory::new(IMAGE_BASE, Box::leak(bytes.into_boxed_slice()));
    (image, entries)
}

/// Replays fixed call sites and names them from a code image
struct CallSites {
    unwinder: Unwinder<ImageMemory>,
    frames: Vec<RawFrame>,
}

impl Backtrace for CallSites {
    fn capture(&self, out: &mut [RawFrame]) -> usize {
        let n = self.frames.len().min(out.len());
        out[..n].copy_from_slice(&self.frames[..n]);
        n
    }

    fn symbolize(&self, frame: RawFrame) -> CallFrame {
        self.unwinder.symbolize(frame)
    }
}

/// Test the partition invariant over a long mixed workload
#[test]
fn test_partition_invariant_holds_for_mixed_workload() {
    const ROUNDS: u32 = 500;

    // One ledger slot per round, so every live block stays tracked
    let mut heap = Heap::new(
        region(64 * 1024),
        ledger(ROUNDS as usize),
        HeapConfig::default(),
        NoBacktrace,
        String::new(),
    )
    .expect("default config is valid");
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    let mut seed = 0x2545_f491u32;
    let mut next = move || {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        seed >> 8
    };

    for round in 0..ROUNDS {
        if live.is_empty() || next() % 3 != 0 {
            let size = 1 + (next() % 200) as usize;
            match heap.allocate(size) {
                Ok(ptr) => {
                    let fill = (round % 251) as u8;
                    unsafe { ptr.as_ptr().write_bytes(fill, size) };
                    live.push((ptr, size, fill));
                }
                Err(HeapError::OutOfMemory { .. }) => {}
                Err(e) => panic!("allocate({}) failed: {}", size, e),
            }
        } else {
            let index = next() as usize % live.len();
            let (ptr, _, _) = live.swap_remove(index);
            heap.deallocate(ptr.as_ptr()).expect("live block");
        }

        let records = heap.check_partition().expect("records tile the region");
        let covered: usize = heap.blocks().map(|b| b.capacity + OVERHEAD).sum();
        assert_eq!(covered, heap.region().len());
        assert_eq!(records, heap.blocks().count());
    }

    // Payloads never overlapped each other or a guard zone
    for (ptr, size, fill) in &live {
        let payload = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), *size) };
        assert!(payload.iter().all(|b| b == fill));
    }
    assert_eq!(heap.stats().corruptions, 0);
    assert_eq!(heap.stats().untracked, 0);
    assert_eq!(heap.leaks().count(), live.len());
}

/// Scenario A: a released block is reused at the same address
#[test]
fn test_release_then_reuse_same_address() {
    let mut heap = heap(4096);

    let a = heap.allocate(10).unwrap();
    assert_eq!(heap.region().len(), round_up(10).unwrap() + OVERHEAD);

    heap.deallocate(a.as_ptr()).unwrap();
    let block = heap.blocks().next().unwrap();
    assert_eq!(block.status, BlockStatus::Free);
    assert_eq!(block.payload, a.as_ptr() as usize);

    let len = heap.region().len();
    assert_eq!(heap.allocate(10).unwrap(), a);
    assert_eq!(heap.region().len(), len);
}

/// Round trip: equal-or-smaller requests reuse the block without growth
#[test]
fn test_round_trip_without_growth() {
    for n in [1usize, 8, 24, 100, 1000] {
        let mut heap = heap(8192);
        let a = heap.allocate(n).unwrap();
        heap.deallocate(a.as_ptr()).unwrap();

        let len = heap.region().len();
        for m in [n, (n / 2).max(1)] {
            let b = heap.allocate(m).unwrap();
            assert_eq!(b, a);
            assert_eq!(heap.region().len(), len);
            heap.deallocate(b.as_ptr()).unwrap();
        }
    }
}

/// Scenario B: a freed block ahead of a used one is split for a smaller request
#[test]
fn test_freed_block_is_split_for_smaller_request() {
    let mut heap = heap(4096);

    let first = heap.allocate(400).unwrap();
    heap.allocate(8).unwrap();
    heap.deallocate(first.as_ptr()).unwrap();

    let blocks: Vec<BlockInfo> = heap.blocks().collect();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].status, BlockStatus::Free);
    assert!(blocks[0].capacity >= 400);
    assert_eq!(blocks[1].status, BlockStatus::Used);

    let len = heap.region().len();
    let reused = heap.allocate(50).unwrap();
    assert_eq!(reused, first);
    assert_eq!(heap.region().len(), len);

    let blocks: Vec<BlockInfo> = heap.blocks().collect();
    assert_eq!(blocks.len(), 3);
    assert_eq!((blocks[0].status, blocks[0].capacity), (BlockStatus::Used, 56));
    assert_eq!(blocks[1].status, BlockStatus::Free);
    assert_eq!(blocks[1].capacity, 400 - 56 - OVERHEAD);
    assert_eq!(blocks[2].status, BlockStatus::Used);
}

/// Adjacent blocks merge when the later one is released first
#[test]
fn test_adjacent_blocks_coalesce() {
    let mut heap = heap(4096);

    let a = heap.allocate(48).unwrap();
    let b = heap.allocate(64).unwrap();
    heap.allocate(8).unwrap();

    heap.deallocate(b.as_ptr()).unwrap();
    heap.deallocate(a.as_ptr()).unwrap();

    let blocks: Vec<BlockInfo> = heap.blocks().collect();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].status, BlockStatus::Free);
    assert_eq!(blocks[0].capacity, 48 + 64 + OVERHEAD);

    // The merged block serves a request neither half could
    let len = heap.region().len();
    assert_eq!(heap.allocate(100).unwrap(), a);
    assert_eq!(heap.region().len(), len);
}

/// Releasing the earlier block first leaves two records: merging is forward only
#[test]
fn test_backward_neighbour_is_not_merged() {
    let mut heap = heap(4096);

    let a = heap.allocate(48).unwrap();
    let b = heap.allocate(64).unwrap();
    heap.allocate(8).unwrap();

    heap.deallocate(a.as_ptr()).unwrap();
    heap.deallocate(b.as_ptr()).unwrap();

    let statuses: Vec<(BlockStatus, usize)> =
        heap.blocks().map(|b| (b.status, b.capacity)).collect();
    assert_eq!(
        statuses,
        [
            (BlockStatus::Free, 48),
            (BlockStatus::Free, 64),
            (BlockStatus::Used, 8)
        ]
    );
}

/// Test guard corruption is reported with the block's size and named provenance
#[test]
fn test_guard_corruption_report_names_allocation_site() {
    let (memory, entries) = image(&["parse_config", "load_level", "main"]);
    let frames = vec![
        RawFrame {
            resume_addr: entries[0] + 0x24,
            entry: entries[0],
        },
        RawFrame {
            resume_addr: entries[1] + 0x10,
            entry: entries[1],
        },
        // Entry without a tag in front of it
        RawFrame {
            resume_addr: entries[2] + 0x30,
            entry: entries[2] + 0x20,
        },
    ];
    let backtrace = CallSites {
        unwinder: Unwinder::new(memory, FrameLayout::APCS),
        frames,
    };
    let mut heap = Heap::new(
        region(4096),
        ledger(8),
        HeapConfig::default(),
        backtrace,
        String::new(),
    )
    .unwrap();

    let keep = heap.allocate(32).unwrap();
    let a = heap.allocate(10).unwrap();
    unsafe { a.as_ptr().sub(1).write(b'!') };
    heap.deallocate(a.as_ptr()).unwrap();

    assert_eq!(heap.stats().corruptions, 1);
    assert_eq!(heap.stats().frees, 1);
    assert!(heap.leaks().all(|entry| entry.address == keep.as_ptr() as usize));

    let report = heap.sink().clone();
    assert!(report.contains(&format!("release of {:#x}", a.as_ptr() as usize)));
    assert!(report.contains("leading  [7e 7e 7e 7e 7e 7e 7e 21]"));
    assert!(report.contains("trailing [7e 7e 7e 7e 7e 7e 7e 7e]"));
    assert!(report.contains("block of 10 bytes, allocated by:"));
    assert!(report.contains(&format!("  #0 {:#x} at parse_config+36\n", entries[0] + 0x24)));
    assert!(report.contains(&format!("  #1 {:#x} at load_level+16\n", entries[1] + 0x10)));
    assert!(report.contains(&format!("  #2 {:#x} at ???+0\n", entries[2] + 0x30)));

    // Intact blocks are released silently
    heap.deallocate(keep.as_ptr()).unwrap();
    assert_eq!(heap.stats().corruptions, 1);
    assert_eq!(heap.sink().len(), report.len());
}

/// Test exactly one leak is reported when one block is never released
#[test]
fn test_leak_report_lists_unreleased_block() {
    let mut heap = heap(8192);
    let sizes = [12usize, 40, 7, 100, 33];

    let ptrs: Vec<NonNull<u8>> = sizes.iter().map(|&n| heap.allocate(n).unwrap()).collect();
    for (i, ptr) in ptrs.iter().enumerate() {
        if i != 3 {
            heap.deallocate(ptr.as_ptr()).unwrap();
        }
    }

    assert_eq!(heap.report_leaks(), 1);

    let leaks: Vec<&LedgerEntry> = heap.leaks().collect();
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].requested, 100);
    assert_eq!(leaks[0].address, ptrs[3].as_ptr() as usize);

    let report = heap.sink();
    assert!(report.contains("5 allocs, 4 frees, 192 bytes allocated\n"));
    assert_eq!(report.matches("bytes lost").count(), 1);
    assert!(report.contains(&format!("100 bytes lost at {:#x}", leaks[0].address)));
}

/// Test growth past the ceiling fails without touching the heap
#[test]
fn test_out_of_memory_leaves_heap_usable() {
    let mut heap = heap(512);

    heap.allocate(300).unwrap();
    let used = round_up(300).unwrap() + OVERHEAD;
    assert_eq!(heap.region().len(), used);

    let result = heap.allocate(100);
    assert_eq!(
        result,
        Err(HeapError::OutOfMemory {
            requested: round_up(100).unwrap() + OVERHEAD,
            available: 512 - used,
        })
    );
    assert_eq!(heap.region().len(), used);
    assert_eq!(heap.stats().allocations, 1);
    assert_eq!(heap.check_partition(), Ok(1));

    assert!(heap.allocate(8).is_ok());
}

/// Test the reject policy refuses allocations once the ledger is full
#[test]
fn test_reject_policy_refuses_untracked_allocations() {
    let config = HeapConfig::default().with_ledger_policy(LedgerPolicy::Reject);
    let mut heap = Heap::new(region(4096), ledger(2), config, NoBacktrace, String::new()).unwrap();

    let a = heap.allocate(8).unwrap();
    heap.allocate(8).unwrap();
    assert_eq!(heap.allocate(8), Err(HeapError::LedgerOverflow { capacity: 2 }));

    // Entries are kept after release, so the ledger stays full
    heap.deallocate(a.as_ptr()).unwrap();
    assert_eq!(heap.allocate(8), Err(HeapError::LedgerOverflow { capacity: 2 }));
    assert_eq!(heap.stats().allocations, 2);
}

/// Test the default policy keeps allocating and says so in the report
#[test]
fn test_untracked_allocations_are_counted() {
    let mut heap = Heap::new(
        region(4096),
        ledger(2),
        HeapConfig::default(),
        NoBacktrace,
        String::new(),
    )
    .unwrap();

    for _ in 0..5 {
        heap.allocate(16).unwrap();
    }

    assert_eq!(heap.stats().untracked, 3);
    assert_eq!(heap.report_leaks(), 2);
    assert!(heap.sink().contains("3 allocations not tracked"));
}

/// Test invalid releases are rejected without changing the heap
#[test]
fn test_invalid_release_is_rejected() {
    let mut heap = heap(4096);
    let a = heap.allocate(64).unwrap();
    let address = a.as_ptr() as usize;

    assert_eq!(heap.deallocate(std::ptr::null_mut()), Ok(()));
    assert_eq!(
        heap.deallocate(unsafe { a.as_ptr().add(8) }),
        Err(HeapError::ForeignPointer {
            address: address + 8
        })
    );

    heap.deallocate(a.as_ptr()).unwrap();
    assert_eq!(
        heap.deallocate(a.as_ptr()),
        Err(HeapError::DoubleFree { address })
    );
    assert_eq!(heap.stats().frees, 1);
    assert_eq!(heap.check_partition(), Ok(1));
}

/// Test independent heaps do not share state
#[test]
fn test_heaps_are_isolated() {
    let mut one = heap(1024);
    let mut two = heap(1024);

    let a = one.allocate(16).unwrap();
    two.allocate(16).unwrap();
    two.allocate(16).unwrap();

    assert!(matches!(
        two.deallocate(a.as_ptr()),
        Err(HeapError::ForeignPointer { .. })
    ));
    assert_eq!(one.stats().allocations, 1);
    assert_eq!(two.stats().allocations, 2);
}

/// Test shutdown writes the final report and returns the sink
#[test]
fn test_shutdown_returns_report() {
    let mut heap = heap(1024);
    heap.allocate(24).unwrap();
    heap.dump("before shutdown");

    let report = heap.shutdown();
    assert!(report.contains("heap dump (before shutdown)"));
    assert!(report.contains("1 allocs, 0 frees, 24 bytes allocated"));
    assert!(report.contains("24 bytes lost"));
}
