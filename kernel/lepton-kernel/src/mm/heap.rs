//! Kernel heap.
//!
//! Variable-size allocator over a contiguous virtual region. Every block
//! is preceded by a [`BlockHeader`]; the block list is doubly linked and
//! strictly ordered by address. Allocation is first-fit with splitting;
//! freeing coalesces with both neighbors immediately, so two adjacent
//! free blocks never exist. Page-aligned requests carve a free sentinel
//! block out of the alignment slack so the list stays contiguous.
//!
//! When no block fits, the heap asks a registered grow callback to map
//! more memory at the region tail, bounded by the configured maximum.
//! The callback maps frames from the frame allocator on the real target;
//! tests hand out slices of a preallocated buffer.
//!
//! The heap doubles as the `#[global_allocator]` on the bare-metal
//! target. The single internal lock must not be held across anything
//! that can block.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use lepton_core::sync::SpinLock;

use crate::config::PAGE_SIZE;

/// Header preceding every heap block, allocated or free.
#[repr(C)]
struct BlockHeader {
    /// Payload size in bytes (header excluded).
    size: usize,
    /// Whether the block is currently free.
    free: bool,
    /// Previous block by address, or null for the first.
    prev: *mut BlockHeader,
    /// Next block by address, or null for the last.
    next: *mut BlockHeader,
}

const HDR: usize = core::mem::size_of::<BlockHeader>();
/// Smallest payload worth keeping as its own block.
const MIN_PAYLOAD: usize = 16;
/// All payloads are aligned to this many bytes.
const GRAIN: usize = 16;

/// Grow callback: given the current region end and a minimum byte count,
/// map more memory at the tail and return how many bytes were added.
pub type GrowFn = fn(region_end: usize, min_bytes: usize) -> Option<usize>;

struct HeapInner {
    first: *mut BlockHeader,
    start: usize,
    end: usize,
    max_end: usize,
    grow_fn: Option<GrowFn>,
}

// SAFETY: the raw block pointers are only dereferenced under the lock.
unsafe impl Send for HeapInner {}

/// The kernel heap allocator.
pub struct Heap {
    inner: SpinLock<HeapInner>,
}

impl Heap {
    /// Creates an uninitialized heap; [`init`](Heap::init) must run first.
    pub const fn empty() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                first: ptr::null_mut(),
                start: 0,
                end: 0,
                max_end: 0,
                grow_fn: None,
            }),
        }
    }

    /// Initializes the heap over `[start, start + size)`, growable up to
    /// `max_size` bytes total.
    ///
    /// # Safety
    ///
    /// The region must be mapped, exclusively owned by the heap, and
    /// `start` must be `GRAIN`-aligned. Must be called exactly once.
    pub unsafe fn init(&self, start: usize, size: usize, max_size: usize) {
        let mut inner = self.inner.lock();
        assert!(inner.first.is_null(), "heap already initialized");
        assert!(size >= HDR + MIN_PAYLOAD, "initial heap too small");
        assert!(start % GRAIN == 0, "heap start misaligned");

        let first = start as *mut BlockHeader;
        // SAFETY: the caller guarantees the region is mapped and ours.
        unsafe {
            (*first).size = size - HDR;
            (*first).free = true;
            (*first).prev = ptr::null_mut();
            (*first).next = ptr::null_mut();
        }
        inner.first = first;
        inner.start = start;
        inner.end = start + size;
        inner.max_end = start + max_size;
    }

    /// Registers the grow callback used when the heap runs out of space.
    pub fn set_grow_fn(&self, f: GrowFn) {
        self.inner.lock().grow_fn = Some(f);
    }

    /// Allocates `size` bytes; `page_aligned` forces a 4 KiB-aligned
    /// payload. Returns `None` on exhaustion (callers report `ENOMEM`).
    pub fn alloc(&self, size: usize, page_aligned: bool) -> Option<*mut u8> {
        let size = lepton_core::addr::align_up(size.max(MIN_PAYLOAD), GRAIN);
        let mut inner = self.inner.lock();

        if let Some(p) = Self::fit(&mut inner, size, page_aligned) {
            return Some(p);
        }

        // First fit failed: grow the region tail and retry once.
        let grow = inner.grow_fn?;
        let room = inner.max_end - inner.end;
        // Worst case for an aligned request: a page of slack plus headers.
        let mut want = size + 2 * HDR + MIN_PAYLOAD;
        if page_aligned {
            want += PAGE_SIZE;
        }
        let want = lepton_core::addr::align_up(want, PAGE_SIZE).min(room);
        if want == 0 {
            return None;
        }
        let granted = grow(inner.end, want)?;
        assert!(inner.end + granted <= inner.max_end, "heap grew past cap");
        Self::append_region(&mut inner, granted);
        Self::fit(&mut inner, size, page_aligned)
    }

    /// Frees a pointer previously returned by [`alloc`](Heap::alloc).
    ///
    /// # Panics
    ///
    /// Panics on double free — a corrupted-invariant condition.
    ///
    /// # Safety
    ///
    /// `p` must come from this heap and not be freed twice concurrently.
    pub unsafe fn free(&self, p: *mut u8) {
        let _inner = self.inner.lock();
        let block = (p as usize - HDR) as *mut BlockHeader;
        // SAFETY: alloc produced p, so a header precedes it.
        unsafe {
            assert!(!(*block).free, "heap double free at {p:p}");
            (*block).free = true;
            Self::coalesce(block);
        }
    }

    /// Number of free blocks in the list (test/diagnostic aid).
    pub fn free_blocks(&self) -> usize {
        let inner = self.inner.lock();
        let mut n = 0;
        let mut cur = inner.first;
        while !cur.is_null() {
            // SAFETY: list pointers are maintained under the lock.
            unsafe {
                if (*cur).free {
                    n += 1;
                }
                cur = (*cur).next;
            }
        }
        n
    }

    /// Total free payload bytes.
    pub fn free_bytes(&self) -> usize {
        let inner = self.inner.lock();
        let mut n = 0;
        let mut cur = inner.first;
        while !cur.is_null() {
            // SAFETY: list pointers are maintained under the lock.
            unsafe {
                if (*cur).free {
                    n += (*cur).size;
                }
                cur = (*cur).next;
            }
        }
        n
    }

    /// Walks the list checking the structural invariants: address order,
    /// back links, and no adjacent free blocks. Panics on violation.
    pub fn check_invariants(&self) {
        let inner = self.inner.lock();
        let mut cur = inner.first;
        let mut prev: *mut BlockHeader = ptr::null_mut();
        while !cur.is_null() {
            // SAFETY: list pointers are maintained under the lock.
            unsafe {
                assert_eq!((*cur).prev, prev, "broken back link");
                if !prev.is_null() {
                    assert!(
                        (prev as usize) < cur as usize,
                        "block list out of address order"
                    );
                    assert!(
                        !((*prev).free && (*cur).free),
                        "adjacent free blocks survived a free"
                    );
                    assert_eq!(
                        prev as usize + HDR + (*prev).size,
                        cur as usize,
                        "gap between blocks"
                    );
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
    }

    /// First-fit scan. Splits oversized hits and carves alignment
    /// sentinels for page-aligned requests.
    fn fit(inner: &mut HeapInner, size: usize, page_aligned: bool) -> Option<*mut u8> {
        let mut cur = inner.first;
        while !cur.is_null() {
            // SAFETY: list pointers are maintained under the lock held
            // by the caller.
            unsafe {
                if (*cur).free {
                    if !page_aligned {
                        if (*cur).size >= size {
                            Self::take(cur, size);
                            return Some((cur as usize + HDR) as *mut u8);
                        }
                    } else if let Some(block) = Self::take_aligned(cur, size) {
                        return Some((block as usize + HDR) as *mut u8);
                    }
                }
                cur = (*cur).next;
            }
        }
        None
    }

    /// Marks `block` allocated, splitting off the tail when the surplus
    /// can hold a header plus a minimal payload.
    ///
    /// # Safety
    ///
    /// `block` must be a free list member with `size` payload available,
    /// and the heap lock must be held.
    unsafe fn take(block: *mut BlockHeader, size: usize) {
        // SAFETY: per contract.
        unsafe {
            let surplus = (*block).size - size;
            if surplus >= HDR + MIN_PAYLOAD {
                let tail = (block as usize + HDR + size) as *mut BlockHeader;
                (*tail).size = surplus - HDR;
                (*tail).free = true;
                (*tail).prev = block;
                (*tail).next = (*block).next;
                if !(*tail).next.is_null() {
                    (*(*tail).next).prev = tail;
                }
                (*block).next = tail;
                (*block).size = size;
            }
            (*block).free = false;
        }
    }

    /// Page-aligned variant of [`take`](Heap::take): positions the
    /// payload on a 4 KiB boundary, leaving the slack before it as a
    /// free sentinel block.
    ///
    /// # Safety
    ///
    /// `cur` must be a free list member and the heap lock must be held.
    unsafe fn take_aligned(cur: *mut BlockHeader, size: usize) -> Option<*mut BlockHeader> {
        // SAFETY: per contract.
        unsafe {
            let payload = cur as usize + HDR;
            let block_end = payload + (*cur).size;

            // Find the first page boundary leaving room for the sentinel.
            let mut aligned = lepton_core::addr::align_up(payload, PAGE_SIZE);
            if aligned != payload {
                while aligned - payload < HDR + MIN_PAYLOAD + HDR {
                    aligned += PAGE_SIZE;
                }
            }
            if aligned + size > block_end {
                return None;
            }

            if aligned == payload {
                Self::take(cur, size);
                return Some(cur);
            }

            // Sentinel keeps [cur, aligned - HDR); the new block header
            // sits immediately below the aligned payload.
            let block = (aligned - HDR) as *mut BlockHeader;
            (*block).size = block_end - aligned;
            (*block).free = true;
            (*block).prev = cur;
            (*block).next = (*cur).next;
            if !(*block).next.is_null() {
                (*(*block).next).prev = block;
            }
            (*cur).next = block;
            (*cur).size = (block as usize) - payload;
            debug_assert!((*cur).free);

            Self::take(block, size);
            Some(block)
        }
    }

    /// Merges `block` with free neighbors on both sides.
    ///
    /// # Safety
    ///
    /// `block` must be a list member marked free; lock held.
    unsafe fn coalesce(block: *mut BlockHeader) {
        // SAFETY: per contract.
        unsafe {
            // Absorb the successor first so the predecessor merge sees
            // the final size.
            let next = (*block).next;
            if !next.is_null() && (*next).free {
                (*block).size += HDR + (*next).size;
                (*block).next = (*next).next;
                if !(*block).next.is_null() {
                    (*(*block).next).prev = block;
                }
            }
            let prev = (*block).prev;
            if !prev.is_null() && (*prev).free {
                (*prev).size += HDR + (*block).size;
                (*prev).next = (*block).next;
                if !(*prev).next.is_null() {
                    (*(*prev).next).prev = prev;
                }
            }
        }
    }

    /// Appends `granted` freshly mapped bytes at the region tail as a
    /// free block, merging with a trailing free block if present.
    fn append_region(inner: &mut HeapInner, granted: usize) {
        let new_block = inner.end as *mut BlockHeader;
        // Find the last block.
        let mut last = inner.first;
        // SAFETY: list pointers are maintained under the lock.
        unsafe {
            while !(*last).next.is_null() {
                last = (*last).next;
            }
            if (*last).free {
                // The tail block just grows.
                (*last).size += granted;
            } else {
                (*new_block).size = granted - HDR;
                (*new_block).free = true;
                (*new_block).prev = last;
                (*new_block).next = ptr::null_mut();
                (*last).next = new_block;
            }
        }
        inner.end += granted;
    }
}

// SAFETY: all mutation happens under the internal lock; alloc/dealloc
// uphold the GlobalAlloc contract (null on failure, unique payloads).
unsafe impl GlobalAlloc for Heap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let page_aligned = layout.align() > GRAIN;
        assert!(
            layout.align() <= PAGE_SIZE,
            "unsupported alignment {}",
            layout.align()
        );
        self.alloc(layout.size(), page_aligned)
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        // SAFETY: p came from alloc above.
        unsafe { self.free(p) };
    }
}

/// The kernel's global allocator instance. Boot code initializes it over
/// the configured heap window and registers a grow callback that maps
/// frames at the tail.
#[cfg_attr(target_os = "none", global_allocator)]
pub static KERNEL_HEAP: Heap = Heap::empty();

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs `f` against a heap initialized over a page-aligned host
    /// buffer of `size` bytes (growable to `max` if larger).
    fn with_heap<F: FnOnce(&Heap)>(size: usize, max: usize, f: F) {
        let layout = Layout::from_size_align(max, PAGE_SIZE).unwrap();
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let heap = Heap::empty();
        unsafe { heap.init(buf as usize, size, max) };
        f(&heap);
        unsafe { std::alloc::dealloc(buf, layout) };
    }

    #[test]
    fn alloc_free_roundtrip() {
        with_heap(4096, 4096, |h| {
            let before = h.free_bytes();
            let p = h.alloc(100, false).unwrap();
            assert!(h.free_bytes() < before);
            unsafe { h.free(p) };
            assert_eq!(h.free_blocks(), 1);
            assert_eq!(h.free_bytes(), before, "coalescing restores the pool");
            h.check_invariants();
        });
    }

    #[test]
    fn split_leaves_remainder_usable() {
        with_heap(4096, 4096, |h| {
            let a = h.alloc(64, false).unwrap();
            let b = h.alloc(512, false).unwrap();
            assert!(b as usize > a as usize);
            h.check_invariants();
            unsafe {
                h.free(a);
                h.free(b);
            }
            assert_eq!(h.free_blocks(), 1);
        });
    }

    #[test]
    fn coalesce_both_neighbors() {
        with_heap(8192, 8192, |h| {
            let a = h.alloc(64, false).unwrap();
            let b = h.alloc(64, false).unwrap();
            let c = h.alloc(64, false).unwrap();
            unsafe {
                h.free(a);
                h.free(c);
            }
            // a and c free, b between them: three free regions total
            // counting the tail block.
            h.check_invariants();
            unsafe { h.free(b) };
            h.check_invariants();
            assert_eq!(h.free_blocks(), 1);
        });
    }

    #[test]
    fn page_aligned_payload() {
        with_heap(4 * 4096, 4 * 4096, |h| {
            let p = h.alloc(256, true).unwrap();
            assert_eq!(p as usize % PAGE_SIZE, 0, "payload not page aligned");
            h.check_invariants();
            unsafe { h.free(p) };
            assert_eq!(h.free_blocks(), 1);
        });
    }

    #[test]
    fn page_aligned_after_small_alloc() {
        with_heap(8 * 4096, 8 * 4096, |h| {
            let small = h.alloc(24, false).unwrap();
            let aligned = h.alloc(4096, true).unwrap();
            assert_eq!(aligned as usize % PAGE_SIZE, 0);
            h.check_invariants();
            unsafe {
                h.free(small);
                h.free(aligned);
            }
            assert_eq!(h.free_blocks(), 1);
        });
    }

    #[test]
    fn exhaustion_returns_none() {
        with_heap(4096, 4096, |h| {
            assert!(h.alloc(2 * 4096, false).is_none());
        });
    }

    #[test]
    fn grow_callback_extends_heap() {
        // The grow fn pretends the region tail is mapped (it is: the
        // test buffer spans the full max size).
        fn grow(_end: usize, min: usize) -> Option<usize> {
            Some(lepton_core::addr::align_up(min, PAGE_SIZE))
        }
        with_heap(4096, 16 * 4096, |h| {
            h.set_grow_fn(grow);
            let p = h.alloc(6 * 4096, false).unwrap();
            h.check_invariants();
            unsafe { h.free(p) };
        });
    }

    #[test]
    fn grow_respects_cap() {
        fn grow(_end: usize, min: usize) -> Option<usize> {
            Some(lepton_core::addr::align_up(min, PAGE_SIZE))
        }
        with_heap(4096, 2 * 4096, |h| {
            h.set_grow_fn(grow);
            // Larger than max_end allows even after growth.
            assert!(h.alloc(8 * 4096, false).is_none());
        });
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let layout = Layout::from_size_align(4096, PAGE_SIZE).unwrap();
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        let heap = Heap::empty();
        unsafe {
            heap.init(buf as usize, 4096, 4096);
            let p = heap.alloc(32, false).unwrap();
            heap.free(p);
            heap.free(p);
        }
    }

    #[test]
    fn interleaved_stress_coalesces_fully() {
        with_heap(64 * 4096, 64 * 4096, |h| {
            // Deterministic xorshift so the pattern is reproducible.
            let mut state = 0x2545_F491u32;
            let mut rand = move || {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state
            };

            let mut live: Vec<*mut u8> = Vec::new();
            for _ in 0..1000 {
                if live.len() > 40 || (!live.is_empty() && rand() % 3 == 0) {
                    let idx = rand() as usize % live.len();
                    let p = live.swap_remove(idx);
                    unsafe { h.free(p) };
                } else {
                    let size = 16 + (rand() as usize % 600);
                    if let Some(p) = h.alloc(size, false) {
                        live.push(p);
                    }
                }
            }
            for p in live.drain(..) {
                unsafe { h.free(p) };
            }
            h.check_invariants();
            assert!(h.free_blocks() <= 1, "heap fragmented after full free");
        });
    }
}
