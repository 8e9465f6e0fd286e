//! A cache-line (and, for large sizes, sector) aligned allocator with
//! per-size free lists, used for WAL write buffers that must be aligned for
//! O_DIRECT-style sector writes (spec.md §6).

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

pub const CACHE_LINE_SIZE: usize = 64;

/// Rounds `size` up to the next power of two, with a floor of
/// `CACHE_LINE_SIZE` so small allocations still share free lists cleanly.
fn size_class(size: usize) -> usize {
    size.max(CACHE_LINE_SIZE).next_power_of_two()
}

/// A single aligned heap allocation. Manually freed (or returned to a pool)
/// via `AlignedAllocator`; dropping it without doing either leaks.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    align: usize,
}

impl AlignedBuffer {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Free lists of aligned buffers, bucketed by power-of-two size class, so
/// repeated WAL block allocations of similar size reuse memory instead of
/// round-tripping through the global allocator.
pub struct AlignedAllocator {
    align: usize,
    free_lists: Mutex<std::collections::HashMap<usize, Vec<NonNull<u8>>>>,
}

unsafe impl Send for AlignedAllocator {}
unsafe impl Sync for AlignedAllocator {}

impl AlignedAllocator {
    pub fn new(align: usize) -> Self {
        AlignedAllocator {
            align: align.max(CACHE_LINE_SIZE),
            free_lists: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn alloc(&self, len: usize) -> AlignedBuffer {
        let capacity = size_class(len);
        if let Some(list) = self.free_lists.lock().unwrap().get_mut(&capacity) {
            if let Some(ptr) = list.pop() {
                return AlignedBuffer {
                    ptr,
                    len,
                    capacity,
                    align: self.align,
                };
            }
        }

        let layout = Layout::from_size_align(capacity, self.align)
            .expect("size class is always a valid power-of-two multiple of align");
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        AlignedBuffer {
            ptr,
            len,
            capacity,
            align: self.align,
        }
    }

    /// Returns a buffer to its size class's free list instead of freeing it
    /// to the global allocator.
    pub fn recycle(&self, buffer: AlignedBuffer) {
        let AlignedBuffer {
            ptr, capacity, align, ..
        } = buffer;
        debug_assert_eq!(align, self.align);
        self.free_lists
            .lock()
            .unwrap()
            .entry(capacity)
            .or_default()
            .push(ptr);
    }
}

impl Drop for AlignedAllocator {
    fn drop(&mut self) {
        let mut lists = self.free_lists.lock().unwrap();
        for (capacity, ptrs) in lists.drain() {
            let layout = Layout::from_size_align(capacity, self.align).unwrap();
            for ptr in ptrs {
                unsafe { dealloc(ptr.as_ptr(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_buffer_is_aligned() {
        let pool = AlignedAllocator::new(4096);
        let buf = pool.alloc(512);
        assert_eq!(buf.as_slice().len(), 512);
        assert_eq!(buf.ptr.as_ptr() as usize % 4096, 0);
        pool.recycle(buf);
    }

    #[test]
    fn recycled_buffer_is_reused() {
        let pool = AlignedAllocator::new(64);
        let buf = pool.alloc(100);
        let addr = buf.as_slice().as_ptr() as usize;
        pool.recycle(buf);
        let buf2 = pool.alloc(100);
        assert_eq!(buf2.as_slice().as_ptr() as usize, addr);
    }

    #[test]
    fn size_classes_round_up() {
        assert_eq!(size_class(1), CACHE_LINE_SIZE);
        assert_eq!(size_class(65), 128);
        assert_eq!(size_class(4096), 4096);
    }
}
