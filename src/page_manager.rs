//! A bump allocator over one pre-reserved arena, handing out
//! fixed-size pages and reclaiming them through a free list.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, Layout};

use parking_lot::Mutex;

use crate::{Error, Result};

/// Owner of all page memory. Pages are fixed-size, 8-byte aligned and
/// handed out uninitialized; callers write their own headers. Once the
/// arena is exhausted, [`PageManager::alloc`] fails with
/// [`Error::OutOfMemory`].
#[derive(Debug)]
pub(crate) struct PageManager {
    arena: *mut u8,
    layout: Layout,
    page_size: usize,
    free: Mutex<Vec<*mut u8>>,
}

unsafe impl Send for PageManager {}
unsafe impl Sync for PageManager {}

impl PageManager {
    pub(crate) fn new(total_memory: usize, page_size: usize) -> PageManager {
        assert!(page_size >= 4096, "pages must hold at least one record");
        assert_eq!(page_size % 8, 0);
        let pages = total_memory / page_size;
        assert!(pages > 0, "arena smaller than a single page");

        let layout = Layout::from_size_align(pages * page_size, 8).unwrap();
        let arena = unsafe { alloc(layout) };
        assert!(!arena.is_null(), "arena reservation failed");

        // hand out low addresses first
        let free = (0..pages)
            .rev()
            .map(|i| unsafe { arena.add(i * page_size) })
            .collect();

        PageManager {
            arena,
            layout,
            page_size,
            free: Mutex::new(free),
        }
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn alloc(&self) -> Result<*mut u8> {
        self.free.lock().pop().ok_or(Error::OutOfMemory)
    }

    pub(crate) fn free(&self, page: *mut u8) {
        debug_assert!(
            (page as usize) >= (self.arena as usize)
                && (page as usize) < (self.arena as usize) + self.layout.size()
                && (page as usize - self.arena as usize) % self.page_size == 0,
            "freed pointer is not a page of this arena"
        );
        self.free.lock().push(page);
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.arena, self.layout);
        }
    }
}
