//! A lock-free, append-only log: a singly linked chain of sealed
//! fixed-capacity pages, written by many threads through atomic
//! reservations and read through a forward iterator in append order.
//!
//! Appending reserves space with a CAS on the page cursor, leaving the
//! entry unsealed; the writer fills it in and then seals it. Append
//! order is the order iterators observe, which makes the log the
//! serialization point for concurrent writers on the same key.

#![allow(unsafe_code)]

use std::hint::spin_loop;
use std::sync::atomic::{
    AtomicPtr, AtomicU64, AtomicUsize,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::Arc;

use crossbeam_epoch::Guard;
use crossbeam_utils::CachePadded;

use crate::page_manager::PageManager;
use crate::record::Record;
use crate::Result;

// page header: reservation cursor, then the next-page link
const OFFSET: usize = 0;
const NEXT: usize = 8;
const DATA: usize = 16;

// cursor bit marking a page that no longer accepts reservations
const CLOSED: usize = 1 << 63;

// entry header: low 32 bits record length, bit 32 the sealed flag
const LEN_MASK: u64 = 0xFFFF_FFFF;
const SEALED: u64 = 1 << 32;

pub(crate) const ENTRY_HEADER_LEN: usize = 8;

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

unsafe fn page_offset<'a>(page: *mut u8) -> &'a AtomicUsize {
    &*(page.add(OFFSET) as *const AtomicUsize)
}

unsafe fn page_next<'a>(page: *mut u8) -> &'a AtomicPtr<u8> {
    &*(page.add(NEXT) as *const AtomicPtr<u8>)
}

/// One reserved slot in the log, wrapping the record bytes that
/// follow its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogEntry {
    ptr: *mut u8,
}

impl LogEntry {
    fn header(&self) -> &AtomicU64 {
        unsafe { &*(self.ptr as *const AtomicU64) }
    }

    /// The record stored in this entry.
    pub(crate) fn record(&self) -> Record {
        unsafe { Record::from_raw(self.ptr.add(ENTRY_HEADER_LEN)) }
    }

    /// Publish the entry to iterators. Terminal; sealed entries are
    /// immutable apart from the record's reverted flag, which its own
    /// writer sets before sealing on conflict.
    pub(crate) fn seal(&self) {
        self.header().fetch_or(SEALED, Release);
    }

    pub(crate) fn sealed(&self) -> bool {
        self.header().load(Acquire) & SEALED != 0
    }
}

/// A cursor into the log, used to bound scans and truncation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LogPosition {
    page: *mut u8,
    pos: usize,
}

pub(crate) struct Log {
    pm: Arc<PageManager>,
    head: CachePadded<AtomicPtr<u8>>,
    start: AtomicPtr<u8>,
}

impl Log {
    pub(crate) fn new(pm: Arc<PageManager>) -> Result<Log> {
        let first = Self::fresh_page(&pm)?;
        Ok(Log {
            pm,
            head: CachePadded::new(AtomicPtr::new(first)),
            start: AtomicPtr::new(first),
        })
    }

    fn fresh_page(pm: &PageManager) -> Result<*mut u8> {
        let page = pm.alloc()?;
        unsafe {
            page_offset(page).store(0, Release);
            page_next(page).store(std::ptr::null_mut(), Release);
        }
        Ok(page)
    }

    fn data_capacity(&self) -> usize {
        self.pm.page_size() - DATA
    }

    /// Reserve space for a record of `record_len` bytes. The returned
    /// entry is unsealed; iterators treat it as in progress until the
    /// writer calls [`LogEntry::seal`].
    pub(crate) fn append(&self, record_len: usize) -> Result<LogEntry> {
        let need = align8(ENTRY_HEADER_LEN + record_len);
        assert!(
            need <= self.data_capacity(),
            "record of {} bytes exceeds the page capacity",
            record_len
        );

        loop {
            let page = self.head.load(Acquire);
            let offset = unsafe { page_offset(page) };

            loop {
                let cur = offset.load(Acquire);
                if cur & CLOSED != 0 {
                    break;
                }
                if cur + need > self.data_capacity() {
                    // a page must be closed before it grows a
                    // successor, or iterators would leave append order
                    if offset
                        .compare_exchange(cur, cur | CLOSED, AcqRel, Acquire)
                        .is_ok()
                    {
                        break;
                    }
                    continue;
                }
                if offset
                    .compare_exchange(cur, cur + need, AcqRel, Acquire)
                    .is_ok()
                {
                    let entry = LogEntry {
                        ptr: unsafe { page.add(DATA + cur) },
                    };
                    entry.header().store(record_len as u64, Release);
                    return Ok(entry);
                }
            }

            let next_link = unsafe { page_next(page) };
            let mut next = next_link.load(Acquire);
            if next.is_null() {
                let fresh = Self::fresh_page(&self.pm)?;
                match next_link.compare_exchange(std::ptr::null_mut(), fresh, AcqRel, Acquire) {
                    Ok(_) => next = fresh,
                    Err(current) => {
                        self.pm.free(fresh);
                        next = current;
                    }
                }
            }
            let _ = self.head.compare_exchange(page, next, AcqRel, Acquire);
        }
    }

    /// Forward iterator over all entries, sealed or not, in append
    /// order. The guard keeps truncated pages alive for the duration
    /// of the scan.
    pub(crate) fn iter<'g>(&self, _guard: &'g Guard) -> LogIter<'g> {
        LogIter {
            page: self.start.load(Acquire),
            pos: 0,
            data_capacity: self.data_capacity(),
            _guard,
        }
    }

    /// The current append position. Entries in pages before it were
    /// all appended before this call.
    pub(crate) fn position(&self) -> LogPosition {
        LogPosition {
            page: self.head.load(Acquire),
            pos: 0,
        }
    }

    /// Release every page before `pos`, making `pos` the new start of
    /// iteration. Freed pages outlive any concurrent scan through the
    /// epoch guard. Only the collector truncates, after it has
    /// absorbed the entries.
    pub(crate) fn truncate(&self, pos: LogPosition, guard: &Guard) {
        let mut page = self.start.load(Acquire);
        if page == pos.page {
            return;
        }
        self.start.store(pos.page, Release);
        while !page.is_null() && page != pos.page {
            let next = unsafe { page_next(page).load(Acquire) };
            let pm = Arc::clone(&self.pm);
            let retired = page as usize;
            unsafe {
                guard.defer_unchecked(move || pm.free(retired as *mut u8));
            }
            page = next;
        }
    }
}

unsafe impl Send for Log {}
unsafe impl Sync for Log {}

impl Drop for Log {
    fn drop(&mut self) {
        let mut page = *self.start.get_mut();
        while !page.is_null() {
            let next = unsafe { page_next(page).load(Acquire) };
            self.pm.free(page);
            page = next;
        }
    }
}

pub(crate) struct LogIter<'g> {
    page: *mut u8,
    pos: usize,
    data_capacity: usize,
    _guard: &'g Guard,
}

impl<'g> LogIter<'g> {
    /// The position of the entry the next call to `next` would yield.
    pub(crate) fn position(&self) -> LogPosition {
        LogPosition {
            page: self.page,
            pos: self.pos,
        }
    }
}

impl<'g> Iterator for LogIter<'g> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        loop {
            if self.page.is_null() {
                return None;
            }
            let cursor = unsafe { page_offset(self.page).load(Acquire) };
            let fill = cursor & !CLOSED;
            if self.pos < fill {
                let entry = LogEntry {
                    ptr: unsafe { self.page.add(DATA + self.pos) },
                };
                // a reservation between the cursor bump and the header
                // store is mid-flight for only a few instructions
                let mut header = entry.header().load(Acquire);
                while header == 0 {
                    spin_loop();
                    header = entry.header().load(Acquire);
                }
                self.pos += align8(ENTRY_HEADER_LEN + (header & LEN_MASK) as usize);
                return Some(entry);
            }
            if cursor & CLOSED == 0 {
                // live tail, nothing more to see yet
                return None;
            }
            self.page = unsafe { page_next(self.page).load(Acquire) };
            self.pos = 0;
        }
    }
}
