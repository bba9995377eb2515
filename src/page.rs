//! Main-tier pages and the per-page compaction that rewrites them.
//!
//! A main page is a bump-filled run of `Main` records, walked by
//! offset. Compaction takes every record of the old page, freezes its
//! delta chain, merges chain entries and pending inserts into one
//! descending version list, throws away what no live snapshot can
//! still see, and emits the survivor into a fill page. The old record
//! is then forwarded so late readers and writers find the rewrite.

#![allow(unsafe_code)]

use std::collections::BTreeMap;

use ::log::trace;

use crate::page_manager::PageManager;
use crate::record::{main_record_len, write_main, MainVersion, Record, RecordKind};
use crate::{Key, Result, Version};

// page header: bytes used by records, written once at build time
const USED: usize = 0;
const DATA: usize = 8;

/// Sealed insert-log entries per key, in append order, awaiting a
/// main-tier home. Ordered so leftover keys pack in key order.
pub(crate) type InsertMap = BTreeMap<Key, Vec<u64>>;

unsafe fn page_used(page: *mut u8) -> usize {
    (page.add(USED) as *const u64).read() as usize
}

/// Iterate the records of a published main page.
pub(crate) fn page_records(page: *mut u8) -> PageScan {
    PageScan {
        page,
        pos: 0,
        used: unsafe { page_used(page) },
    }
}

pub(crate) struct PageScan {
    page: *mut u8,
    pos: usize,
    used: usize,
}

impl Iterator for PageScan {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if self.pos >= self.used {
            return None;
        }
        let record = unsafe { Record::from_raw(self.page.add(DATA + self.pos)) };
        self.pos += record.main_len();
        Some(record)
    }
}

fn collect_chain(base: Record, head: u64, out: &mut Vec<MainVersion>) {
    let mut node_addr = head;
    while node_addr != 0 && node_addr != base.addr() {
        let node = Record::from_addr(node_addr);
        if node.is_valid_data_record() {
            let payload = match node.kind() {
                RecordKind::Delete => None,
                _ => {
                    let data = node.payload();
                    Some((data.as_ptr(), data.len()))
                }
            };
            out.push((node.version(), payload));
        }
        node_addr = node.previous();
    }
    match base.kind() {
        RecordKind::Insert => {
            if base.is_valid_data_record() {
                let data = base.payload();
                out.push((base.version(), Some((data.as_ptr(), data.len()))));
            }
        }
        RecordKind::Main => {
            for i in 0..base.main_count() {
                let version = base.main_version(i);
                if version == 0 {
                    continue;
                }
                let payload = if base.main_is_delete(i) {
                    None
                } else {
                    let data = base.main_payload(i);
                    Some((data.as_ptr(), data.len()))
                };
                out.push((version, payload));
            }
        }
        kind => unreachable!("chain rooted at {:?} record", kind),
    }
}

/// Keep everything some snapshot may still need: all versions at or
/// above the watermark, plus the newest older one standing in for the
/// rest, unless that one is a delete. An empty result drops the key.
fn compact(items: &[MainVersion], min_version: Version) -> Vec<MainVersion> {
    let mut kept = Vec::with_capacity(items.len());
    for &(version, payload) in items {
        if version >= min_version {
            kept.push((version, payload));
        } else {
            if payload.is_some() {
                kept.push((version, payload));
            }
            break;
        }
    }
    kept
}

/// Builds the replacement main tier for one sweep: fill pages plus the
/// rewritten records' new addresses.
pub(crate) struct Rewriter<'a> {
    pm: &'a PageManager,
    min_version: Version,
    fill: *mut u8,
    pos: usize,
    pages: Vec<*mut u8>,
}

impl<'a> Rewriter<'a> {
    pub(crate) fn new(pm: &'a PageManager, min_version: Version) -> Result<Rewriter<'a>> {
        let fill = pm.alloc()?;
        Ok(Rewriter {
            pm,
            min_version,
            fill,
            pos: 0,
            pages: Vec::new(),
        })
    }

    fn capacity(&self) -> usize {
        self.pm.page_size() - DATA
    }

    fn roll(&mut self) {
        unsafe {
            (self.fill.add(USED) as *mut u64).write(self.pos as u64);
        }
        self.pages.push(self.fill);
        // an allocation hole here would strand frozen records, so the
        // sweep aborts the process rather than limp on
        self.fill = self
            .pm
            .alloc()
            .expect("page arena exhausted during compaction; raise total_memory");
        self.pos = 0;
    }

    /// Rewrite one key from its base records: the main-tier record
    /// and/or the pending insert-log entries carrying it. Returns the
    /// new record address, or `None` when the key was dropped.
    pub(crate) fn rewrite(&mut self, bases: &[Record]) -> Option<u64> {
        debug_assert!(!bases.is_empty());
        let key = bases[0].key();

        // freeze every base first so the merged view cannot grow under us
        let heads: Vec<u64> = bases.iter().map(|base| base.freeze()).collect();

        let mut items = Vec::new();
        for (base, head) in bases.iter().zip(&heads) {
            collect_chain(*base, *head, &mut items);
        }
        // newest first; chain order breaks ties so a transaction's
        // latest write of a version wins
        items.sort_by(|a, b| b.0.cmp(&a.0));
        items.dedup_by_key(|item| item.0);

        let kept = compact(&items, self.min_version);
        if kept.is_empty() {
            trace!("gc drops key {}", key);
            for base in bases {
                base.forward(0);
            }
            return None;
        }

        let len = main_record_len(&kept);
        assert!(len <= self.capacity(), "record larger than a page");
        if self.pos + len > self.capacity() {
            self.roll();
        }
        let dst = unsafe { self.fill.add(DATA + self.pos) };
        let written = unsafe { write_main(dst, key, &kept) };
        debug_assert_eq!(written, len);
        self.pos += written;

        let addr = dst as u64;
        for base in bases {
            base.forward(addr);
        }
        Some(addr)
    }

    /// Seal the last fill page and hand the new page list over.
    pub(crate) fn finish(self) -> Vec<*mut u8> {
        let mut pages = self.pages;
        if self.pos > 0 {
            unsafe {
                (self.fill.add(USED) as *mut u64).write(self.pos as u64);
            }
            pages.push(self.fill);
        } else {
            self.pm.free(self.fill);
        }
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crossbeam_epoch::pin;

    use crate::record::HEADER_LEN;
    use crate::snapshot::SnapshotDescriptor;
    use crate::{log::Log, record::Visibility};

    fn pm() -> Arc<PageManager> {
        Arc::new(PageManager::new(32 * 4096, 4096))
    }

    fn insert_entry(log: &Log, key: Key, version: Version, payload: &[u8]) -> Record {
        let entry = log.append(HEADER_LEN + payload.len()).unwrap();
        entry.record().init(RecordKind::Insert, key, version, payload);
        entry.seal();
        entry.record()
    }

    fn chain_update(log: &Log, base: Record, version: Version, payload: Option<&[u8]>) {
        let data = payload.unwrap_or(b"");
        let entry = log.append(HEADER_LEN + data.len()).unwrap();
        let kind = if payload.is_some() {
            RecordKind::Update
        } else {
            RecordKind::Delete
        };
        entry.record().init(kind, base.key(), version, data);
        base.update(entry.record(), &SnapshotDescriptor::new(version, version))
            .unwrap();
        entry.seal();
    }

    #[test]
    fn compact_keeps_watermarked_versions() {
        let a = b"a";
        let items: Vec<MainVersion> = vec![
            (30, Some((a.as_ptr(), 1))),
            (20, None),
            (10, Some((a.as_ptr(), 1))),
            (5, Some((a.as_ptr(), 1))),
        ];
        let kept = compact(&items, 15);
        // 30 and the delete at 20 survive; 10 stands in for everything older
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].0, 30);
        assert_eq!(kept[1].0, 20);
        assert_eq!(kept[2].0, 10);

        // a below-watermark delete erases the key
        let deleted: Vec<MainVersion> = vec![(8, None), (3, Some((a.as_ptr(), 1)))];
        assert!(compact(&deleted, 15).is_empty());
    }

    #[test]
    fn rewrite_merges_chain_and_forwards() {
        let pm = pm();
        let insert_log = Log::new(Arc::clone(&pm)).unwrap();
        let update_log = Log::new(Arc::clone(&pm)).unwrap();
        let guard = pin();

        let base = insert_entry(&insert_log, 7, 10, b"v1");
        chain_update(&update_log, base, 12, Some(b"v2"));
        chain_update(&update_log, base, 14, Some(b"v3"));

        let mut rewriter = Rewriter::new(&pm, 13).unwrap();
        let addr = rewriter.rewrite(&[base]).unwrap();
        let pages = rewriter.finish();
        assert_eq!(pages.len(), 1);

        let new_record = Record::from_addr(addr);
        assert_eq!(new_record.key(), 7);
        // 14 kept, 12 is the below-watermark survivor, 10 coalesced away
        assert_eq!(new_record.main_count(), 2);
        assert_eq!(new_record.main_version(0), 14);
        assert_eq!(new_record.main_version(1), 12);

        // the old base forwards readers to the rewrite
        assert!(base.absorbed());
        match base.read(&SnapshotDescriptor::new(15, 14), &guard) {
            Visibility::Found { data, version, .. } => {
                assert_eq!(data, b"v3");
                assert_eq!(version, 14);
            }
            other => panic!("unexpected {:?}", other),
        }

        let records: Vec<_> = page_records(pages[0]).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr(), addr);

        for page in pages {
            pm.free(page);
        }
    }

    #[test]
    fn rewrite_drops_deleted_keys() {
        let pm = pm();
        let insert_log = Log::new(Arc::clone(&pm)).unwrap();
        let update_log = Log::new(Arc::clone(&pm)).unwrap();
        let guard = pin();

        let base = insert_entry(&insert_log, 9, 5, b"gone");
        chain_update(&update_log, base, 8, None);

        let mut rewriter = Rewriter::new(&pm, 20).unwrap();
        assert_eq!(rewriter.rewrite(&[base]), None);
        assert!(rewriter.finish().is_empty());

        assert_eq!(
            base.read(&SnapshotDescriptor::new(21, 20), &guard),
            Visibility::Dropped
        );
    }

    #[test]
    fn rewrite_splices_reinsert_after_delete() {
        let pm = pm();
        let insert_log = Log::new(Arc::clone(&pm)).unwrap();
        let update_log = Log::new(Arc::clone(&pm)).unwrap();
        let guard = pin();

        let first = insert_entry(&insert_log, 4, 5, b"old");
        chain_update(&update_log, first, 8, None);
        let second = insert_entry(&insert_log, 4, 10, b"new");

        let mut rewriter = Rewriter::new(&pm, 6).unwrap();
        let addr = rewriter.rewrite(&[first, second]).unwrap();
        let pages = rewriter.finish();

        let record = Record::from_addr(addr);
        assert_eq!(record.main_count(), 3);
        assert_eq!(record.main_version(0), 10);
        assert_eq!(record.main_version(1), 8);
        assert!(record.main_is_delete(1));
        assert_eq!(record.main_version(2), 5);

        match record.read(&SnapshotDescriptor::new(12, 10), &guard) {
            Visibility::Found {
                data, is_newest, ..
            } => {
                assert_eq!(data, b"new");
                assert!(is_newest);
            }
            other => panic!("unexpected {:?}", other),
        }

        for page in pages {
            pm.free(page);
        }
    }

    #[test]
    fn fill_pages_roll_when_full() {
        let pm = pm();
        let insert_log = Log::new(Arc::clone(&pm)).unwrap();

        let payload = [1u8; 700];
        let bases: Vec<Record> = (1..=16)
            .map(|key| insert_entry(&insert_log, key, 2, &payload))
            .collect();

        let mut rewriter = Rewriter::new(&pm, 1).unwrap();
        for base in &bases {
            rewriter.rewrite(std::slice::from_ref(base)).unwrap();
        }
        let pages = rewriter.finish();
        assert!(pages.len() > 1, "expected the fill page to roll");

        let total: usize = pages.iter().map(|p| page_records(*p).count()).sum();
        assert_eq!(total, 16);

        for page in pages {
            pm.free(page);
        }
    }
}
