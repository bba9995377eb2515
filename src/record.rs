//! The record codec shared by the main tier and the delta logs.
//!
//! Every record starts with the same 48-byte header over raw 8-byte
//! aligned memory. Log records (`Insert`, `Update`, `Delete`) carry a
//! single version and an opaque payload; `Main` records carry a whole
//! descending version history in one contiguous chunk. Versions of one
//! key form a newest-to-oldest chain: the base record's `newest` word
//! points at the most recent delta entry, and each delta entry's
//! `previous` word points at the next older one, terminating at the
//! base itself.
//!
//! The low bits of the `newest` word double as the relocation tags the
//! collector uses: a *frozen* record no longer accepts chain
//! extensions, and a *forwarded* record redirects readers to its
//! rewritten successor (address zero meaning the record was dropped
//! entirely).

#![allow(unsafe_code)]

use std::sync::atomic::{
    AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use crate::snapshot::SnapshotDescriptor;
use crate::{Error, Key, Result, Version};

/// Bytes of the common record header.
pub(crate) const HEADER_LEN: usize = 48;

const META: usize = 0;
const KEY: usize = 8;
const VERSION: usize = 16;
const PREVIOUS: usize = 24;
const NEWEST: usize = 32;
const SIZE: usize = 40;

const KIND_MASK: u64 = 0xFF;
const REVERTED: u64 = 1 << 8;

// relocation tags in the low bits of `newest`; addresses are 8-aligned
const FROZEN: u64 = 1;
const FORWARDED: u64 = 2;
const TAGS: u64 = 7;

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// What a record is. `Main` lives in main-tier pages; the log kinds
/// live in the insert and update logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    Main,
    Insert,
    Update,
    Delete,
}

impl RecordKind {
    fn from_meta(meta: u64) -> RecordKind {
        match meta & KIND_MASK {
            1 => RecordKind::Main,
            2 => RecordKind::Insert,
            3 => RecordKind::Update,
            4 => RecordKind::Delete,
            other => unreachable!("corrupt record kind {}", other),
        }
    }

    fn to_meta(self) -> u64 {
        match self {
            RecordKind::Main => 1,
            RecordKind::Insert => 2,
            RecordKind::Update => 3,
            RecordKind::Delete => 4,
        }
    }
}

/// The outcome of walking a record's version chain under a snapshot.
#[derive(Debug, PartialEq)]
pub(crate) enum Visibility<'g> {
    /// The newest visible version holds data. `is_newest` is true when
    /// no valid version anywhere in the chain is newer.
    Found {
        data: &'g [u8],
        version: Version,
        is_newest: bool,
    },
    /// The newest visible version is a delete marker.
    Deleted { is_newest: bool },
    /// Versions exist, but none is visible to this snapshot.
    NotInSnapshot,
    /// The record was compacted away entirely; treat it as absent.
    Dropped,
}

/// An untyped view of a record at a raw address. Copyable and cheap;
/// validity of the address is the caller's obligation (records live in
/// log or main pages whose reclamation is epoch-deferred).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Record {
    ptr: *mut u8,
}

impl Record {
    pub(crate) unsafe fn from_raw(ptr: *mut u8) -> Record {
        debug_assert_eq!(ptr as usize % 8, 0);
        Record { ptr }
    }

    pub(crate) fn from_addr(addr: u64) -> Record {
        Record {
            ptr: addr as *mut u8,
        }
    }

    pub(crate) fn addr(self) -> u64 {
        self.ptr as u64
    }

    fn word(self, offset: usize) -> &'static AtomicU64 {
        unsafe { &*(self.ptr.add(offset) as *const AtomicU64) }
    }

    fn read_u64(self, offset: usize) -> u64 {
        unsafe { (self.ptr.add(offset) as *const u64).read() }
    }

    fn write_u64(self, offset: usize, value: u64) {
        unsafe { (self.ptr.add(offset) as *mut u64).write(value) }
    }

    pub(crate) fn kind(self) -> RecordKind {
        RecordKind::from_meta(self.word(META).load(Acquire))
    }

    pub(crate) fn key(self) -> Key {
        self.read_u64(KEY)
    }

    pub(crate) fn version(self) -> Version {
        self.read_u64(VERSION)
    }

    fn payload_len(self) -> usize {
        self.read_u64(SIZE) as usize
    }

    pub(crate) fn payload<'a>(self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.add(HEADER_LEN), self.payload_len()) }
    }

    /// Initialize a freshly reserved log record. Must happen before
    /// the enclosing log entry is sealed.
    pub(crate) fn init(self, kind: RecordKind, key: Key, version: Version, payload: &[u8]) {
        debug_assert!(kind != RecordKind::Main);
        self.write_u64(KEY, key);
        self.write_u64(VERSION, version);
        self.write_u64(SIZE, payload.len() as u64);
        self.word(PREVIOUS).store(0, Relaxed);
        self.word(NEWEST).store(0, Relaxed);
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), self.ptr.add(HEADER_LEN), payload.len());
        }
        self.word(META).store(kind.to_meta(), Release);
    }

    /// False for log entries whose writer aborted them.
    pub(crate) fn is_valid_data_record(self) -> bool {
        self.word(META).load(Acquire) & REVERTED == 0
    }

    pub(crate) fn set_reverted(self) {
        self.word(META).fetch_or(REVERTED, AcqRel);
    }

    pub(crate) fn previous(self) -> u64 {
        self.word(PREVIOUS).load(Acquire)
    }

    fn newest_word(self) -> u64 {
        self.word(NEWEST).load(Acquire)
    }

    /// Whether the collector already rewrote this record elsewhere.
    pub(crate) fn absorbed(self) -> bool {
        self.newest_word() & FORWARDED != 0
    }

    /// Follow relocation forwards to the record currently holding this
    /// key's history. `None` when the record was dropped.
    pub(crate) fn resolve(self) -> Option<Record> {
        let mut record = self;
        loop {
            let word = record.newest_word();
            if word & FORWARDED == 0 {
                return Some(record);
            }
            let addr = word & !TAGS;
            if addr == 0 {
                return None;
            }
            record = Record::from_addr(addr);
        }
    }

    /// Walk the chain newest-to-oldest and return the first version
    /// visible to `snapshot`.
    pub(crate) fn read<'g>(
        self,
        snapshot: &SnapshotDescriptor,
        _guard: &'g crossbeam_epoch::Guard,
    ) -> Visibility<'g> {
        let base = match self.resolve() {
            Some(base) => base,
            None => return Visibility::Dropped,
        };
        let mut is_newest = true;
        let mut node_addr = base.newest_word() & !TAGS;
        while node_addr != 0 && node_addr != base.addr() {
            let node = Record::from_addr(node_addr);
            if node.is_valid_data_record() {
                let version = node.version();
                if snapshot.visible(version) {
                    return match node.kind() {
                        RecordKind::Delete => Visibility::Deleted { is_newest },
                        _ => Visibility::Found {
                            data: node.payload(),
                            version,
                            is_newest,
                        },
                    };
                }
                is_newest = false;
            }
            node_addr = node.previous();
        }
        match base.kind() {
            RecordKind::Insert => {
                if base.is_valid_data_record() {
                    let version = base.version();
                    if snapshot.visible(version) {
                        return Visibility::Found {
                            data: base.payload(),
                            version,
                            is_newest,
                        };
                    }
                }
                Visibility::NotInSnapshot
            }
            RecordKind::Main => {
                for i in 0..base.main_count() {
                    let version = base.main_version(i);
                    if version == 0 {
                        // reverted slot
                        continue;
                    }
                    if snapshot.visible(version) {
                        if base.main_is_delete(i) {
                            return Visibility::Deleted { is_newest };
                        }
                        return Visibility::Found {
                            data: base.main_payload(i),
                            version,
                            is_newest,
                        };
                    }
                    is_newest = false;
                }
                Visibility::NotInSnapshot
            }
            kind => unreachable!("chain rooted at {:?} record", kind),
        }
    }

    fn newest_version(self, head: u64) -> Version {
        let mut node_addr = head;
        while node_addr != 0 && node_addr != self.addr() {
            let node = Record::from_addr(node_addr);
            if node.is_valid_data_record() {
                return node.version();
            }
            node_addr = node.previous();
        }
        match self.kind() {
            RecordKind::Insert => self.version(),
            RecordKind::Main => (0..self.main_count())
                .map(|i| self.main_version(i))
                .find(|v| *v != 0)
                .unwrap_or(0),
            kind => unreachable!("chain rooted at {:?} record", kind),
        }
    }

    /// Extend the chain with `new_entry` by swinging `newest` from the
    /// observed head. Fails with [`Error::NotInSnapshot`] when the
    /// current head version is outside the snapshot (a pending or
    /// future writer got there first), and with [`Error::Conflict`]
    /// when the CAS loses a race or the collector froze the record.
    pub(crate) fn update(self, new_entry: Record, snapshot: &SnapshotDescriptor) -> Result<()> {
        let word = self.newest_word();
        if word & TAGS != 0 {
            return Err(Error::Conflict);
        }
        let newest = self.newest_version(word);
        if newest != 0 && !snapshot.visible(newest) {
            return Err(Error::NotInSnapshot);
        }
        let previous = if word == 0 { self.addr() } else { word };
        new_entry.word(PREVIOUS).store(previous, Release);
        self.word(NEWEST)
            .compare_exchange(word, new_entry.addr(), AcqRel, Acquire)
            .map(|_| ())
            .map_err(|_| Error::Conflict)
    }

    /// Roll back every node of `version` in this record's chain.
    pub(crate) fn revert(self, version: Version) -> Result<()> {
        let base = match self.resolve() {
            Some(base) => base,
            None => return Err(Error::NotFound),
        };
        if base.newest_word() & FROZEN != 0 {
            return Err(Error::Conflict);
        }
        let mut reverted = false;
        let mut node_addr = base.newest_word() & !TAGS;
        while node_addr != 0 && node_addr != base.addr() {
            let node = Record::from_addr(node_addr);
            if node.is_valid_data_record() && node.version() == version {
                node.set_reverted();
                reverted = true;
            }
            node_addr = node.previous();
        }
        match base.kind() {
            RecordKind::Insert => {
                if base.is_valid_data_record() && base.version() == version {
                    base.set_reverted();
                    reverted = true;
                }
            }
            RecordKind::Main => {
                for i in 0..base.main_count() {
                    if base.main_version(i) == version {
                        base.main_version_slot(i).store(0, Release);
                        reverted = true;
                    }
                }
            }
            kind => unreachable!("chain rooted at {:?} record", kind),
        }
        if !reverted {
            return Err(Error::NotFound);
        }
        // a sweep that froze the record mid-revert may have collected
        // the chain before our flags landed; make the caller retry
        // against the rewritten record
        if base.newest_word() & FROZEN != 0 {
            return Err(Error::Conflict);
        }
        Ok(())
    }

    /// Stop all chain extensions on this record, returning the frozen
    /// head. Collector-only; runs once per record per sweep.
    pub(crate) fn freeze(self) -> u64 {
        loop {
            let word = self.newest_word();
            debug_assert_eq!(word & TAGS, 0, "record frozen twice");
            if self
                .word(NEWEST)
                .compare_exchange(word, word | FROZEN, AcqRel, Acquire)
                .is_ok()
            {
                return word;
            }
        }
    }

    /// Redirect a frozen record to its rewritten successor, or mark it
    /// dropped with `new_addr == 0`. Collector-only.
    pub(crate) fn forward(self, new_addr: u64) {
        debug_assert_eq!(new_addr & TAGS, 0);
        debug_assert_ne!(self.newest_word() & FROZEN, 0, "forwarding unfrozen record");
        self.word(NEWEST).store(new_addr | FROZEN | FORWARDED, Release);
    }

    // main-record accessors; the body is a descending version array,
    // an offset array with one extra end slot, then the payload arena

    pub(crate) fn main_count(self) -> usize {
        self.read_u64(SIZE) as usize
    }

    fn main_version_slot(self, i: usize) -> &'static AtomicU64 {
        self.word(HEADER_LEN + 8 * i)
    }

    pub(crate) fn main_version(self, i: usize) -> Version {
        self.main_version_slot(i).load(Acquire)
    }

    fn main_offset(self, i: usize) -> usize {
        let n = self.main_count();
        unsafe { (self.ptr.add(HEADER_LEN + 8 * n + 4 * i) as *const u32).read_unaligned() as usize }
    }

    pub(crate) fn main_is_delete(self, i: usize) -> bool {
        self.main_offset(i) == self.main_offset(i + 1)
    }

    pub(crate) fn main_payload<'a>(self, i: usize) -> &'a [u8] {
        let start = self.main_offset(i);
        let end = self.main_offset(i + 1);
        unsafe { std::slice::from_raw_parts(self.ptr.add(start), end - start) }
    }

    /// Total byte length of a main record, for walking a page.
    pub(crate) fn main_len(self) -> usize {
        align8(self.main_offset(self.main_count()))
    }
}

/// One version headed for a rewritten main record: its timestamp and
/// payload bytes, or `None` for a delete marker.
pub(crate) type MainVersion = (Version, Option<(*const u8, usize)>);

/// The byte length [`write_main`] would emit for `items`.
pub(crate) fn main_record_len(items: &[MainVersion]) -> usize {
    let n = items.len();
    let payload_start = align8(HEADER_LEN + 8 * n + 4 * (n + 1));
    let payload: usize = items.iter().map(|(_, p)| p.map_or(0, |(_, len)| len)).sum();
    align8(payload_start + payload)
}

/// Emit a main record for `key` holding `items` (descending versions)
/// at `dst`, returning the bytes written. The record starts with an
/// empty delta chain.
pub(crate) unsafe fn write_main(dst: *mut u8, key: Key, items: &[MainVersion]) -> usize {
    debug_assert_eq!(dst as usize % 8, 0);
    debug_assert!(!items.is_empty());
    debug_assert!(items.windows(2).all(|w| w[0].0 >= w[1].0));

    let record = Record::from_raw(dst);
    let n = items.len();
    record.write_u64(KEY, key);
    record.write_u64(VERSION, 0);
    record.write_u64(SIZE, n as u64);
    record.word(PREVIOUS).store(0, Relaxed);
    record.word(NEWEST).store(0, Relaxed);

    let offsets = dst.add(HEADER_LEN + 8 * n) as *mut u32;
    let mut cursor = align8(HEADER_LEN + 8 * n + 4 * (n + 1));
    for (i, (version, payload)) in items.iter().enumerate() {
        (dst.add(HEADER_LEN + 8 * i) as *mut u64).write(*version);
        offsets.add(i).write_unaligned(cursor as u32);
        if let Some((ptr, len)) = payload {
            std::ptr::copy_nonoverlapping(*ptr, dst.add(cursor), *len);
            cursor += len;
        }
    }
    offsets.add(n).write_unaligned(cursor as u32);

    record.word(META).store(RecordKind::Main.to_meta(), Release);
    align8(cursor)
}
