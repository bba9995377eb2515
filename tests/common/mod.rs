#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use deltastore::{MinVersionSource, SnapshotDescriptor};

pub fn setup_logger() {
    use std::io::Write;

    fn tn() -> String {
        std::thread::current().name().unwrap_or("unknown").to_owned()
    }

    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{:05} {:20} {:10} {}",
                record.level(),
                tn(),
                record.module_path().unwrap_or("?").split("::").last().unwrap(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info);

    if let Ok(env) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env);
    }

    let _r = builder.try_init();
}

#[derive(Default)]
struct Inner {
    next: u64,
    base: u64,
    // live transaction -> the base it began with
    live: BTreeMap<u64, u64>,
    committed: BTreeSet<u64>,
}

/// A minimal commit manager for tests: monotonically numbered
/// transactions, a committed base that advances once every older
/// transaction has resolved, and the watermark the collector needs.
pub struct CommitManager {
    inner: Mutex<Inner>,
}

impl CommitManager {
    pub fn new() -> Arc<CommitManager> {
        Arc::new(CommitManager {
            inner: Mutex::new(Inner {
                next: 1,
                ..Inner::default()
            }),
        })
    }

    pub fn begin(&self) -> SnapshotDescriptor {
        let mut inner = self.inner.lock();
        let version = inner.next;
        inner.next += 1;
        let base = inner.base;
        inner.live.insert(version, base);
        SnapshotDescriptor::with_committed(version, base, inner.committed.iter().copied().collect())
    }

    pub fn commit(&self, snapshot: &SnapshotDescriptor) {
        let mut inner = self.inner.lock();
        let version = snapshot.version();
        assert!(
            inner.live.remove(&version).is_some(),
            "commit of an unknown tx"
        );
        inner.committed.insert(version);
        loop {
            let next = inner.base + 1;
            if inner.committed.remove(&next) {
                inner.base = next;
            } else {
                break;
            }
        }
    }
}

impl MinVersionSource for CommitManager {
    fn min_version(&self) -> u64 {
        // everything a live snapshot can still see lies at or below
        // its base, so the oldest base bounds what gc may coalesce
        let inner = self.inner.lock();
        inner
            .live
            .values()
            .min()
            .copied()
            .unwrap_or(inner.base)
            + 1
    }
}
