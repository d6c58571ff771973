// ── Snapshot store ──
//
// Holds the latest published snapshot and the one before it. Readers load
// an `Arc` without locking; the coordinator builds the next snapshot in a
// working copy and swaps it in atomically. Subscribers are woken through a
// `watch` channel carrying the new version.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use chrono::Utc;
use tokio::sync::watch;

use crate::model::Snapshot;

pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    previous: ArcSwap<Snapshot>,
    version: AtomicU64,
    notify: watch::Sender<Arc<Snapshot>>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let empty = Arc::new(Snapshot::default());
        let (notify, _) = watch::channel(Arc::clone(&empty));
        Self {
            current: ArcSwap::new(Arc::clone(&empty)),
            previous: ArcSwap::new(empty),
            version: AtomicU64::new(0),
            notify,
        }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// The snapshot published before [`current`](Self::current).
    pub fn previous(&self) -> Arc<Snapshot> {
        self.previous.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Stamp `next` with a fresh version and make it current.
    pub fn publish(&self, mut next: Snapshot) -> Arc<Snapshot> {
        next.version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        next.taken_at = Some(Utc::now());
        let next = Arc::new(next);
        let old = self.current.swap(Arc::clone(&next));
        self.previous.store(old);
        self.notify.send_replace(Arc::clone(&next));
        next
    }

    /// Forget everything, e.g. after the device set changed.
    pub fn reset(&self) {
        let empty = Arc::new(Snapshot {
            version: self.version(),
            ..Snapshot::default()
        });
        self.current.store(Arc::clone(&empty));
        self.previous.store(empty);
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.notify.subscribe()
    }
}
