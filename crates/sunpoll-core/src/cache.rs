// ── Response cache ──
//
// Keyed by (device serial, endpoint kind). Each kind has its own TTL; an
// entry is fresh while `now < stored_at + ttl`. Failed fetches store
// nothing, so a stale-but-valid value is never replaced by an error.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use strum::{Display, EnumIter, IntoEnumIterator};
use tokio::time::Instant;
use tracing::debug;

/// Entries kept before eviction kicks in.
pub const DEFAULT_CAPACITY: usize = 512;

/// What a cached response was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum EndpointKind {
    BatteryInfo,
    ParameterRead,
    QuickChargeStatus,
    Runtime,
    Energy,
    ControllerRuntime,
}

impl EndpointKind {
    pub fn default_ttl(self) -> Duration {
        match self {
            Self::BatteryInfo => Duration::from_secs(300),
            Self::ParameterRead => Duration::from_secs(120),
            Self::QuickChargeStatus => Duration::from_secs(60),
            Self::Runtime | Self::Energy | Self::ControllerRuntime => Duration::from_secs(20),
        }
    }

    /// Kinds read every cycle; their TTL may be tightened to the poll interval.
    fn is_fast(self) -> bool {
        matches!(self, Self::Runtime | Self::Energy | Self::ControllerRuntime)
    }
}

type Key = (String, EndpointKind);

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Fresh vs stale entry counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub valid: usize,
    pub expired: usize,
}

/// TTL cache for transport responses.
pub struct ResponseCache<V> {
    entries: DashMap<Key, Entry<V>>,
    capacity: usize,
    ttl_cap: Option<Duration>,
}

impl<V: Clone> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl_cap: None,
        }
    }

    /// Clamp the TTL of per-cycle kinds to `cap`, so a link polled every
    /// `cap` is never served a response older than one interval.
    pub fn with_ttl_cap(mut self, cap: Duration) -> Self {
        self.ttl_cap = Some(cap);
        self
    }

    pub fn ttl(&self, kind: EndpointKind) -> Duration {
        let ttl = kind.default_ttl();
        match self.ttl_cap {
            Some(cap) if kind.is_fast() => ttl.min(cap),
            _ => ttl,
        }
    }

    /// The cached value, if still fresh.
    pub fn get(&self, serial: &str, kind: EndpointKind) -> Option<V> {
        let ttl = self.ttl(kind);
        let entry = self.entries.get(&(serial.to_owned(), kind))?;
        (entry.stored_at.elapsed() < ttl).then(|| entry.value.clone())
    }

    pub fn insert(&self, serial: &str, kind: EndpointKind, value: V) {
        self.entries.insert(
            (serial.to_owned(), kind),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
        if self.entries.len() > self.capacity {
            self.evict();
        }
    }

    /// Return the fresh cached value, or run `fetch` and store its result.
    ///
    /// An `Err` from `fetch` is returned unchanged and nothing is stored.
    pub async fn get_or_fetch<E, F, Fut>(
        &self,
        serial: &str,
        kind: EndpointKind,
        fetch: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(serial, kind) {
            debug!(serial, %kind, "cache hit");
            return Ok(hit);
        }
        let value = fetch().await?;
        self.insert(serial, kind, value.clone());
        Ok(value)
    }

    /// Drop every entry for one device.
    pub fn invalidate_device(&self, serial: &str) {
        self.entries.retain(|(s, _), _| s != serial);
    }

    /// Drop the per-cycle kinds for one device so the next read goes out.
    pub fn invalidate_fast(&self, serial: &str) {
        for kind in EndpointKind::iter().filter(|k| k.is_fast()) {
            self.entries.remove(&(serial.to_owned(), kind));
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in &self.entries {
            if entry.stored_at.elapsed() < self.ttl(entry.key().1) {
                stats.valid += 1;
            } else {
                stats.expired += 1;
            }
        }
        stats
    }

    /// Keep the newest 80% of `capacity`, dropping the oldest entries.
    fn evict(&self) {
        let keep = self.capacity * 4 / 5;
        let mut ages: Vec<(Key, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.stored_at))
            .collect();
        if ages.len() <= keep {
            return;
        }
        ages.sort_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in ages.into_iter().skip(keep) {
            self.entries.remove(&key);
        }
        debug!(kept = self.entries.len(), "evicted oldest cache entries");
    }
}
