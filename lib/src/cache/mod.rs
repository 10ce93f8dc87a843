//! The cache index.
//!
//! Lookup follows the single-fetcher contract: at most one session fetches
//! a given (hash, vary) at a time. The first lookup to miss inserts a busy
//! entry and receives the obligation to fetch; concurrent lookups for the
//! same key park on the head's watch channel until the fetcher publishes
//! the object (unbusy) or abandons the entry (drop), then re-enter Lookup.

use std::{fmt, sync::Arc, time::Duration};

use http::HeaderMap;
use tokio::sync::watch;

use crate::{
    object::{ObjCore, Object},
    workspace::Workspace,
};

mod store;
pub mod variance;

use store::{HeadState, ObjHead};

/// Cache key: the SHA-256 digest produced by the hash hook.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn new(digest: [u8; 32]) -> Self {
        CacheKey(digest)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…")
    }
}

/// The result of a cache probe.
pub enum LookupOutcome {
    /// We inserted a busy entry; the caller is now the fetcher.
    Miss(BusyGuard),
    Hit {
        core: Arc<ObjCore>,
        obj: Arc<Object>,
    },
    /// A negative entry: bypass the cache for this request.
    HitPass {
        core: Arc<ObjCore>,
        obj: Arc<Object>,
    },
    /// Lost the race to a busy peer; park until woken, then re-probe.
    Busy(BusyWaiter),
}

/// Wakeup handle for a session parked on a busy entry.
pub struct BusyWaiter {
    rx: watch::Receiver<HeadState>,
}

impl BusyWaiter {
    /// Wait for the next unbusy/drop on the head. Spurious wakeups are
    /// fine; the caller re-enters Lookup either way.
    pub async fn wait(&mut self) {
        let _ = self.rx.changed().await;
    }
}

impl fmt::Debug for BusyWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BusyWaiter")
    }
}

/// The fetch obligation attached to a busy index entry.
///
/// Publishing stores the object and wakes parked peers. Dropping the guard
/// without publishing removes the busy entry and wakes peers so one of them
/// can take over the obligation.
#[derive(Debug)]
pub struct BusyGuard {
    head: Arc<ObjHead>,
    core: Arc<ObjCore>,
    published: bool,
}

impl BusyGuard {
    pub fn core(&self) -> &Arc<ObjCore> {
        &self.core
    }

    /// Flag this entry as hit-for-pass; effective once published.
    pub fn mark_pass(&self) {
        self.core.set_pass();
    }

    /// Unbusy: publish the finished object to the index and drain the busy
    /// list.
    pub fn publish(mut self, obj: Arc<Object>) -> Arc<ObjCore> {
        self.core.publish(obj);
        self.published = true;
        self.head.notify();
        Arc::clone(&self.core)
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        // Abandoned fetch: take the busy entry back out, and wake the busy
        // list so a parked peer can claim the obligation.
        let core = Arc::clone(&self.core);
        self.head.with_state(move |state| {
            state.cores.retain(|c| !Arc::ptr_eq(c, &core));
            (true, ())
        });
    }
}

/// The process-wide cache index.
pub struct CacheIndex {
    heads: moka::sync::Cache<CacheKey, Arc<ObjHead>>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        let heads = moka::sync::Cache::builder()
            .eviction_listener(|key, _value, cause| {
                tracing::debug!("cache eviction of {key:?}: {cause:?}")
            })
            .build();
        CacheIndex { heads }
    }
}

impl CacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe the index.
    ///
    /// `always_miss` skips matching and inserts a fresh busy entry;
    /// `ignore_busy` disables parking so racing requests fetch
    /// independently. Dead entries encountered during the scan are reaped.
    pub fn lookup(
        &self,
        key: &CacheKey,
        req_headers: &HeaderMap,
        ws: &mut Workspace,
        now: f64,
        always_miss: bool,
        ignore_busy: bool,
    ) -> LookupOutcome {
        let head = self
            .heads
            .get_with(*key, || Arc::new(ObjHead::new()));

        // Subscribe before scanning: an unbusy between our scan and a later
        // await must still register as a wakeup.
        let rx = head.subscribe();

        let mut found: Option<(Arc<ObjCore>, Arc<Object>)> = None;
        let mut busy_seen = false;

        let miss_guard = head.with_state(|state| {
            state.cores.retain(|core| {
                if core.is_busy() {
                    return true;
                }
                match core.object() {
                    Some(obj) => obj.exp.is_alive(now),
                    None => false,
                }
            });

            if !always_miss {
                for core in &state.cores {
                    if core.is_busy() {
                        if !ignore_busy {
                            busy_seen = true;
                        }
                        continue;
                    }
                    let obj = match core.object() {
                        Some(obj) => obj,
                        None => continue,
                    };
                    if !obj.exp.is_fresh(now) {
                        continue;
                    }
                    if let Some((rule, variant)) = &obj.vary {
                        if !rule.matches(req_headers, variant, ws) {
                            continue;
                        }
                    }
                    found = Some((Arc::clone(core), obj));
                    break;
                }
            }

            if found.is_some() || busy_seen {
                return (false, None);
            }

            // Nothing serveable and nobody fetching: obligate ourselves.
            let core = Arc::new(ObjCore::new_busy());
            state.cores.push(Arc::clone(&core));
            // Parked peers wait for completion, not obligation; stay quiet.
            (false, Some(core))
        });

        if let Some(core) = miss_guard {
            return LookupOutcome::Miss(BusyGuard {
                head,
                core,
                published: false,
            });
        }
        if let Some((core, obj)) = found {
            if core.is_pass() {
                return LookupOutcome::HitPass { core, obj };
            }
            return LookupOutcome::Hit { core, obj };
        }
        LookupOutcome::Busy(BusyWaiter { rx })
    }

    /// Number of heads currently indexed.
    pub fn head_count(&self) -> u64 {
        self.heads.run_pending_tasks();
        self.heads.entry_count()
    }
}

/// LRU touch with suppression: returns true when the touch was recorded,
/// false when it fell inside the suppression window.
pub fn touch_lru(obj: &Object, now: f64, lru_timeout: Duration) -> bool {
    let mut lru = obj.lru.lock();
    let touched = now - lru.last_lru > lru_timeout.as_secs_f64();
    if touched {
        lru.last_lru = now;
    }
    lru.last_use = now;
    touched
}
