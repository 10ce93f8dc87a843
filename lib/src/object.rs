//! Cached objects and their fetch-time companions.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;

use crate::{
    cache::variance::{Variant, VaryRule},
    esi::EsiData,
    storage::StorageLease,
    vfp::VfpKind,
    Error,
};

/// Expiry bundle. `ttl < 0` marks an object that must never be served from
/// cache (pass objects carry -1 throughout).
#[derive(Debug, Clone, Copy)]
pub struct Expiry {
    /// When the response entered the cache, epoch seconds.
    pub entered: f64,
    pub ttl: f64,
    pub grace: f64,
    pub keep: f64,
}

impl Default for Expiry {
    fn default() -> Self {
        Expiry {
            entered: 0.0,
            ttl: -1.0,
            grace: 0.0,
            keep: 0.0,
        }
    }
}

impl Expiry {
    pub fn clear(&mut self) {
        *self = Expiry::default();
    }

    /// Whether the object may be served at time `now`.
    pub fn is_fresh(&self, now: f64) -> bool {
        self.ttl >= 0.0 && (now - self.entered) < self.ttl
    }

    /// Whether the object still has any reason to exist at time `now`.
    pub fn is_alive(&self, now: f64) -> bool {
        self.ttl >= 0.0 && (now - self.entered) < self.ttl + self.grace.max(0.0) + self.keep.max(0.0)
    }
}

/// LRU bookkeeping, updated on delivery under `lru_timeout` suppression.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lru {
    pub last_use: f64,
    pub last_lru: f64,
}

/// Append-only body storage. Exclusively written by the fetching session
/// until unbusy, immutable afterwards.
#[derive(Debug, Default)]
pub struct ObjBody {
    chunks: Mutex<Vec<Bytes>>,
    len: AtomicU64,
}

impl ObjBody {
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.lock().clone()
    }

    /// The whole body as one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let chunks = self.chunks.lock();
        let mut out = Vec::with_capacity(self.len() as usize);
        for c in chunks.iter() {
            out.extend_from_slice(c);
        }
        out
    }

    fn push(&self, chunk: Bytes) {
        let n = chunk.len() as u64;
        self.chunks.lock().push(chunk);
        self.len.fetch_add(n, Ordering::Release);
    }
}

/// The cached artifact. Response metadata is fixed at construction; the
/// body is appended during fetch and frozen at unbusy.
#[derive(Debug)]
pub struct Object {
    /// xid of the request that produced this object.
    pub xid: u64,
    pub response: StatusCode,
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: ObjBody,
    pub gziped: bool,
    pub last_modified: f64,
    pub vary: Option<(VaryRule, Variant)>,
    pub exp: Expiry,
    pub lru: Mutex<Lru>,
    esidata: Mutex<Option<EsiData>>,
    storage: StorageLease,
}

impl Object {
    pub fn new(
        xid: u64,
        response: StatusCode,
        headers: HeaderMap,
        exp: Expiry,
        storage: StorageLease,
    ) -> Self {
        Object {
            xid,
            response,
            reason: None,
            headers,
            body: ObjBody::default(),
            gziped: false,
            last_modified: 0.0,
            vary: None,
            exp,
            lru: Mutex::new(Lru::default()),
            esidata: Mutex::new(None),
            storage,
        }
    }

    /// Append a body chunk, charging the storage lease. Failing the charge
    /// fails the fetch; the caller drops the object.
    pub fn push_body(&self, chunk: Bytes) -> Result<(), Error> {
        self.storage.grow(chunk.len() as u64)?;
        self.body.push(chunk);
        Ok(())
    }

    pub fn set_esidata(&self, data: EsiData) {
        *self.esidata.lock() = Some(data);
    }

    pub fn esidata(&self) -> Option<EsiData> {
        self.esidata.lock().clone()
    }

    pub fn has_esidata(&self) -> bool {
        self.esidata.lock().is_some()
    }
}

bitflags! {
    /// Index-entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoreFlags: u8 {
        /// A fetch is in progress; lookups park instead of matching.
        const BUSY = 1 << 0;
        /// Negative entry: future lookups bypass the cache.
        const PASS = 1 << 1;
    }
}

/// The cache-index handle for one object (or busy placeholder).
#[derive(Debug)]
pub struct ObjCore {
    flags: Mutex<CoreFlags>,
    obj: Mutex<Option<std::sync::Arc<Object>>>,
}

impl ObjCore {
    pub(crate) fn new_busy() -> Self {
        ObjCore {
            flags: Mutex::new(CoreFlags::BUSY),
            obj: Mutex::new(None),
        }
    }

    pub fn flags(&self) -> CoreFlags {
        *self.flags.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.flags().contains(CoreFlags::BUSY)
    }

    pub fn is_pass(&self) -> bool {
        self.flags().contains(CoreFlags::PASS)
    }

    pub(crate) fn set_pass(&self) {
        self.flags.lock().insert(CoreFlags::PASS);
    }

    /// Publish the object and clear BUSY. The index notifies parked peers.
    pub(crate) fn publish(&self, obj: std::sync::Arc<Object>) {
        let mut flags = self.flags.lock();
        assert!(flags.contains(CoreFlags::BUSY), "publish on non-busy core");
        *self.obj.lock() = Some(obj);
        flags.remove(CoreFlags::BUSY);
    }

    pub fn object(&self) -> Option<std::sync::Arc<Object>> {
        self.obj.lock().clone()
    }
}

/// Framing of the backend response body, classified before the fetch hook
/// can touch the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStatus {
    None,
    Length(u64),
    Chunked,
    Eof,
}

/// Fetch-time state, bound to one busy index entry and exclusively owned by
/// the fetching session.
#[derive(Debug, Default)]
pub struct BusyObj {
    pub is_gzip: bool,
    pub is_gunzip: bool,
    pub do_gzip: bool,
    pub do_gunzip: bool,
    pub do_esi: bool,
    pub do_stream: bool,
    pub exp: Expiry,
    pub body_status: Option<BodyStatus>,
    pub vfp: VfpKind,
    /// The in-flight backend body; dropping it closes the backend side.
    pub beresp_body: Option<hyper::Body>,
}

impl BusyObj {
    pub fn new() -> Self {
        BusyObj::default()
    }

    /// Body-transform selection: ESI supersedes everything, then the
    /// explicit transforms, then integrity-checking of gzip input.
    pub fn pick_vfp(&self) -> VfpKind {
        if self.do_esi {
            VfpKind::Esi
        } else if self.do_gunzip {
            VfpKind::Gunzip
        } else if self.do_gzip {
            VfpKind::Gzip
        } else if self.is_gzip {
            VfpKind::TestGzip
        } else {
            VfpKind::Identity
        }
    }

    /// The mutual-exclusion rules between the four encoding flags, checked
    /// at every transition into FetchBody.
    pub fn assert_encoding_invariants(&self) {
        assert!(!(self.is_gzip && self.is_gunzip));
        assert!(!(self.do_gzip && self.do_gunzip));
        if self.do_gunzip {
            assert!(self.is_gzip);
        }
        if self.do_gzip {
            assert!(self.is_gunzip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{StorageHint, StoragePools};

    fn test_object(exp: Expiry) -> Object {
        let pools = StoragePools::new(1 << 20, 1 << 20);
        let lease = pools.lease(StorageHint::Default, 0).unwrap();
        Object::new(1, StatusCode::OK, HeaderMap::new(), exp, lease)
    }

    #[test]
    fn freshness_window() {
        let now = 1000.0;
        let exp = Expiry {
            entered: now,
            ttl: 60.0,
            grace: 10.0,
            keep: 0.0,
        };
        assert!(exp.is_fresh(now + 59.0));
        assert!(!exp.is_fresh(now + 61.0));
        assert!(exp.is_alive(now + 65.0));
        assert!(!exp.is_alive(now + 80.0));
    }

    #[test]
    fn pass_ttl_is_never_fresh() {
        let exp = Expiry::default();
        assert!(!exp.is_fresh(0.0));
        assert!(!exp.is_fresh(f64::MAX));
    }

    #[test]
    fn body_accumulates() {
        let obj = test_object(Expiry::default());
        obj.push_body(Bytes::from_static(b"hel")).unwrap();
        obj.push_body(Bytes::from_static(b"lo")).unwrap();
        assert_eq!(obj.body.len(), 5);
        assert_eq!(obj.body.to_vec(), b"hello");
    }

    #[test]
    fn storage_charge_failure_surfaces() {
        let pools = StoragePools::new(4, 4);
        let lease = pools.lease(StorageHint::Default, 0).unwrap();
        let obj = Object::new(1, StatusCode::OK, HeaderMap::new(), Expiry::default(), lease);
        obj.push_body(Bytes::from_static(b"1234")).unwrap();
        assert!(obj.push_body(Bytes::from_static(b"5")).is_err());
    }

    #[test]
    fn core_publish_clears_busy() {
        let core = ObjCore::new_busy();
        assert!(core.is_busy());
        assert!(core.object().is_none());
        core.publish(std::sync::Arc::new(test_object(Expiry::default())));
        assert!(!core.is_busy());
        assert!(core.object().is_some());
    }

    #[test]
    fn encoding_invariants_hold_by_default() {
        let mut bo = BusyObj::new();
        bo.assert_encoding_invariants();
        bo.is_gzip = true;
        bo.do_gunzip = true;
        bo.assert_encoding_invariants();
    }

    #[test]
    #[should_panic]
    fn gzip_of_gzip_is_rejected() {
        let mut bo = BusyObj::new();
        bo.is_gzip = true;
        bo.do_gzip = true;
        bo.assert_encoding_invariants();
    }
}
