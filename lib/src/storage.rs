//! Storage pools.
//!
//! Two byte-accounted pools back all object bodies: the main pool for
//! cacheable objects and a transient pool for shortlived and pass objects.
//! An allocation is a lease; growing it past the pool capacity fails the
//! fetch, and dropping it returns the bytes.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::Error;

/// Placement request for a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageHint {
    #[default]
    Default,
    /// Force the uncached pool; used for shortlived, pass, and synthetic
    /// objects.
    Transient,
}

#[derive(Debug)]
struct Pool {
    name: &'static str,
    capacity: u64,
    used: AtomicU64,
}

impl Pool {
    /// Reserve `n` bytes, failing without overshoot if the pool is full.
    fn reserve(&self, n: u64) -> bool {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + n > self.capacity {
                return false;
            }
            match self.used.compare_exchange_weak(
                used,
                used + n,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    fn release(&self, n: u64) {
        self.used.fetch_sub(n, Ordering::Relaxed);
    }
}

/// The process-wide pool pair.
#[derive(Debug, Clone)]
pub struct StoragePools {
    main: Arc<Pool>,
    transient: Arc<Pool>,
}

impl StoragePools {
    pub fn new(main_bytes: u64, transient_bytes: u64) -> Self {
        StoragePools {
            main: Arc::new(Pool {
                name: "main",
                capacity: main_bytes,
                used: AtomicU64::new(0),
            }),
            transient: Arc::new(Pool {
                name: "transient",
                capacity: transient_bytes,
                used: AtomicU64::new(0),
            }),
        }
    }

    /// Open a lease of `initial` bytes on the hinted pool. `None` means the
    /// pool cannot take the object; the caller decides on a fallback.
    pub fn lease(&self, hint: StorageHint, initial: u64) -> Option<StorageLease> {
        let pool = match hint {
            StorageHint::Default => &self.main,
            StorageHint::Transient => &self.transient,
        };
        if !pool.reserve(initial) {
            tracing::debug!(pool = pool.name, initial, "storage allocation failed");
            return None;
        }
        Some(StorageLease {
            pool: Arc::clone(pool),
            charged: AtomicU64::new(initial),
        })
    }

    pub fn main_used(&self) -> u64 {
        self.main.used.load(Ordering::Relaxed)
    }

    pub fn transient_used(&self) -> u64 {
        self.transient.used.load(Ordering::Relaxed)
    }
}

/// Bytes held by one object. Returned to the pool on drop.
#[derive(Debug)]
pub struct StorageLease {
    pool: Arc<Pool>,
    charged: AtomicU64,
}

impl StorageLease {
    /// Charge `n` more bytes to this lease.
    pub fn grow(&self, n: u64) -> Result<(), Error> {
        if !self.pool.reserve(n) {
            return Err(Error::StorageExhausted);
        }
        self.charged.fetch_add(n, Ordering::Relaxed);
        Ok(())
    }

    pub fn charged(&self) -> u64 {
        self.charged.load(Ordering::Relaxed)
    }
}

impl Drop for StorageLease {
    fn drop(&mut self) {
        self.pool.release(self.charged.load(Ordering::Relaxed));
    }
}
