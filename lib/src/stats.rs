//! Counters.
//!
//! The global table is a set of process-wide atomics. Sessions accumulate
//! into a per-worker cell set and fold into the global table periodically
//! (every `wthread_stats_rate` client requests) and at session teardown, so
//! the hot path never contends on the shared counters.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! stat_fields {
    ($($name:ident),* $(,)?) => {
        /// Process-wide counters.
        #[derive(Debug, Default)]
        pub struct Stats {
            $(pub $name: AtomicU64,)*
        }

        /// Per-worker counter cells, folded into `Stats` in batches.
        #[derive(Debug, Default, Clone)]
        pub struct WorkerStats {
            $(pub $name: u64,)*
        }

        impl WorkerStats {
            /// Fold this cell set into the global table and zero it.
            pub fn flush(&mut self, global: &Stats) {
                $(
                    if self.$name != 0 {
                        global.$name.fetch_add(self.$name, Ordering::Relaxed);
                        self.$name = 0;
                    }
                )*
            }
        }
    };
}

stat_fields! {
    sess,
    client_req,
    cache_hit,
    cache_hitpass,
    cache_miss,
    backend_req,
    backend_retry,
    fetch,
    pass,
    pipe,
    s_fetch_failed,
    n_object,
    restarts,
    esi_requests,
    esi_errors,
    sess_closed,
    sess_pipeline,
    sess_readahead,
    sess_linger,
    sess_herd,
    s_hdrbytes,
    s_bodybytes,
}

impl Stats {
    pub fn get(&self, f: impl Fn(&Stats) -> &AtomicU64) -> u64 {
        f(self).load(Ordering::Relaxed)
    }
}

/// Per-request accounting, charged exactly once (at Done, or when the
/// session is handed off). The dispatcher asserts this is zero after its
/// loop, so a step that forgets to charge is caught immediately.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AcctTmp {
    pub sess: u64,
    pub req: u64,
    pub pipe: u64,
    pub pass: u64,
    pub fetch: u64,
    pub hdrbytes: u64,
    pub bodybytes: u64,
}

impl AcctTmp {
    pub fn is_zero(&self) -> bool {
        *self == AcctTmp::default()
    }

    /// Move this request's charges into the worker cells and zero out.
    pub fn charge(&mut self, wstats: &mut WorkerStats) {
        wstats.sess += self.sess;
        wstats.client_req += self.req;
        wstats.pipe += self.pipe;
        wstats.pass += self.pass;
        wstats.fetch += self.fetch;
        wstats.s_hdrbytes += self.hdrbytes;
        wstats.s_bodybytes += self.bodybytes;
        *self = AcctTmp::default();
    }
}
