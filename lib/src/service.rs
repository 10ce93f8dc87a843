//! The shared proxy context and the accept loop.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::net::{TcpListener, TcpStream};
use tracing::{event, Level};

use crate::{
    cache::CacheIndex,
    config::{LegateConfig, Params},
    httc::RxStatus,
    policy::{DefaultPolicy, Policy},
    session::Session,
    stats::Stats,
    steps::{self, Park, Step},
    storage::StoragePools,
    upstream::BackendIo,
    Error,
};

struct CtxInner {
    params: Params,
    policy: Arc<dyn Policy>,
    cache: CacheIndex,
    storage: StoragePools,
    stats: Stats,
    backends: Vec<BackendIo>,
    xids: AtomicU64,
    rng: Mutex<StdRng>,
}

/// Everything a session needs to run. Cheaply clonable; one per process,
/// cloned into each connection task.
#[derive(Clone)]
pub struct ProxyCtx {
    inner: Arc<CtxInner>,
}

impl ProxyCtx {
    pub fn new(config: &LegateConfig) -> Result<Self, Error> {
        let params = config.params().clone();
        let backends = config
            .backends()
            .iter()
            .map(|b| BackendIo::new(Arc::clone(b), &params))
            .collect();
        let storage = StoragePools::new(params.storage_bytes, params.transient_bytes);

        // Seed the xid counter from entropy so transaction ids stay unique
        // in logs across process restarts.
        let mut rng = StdRng::from_entropy();
        let xids = AtomicU64::new(rng.gen::<u32>() as u64 | 1);

        Ok(ProxyCtx {
            inner: Arc::new(CtxInner {
                params,
                policy: Arc::new(DefaultPolicy),
                cache: CacheIndex::new(),
                storage,
                stats: Stats::default(),
                backends,
                xids,
                rng: Mutex::new(rng),
            }),
        })
    }

    /// Replace the policy program. Takes effect for sessions started
    /// afterwards.
    pub fn with_policy(self, policy: Arc<dyn Policy>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.policy = policy;
                inner
            }
            Err(_) => panic!("with_policy after sharing the context"),
        };
        ProxyCtx {
            inner: Arc::new(inner),
        }
    }

    pub fn params(&self) -> &Params {
        &self.inner.params
    }

    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    pub fn cache(&self) -> &CacheIndex {
        &self.inner.cache
    }

    pub fn storage(&self) -> &StoragePools {
        &self.inner.storage
    }

    pub fn policy(&self) -> &dyn Policy {
        self.inner.policy.as_ref()
    }

    pub fn backend(&self, idx: usize) -> &BackendIo {
        &self.inner.backends[idx]
    }

    pub fn backend_count(&self) -> usize {
        self.inner.backends.len()
    }

    /// Next transaction id. Wraps are fine (ids are for logs); zero is
    /// skipped, it means "no active request".
    pub fn next_xid(&self) -> u64 {
        loop {
            let xid = self.inner.xids.fetch_add(1, Ordering::Relaxed);
            if xid != 0 {
                return xid;
            }
        }
    }

    /// Admin: read the xid counter.
    pub fn debug_xid(&self) -> u64 {
        self.inner.xids.load(Ordering::Relaxed)
    }

    /// Admin: pin the xid counter, for test reproducibility.
    pub fn debug_set_xid(&self, n: u64) {
        self.inner.xids.store(n, Ordering::Relaxed);
    }

    /// Admin: reseed the PRNG. Seed 1 is the portable reproducible value.
    pub fn debug_srandom(&self, seed: u64) {
        *self.inner.rng.lock() = StdRng::seed_from_u64(seed);
    }

    pub fn random(&self) -> u64 {
        self.inner.rng.lock().gen()
    }
}

/// Bind and run the accept loop. Never returns under normal operation.
pub async fn serve(ctx: ProxyCtx, addr: SocketAddr) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    event!(Level::INFO, "listening on http://{}", listener.local_addr()?);
    loop {
        let (stream, remote) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            session_task(stream, remote, ctx).await;
        });
    }
}

/// One task per connection: run the engine until the session is gone,
/// playing the pool-waiter role in between requests.
pub async fn session_task(stream: TcpStream, remote: SocketAddr, ctx: ProxyCtx) {
    let _ = stream.set_nodelay(true);
    let mut sess = Session::new(
        stream,
        remote,
        ctx.params().http_req_size,
        ctx.params().workspace_size,
    );

    loop {
        match steps::drive(&mut sess, &ctx).await {
            Park::Gone => return,
            Park::EsiDone => unreachable!("include completion escaped the deliver walk"),
            Park::Busy => unreachable!("drive absorbs busy parks"),
            Park::Waiter => {
                // The waiter role: sit on the idle connection without a
                // step, and hand it back once a full request is buffered.
                loop {
                    match sess.htc.rx(&mut sess.io).await {
                        RxStatus::Complete => break,
                        RxStatus::Partial => continue,
                        RxStatus::Overflow => {
                            sess.close("overflow");
                            break;
                        }
                        RxStatus::Eof if sess.htc.buffered() == 0 => {
                            sess.close("EOF");
                            break;
                        }
                        RxStatus::Eof | RxStatus::Error => {
                            sess.close("error");
                            break;
                        }
                    }
                }
                if sess.fd_closed {
                    sess.wstats.sess_closed += 1;
                    sess.wstats.flush(ctx.stats());
                    sess.log.flush();
                    return;
                }
                sess.step = Step::Start;
            }
        }
    }
}
