//! Index-head internals.
//!
//! Each cache key owns one `ObjHead`: the list of index entries (one per
//! variant, plus busy placeholders) behind a watch channel. The channel is
//! both the lock for the entry list and the wakeup path for sessions parked
//! on a busy entry.

use std::sync::Arc;

use tokio::sync::watch;

use crate::object::ObjCore;

#[derive(Debug, Default)]
pub(crate) struct HeadState {
    pub(crate) cores: Vec<Arc<ObjCore>>,
}

#[derive(Debug)]
pub(crate) struct ObjHead {
    state: watch::Sender<HeadState>,
}

impl ObjHead {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(HeadState::default());
        ObjHead { state: tx }
    }

    /// Run `f` under the head lock. The mutation is always applied; waiters
    /// are only woken when `f` asks for it, so busy insertions (which no
    /// parked peer cares about) stay silent.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut HeadState) -> (bool, R)) -> R {
        let mut out = None;
        self.state.send_if_modified(|state| {
            let (notify, r) = f(state);
            out = Some(r);
            notify
        });
        out.expect("with_state closure ran")
    }

    /// Subscribe for unbusy/drop wakeups. Must be called before scanning so
    /// a notification between scan and await cannot be missed.
    pub(crate) fn subscribe(&self) -> watch::Receiver<HeadState> {
        self.state.subscribe()
    }

    /// Wake every parked session on this head.
    pub(crate) fn notify(&self) {
        self.state.send_modify(|_| {});
    }
}
