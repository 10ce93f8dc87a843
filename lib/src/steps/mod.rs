//! The request state engine.
//!
//! A session walks a directed graph of steps; each handler advances
//! `session.step` and reports whether to keep going or to park. The
//! dispatcher loops until a park, checking structural invariants on every
//! iteration and flushing the transaction log on the way out.

use std::{future::Future, pin::Pin};

use crate::{service::ProxyCtx, session::Session};

mod client;
mod deliver;
mod fetch;

/// The nodes of the request state graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    First,
    Wait,
    Start,
    Recv,
    Lookup,
    Hit,
    Miss,
    Pass,
    Pipe,
    Fetch,
    FetchBody,
    StreamBody,
    PrepResp,
    Deliver,
    Error,
    Done,
}

/// What a step handler tells the dispatcher.
#[derive(Debug)]
pub(crate) enum Flow {
    Continue,
    Park(Park),
}

/// Why the session left the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Park {
    /// Idle keep-alive: hand the connection back to the waiter.
    Waiter,
    /// Lost a lookup race; a waiter handle is on the session.
    Busy,
    /// An include finished; control returns to the parent request.
    EsiDone,
    /// The session is finished; the connection is closed or closing.
    Gone,
}

/// Run the session until it parks.
///
/// May only be entered at First, Start, Lookup or Recv.
pub async fn dispatch(sess: &mut Session, ctx: &ProxyCtx) -> Park {
    assert!(
        matches!(
            sess.step,
            Step::First | Step::Start | Step::Lookup | Step::Recv
        ),
        "dispatcher entered at {:?}",
        sess.step
    );

    loop {
        sess.ws.assert_sane();
        if ctx.params().diag_steps {
            tracing::trace!(
                xid = sess.xid,
                step = ?sess.step,
                obj = sess.rctx.obj.is_some(),
                "step"
            );
        }

        let flow = match sess.step {
            Step::First => client::cnt_first(sess, ctx).await,
            Step::Wait => client::cnt_wait(sess, ctx).await,
            Step::Start => client::cnt_start(sess, ctx).await,
            Step::Recv => client::cnt_recv(sess, ctx).await,
            Step::Lookup => client::cnt_lookup(sess, ctx).await,
            Step::Hit => client::cnt_hit(sess, ctx).await,
            Step::Miss => client::cnt_miss(sess, ctx).await,
            Step::Pass => client::cnt_pass(sess, ctx).await,
            Step::Pipe => client::cnt_pipe(sess, ctx).await,
            Step::Fetch => fetch::cnt_fetch(sess, ctx).await,
            Step::FetchBody => fetch::cnt_fetchbody(sess, ctx).await,
            Step::StreamBody => fetch::cnt_streambody(sess, ctx).await,
            Step::PrepResp => deliver::cnt_prepresp(sess, ctx).await,
            Step::Deliver => deliver::cnt_deliver(sess, ctx).await,
            Step::Error => client::cnt_error(sess, ctx).await,
            Step::Done => client::cnt_done(sess, ctx).await,
        };

        let park = match flow {
            Flow::Continue => continue,
            Flow::Park(park) => park,
        };

        sess.log.flush();
        match park {
            Park::Waiter | Park::Gone | Park::EsiDone => {
                // Request boundary: no held references, no uncharged
                // accounting.
                assert!(sess.rctx.is_empty(), "held references at {park:?}");
                assert!(sess.rctx.acct.is_zero(), "accounting residue at {park:?}");
            }
            Park::Busy => {
                assert!(sess.rctx.obj.is_none(), "object held across busy park");
                assert!(sess.busy_waiter.is_some(), "busy park without waiter");
            }
        }
        return park;
    }
}

/// Run the session until it parks for something other than a busy peer.
/// Busy parks are absorbed here: await the wakeup, then re-enter Lookup.
pub fn drive<'a>(
    sess: &'a mut Session,
    ctx: &'a ProxyCtx,
) -> Pin<Box<dyn Future<Output = Park> + Send + 'a>> {
    Box::pin(async move {
        loop {
            match dispatch(sess, ctx).await {
                Park::Busy => {
                    let mut waiter = sess
                        .busy_waiter
                        .take()
                        .expect("busy park leaves a waiter");
                    waiter.wait().await;
                    debug_assert_eq!(sess.step, Step::Lookup);
                }
                park => return park,
            }
        }
    })
}
