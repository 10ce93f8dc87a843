//! Per-session transaction log.
//!
//! Records are buffered in a ring on the session and flushed as `tracing`
//! events when the dispatcher loop exits (and at request end), so one
//! request's records come out adjacent even under heavy concurrency.

use std::fmt::Write as _;

/// Record tags. One per observable event kind; the set mirrors what the
/// engine logs at each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    SessOpen,
    SessClose,
    ReqStart,
    ReqEnd,
    Hit,
    HitPass,
    Miss,
    Length,
    TTL,
    Gzip,
    Backend,
    BackendRetry,
    Error,
    Debug,
}

impl Tag {
    fn as_str(self) -> &'static str {
        match self {
            Tag::SessOpen => "SessOpen",
            Tag::SessClose => "SessClose",
            Tag::ReqStart => "ReqStart",
            Tag::ReqEnd => "ReqEnd",
            Tag::Hit => "Hit",
            Tag::HitPass => "HitPass",
            Tag::Miss => "Miss",
            Tag::Length => "Length",
            Tag::TTL => "TTL",
            Tag::Gzip => "Gzip",
            Tag::Backend => "Backend",
            Tag::BackendRetry => "BackendRetry",
            Tag::Error => "Error",
            Tag::Debug => "Debug",
        }
    }
}

#[derive(Debug)]
struct Record {
    tag: Tag,
    xid: u64,
    msg: String,
}

/// The buffered log ring for one session.
#[derive(Debug, Default)]
pub struct ReqLog {
    records: Vec<Record>,
}

impl ReqLog {
    pub fn new() -> Self {
        ReqLog::default()
    }

    pub fn record(&mut self, tag: Tag, xid: u64, msg: impl Into<String>) {
        self.records.push(Record {
            tag,
            xid,
            msg: msg.into(),
        });
    }

    pub fn record_fmt(&mut self, tag: Tag, xid: u64, args: std::fmt::Arguments<'_>) {
        let mut msg = String::new();
        let _ = msg.write_fmt(args);
        self.records.push(Record { tag, xid, msg });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Emit and clear all buffered records.
    pub fn flush(&mut self) {
        for rec in self.records.drain(..) {
            tracing::info!(
                target: "legate::reqlog",
                tag = rec.tag.as_str(),
                xid = rec.xid,
                "{}",
                rec.msg
            );
        }
    }
}
