//! The admin listener: a line-oriented control protocol for debugging and
//! test reproducibility.
//!
//! Supported commands: `ping`, `debug.xid [n]` (examine or pin the xid
//! counter), `debug.srandom [seed]` (reseed the PRNG; seed 1 is the
//! portable reproducible value).

use std::net::SocketAddr;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};
use tracing::{event, Level};

use crate::{service::ProxyCtx, Error};

/// Outcome of one admin command.
#[derive(Debug, PartialEq, Eq)]
pub struct AdminReply {
    pub status: u16,
    pub body: String,
}

impl AdminReply {
    fn ok(body: impl Into<String>) -> Self {
        AdminReply {
            status: 200,
            body: body.into(),
        }
    }

    fn unknown(cmd: &str) -> Self {
        AdminReply {
            status: 101,
            body: format!("Unknown request: {cmd}"),
        }
    }

    fn syntax(msg: impl Into<String>) -> Self {
        AdminReply {
            status: 104,
            body: msg.into(),
        }
    }
}

/// Parse and apply one command line.
pub fn dispatch(ctx: &ProxyCtx, line: &str) -> AdminReply {
    let mut words = line.split_whitespace();
    let cmd = match words.next() {
        Some(cmd) => cmd,
        None => return AdminReply::syntax("empty command"),
    };
    let arg = words.next();
    if words.next().is_some() {
        return AdminReply::syntax("too many arguments");
    }

    match cmd {
        "ping" => AdminReply::ok(format!("PONG {:.0}", crate::clock::now())),
        "debug.xid" => {
            if let Some(arg) = arg {
                match arg.parse::<u64>() {
                    Ok(n) => ctx.debug_set_xid(n),
                    Err(_) => return AdminReply::syntax("xid must be a number"),
                }
            }
            AdminReply::ok(format!("XID is {}", ctx.debug_xid()))
        }
        "debug.srandom" => {
            let seed = match arg {
                Some(arg) => match arg.parse::<u64>() {
                    Ok(seed) => seed,
                    Err(_) => return AdminReply::syntax("seed must be a number"),
                },
                None => 1,
            };
            ctx.debug_srandom(seed);
            AdminReply::ok(format!("Random(3) seeded with {seed}"))
        }
        other => AdminReply::unknown(other),
    }
}

/// Serve the admin protocol. One line in, a status line plus body out.
pub async fn serve(ctx: ProxyCtx, addr: SocketAddr) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    event!(Level::INFO, "admin listening on {}", listener.local_addr()?);
    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = dispatch(&ctx, &line);
                let msg = format!("{} {}\n{}\n", reply.status, reply.body.len(), reply.body);
                if write_half.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}
