//! The legate daemon.

mod opts;

use anyhow::Context;
use clap::Parser;
use legate_lib::{admin, serve, LegateConfig, ProxyCtx};
use opts::Opts;
use tracing::{event, Level};
use tracing_subscriber::{filter::EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    install_tracing_subscriber(&opts);

    let config = LegateConfig::from_file(opts.config_path()).with_context(|| {
        format!(
            "unable to load configuration from {}",
            opts.config_path().display()
        )
    })?;

    let listen_addr = opts.addr().unwrap_or_else(|| config.listen_addr());
    let admin_addr = opts.admin_addr().or_else(|| config.admin_addr());

    let ctx = ProxyCtx::new(&config)?;

    let admin_task = admin_addr.map(|addr| {
        let ctx = ctx.clone();
        tokio::spawn(async move { admin::serve(ctx, addr).await })
    });

    tokio::select! {
        res = serve(ctx, listen_addr) => {
            res.context("client listener failed")?;
        }
        res = wait_admin(admin_task) => {
            res.context("admin listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            event!(Level::INFO, "shutdown signal received");
        }
    }

    Ok(())
}

async fn wait_admin(
    task: Option<tokio::task::JoinHandle<Result<(), legate_lib::Error>>>,
) -> anyhow::Result<()> {
    match task {
        Some(task) => {
            task.await??;
            Ok(())
        }
        None => std::future::pending().await,
    }
}

fn install_tracing_subscriber(opts: &Opts) {
    // Default to INFO unless RUST_LOG or the verbosity flags say otherwise.
    if std::env::var("RUST_LOG").is_err() {
        match opts.verbosity() {
            0 => std::env::set_var("RUST_LOG", "info"),
            1 => std::env::set_var("RUST_LOG", "debug"),
            _ => std::env::set_var("RUST_LOG", "trace"),
        }
    }
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
