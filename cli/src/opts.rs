//! Command line arguments.

use {
    clap::Parser,
    std::net::SocketAddr,
    std::path::{Path, PathBuf},
};

// Command-line arguments for the legate CLI.
//
// This struct is used to derive a command-line argument parser. See the
// [clap](https://docs.rs/clap/latest/clap/) documentation for more
// information.
//
// Note that the doc comment below is used as descriptive text in the
// `--help` output.
/// legate is an HTTP reverse-caching proxy.
#[derive(Parser, Debug)]
#[command(name = "legate", author, version, about)]
pub struct Opts {
    /// The path to a TOML file containing the proxy configuration.
    #[arg(short = 'C', long = "config")]
    config_path: PathBuf,
    /// Override the listen address from the configuration file.
    #[arg(short = 'a', long = "addr")]
    socket_addr: Option<SocketAddr>,
    /// Override the admin listen address from the configuration file.
    #[arg(short = 'T', long = "admin-addr")]
    admin_addr: Option<SocketAddr>,
    /// Verbosity of logs. `-v` sets the log level to DEBUG and `-vv` to
    /// TRACE. This option will not take effect if you set RUST_LOG to a
    /// value before starting legate.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbosity: u8,
}

impl Opts {
    /// The path to the configuration file.
    pub fn config_path(&self) -> &Path {
        self.config_path.as_ref()
    }

    /// The listen address override, if given.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.socket_addr
    }

    /// The admin address override, if given.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }
}
