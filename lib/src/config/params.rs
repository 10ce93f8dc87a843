//! Runtime parameters, the `[params]` table of `legate.toml`.

use {
    crate::error::ConfigError,
    serde_derive::Deserialize,
    std::time::Duration,
};

/// Validated runtime parameters. One instance lives in the proxy context
/// for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Params {
    /// Ceiling on policy-initiated restarts per request.
    pub max_restarts: u32,
    /// How long a worker lingers on an idle keep-alive connection before
    /// herding it back to the waiter. Zero disables lingering.
    pub session_linger: Duration,
    /// TTL when the response headers provide none.
    pub default_ttl: f64,
    pub default_grace: f64,
    pub default_keep: f64,
    /// Objects with a TTL below this go to transient storage.
    pub shortlived: f64,
    /// Master switch for all gzip processing.
    pub http_gzip_support: bool,
    /// flate2 compression level for `do_gzip` (0-9).
    pub gzip_level: u32,
    /// Buffer size for the streaming gunzip context.
    pub gzip_stack_buffer: usize,
    /// Client read buffer cap; a request head beyond this closes the
    /// connection with "overflow".
    pub http_req_size: usize,
    /// Largest client request body the engine will take along.
    pub client_body_size: usize,
    /// LRU touches are suppressed within this window.
    pub lru_timeout: Duration,
    /// Worker stats fold into the global table after this many requests.
    pub wthread_stats_rate: u64,
    /// Main storage pool capacity in bytes.
    pub storage_bytes: u64,
    /// Transient storage pool capacity in bytes.
    pub transient_bytes: u64,
    pub connect_timeout: Duration,
    pub first_byte_timeout: Duration,
    pub between_bytes_timeout: Duration,
    /// Emit a trace line per step transition.
    pub diag_steps: bool,
    /// Session workspace size.
    pub workspace_size: usize,
}

impl Default for Params {
    fn default() -> Self {
        RawParams::default().validate().expect("defaults are valid")
    }
}

/// Deserializer for the raw table; every field optional.
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(super) struct RawParams {
    max_restarts: Option<u32>,
    session_linger_ms: Option<u64>,
    default_ttl: Option<f64>,
    default_grace: Option<f64>,
    default_keep: Option<f64>,
    shortlived: Option<f64>,
    http_gzip_support: Option<bool>,
    gzip_level: Option<u32>,
    gzip_stack_buffer: Option<usize>,
    http_req_size: Option<usize>,
    client_body_size: Option<usize>,
    lru_timeout_ms: Option<u64>,
    wthread_stats_rate: Option<u64>,
    storage_bytes: Option<u64>,
    transient_bytes: Option<u64>,
    connect_timeout_ms: Option<u64>,
    first_byte_timeout_ms: Option<u64>,
    between_bytes_timeout_ms: Option<u64>,
    diag_steps: Option<bool>,
    workspace_size: Option<usize>,
}

impl RawParams {
    pub(super) fn validate(self) -> Result<Params, ConfigError> {
        let gzip_level = self.gzip_level.unwrap_or(6);
        if gzip_level > 9 {
            return Err(ConfigError::InvalidParam {
                name: "gzip_level",
                reason: format!("{gzip_level} not in 0..=9"),
            });
        }
        let default_ttl = self.default_ttl.unwrap_or(120.0);
        if !default_ttl.is_finite() || default_ttl < 0.0 {
            return Err(ConfigError::InvalidParam {
                name: "default_ttl",
                reason: format!("{default_ttl} must be a non-negative number"),
            });
        }
        let http_req_size = self.http_req_size.unwrap_or(32 * 1024);
        if http_req_size < 1024 {
            return Err(ConfigError::InvalidParam {
                name: "http_req_size",
                reason: "must be at least 1024".to_string(),
            });
        }
        Ok(Params {
            max_restarts: self.max_restarts.unwrap_or(4),
            session_linger: Duration::from_millis(self.session_linger_ms.unwrap_or(50)),
            default_ttl,
            default_grace: self.default_grace.unwrap_or(10.0),
            default_keep: self.default_keep.unwrap_or(0.0),
            shortlived: self.shortlived.unwrap_or(10.0),
            http_gzip_support: self.http_gzip_support.unwrap_or(true),
            gzip_level,
            gzip_stack_buffer: self.gzip_stack_buffer.unwrap_or(32 * 1024),
            http_req_size,
            client_body_size: self.client_body_size.unwrap_or(8 * 1024 * 1024),
            lru_timeout: Duration::from_millis(self.lru_timeout_ms.unwrap_or(2_000)),
            wthread_stats_rate: self.wthread_stats_rate.unwrap_or(10),
            storage_bytes: self.storage_bytes.unwrap_or(256 * 1024 * 1024),
            transient_bytes: self.transient_bytes.unwrap_or(64 * 1024 * 1024),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.unwrap_or(3_500)),
            first_byte_timeout: Duration::from_millis(self.first_byte_timeout_ms.unwrap_or(60_000)),
            between_bytes_timeout: Duration::from_millis(
                self.between_bytes_timeout_ms.unwrap_or(60_000),
            ),
            diag_steps: self.diag_steps.unwrap_or(false),
            workspace_size: self.workspace_size.unwrap_or(64 * 1024),
        })
    }
}
