//! Error types.

use std::io;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Error when the engine has reached a state that only a programming
    /// error can explain. The request is failed loudly rather than papered
    /// over.
    #[error("Fatal error: [{0}]")]
    FatalError(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error(transparent)]
    HyperError(#[from] hyper::Error),

    #[error(transparent)]
    HttpError(#[from] http::Error),

    #[error(transparent)]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error(transparent)]
    InvalidMethod(#[from] http::method::InvalidMethod),

    #[error(transparent)]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),

    #[error(transparent)]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error(transparent)]
    IoError(#[from] io::Error),

    #[error("Storage pool exhausted")]
    StorageExhausted,

    #[error("Workspace overflow: {0} bytes requested")]
    WorkspaceOverflow(usize),

    #[error("Body read error: {0}")]
    BodyRead(String),

    #[error("Gzip error: {0}")]
    Gzip(String),

    #[error("restart from the miss hook is not supported")]
    MissRestart,

    #[error("pipe within an ESI include")]
    PipeInEsi,

    #[error("String conversion error")]
    ToStr(#[from] http::header::ToStrError),

    #[error("Expected UTF-8")]
    Utf8Expected(#[from] std::str::Utf8Error),
}

/// Errors that can occur while parsing a `legate.toml` file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An I/O error that occurred while reading the file.
    #[error("error reading '{path}': {err}")]
    IoError {
        path: String,
        #[source]
        err: io::Error,
    },

    #[error("invalid configuration for backend '{name}': {err}")]
    InvalidBackendDefinition {
        name: String,
        #[source]
        err: BackendConfigError,
    },

    #[error("no backends defined")]
    NoBackends,

    #[error("invalid listen address: {0}")]
    InvalidListenAddr(String),

    #[error("invalid admin address: {0}")]
    InvalidAdminAddr(String),

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParam { name: &'static str, reason: String },

    /// An error that occurred while deserializing the file.
    ///
    /// This represents errors caused by syntactically invalid TOML data,
    /// missing fields, etc.
    #[error("error parsing `legate.toml`: {0}")]
    InvalidToml(#[from] toml::de::Error),
}

/// Errors that may occur while validating backend configurations.
#[derive(Debug, thiserror::Error)]
pub enum BackendConfigError {
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] http::uri::InvalidUri),

    #[error("url must use the http scheme")]
    NotHttp,

    #[error("url is missing a host")]
    MissingHost,

    #[error("missing 'url' field")]
    MissingUrl,

    #[error("invalid override_host: {0}")]
    InvalidOverrideHost(#[from] http::header::InvalidHeaderValue),

    #[error("'override_host' field is empty")]
    EmptyOverrideHost,
}
