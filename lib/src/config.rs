//! Proxy configuration.

use {
    self::{backends::RawBackendsConfig, params::RawParams},
    crate::error::ConfigError,
    serde_derive::Deserialize,
    std::{fs, net::SocketAddr, path::Path, str::FromStr, sync::Arc},
};

/// Types and deserializers for backend configuration settings.
mod backends;
pub use self::backends::Backend;
pub type Backends = Vec<Arc<Backend>>;

/// Runtime-tunable parameters.
mod params;
pub use self::params::Params;

/// Top-level configuration, the validated form of a `legate.toml` file.
#[derive(Debug, Clone)]
pub struct LegateConfig {
    listen_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    backends: Backends,
    params: Params,
}

impl LegateConfig {
    /// The address client connections are accepted on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// The address the admin listener binds, if configured.
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// The configured backends, in declaration order. The first entry is
    /// the default director.
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Parse a `legate.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        fs::read_to_string(path.as_ref())
            .map_err(|err| ConfigError::IoError {
                path: path.as_ref().display().to_string(),
                err,
            })
            .and_then(|toml| Self::from_toml(&toml))
    }

    fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let raw = toml::from_str::<RawLegateConfig>(toml)?;
        raw.validate()
    }
}

impl FromStr for LegateConfig {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_toml(s)
    }
}

/// Internal deserializer used to read data from a `legate.toml` file.
#[derive(Deserialize)]
struct RawLegateConfig {
    listen_addr: Option<String>,
    admin_addr: Option<String>,
    backends: Option<RawBackendsConfig>,
    params: Option<RawParams>,
}

impl RawLegateConfig {
    fn validate(self) -> Result<LegateConfig, ConfigError> {
        let listen_addr = match self.listen_addr {
            Some(ref s) => s
                .parse()
                .map_err(|_| ConfigError::InvalidListenAddr(s.clone()))?,
            None => SocketAddr::from(([127, 0, 0, 1], 6081)),
        };
        let admin_addr = match self.admin_addr {
            Some(ref s) => Some(
                s.parse()
                    .map_err(|_| ConfigError::InvalidAdminAddr(s.clone()))?,
            ),
            None => None,
        };
        let backends = self
            .backends
            .ok_or(ConfigError::NoBackends)?
            .validate()?;
        if backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        let params = self.params.unwrap_or_default().validate()?;
        Ok(LegateConfig {
            listen_addr,
            admin_addr,
            backends,
            params,
        })
    }
}
