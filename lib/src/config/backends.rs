//! Backend configuration.

use {
    super::Backends,
    crate::error::{BackendConfigError, ConfigError},
    http::{HeaderValue, Uri},
    serde_derive::Deserialize,
    std::sync::Arc,
    toml::value::{Table, Value},
};

/// A single backend definition.
///
/// Requests are dialed to the authority of `uri` regardless of what the
/// client's request URI says; `override_host` replaces the forwarded `Host`
/// header when present.
#[derive(Clone, Debug)]
pub struct Backend {
    pub name: String,
    pub uri: Uri,
    pub override_host: Option<HeaderValue>,
}

/// Deserializer for the `[backends]` section: a table of named definitions,
/// kept in declaration order (the first backend is the default director).
#[derive(Deserialize)]
#[serde(transparent)]
pub(super) struct RawBackendsConfig(Table);

impl RawBackendsConfig {
    pub(super) fn validate(self) -> Result<Backends, ConfigError> {
        self.0
            .into_iter()
            .map(|(name, defn)| {
                parse_backend(&name, defn)
                    .map(Arc::new)
                    .map_err(|err| ConfigError::InvalidBackendDefinition { name, err })
            })
            .collect()
    }
}

fn parse_backend(name: &str, defn: Value) -> Result<Backend, BackendConfigError> {
    let table = match defn {
        Value::Table(table) => table,
        _ => return Err(BackendConfigError::MissingUrl),
    };

    let uri: Uri = table
        .get("url")
        .and_then(Value::as_str)
        .ok_or(BackendConfigError::MissingUrl)?
        .parse()?;
    if uri.scheme_str() != Some("http") {
        return Err(BackendConfigError::NotHttp);
    }
    if uri.host().is_none() {
        return Err(BackendConfigError::MissingHost);
    }

    let override_host = match table.get("override_host").and_then(Value::as_str) {
        Some("") => return Err(BackendConfigError::EmptyOverrideHost),
        Some(host) => Some(HeaderValue::from_str(host)?),
        None => None,
    };

    Ok(Backend {
        name: name.to_owned(),
        uri,
        override_host,
    })
}

impl Backend {
    /// host:port authority for plain TCP connections (pipe mode).
    pub fn authority(&self) -> String {
        let host = self.uri.host().unwrap_or("localhost");
        match self.uri.port_u16() {
            Some(p) => format!("{host}:{p}"),
            None => format!("{host}:80"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_backend_is_rejected() {
        let raw: RawBackendsConfig =
            toml::from_str("[origin]\nurl = \"https://example.com/\"").unwrap();
        let err = raw.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidBackendDefinition { name, .. } if name == "origin"
        ));
    }

    #[test]
    fn authority_defaults_port_80() {
        let raw: RawBackendsConfig =
            toml::from_str("[origin]\nurl = \"http://example.com/\"").unwrap();
        let backends = raw.validate().unwrap();
        assert_eq!(backends[0].authority(), "example.com:80");
    }
}
