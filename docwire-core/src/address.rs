//! Server addresses.

use std::fmt;

/// Default port a document server listens on.
pub const DEFAULT_PORT: u16 = 27017;

/// Host and port of a single server.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Create an address from a host and port.
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port,
        }
    }

    /// Parse `host` or `host:port`. A missing port uses [`DEFAULT_PORT`].
    ///
    /// Returns `None` for an empty host or an unparsable port.
    pub fn parse(value: &str) -> Option<Self> {
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (value, DEFAULT_PORT),
        };
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
