//! Connection builder.
//!
//! Provides a fluent API for configuring and building an
//! [`InternalStreamConnection`].

use std::sync::Arc;

use docwire_core::{CompressorRegistry, CompressorSpec, ConnectionError};

use crate::connection::InternalStreamConnection;
use crate::description::ServerId;
use crate::events::CommandListener;
use crate::initializer::{ConnectionInitializer, HandshakeInitializer};
use crate::stream::StreamFactory;

/// Builder for creating an [`InternalStreamConnection`].
///
/// # Example
///
/// ```ignore
/// use docwire_connection::{ConnectionBuilder, CompressorKind, CompressorSpec, ServerAddress};
///
/// let connection = ConnectionBuilder::new(ServerAddress::new("localhost", 27017))
///     .stream_factory(tcp_stream_factory)
///     .compressor(CompressorSpec::new(CompressorKind::Zstd))
///     .application_name("inventory")
///     .build()?;
/// connection.open()?;
/// ```
pub struct ConnectionBuilder {
    /// Server the connection talks to.
    server_id: ServerId,
    /// Creates the stream when the connection opens.
    stream_factory: Option<Arc<dyn StreamFactory>>,
    /// Locally supported compressors, in preference order.
    compressors: Vec<CompressorSpec>,
    /// Receives command events once the connection is open.
    listener: Option<Arc<dyn CommandListener>>,
    /// Replaces the default handshake.
    initializer: Option<Arc<dyn ConnectionInitializer>>,
    /// Application name for the default handshake.
    application_name: Option<String>,
}

impl std::fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("server_id", &self.server_id)
            .field("stream_factory", &self.stream_factory.is_some())
            .field("compressors", &self.compressors)
            .field("listener", &self.listener.is_some())
            .field("initializer", &self.initializer.is_some())
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl ConnectionBuilder {
    /// Create a new ConnectionBuilder for the given server.
    pub fn new<S: Into<ServerId>>(server_id: S) -> Self {
        Self {
            server_id: server_id.into(),
            stream_factory: None,
            compressors: Vec::new(),
            listener: None,
            initializer: None,
            application_name: None,
        }
    }

    /// Set the factory that creates the stream. Required.
    pub fn stream_factory<F: StreamFactory + 'static>(mut self, factory: F) -> Self {
        self.stream_factory = Some(Arc::new(factory));
        self
    }

    /// Add a locally supported compressor.
    ///
    /// Compressors are offered to the server in the order they are added.
    pub fn compressor(mut self, spec: CompressorSpec) -> Self {
        self.compressors.push(spec);
        self
    }

    /// Add locally supported compressors by handshake name.
    ///
    /// # Errors
    /// Returns `UnsupportedCompressor` for a name without a local implementation.
    pub fn compressor_names<I, S>(mut self, names: I) -> Result<Self, ConnectionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self.compressors.push(CompressorSpec::from_name(name.as_ref())?);
        }
        Ok(self)
    }

    /// Register a command listener.
    pub fn command_listener<L: CommandListener + 'static>(mut self, listener: L) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Replace the default [`HandshakeInitializer`].
    pub fn initializer<I: ConnectionInitializer + 'static>(mut self, initializer: I) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Application name reported by the default handshake.
    pub fn application_name<S: Into<String>>(mut self, name: S) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Build the connection. It still has to be opened.
    ///
    /// # Errors
    /// Returns `InvalidState` if no stream factory was set.
    pub fn build(self) -> Result<InternalStreamConnection, ConnectionError> {
        let stream_factory = self.stream_factory.ok_or_else(|| {
            ConnectionError::InvalidState("a stream factory is required".into())
        })?;
        let compressors = CompressorRegistry::new(&self.compressors);

        let initializer = match self.initializer {
            Some(initializer) => initializer,
            None => {
                let mut handshake = HandshakeInitializer::new().compressors(compressors.names());
                if let Some(name) = self.application_name {
                    handshake = handshake.application_name(name);
                }
                Arc::new(handshake)
            }
        };

        Ok(InternalStreamConnection::new(
            self.server_id,
            stream_factory,
            compressors,
            initializer,
            self.listener,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use docwire_core::{CompressorKind, ErrorKind, ServerAddress};
    use std::io;

    fn refusing_factory(_: &ServerAddress) -> io::Result<Arc<dyn Stream>> {
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[test]
    fn test_build_requires_stream_factory() {
        let err = ConnectionBuilder::new(ServerAddress::default()).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[cfg(all(feature = "compression-zlib", feature = "compression-snappy"))]
    #[test]
    fn test_build_keeps_compressor_order() {
        let connection = ConnectionBuilder::new(ServerAddress::default())
            .stream_factory(refusing_factory)
            .compressor(CompressorSpec::new(CompressorKind::Noop))
            .compressor_names(["zlib", "snappy"])
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(connection.compressor_names(), vec!["noop", "zlib", "snappy"]);
        assert!(!connection.opened());
        assert!(connection.send_compressor().is_none());
    }

    #[test]
    fn test_unknown_compressor_name() {
        let err = ConnectionBuilder::new(ServerAddress::default())
            .compressor_names(["lz4"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedCompressor);
    }

    #[test]
    fn test_open_failure_closes() {
        let connection = ConnectionBuilder::new(ServerAddress::default())
            .stream_factory(refusing_factory)
            .build()
            .unwrap();
        let err = connection.open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OpenFailure);
        assert!(connection.is_closed());
    }

    #[test]
    fn test_builder_debug() {
        let builder = ConnectionBuilder::new(ServerAddress::default()).application_name("inventory");
        let debug_str = format!("{builder:?}");
        assert!(debug_str.contains("ConnectionBuilder"));
        assert!(debug_str.contains("inventory"));
    }
}
