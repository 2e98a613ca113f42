//! Connection identity and the handshake snapshot.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use docwire_core::{DEFAULT_MAX_MESSAGE_SIZE, MessageSettings, ServerAddress};

static NEXT_LOCAL_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a server within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    cluster_id: String,
    address: ServerAddress,
}

impl ServerId {
    pub fn new<S: Into<String>>(cluster_id: S, address: ServerAddress) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            address,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }
}

impl From<ServerAddress> for ServerId {
    fn from(address: ServerAddress) -> Self {
        Self::new("default", address)
    }
}

/// Identifies one connection to a server.
///
/// The local value is unique within the process. The server value is the
/// server's own id for the connection, learned during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    server_id: ServerId,
    local_value: u32,
    server_value: Option<i64>,
}

impl ConnectionId {
    /// Allocate a new local id.
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            local_value: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            server_value: None,
        }
    }

    /// The same connection, with the server-assigned id attached.
    pub fn with_server_value(&self, server_value: i64) -> Self {
        Self {
            server_value: Some(server_value),
            ..self.clone()
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn local_value(&self) -> u32 {
        self.local_value
    }

    pub fn server_value(&self) -> Option<i64> {
        self.server_value
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self.server_id.address();
        match self.server_value {
            Some(server) => write!(f, "connection {}/{} to {}", self.local_value, server, address),
            None => write!(f, "connection {} to {}", self.local_value, address),
        }
    }
}

/// What kind of server answered the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    Standalone,
    ReplicaSetPrimary,
    ReplicaSetSecondary,
    ShardRouter,
    #[default]
    Unknown,
}

/// Immutable snapshot of a connection, produced by the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescription {
    connection_id: ConnectionId,
    server_type: ServerType,
    max_document_size: usize,
    max_message_size: usize,
    max_batch_count: usize,
    compressors: Vec<String>,
}

impl ConnectionDescription {
    /// The description before any handshake: unknown server, default limits.
    pub fn new(connection_id: ConnectionId) -> Self {
        let defaults = MessageSettings::default();
        Self {
            connection_id,
            server_type: ServerType::Unknown,
            max_document_size: defaults.max_document_size,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_count: defaults.max_batch_count,
            compressors: Vec::new(),
        }
    }

    pub fn with_server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    pub fn with_max_document_size(mut self, size: usize) -> Self {
        self.max_document_size = size;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_batch_count(mut self, count: usize) -> Self {
        self.max_batch_count = count;
        self
    }

    /// Compressor names the server advertised, in its order of preference.
    pub fn with_compressors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compressors = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connection_id(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = connection_id;
        self
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn server_address(&self) -> &ServerAddress {
        self.connection_id.server_id().address()
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn max_document_size(&self) -> usize {
        self.max_document_size
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn max_batch_count(&self) -> usize {
        self.max_batch_count
    }

    pub fn compressors(&self) -> &[String] {
        &self.compressors
    }

    /// Limits for encoding outbound messages.
    pub fn message_settings(&self) -> MessageSettings {
        MessageSettings {
            max_document_size: self.max_document_size,
            max_message_size: self.max_message_size,
            max_batch_count: self.max_batch_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_id() -> ServerId {
        ServerAddress::new("db.example.com", 27018).into()
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new(server_id());
        let b = ConnectionId::new(server_id());
        assert_ne!(a.local_value(), b.local_value());
        assert_eq!(a.server_value(), None);
    }

    #[test]
    fn test_with_server_value_keeps_local() {
        let id = ConnectionId::new(server_id());
        let with_server = id.with_server_value(4411);
        assert_eq!(with_server.local_value(), id.local_value());
        assert_eq!(with_server.server_value(), Some(4411));
        assert!(with_server.to_string().contains("4411"));
        assert!(with_server.to_string().contains("db.example.com:27018"));
    }

    #[test]
    fn test_description_defaults() {
        let description = ConnectionDescription::new(ConnectionId::new(server_id()));
        assert_eq!(description.server_type(), ServerType::Unknown);
        assert_eq!(description.max_message_size(), 48_000_000);
        assert_eq!(description.max_document_size(), 16 * 1024 * 1024);
        assert_eq!(description.max_batch_count(), 1000);
        assert!(description.compressors().is_empty());
        assert_eq!(description.server_address().port(), 27018);
    }

    #[test]
    fn test_message_settings_follow_description() {
        let description = ConnectionDescription::new(ConnectionId::new(server_id()))
            .with_max_message_size(1024)
            .with_max_document_size(512)
            .with_compressors(["zlib"]);
        let settings = description.message_settings();
        assert_eq!(settings.max_message_size, 1024);
        assert_eq!(settings.max_document_size, 512);
        assert_eq!(description.compressors().to_vec(), vec!["zlib".to_string()]);
    }
}
