//! Connection initialization.
//!
//! An initializer runs after the stream opens and before the connection is
//! marked open. It talks to the server over the connection being opened and
//! returns the [`ConnectionDescription`] the connection will use.

use bson::{Bson, Document, doc};
use docwire_core::{CommandMessage, ConnectionError, DEFAULT_MAX_MESSAGE_SIZE, DocumentDecoder};
use futures::future::BoxFuture;

use crate::connection::InternalStreamConnection;
use crate::description::{ConnectionDescription, ServerType};

/// Runs the opening handshake.
pub trait ConnectionInitializer: Send + Sync {
    fn initialize(
        &self,
        connection: &InternalStreamConnection,
    ) -> Result<ConnectionDescription, ConnectionError>;

    fn initialize_async<'a>(
        &'a self,
        connection: &'a InternalStreamConnection,
    ) -> BoxFuture<'a, Result<ConnectionDescription, ConnectionError>>;
}

/// The default handshake: `isMaster` with client metadata and the locally
/// supported compressor names.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInitializer {
    application_name: Option<String>,
    compressors: Vec<String>,
}

impl HandshakeInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Application name reported in the client metadata.
    pub fn application_name<S: Into<String>>(mut self, name: S) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Compressor names offered to the server, in preference order.
    pub fn compressors<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.compressors = names.into_iter().map(Into::into).collect();
        self
    }

    /// The handshake command document.
    pub fn handshake_command(&self) -> Document {
        let mut client = doc! {
            "driver": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": { "type": std::env::consts::OS, "architecture": std::env::consts::ARCH },
        };
        if let Some(name) = &self.application_name {
            client.insert("application", doc! { "name": name.as_str() });
        }

        let mut command = doc! { "isMaster": 1, "client": client };
        if !self.compressors.is_empty() {
            command.insert("compression", self.compressors.clone());
        }
        command
    }

    fn message(&self) -> CommandMessage {
        CommandMessage::new("admin", self.handshake_command()).legacy()
    }
}

impl ConnectionInitializer for HandshakeInitializer {
    fn initialize(
        &self,
        connection: &InternalStreamConnection,
    ) -> Result<ConnectionDescription, ConnectionError> {
        let reply = connection.send_and_receive(&self.message(), &DocumentDecoder)?;
        Ok(description_from_reply(&connection.description(), &reply))
    }

    fn initialize_async<'a>(
        &'a self,
        connection: &'a InternalStreamConnection,
    ) -> BoxFuture<'a, Result<ConnectionDescription, ConnectionError>> {
        Box::pin(async move {
            let reply = connection
                .send_and_receive_async(&self.message(), &DocumentDecoder)
                .await?;
            Ok(description_from_reply(&connection.description(), &reply))
        })
    }
}

/// Build a description from an `isMaster` reply.
///
/// Missing limits fall back to their defaults and the connection id gains
/// the server-side id when the reply carries one.
pub fn description_from_reply(
    current: &ConnectionDescription,
    reply: &Document,
) -> ConnectionDescription {
    let defaults = ConnectionDescription::new(current.connection_id().clone());
    let compressors: Vec<String> = reply
        .get_array("compression")
        .map(|names| {
            names
                .iter()
                .filter_map(Bson::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let connection_id = match get_number(reply, "connectionId") {
        Some(server_value) => current.connection_id().with_server_value(server_value),
        None => current.connection_id().clone(),
    };

    defaults
        .with_connection_id(connection_id)
        .with_server_type(server_type(reply))
        .with_max_message_size(
            get_size(reply, "maxMessageSizeBytes").unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
        )
        .with_max_document_size(
            get_size(reply, "maxBsonObjectSize").unwrap_or(current.max_document_size()),
        )
        .with_max_batch_count(
            get_size(reply, "maxWriteBatchSize").unwrap_or(current.max_batch_count()),
        )
        .with_compressors(compressors)
}

fn server_type(reply: &Document) -> ServerType {
    if reply.get_str("msg").is_ok_and(|msg| msg == "isdbgrid") {
        return ServerType::ShardRouter;
    }
    if reply.contains_key("setName") {
        if reply.get_bool("ismaster").unwrap_or(false) {
            return ServerType::ReplicaSetPrimary;
        }
        if reply.get_bool("secondary").unwrap_or(false) {
            return ServerType::ReplicaSetSecondary;
        }
        return ServerType::Unknown;
    }
    ServerType::Standalone
}

fn get_number(document: &Document, key: &str) -> Option<i64> {
    match document.get(key)? {
        Bson::Int32(value) => Some(i64::from(*value)),
        Bson::Int64(value) => Some(*value),
        Bson::Double(value) => Some(*value as i64),
        _ => None,
    }
}

fn get_size(document: &Document, key: &str) -> Option<usize> {
    get_number(document, key).and_then(|value| usize::try_from(value).ok())
}
