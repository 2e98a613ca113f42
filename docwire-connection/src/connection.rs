//! The stream connection.
//!
//! [`InternalStreamConnection`] owns one [`Stream`] to one server. It runs
//! the opening handshake, negotiates the send compressor, and dispatches
//! commands:
//!
//! ```text
//! encode -> (compress) -> write -> read header -> read body -> (decompress)
//!        -> ok-check -> decode
//! ```
//!
//! Blocking and async dispatch share every step except the I/O calls. Any
//! dispatch failure after encoding closes the connection.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use docwire_core::{
    BoxedCompressor, COMPRESSED_HEADER_LENGTH, CommandMessage, CompressedHeader,
    CompressorRegistry, ConnectionError, Decoder, MESSAGE_HEADER_LENGTH, MessageHeader,
    MessageSettings, ReplyMessage, ServerAddress, is_command_ok, is_security_sensitive,
    to_document,
};
use tokio::sync::watch;

use crate::buffer::{ByteBuf, ResponseBuffers};
use crate::builder::ConnectionBuilder;
use crate::description::{ConnectionDescription, ConnectionId, ServerId};
use crate::events::{CommandEventSender, CommandListener};
use crate::initializer::ConnectionInitializer;
use crate::state::{AtomicState, ConnectionState};
use crate::stream::{Stream, StreamFactory};
use crate::translate::{Operation, translate, translate_body_read};

/// A connection to one server over one stream.
///
/// A connection is opened at most once and closed at most once. It expects
/// at most one dispatch in flight at a time; [`close`](Self::close) may be
/// called from anywhere at any time and fails whatever is pending.
pub struct InternalStreamConnection {
    server_id: ServerId,
    stream_factory: Arc<dyn StreamFactory>,
    stream: OnceLock<Arc<dyn Stream>>,
    state: AtomicState,
    description: ArcSwap<ConnectionDescription>,
    send_compressor: ArcSwapOption<BoxedCompressor>,
    compressors: CompressorRegistry,
    initializer: Arc<dyn ConnectionInitializer>,
    listener: Option<Arc<dyn CommandListener>>,
    closed: watch::Sender<bool>,
}

/// An encoded command plus the event tracker started for it.
struct PreparedCommand {
    bytes: Bytes,
    max_message_size: usize,
    events: CommandEventSender,
}

impl InternalStreamConnection {
    /// Start configuring a connection to `server_id`.
    pub fn builder<S: Into<ServerId>>(server_id: S) -> ConnectionBuilder {
        ConnectionBuilder::new(server_id)
    }

    pub(crate) fn new(
        server_id: ServerId,
        stream_factory: Arc<dyn StreamFactory>,
        compressors: CompressorRegistry,
        initializer: Arc<dyn ConnectionInitializer>,
        listener: Option<Arc<dyn CommandListener>>,
    ) -> Self {
        let description = ConnectionDescription::new(ConnectionId::new(server_id.clone()));
        let (closed, _) = watch::channel(false);
        Self {
            server_id,
            stream_factory,
            stream: OnceLock::new(),
            state: AtomicState::new(),
            description: ArcSwap::from_pointee(description),
            send_compressor: ArcSwapOption::empty(),
            compressors,
            initializer,
            listener,
            closed,
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn server_address(&self) -> &ServerAddress {
        self.server_id.address()
    }

    /// The current description. Replaced when the handshake completes.
    pub fn description(&self) -> Arc<ConnectionDescription> {
        self.description.load_full()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Whether the handshake completed and the connection is not closed.
    pub fn opened(&self) -> bool {
        self.state.load() == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state.load() == ConnectionState::Closed
    }

    /// The compressor applied to outbound commands, if one was negotiated.
    pub fn send_compressor(&self) -> Option<BoxedCompressor> {
        self.send_compressor
            .load_full()
            .map(|compressor| compressor.as_ref().clone())
    }

    /// Handshake names of the locally configured compressors.
    pub fn compressor_names(&self) -> Vec<&'static str> {
        self.compressors.names()
    }

    /// Open the stream and run the handshake.
    ///
    /// # Errors
    /// Returns `InvalidState` if the connection was already opened. Any
    /// failure closes the connection before it is returned.
    pub fn open(&self) -> Result<(), ConnectionError> {
        let stream = self.begin_open()?;
        let result = stream
            .open()
            .map_err(|e| self.io_error(e, Operation::Open))
            .and_then(|()| self.initializer.initialize(self));
        self.finish_open(result)
    }

    /// Open the stream and run the handshake without blocking.
    ///
    /// Same semantics as [`open`](Self::open).
    pub async fn open_async(&self) -> Result<(), ConnectionError> {
        let stream = self.begin_open()?;
        let opened = self
            .until_closed(async {
                stream
                    .open_async()
                    .await
                    .map_err(|e| self.io_error(e, Operation::Open))
            })
            .await;
        let result = match opened {
            Ok(()) => self.initializer.initialize_async(self).await,
            Err(err) => Err(err),
        };
        self.finish_open(result)
    }

    /// Close the connection.
    ///
    /// Idempotent. Only the first call closes the stream; pending async
    /// operations fail with `ClosedConnection`.
    pub fn close(&self) {
        if self.state.close() == ConnectionState::Closed {
            return;
        }
        if let Some(stream) = self.stream.get() {
            stream.close();
        }
        self.closed.send_replace(true);
        tracing::debug!(
            connection = %self.description.load().connection_id(),
            "connection closed"
        );
    }

    /// An empty buffer from the stream with room for `size` bytes.
    pub fn get_buffer(&self, size: usize) -> Result<ByteBuf, ConnectionError> {
        self.stream
            .get()
            .map(|stream| stream.get_buffer(size))
            .ok_or_else(|| ConnectionError::InvalidState("the connection has not been opened".into()))
    }

    /// Send a command and decode its reply.
    ///
    /// # Errors
    /// Encoding errors are returned without touching the connection. Every
    /// other failure, including a reply with `ok: 0`, closes the connection.
    pub fn send_and_receive<T, D>(
        &self,
        message: &CommandMessage,
        decoder: &D,
    ) -> Result<T, ConnectionError>
    where
        D: Decoder<T> + ?Sized,
    {
        let stream = self.usable_stream()?;
        let PreparedCommand {
            bytes,
            max_message_size,
            mut events,
        } = self.prepare_command(message)?;

        let result = stream
            .write(&bytes)
            .map_err(|e| self.io_error(e, Operation::Write))
            .and_then(|()| self.receive_response(stream.as_ref(), max_message_size))
            .and_then(|response| {
                self.complete_command(response, message.request_id(), decoder, &mut events)
            });
        self.finish_command(result, &mut events)
    }

    /// Send a command and decode its reply without blocking.
    ///
    /// Same semantics as [`send_and_receive`](Self::send_and_receive).
    pub async fn send_and_receive_async<T, D>(
        &self,
        message: &CommandMessage,
        decoder: &D,
    ) -> Result<T, ConnectionError>
    where
        D: Decoder<T> + ?Sized,
    {
        let stream = self.usable_stream()?;
        let PreparedCommand {
            bytes,
            max_message_size,
            mut events,
        } = self.prepare_command(message)?;

        let exchanged = async {
            self.write_async(stream.as_ref(), &bytes).await?;
            self.receive_response_async(stream.as_ref(), max_message_size)
                .await
        }
        .await;
        let result = exchanged.and_then(|response| {
            self.complete_command(response, message.request_id(), decoder, &mut events)
        });
        self.finish_command(result, &mut events)
    }

    /// Write an already framed message.
    ///
    /// A write failure closes the connection.
    pub fn send_message(&self, message: &[u8], request_id: u32) -> Result<(), ConnectionError> {
        let stream = self.usable_stream()?;
        tracing::trace!(request_id, length = message.len(), "sending message");
        stream
            .write(message)
            .map_err(|e| self.io_error(e, Operation::Write))
            .inspect_err(|_| self.close())
    }

    /// Write an already framed message without blocking.
    pub async fn send_message_async(
        &self,
        message: &[u8],
        request_id: u32,
    ) -> Result<(), ConnectionError> {
        let stream = self.usable_stream()?;
        tracing::trace!(request_id, length = message.len(), "sending message");
        self.write_async(stream.as_ref(), message)
            .await
            .inspect_err(|_| self.close())
    }

    /// Read the next message, which must answer `response_to`.
    ///
    /// Compressed messages are decompressed. Any failure closes the
    /// connection.
    pub fn receive_message(&self, response_to: u32) -> Result<ResponseBuffers, ConnectionError> {
        let stream = self.usable_stream()?;
        let max_message_size = self.description.load().max_message_size();
        self.receive_response(stream.as_ref(), max_message_size)
            .and_then(|response| check_response_to(response, response_to))
            .inspect_err(|_| self.close())
    }

    /// Read the next message without blocking.
    pub async fn receive_message_async(
        &self,
        response_to: u32,
    ) -> Result<ResponseBuffers, ConnectionError> {
        let stream = self.usable_stream()?;
        let max_message_size = self.description.load().max_message_size();
        self.receive_response_async(stream.as_ref(), max_message_size)
            .await
            .and_then(|response| check_response_to(response, response_to))
            .inspect_err(|_| self.close())
    }

    fn begin_open(&self) -> Result<Arc<dyn Stream>, ConnectionError> {
        if let Err(state) = self
            .state
            .transition(ConnectionState::Unopened, ConnectionState::Opening)
        {
            return Err(match state {
                ConnectionState::Closed => {
                    ConnectionError::closed(self.server_address(), "the connection is closed")
                }
                _ => ConnectionError::InvalidState("the connection has already been opened".into()),
            });
        }

        let stream = match self.stream_factory.create(self.server_address()) {
            Ok(stream) => stream,
            Err(err) => {
                let err = self.io_error(err, Operation::Open);
                self.close();
                return Err(err);
            }
        };
        if self.stream.set(stream.clone()).is_err() {
            self.close();
            return Err(ConnectionError::InvalidState(
                "the connection already has a stream".into(),
            ));
        }
        // close() may have run before the stream was visible to it.
        if self.is_closed() {
            stream.close();
            return Err(ConnectionError::closed(
                self.server_address(),
                "the connection was closed while opening",
            ));
        }
        Ok(stream)
    }

    fn finish_open(
        &self,
        result: Result<ConnectionDescription, ConnectionError>,
    ) -> Result<(), ConnectionError> {
        let outcome = result.and_then(|description| {
            let compressor = self.compressors.negotiate(description.compressors())?;
            self.description.store(Arc::new(description));
            self.send_compressor.store(compressor.map(Arc::new));
            self.state
                .transition(ConnectionState::Opening, ConnectionState::Open)
                .map_err(|_| {
                    ConnectionError::closed(
                        self.server_address(),
                        "the connection was closed while opening",
                    )
                })
        });

        match outcome {
            Ok(()) => {
                let description = self.description.load();
                tracing::info!(
                    connection = %description.connection_id(),
                    server_type = ?description.server_type(),
                    compressor = self.send_compressor().map(|c| c.name()),
                    "opened connection"
                );
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    fn usable_stream(&self) -> Result<Arc<dyn Stream>, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::closed(
                self.server_address(),
                "the connection is closed",
            ));
        }
        self.stream
            .get()
            .cloned()
            .ok_or_else(|| ConnectionError::InvalidState("the connection has not been opened".into()))
    }

    fn io_error(&self, err: std::io::Error, operation: Operation) -> ConnectionError {
        if self.is_closed() {
            return ConnectionError::closed(self.server_address(), err.to_string());
        }
        translate(err, operation, self.server_address())
    }

    fn body_read_error(&self, err: std::io::Error) -> ConnectionError {
        if self.is_closed() {
            return ConnectionError::closed(self.server_address(), err.to_string());
        }
        translate_body_read(err, self.server_address())
    }

    /// Race `operation` against [`close`](Self::close).
    async fn until_closed<T, F>(&self, operation: F) -> Result<T, ConnectionError>
    where
        F: Future<Output = Result<T, ConnectionError>>,
    {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(ConnectionError::closed(
                self.server_address(),
                "the connection was closed while an operation was pending",
            )),
            result = operation => result,
        }
    }

    async fn write_async(&self, stream: &dyn Stream, data: &[u8]) -> Result<(), ConnectionError> {
        self.until_closed(async {
            stream
                .write_async(data)
                .await
                .map_err(|e| self.io_error(e, Operation::Write))
        })
        .await
    }

    fn prepare_command(&self, message: &CommandMessage) -> Result<PreparedCommand, ConnectionError> {
        let description = self.description.load();
        let settings = description.message_settings();
        let bytes = self.encode_command(message, &settings)?;
        let listener = if self.opened() {
            self.listener.clone()
        } else {
            None
        };
        let events = CommandEventSender::start(listener, description.connection_id(), message);
        Ok(PreparedCommand {
            bytes,
            max_message_size: settings.max_message_size,
            events,
        })
    }

    fn encode_command(
        &self,
        message: &CommandMessage,
        settings: &MessageSettings,
    ) -> Result<Bytes, ConnectionError> {
        let encoded = message.encode(settings)?;
        match self.send_compressor.load_full() {
            Some(compressor) if !is_security_sensitive(message.command_name()) => {
                encoded.compress(&compressor, settings)
            }
            _ => Ok(encoded.bytes().clone()),
        }
    }

    fn receive_response(
        &self,
        stream: &dyn Stream,
        max_message_size: usize,
    ) -> Result<ResponseBuffers, ConnectionError> {
        tracing::trace!(address = %self.server_address(), "receiving message");
        let header = stream
            .read(MESSAGE_HEADER_LENGTH)
            .map_err(|e| self.io_error(e, Operation::Read))?;
        let header = MessageHeader::decode(&header, max_message_size)?;
        let body = stream
            .read(header.body_length())
            .map_err(|e| self.body_read_error(e))?;
        self.assemble_response(stream, header, body, max_message_size)
    }

    async fn receive_response_async(
        &self,
        stream: &dyn Stream,
        max_message_size: usize,
    ) -> Result<ResponseBuffers, ConnectionError> {
        tracing::trace!(address = %self.server_address(), "receiving message");
        let header = self
            .until_closed(async {
                stream
                    .read_async(MESSAGE_HEADER_LENGTH)
                    .await
                    .map_err(|e| self.io_error(e, Operation::Read))
            })
            .await?;
        let header = MessageHeader::decode(&header, max_message_size)?;
        let body = self
            .until_closed(async {
                stream
                    .read_async(header.body_length())
                    .await
                    .map_err(|e| self.body_read_error(e))
            })
            .await?;
        self.assemble_response(stream, header, body, max_message_size)
    }

    /// Check the body length and decompress if needed.
    fn assemble_response(
        &self,
        stream: &dyn Stream,
        header: MessageHeader,
        body: ByteBuf,
        max_message_size: usize,
    ) -> Result<ResponseBuffers, ConnectionError> {
        if body.len() != header.body_length() {
            return Err(ConnectionError::ProtocolFraming(format!(
                "message length {} declares {} body bytes but {} were received",
                header.message_length,
                header.body_length(),
                body.len()
            )));
        }
        if !header.is_compressed() {
            return Ok(ResponseBuffers::new(header.into(), body));
        }

        let compressed = CompressedHeader::decode(&body, header)?;
        let compressor = self.compressors.require(compressed.compressor_id)?;
        let size = compressed.uncompressed_size as usize;
        if size.saturating_add(MESSAGE_HEADER_LENGTH) > max_message_size {
            return Err(ConnectionError::ProtocolFraming(format!(
                "uncompressed size {} is larger than the maximum message length {}",
                size, max_message_size
            )));
        }

        let mut uncompressed = stream.get_buffer(size);
        compressor
            .uncompress(&body[COMPRESSED_HEADER_LENGTH..], size, uncompressed.bytes_mut())
            .map_err(|e| {
                ConnectionError::ProtocolFraming(format!(
                    "{} decompression failed: {e}",
                    compressor.name()
                ))
            })?;
        Ok(ResponseBuffers::new(compressed.into(), uncompressed))
    }

    /// The ok-check and decode. `response` is released when this returns.
    fn complete_command<T, D>(
        &self,
        response: ResponseBuffers,
        request_id: u32,
        decoder: &D,
        events: &mut CommandEventSender,
    ) -> Result<T, ConnectionError>
    where
        D: Decoder<T> + ?Sized,
    {
        let reply = ReplyMessage::parse(response.header(), response.body(), request_id)?;
        let document = reply.document();
        if !is_command_ok(document)? {
            return Err(ConnectionError::command_failure(
                to_document(document)?,
                self.server_address(),
            ));
        }
        events.succeeded(document);
        decoder.decode(document)
    }

    fn finish_command<T>(
        &self,
        result: Result<T, ConnectionError>,
        events: &mut CommandEventSender,
    ) -> Result<T, ConnectionError> {
        result.inspect_err(|err| {
            events.failed(err);
            self.close();
        })
    }
}

fn check_response_to(
    response: ResponseBuffers,
    response_to: u32,
) -> Result<ResponseBuffers, ConnectionError> {
    if response.header().response_to != response_to {
        return Err(ConnectionError::ProtocolFraming(format!(
            "the responseTo ({}) in the response does not match the requestId ({}) in the request",
            response.header().response_to,
            response_to
        )));
    }
    Ok(response)
}

impl fmt::Debug for InternalStreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalStreamConnection")
            .field("server_id", &self.server_id)
            .field("state", &self.state.load())
            .field("description", &self.description.load())
            .field("send_compressor", &self.send_compressor())
            .field("compressors", &self.compressors)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}
