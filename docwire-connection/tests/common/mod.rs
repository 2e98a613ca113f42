#![allow(dead_code)]

//! Scripted in-memory server for connection tests.
//!
//! [`MockStream`] parses every message the connection writes (decompressing
//! it if needed) and hands it to a handler, whose reply bytes are queued for
//! the connection to read. Every buffer the stream hands out is counted when
//! created and when released.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bson::{Document, doc};
use bytes::{BufMut, BytesMut};
use docwire_connection::{
    BoxedCompressor, ByteBuf, CommandFailedEvent, CommandListener, CommandStartedEvent,
    CommandSucceededEvent, CompressorRegistry, CompressorSpec, ConnectionBuilder,
    InternalStreamConnection, MessageHeader, OpCode, ServerAddress, Stream,
};
use docwire_core::{COMPRESSED_HEADER_LENGTH, CompressedHeader, MESSAGE_HEADER_LENGTH};
use futures::future::BoxFuture;

/// A message as the server saw it.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: MessageHeader,
    /// Opcode after unwrapping `OP_COMPRESSED`.
    pub op_code: i32,
    /// Compressor id if the message arrived compressed.
    pub compressor_id: Option<u8>,
    pub document: Document,
}

impl Request {
    pub fn command_name(&self) -> &str {
        self.document.keys().next().map(String::as_str).unwrap_or_default()
    }
}

type Handler = Box<dyn Fn(&Request) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Debug, Default)]
pub struct BufferStats {
    pub handed_out: AtomicUsize,
    pub released: AtomicUsize,
}

impl BufferStats {
    pub fn handed_out(&self) -> usize {
        self.handed_out.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

pub struct MockStream {
    address: ServerAddress,
    handler: Handler,
    inbound: Mutex<VecDeque<u8>>,
    requests: Mutex<Vec<Request>>,
    closes: AtomicUsize,
    closed: AtomicBool,
    stall_reads: AtomicBool,
    read_error: Mutex<Option<io::ErrorKind>>,
    compressors: CompressorRegistry,
    pub buffers: Arc<BufferStats>,
}

impl MockStream {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Request) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        let specs: Vec<CompressorSpec> = ["noop", "snappy", "zlib", "zstd"]
            .iter()
            .filter_map(|name| CompressorSpec::from_name(name).ok())
            .collect();
        Arc::new(Self {
            address: ServerAddress::new("mock", 27017),
            handler: Box::new(handler),
            inbound: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stall_reads: AtomicBool::new(false),
            read_error: Mutex::new(None),
            compressors: CompressorRegistry::new(&specs),
            buffers: Arc::new(BufferStats::default()),
        })
    }

    /// Number of times `close` was called.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Request {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }

    /// Make async reads wait forever.
    pub fn stall_reads(&self) {
        self.stall_reads.store(true, Ordering::SeqCst);
    }

    /// Make the next read fail with `kind`.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        *self.read_error.lock().unwrap() = Some(kind);
    }

    /// Queue raw bytes for the connection to read.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().extend(bytes.iter().copied());
    }

    fn tracked(&self, data: BytesMut) -> ByteBuf {
        self.buffers.handed_out.fetch_add(1, Ordering::SeqCst);
        let stats = self.buffers.clone();
        ByteBuf::with_release(data, move |_| {
            stats.released.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn parse(&self, data: &[u8]) -> Request {
        let header = MessageHeader::decode(data, usize::MAX).unwrap();
        let body = &data[MESSAGE_HEADER_LENGTH..];
        if !header.is_compressed() {
            return Request {
                header,
                op_code: header.op_code,
                compressor_id: None,
                document: parse_document(header.op_code, body),
            };
        }

        let compressed = CompressedHeader::decode(body, header).unwrap();
        let compressor = self.compressors.require(compressed.compressor_id).unwrap();
        let mut uncompressed = BytesMut::new();
        compressor
            .uncompress(
                &body[COMPRESSED_HEADER_LENGTH..],
                compressed.uncompressed_size as usize,
                &mut uncompressed,
            )
            .unwrap();
        assert_eq!(uncompressed.len(), compressed.uncompressed_size as usize);
        Request {
            header,
            op_code: compressed.original_op_code,
            compressor_id: Some(compressed.compressor_id),
            document: parse_document(compressed.original_op_code, &uncompressed),
        }
    }
}

fn parse_document(op_code: i32, body: &[u8]) -> Document {
    let start = match op_code {
        OpCode::OP_MSG => 5,
        OpCode::OP_QUERY => {
            let name_end = body[4..].iter().position(|b| *b == 0).unwrap() + 4;
            name_end + 1 + 8
        }
        other => panic!("unexpected request opcode {other}"),
    };
    bson::from_slice(&body[start..]).unwrap()
}

impl Stream for MockStream {
    fn address(&self) -> &ServerAddress {
        &self.address
    }

    fn open(&self) -> io::Result<()> {
        Ok(())
    }

    fn open_async(&self) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        let request = self.parse(data);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(reply) = (self.handler)(&request) {
            self.push_inbound(&reply);
        }
        Ok(())
    }

    fn write_async<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move { self.write(data) })
    }

    fn read(&self, len: usize) -> io::Result<ByteBuf> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "stream closed"));
        }
        if let Some(kind) = self.read_error.lock().unwrap().take() {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no more bytes"));
        }
        let take = len.min(inbound.len());
        let data: Vec<u8> = inbound.drain(..take).collect();
        Ok(self.tracked(BytesMut::from(&data[..])))
    }

    fn read_async(&self, len: usize) -> BoxFuture<'_, io::Result<ByteBuf>> {
        if self.stall_reads.load(Ordering::SeqCst) {
            return Box::pin(futures::future::pending());
        }
        Box::pin(async move { self.read(len) })
    }

    fn get_buffer(&self, size: usize) -> ByteBuf {
        self.tracked(BytesMut::with_capacity(size))
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Frame `document` as an `OP_MSG` reply.
pub fn op_msg_reply(response_to: u32, document: &Document) -> Vec<u8> {
    let bytes = bson::to_vec(document).unwrap();
    let length = MESSAGE_HEADER_LENGTH + 5 + bytes.len();
    let mut buf = BytesMut::new();
    MessageHeader::new(length as u32, 9000, response_to, OpCode::OP_MSG).encode_into(&mut buf);
    buf.put_u32_le(0);
    buf.put_u8(0);
    buf.put_slice(&bytes);
    buf.to_vec()
}

/// Frame `document` as an `OP_REPLY`.
pub fn op_reply(response_to: u32, document: &Document) -> Vec<u8> {
    let bytes = bson::to_vec(document).unwrap();
    let length = MESSAGE_HEADER_LENGTH + 20 + bytes.len();
    let mut buf = BytesMut::new();
    MessageHeader::new(length as u32, 9001, response_to, OpCode::OP_REPLY).encode_into(&mut buf);
    buf.put_i32_le(0); // responseFlags
    buf.put_i64_le(0); // cursorId
    buf.put_i32_le(0); // startingFrom
    buf.put_i32_le(1); // numberReturned
    buf.put_slice(&bytes);
    buf.to_vec()
}

/// Wrap a framed message in `OP_COMPRESSED`.
pub fn compress_reply(message: &[u8], compressor: &BoxedCompressor) -> Vec<u8> {
    let header = MessageHeader::decode(message, usize::MAX).unwrap();
    let body = &message[MESSAGE_HEADER_LENGTH..];
    let compressed = compressor.compress(body).unwrap();
    compressed_message(
        header.response_to,
        compressor.id(),
        &compressed,
        body.len() as u32,
    )
}

/// Frame an `OP_COMPRESSED` reply around an arbitrary payload, declaring
/// `uncompressed_size` whether or not it is true.
pub fn compressed_message(
    response_to: u32,
    compressor_id: u8,
    payload: &[u8],
    uncompressed_size: u32,
) -> Vec<u8> {
    let length = MESSAGE_HEADER_LENGTH + COMPRESSED_HEADER_LENGTH + payload.len();
    let outer = MessageHeader::new(length as u32, 9002, response_to, OpCode::OP_COMPRESSED);
    let mut buf = BytesMut::new();
    outer.encode_into(&mut buf);
    CompressedHeader {
        original_op_code: OpCode::OP_MSG,
        uncompressed_size,
        compressor_id,
        message_header: outer,
    }
    .encode_into(&mut buf);
    buf.put_slice(payload);
    buf.to_vec()
}

pub fn compressor(name: &str) -> BoxedCompressor {
    CompressorSpec::from_name(name).unwrap().create()
}

/// Answer the handshake, advertising `compression`.
pub fn handshake_reply(request: &Request, compression: &[&str]) -> Vec<u8> {
    let mut reply = doc! {
        "ok": 1.0,
        "ismaster": true,
        "maxMessageSizeBytes": 48_000_000,
        "maxBsonObjectSize": 16_777_216,
        "maxWriteBatchSize": 100_000,
        "connectionId": 42,
    };
    if !compression.is_empty() {
        let names: Vec<String> = compression.iter().map(|s| s.to_string()).collect();
        reply.insert("compression", names);
    }
    op_reply(request.header.request_id, &reply)
}

/// A server that completes the handshake and answers every command with
/// `reply(request)`. Replies are compressed with `reply_compressor` if set.
pub fn server<F>(
    advertised: &'static [&'static str],
    reply_compressor: Option<&'static str>,
    reply: F,
) -> Arc<MockStream>
where
    F: Fn(&Request) -> Document + Send + Sync + 'static,
{
    MockStream::new(move |request| {
        if request.command_name() == "isMaster" {
            return Some(handshake_reply(request, advertised));
        }
        let message = op_msg_reply(request.header.request_id, &reply(request));
        Some(match reply_compressor {
            Some(name) => compress_reply(&message, &compressor(name)),
            None => message,
        })
    })
}

/// Build a connection over `stream` with the given local compressors.
pub fn connect(stream: &Arc<MockStream>, compressors: &[&str]) -> InternalStreamConnection {
    builder(stream, compressors).build().unwrap()
}

pub fn builder(stream: &Arc<MockStream>, compressors: &[&str]) -> ConnectionBuilder {
    let stream = stream.clone();
    ConnectionBuilder::new(ServerAddress::new("mock", 27017))
        .stream_factory(move |_: &ServerAddress| -> io::Result<Arc<dyn Stream>> {
            Ok(stream.clone())
        })
        .compressor_names(compressors)
        .unwrap()
}

/// Records every command event.
#[derive(Default)]
pub struct Recorder {
    pub started: Mutex<Vec<CommandStartedEvent>>,
    pub succeeded: Mutex<Vec<CommandSucceededEvent>>,
    pub failed: Mutex<Vec<CommandFailedEvent>>,
}

impl Recorder {
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.started.lock().unwrap().len(),
            self.succeeded.lock().unwrap().len(),
            self.failed.lock().unwrap().len(),
        )
    }
}

impl CommandListener for Recorder {
    fn command_started(&self, event: &CommandStartedEvent) {
        self.started.lock().unwrap().push(event.clone());
    }

    fn command_succeeded(&self, event: &CommandSucceededEvent) {
        self.succeeded.lock().unwrap().push(event.clone());
    }

    fn command_failed(&self, event: &CommandFailedEvent) {
        self.failed.lock().unwrap().push(event.clone());
    }
}
