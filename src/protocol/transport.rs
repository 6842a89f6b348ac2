use std::{
    io::{self, Cursor, Read, Write},
    net::{Shutdown, TcpStream},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace};
use thiserror::Error;

use crate::codec::{
    CapturedStream, CodecError, DefaultTypeRegistry, InMemorySource, StreamKind, StreamValue,
    TypeRegistry, Value, WellKnownRegistry, WireDecoder, WireEncoder,
};

use super::message::WireObject;

/// Default upper bound for a frame payload (32 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 25;
/// Default size of the coalescing output buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 16;
/// Largest amount of stream data carried by one chunk.
pub const MAX_CHUNK_SIZE: usize = 65534;

const LENGTH_PREFIX: usize = 4;
const CHUNK_PREFIX: usize = 2;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode or decode message: {0}")]
    Codec(#[from] CodecError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid frame length {length}, expected 1..={max}")]
    FrameLength { length: i64, max: usize },
    #[error("failed to read {kind} stream while sending: {source}")]
    StreamSource {
        kind: StreamKind,
        #[source]
        source: io::Error,
    },
    #[error("stream {index} of frame {frame} is no longer available")]
    StreamUnavailable { frame: u64, index: u32 },
}

impl TransportError {
    /// Whether the failure came from the underlying channel rather than from
    /// malformed traffic.
    pub fn is_io(&self) -> bool {
        matches!(self, TransportError::Io(_))
    }

    /// Whether the failure is a read that ran past the channel's timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Io(e)
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        )
    }
}

/// A connected byte channel with the socket controls the connection layer needs.
pub trait Channel: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn shutdown(&self) -> io::Result<()>;

    /// A handle that closes this channel from another thread, including while
    /// a read on it is blocked.
    fn closer(&self) -> io::Result<Arc<dyn Closer>>;
}

/// Closes a channel without access to the channel itself.
pub trait Closer: Send + Sync {
    fn close(&self) -> io::Result<()>;
}

impl Channel for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn closer(&self) -> io::Result<Arc<dyn Closer>> {
        Ok(Arc::new(self.try_clone()?))
    }
}

impl Closer for TcpStream {
    fn close(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        (**self).shutdown()
    }

    fn closer(&self) -> io::Result<Arc<dyn Closer>> {
        (**self).closer()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub max_frame_size: usize,
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug)]
enum Slot {
    OnWire,
    Buffered(Vec<u8>),
    Gone,
}

/// Chunked streams that followed the most recently read frame.
#[derive(Debug, Default)]
struct Inbound {
    frame: u64,
    slots: Vec<Slot>,
    /// Index of the stream currently at the head of the channel.
    cursor: usize,
    /// Bytes left in the chunk being read.
    chunk_left: usize,
    /// Whether any of the head stream has been consumed.
    started: bool,
}

/// Length-prefixed frames plus the chunk sub-protocol over a byte channel.
///
/// ```text
/// frame: [i32 length][payload]
/// chunk: [u16 length][data]      a 0 length ends the stream
/// ```
pub struct FrameTransport<T: Read + Write> {
    stream: T,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
    config: TransportConfig,
    well_known: Arc<WellKnownRegistry>,
    types: Arc<dyn TypeRegistry>,
    frames: u64,
    inbound: Inbound,
}

impl<T: Read + Write> FrameTransport<T> {
    pub fn new(stream: T) -> Self {
        Self::with_registries(
            stream,
            TransportConfig::default(),
            Arc::new(WellKnownRegistry::default()),
            Arc::new(DefaultTypeRegistry::default()),
        )
    }

    pub fn with_registries(
        stream: T,
        config: TransportConfig,
        well_known: Arc<WellKnownRegistry>,
        types: Arc<dyn TypeRegistry>,
    ) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(config.buffer_size),
            chunk: vec![0; MAX_CHUNK_SIZE],
            config,
            well_known,
            types,
            frames: 0,
            inbound: Inbound::default(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn types(&self) -> &Arc<dyn TypeRegistry> {
        &self.types
    }

    pub fn write_message<M: WireObject>(&mut self, message: &M) -> Result<(), TransportError> {
        self.write_object(&message.to_value())
    }

    pub fn read_message<M: WireObject>(&mut self) -> Result<M, TransportError> {
        Ok(M::from_value(self.read_object()?)?)
    }

    /// Writes `value` as one frame, followed by the chunks of every stream it
    /// externalized.
    pub fn write_object(&mut self, value: &Value) -> Result<(), TransportError> {
        self.buffer.clear();
        self.buffer.extend_from_slice(&[0; LENGTH_PREFIX]);

        let streams = WireEncoder::new(&self.well_known).encode(value, &mut self.buffer)?;

        let length = self.buffer.len() - LENGTH_PREFIX;
        if length > self.config.max_frame_size {
            self.buffer.clear();
            return Err(TransportError::FrameLength {
                length: length as i64,
                max: self.config.max_frame_size,
            });
        }
        self.buffer[..LENGTH_PREFIX].copy_from_slice(&(length as u32).to_be_bytes());
        debug!("writing frame of {length} bytes with {} streams", streams.len());

        for stream in streams {
            self.write_chunks(stream)?;
        }

        self.stream.write_all(&self.buffer)?;
        self.stream.flush()?;
        self.buffer.clear();
        if self.buffer.capacity() > 4 * self.config.buffer_size {
            self.buffer = Vec::with_capacity(self.config.buffer_size);
        }
        Ok(())
    }

    /// Drains one captured stream into chunks; the reader is dropped (closed)
    /// once exhausted.
    fn write_chunks(&mut self, mut captured: CapturedStream) -> Result<(), TransportError> {
        let mut total = 0usize;
        loop {
            let n = read_some(&mut captured.reader, &mut self.chunk).map_err(|source| {
                TransportError::StreamSource {
                    kind: captured.kind,
                    source,
                }
            })?;
            self.write_chunk(n)?;
            total += n;
            if n == 0 {
                break;
            }
        }
        trace!("sent {} stream of {total} bytes", captured.kind);
        Ok(())
    }

    fn write_chunk(&mut self, n: usize) -> Result<(), TransportError> {
        let header = (n as u16).to_be_bytes();

        // A chunk that does not fit flushes what is buffered first.
        if self.buffer.len() + CHUNK_PREFIX + n > self.config.buffer_size {
            self.stream.write_all(&self.buffer)?;
            self.buffer.clear();
        }

        if CHUNK_PREFIX + n > self.config.buffer_size {
            self.stream.write_all(&header)?;
            self.stream.write_all(&self.chunk[..n])?;
        } else {
            self.buffer.extend_from_slice(&header);
            self.buffer.extend_from_slice(&self.chunk[..n]);
        }
        Ok(())
    }

    /// Reads the next frame. Streams of the previous frame that were never
    /// opened are skipped.
    pub fn read_object(&mut self) -> Result<Value, TransportError> {
        self.read_frame(|stream, buf| stream.read_exact(buf))
    }

    fn read_frame(
        &mut self,
        mut fill: impl FnMut(&mut T, &mut [u8]) -> io::Result<()>,
    ) -> Result<Value, TransportError> {
        self.discard_pending()?;

        let mut prefix = [0u8; LENGTH_PREFIX];
        fill(&mut self.stream, &mut prefix)?;
        let length = i32::from_be_bytes(prefix);
        if length <= 0 || length as usize > self.config.max_frame_size {
            return Err(TransportError::FrameLength {
                length: i64::from(length),
                max: self.config.max_frame_size,
            });
        }

        let mut payload = vec![0; length as usize];
        fill(&mut self.stream, &mut payload)?;
        self.frames += 1;

        let decoded =
            WireDecoder::new(&self.well_known, self.types.as_ref()).decode(&payload, self.frames)?;
        debug!(
            "read frame {} of {length} bytes with {} streams",
            self.frames,
            decoded.streams.len()
        );

        self.inbound = Inbound {
            frame: self.frames,
            slots: decoded.streams.iter().map(|_| Slot::OnWire).collect(),
            ..Inbound::default()
        };
        Ok(decoded.value)
    }

    /// Opens a streaming value for reading.
    ///
    /// Placeholders of the current frame are pulled off the channel lazily.
    /// Opening a later stream first buffers the earlier unopened ones.
    pub fn open_stream(&mut self, stream: &StreamValue) -> Result<StreamReader<'_, T>, TransportError> {
        let Some((frame, index)) = stream.remote_slot() else {
            return Ok(StreamReader::Local(stream.open()?));
        };
        let unavailable = TransportError::StreamUnavailable { frame, index };
        let i = index as usize;
        if frame != self.inbound.frame || i >= self.inbound.slots.len() {
            return Err(unavailable);
        }

        if i < self.inbound.cursor {
            return match std::mem::replace(&mut self.inbound.slots[i], Slot::Gone) {
                Slot::Buffered(bytes) => Ok(StreamReader::Buffered(Cursor::new(bytes))),
                _ => Err(unavailable),
            };
        }
        if i == self.inbound.cursor && self.inbound.started {
            return Err(unavailable);
        }

        while self.inbound.cursor < i {
            let head = self.inbound.cursor;
            if self.inbound.started {
                self.drain_head(None)?;
            } else {
                let mut bytes = Vec::new();
                self.drain_head(Some(&mut bytes))?;
                self.inbound.slots[head] = Slot::Buffered(bytes);
            }
        }

        Ok(StreamReader::Live(ChunkReader {
            transport: self,
            index: i,
        }))
    }

    /// Replaces every placeholder of the current frame inside `value` with
    /// its bytes, so the value no longer depends on this transport.
    pub fn materialize(&mut self, mut value: Value) -> Result<Value, TransportError> {
        let frame = self.inbound.frame;
        let mut contents: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.inbound.slots.len());
        for i in 0..self.inbound.slots.len() {
            if i < self.inbound.cursor {
                contents.push(match std::mem::replace(&mut self.inbound.slots[i], Slot::Gone) {
                    Slot::Buffered(bytes) => Some(bytes),
                    _ => None,
                });
            } else if self.inbound.started {
                self.drain_head(None)?;
                contents.push(None);
            } else {
                let mut bytes = Vec::new();
                self.drain_head(Some(&mut bytes))?;
                contents.push(Some(bytes));
            }
        }

        value.for_each_stream_mut(&mut |stream: &mut StreamValue| {
            let Some((f, index)) = stream.remote_slot() else {
                return Ok(());
            };
            let bytes = contents
                .get_mut(index as usize)
                .and_then(Option::take)
                .filter(|_| f == frame)
                .ok_or(TransportError::StreamUnavailable { frame: f, index })?;
            stream.resolve(Arc::new(InMemorySource::new(bytes)));
            Ok::<(), TransportError>(())
        })?;
        Ok(value)
    }

    /// Skips any streams of the current frame that are still on the channel.
    fn discard_pending(&mut self) -> Result<(), TransportError> {
        let pending = self.inbound.slots.len() - self.inbound.cursor;
        if pending > 0 {
            debug!("discarding {pending} unread streams of frame {}", self.inbound.frame);
        }
        while self.inbound.cursor < self.inbound.slots.len() {
            self.drain_head(None)?;
        }
        Ok(())
    }

    /// Reads the head stream to its terminator, keeping the bytes if asked.
    fn drain_head(&mut self, mut sink: Option<&mut Vec<u8>>) -> Result<(), TransportError> {
        let head = self.inbound.cursor;
        let mut buf = [0u8; 8192];
        while self.inbound.cursor == head {
            let n = self.read_stream_data(&mut buf)?;
            if let Some(out) = sink.as_deref_mut() {
                out.extend_from_slice(&buf[..n]);
            }
        }
        Ok(())
    }

    /// Reads stream data from the head stream; returns 0 once its terminating
    /// chunk has been consumed.
    fn read_stream_data(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.inbound.cursor >= self.inbound.slots.len() {
            return Ok(0);
        }

        if self.inbound.chunk_left == 0 {
            let mut prefix = [0u8; CHUNK_PREFIX];
            self.stream.read_exact(&mut prefix)?;
            let n = u16::from_be_bytes(prefix) as usize;
            self.inbound.started = true;
            trace!("chunk of {n} bytes for stream {}", self.inbound.cursor);

            if n == 0 {
                let head = self.inbound.cursor;
                self.inbound.slots[head] = Slot::Gone;
                self.inbound.cursor += 1;
                self.inbound.started = false;
                return Ok(0);
            }
            self.inbound.chunk_left = n;
        }

        let want = buf.len().min(self.inbound.chunk_left);
        let read = self.stream.read(&mut buf[..want])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed inside a stream chunk",
            ));
        }
        self.inbound.chunk_left -= read;
        Ok(read)
    }
}

impl<T: Channel> FrameTransport<T> {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown()
    }

    pub fn closer(&self) -> io::Result<Arc<dyn Closer>> {
        self.stream.closer()
    }

    /// Reads the next frame, failing with `TimedOut` once `deadline` passes
    /// however the peer paces its bytes. Leaves the channel's read timeout
    /// set to whatever was left on the last read.
    pub fn read_object_before(&mut self, deadline: Instant) -> Result<Value, TransportError> {
        self.read_frame(|stream, buf| read_exact_before(stream, buf, deadline))
    }

    pub fn read_message_before<M: WireObject>(
        &mut self,
        deadline: Instant,
    ) -> Result<M, TransportError> {
        Ok(M::from_value(self.read_object_before(deadline)?)?)
    }
}

/// `read_exact` where every read may only block for the time left before
/// `deadline`.
fn read_exact_before<C: Channel>(
    channel: &mut C,
    mut buf: &mut [u8],
    deadline: Instant,
) -> io::Result<()> {
    while !buf.is_empty() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline passed"));
        }
        channel.set_read_timeout(Some(left))?;
        match channel.read(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_some(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Pulls one externalized stream off the transport, chunk by chunk.
pub struct ChunkReader<'a, T: Read + Write> {
    transport: &'a mut FrameTransport<T>,
    index: usize,
}

impl<T: Read + Write> Read for ChunkReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.transport.inbound.cursor != self.index {
            return Ok(0);
        }
        self.transport.read_stream_data(buf)
    }
}

pub enum StreamReader<'a, T: Read + Write> {
    Live(ChunkReader<'a, T>),
    Buffered(Cursor<Vec<u8>>),
    Local(Box<dyn Read + Send>),
}

impl<T: Read + Write> Read for StreamReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamReader::Live(reader) => reader.read(buf),
            StreamReader::Buffered(reader) => reader.read(buf),
            StreamReader::Local(reader) => reader.read(buf),
        }
    }
}
