//! Streaming values that travel outside the object graph.
//!
//! A streaming value is never written inline. On the sending side it wraps a
//! [`StreamSource`] that the encoder opens ("captures") while walking the
//! graph; the bytes follow the frame through the chunk sub-protocol. On the
//! receiving side it is a placeholder bound to `(frame, index)` which the
//! transport resolves lazily, only when a reader is requested.
use std::{
    fmt,
    fs::File,
    io::{self, Cursor, Read},
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Streaming capabilities that are externalized instead of serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    CharacterStream,
    ByteStream,
    Clob,
    Blob,
    Xml,
}

impl StreamKind {
    pub const ALL: [StreamKind; 5] = [
        StreamKind::CharacterStream,
        StreamKind::ByteStream,
        StreamKind::Clob,
        StreamKind::Blob,
        StreamKind::Xml,
    ];

    /// Class name of the placeholder substituted into the graph.
    pub fn placeholder_class(self) -> &'static str {
        match self {
            StreamKind::CharacterStream => "quarry.stream.CharacterStream",
            StreamKind::ByteStream => "quarry.stream.ByteStream",
            StreamKind::Clob => "quarry.stream.Clob",
            StreamKind::Blob => "quarry.stream.Blob",
            StreamKind::Xml => "quarry.stream.Xml",
        }
    }

    pub fn from_placeholder_class(class: &str) -> Option<StreamKind> {
        StreamKind::ALL
            .into_iter()
            .find(|k| k.placeholder_class() == class)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::CharacterStream => "character",
            StreamKind::ByteStream => "byte",
            StreamKind::Clob => "clob",
            StreamKind::Blob => "blob",
            StreamKind::Xml => "xml",
        };
        write!(f, "{name}")
    }
}

/// Something that can hand out the raw bytes of a streaming value.
///
/// Character kinds are transferred as UTF-8.
pub trait StreamSource: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// In-memory bytes; can be opened any number of times.
#[derive(Debug, Clone)]
pub struct InMemorySource(Arc<[u8]>);

impl InMemorySource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }
}

impl StreamSource for InMemorySource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(Arc::clone(&self.0))))
    }
}

/// A file on disk, reopened for every capture.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StreamSource for FileSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// Wraps a reader that can only be consumed once.
pub struct OnceSource {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl OnceSource {
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
        }
    }
}

impl StreamSource for OnceSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        reader.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "stream has already been consumed")
        })
    }
}

#[derive(Clone)]
pub(crate) enum StreamBody {
    Local(Arc<dyn StreamSource>),
    Remote { frame: u64, index: u32 },
}

/// A streaming value inside a [`Value`](super::Value) graph.
#[derive(Clone)]
pub struct StreamValue {
    kind: StreamKind,
    pub(crate) body: StreamBody,
}

impl StreamValue {
    pub fn from_source(kind: StreamKind, source: Arc<dyn StreamSource>) -> Self {
        Self {
            kind,
            body: StreamBody::Local(source),
        }
    }

    pub fn from_reader(kind: StreamKind, reader: impl Read + Send + 'static) -> Self {
        Self::from_source(kind, Arc::new(OnceSource::new(reader)))
    }

    pub fn blob(bytes: impl Into<Vec<u8>>) -> Self {
        Self::from_source(StreamKind::Blob, Arc::new(InMemorySource::new(bytes)))
    }

    pub fn clob(text: impl Into<String>) -> Self {
        Self::from_source(
            StreamKind::Clob,
            Arc::new(InMemorySource::new(text.into().into_bytes())),
        )
    }

    pub fn xml(text: impl Into<String>) -> Self {
        Self::from_source(
            StreamKind::Xml,
            Arc::new(InMemorySource::new(text.into().into_bytes())),
        )
    }

    pub(crate) fn remote(kind: StreamKind, frame: u64, index: u32) -> Self {
        Self {
            kind,
            body: StreamBody::Remote { frame, index },
        }
    }

    /// Rebinds a received placeholder to local bytes.
    pub(crate) fn resolve(&mut self, source: Arc<dyn StreamSource>) {
        self.body = StreamBody::Local(source);
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// True while the value is still a placeholder waiting on the transport.
    pub fn is_remote(&self) -> bool {
        matches!(self.body, StreamBody::Remote { .. })
    }

    pub(crate) fn remote_slot(&self) -> Option<(u64, u32)> {
        match self.body {
            StreamBody::Remote { frame, index } => Some((frame, index)),
            StreamBody::Local(_) => None,
        }
    }

    /// Opens a local stream. Remote placeholders must be opened through the
    /// transport that received them.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.body {
            StreamBody::Local(source) => source.open(),
            StreamBody::Remote { index, .. } => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("stream {index} is still on the wire; open it through its transport"),
            )),
        }
    }

    pub fn read_to_end(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.open()?.read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn read_to_string(&self) -> io::Result<String> {
        let mut out = String::new();
        self.open()?.read_to_string(&mut out)?;
        Ok(out)
    }
}

impl PartialEq for StreamValue {
    fn eq(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (&self.body, &other.body) {
            (StreamBody::Local(a), StreamBody::Local(b)) => Arc::ptr_eq(a, b),
            (
                StreamBody::Remote { frame, index },
                StreamBody::Remote {
                    frame: other_frame,
                    index: other_index,
                },
            ) => frame == other_frame && index == other_index,
            _ => false,
        }
    }
}

impl fmt::Debug for StreamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            StreamBody::Local(_) => write!(f, "StreamValue({}, local)", self.kind),
            StreamBody::Remote { frame, index } => {
                write!(f, "StreamValue({}, frame {frame} #{index})", self.kind)
            }
        }
    }
}
