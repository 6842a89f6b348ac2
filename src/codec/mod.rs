//! Compact binary object codec.
//!
//! Converts a [`Value`] graph to and from the payload of a frame. Streaming
//! values are externalized: the encoder replaces each one with a placeholder
//! and hands its bytes to the transport, which sends them as chunks after the
//! frame.
//!
//! # Payload layout
//!
//! ```text
//! [u8 version = 0x05][primary value][stream reference list]
//! ```
//!
//! Values start with a tag byte (see [`tags`]). Objects carry a class
//! descriptor that is one of:
//!
//! - `0x00` primitive; a bincode-encoded [`Primitive`] follows,
//! - `0x01` named; `[u16 length][UTF-8 name]` follows,
//! - `0xFF` back-reference; a `u16` handle to a descriptor written earlier,
//! - any other byte; a code in the shared [`WellKnownRegistry`].
//!
//! Each distinct type is described once per payload; later occurrences use
//! back-references. All integers are big-endian.
//!
//! The stream reference list is an ordinary list of placeholders in index
//! order, so the decoder can bind every placeholder in one pass.
use std::io;

use bincode::config::{BigEndian, Configuration, Fixint};
use thiserror::Error;

mod decoder;
mod encoder;
mod registry;
mod stream;
mod value;

pub use decoder::{Decoded, WireDecoder};
pub use encoder::{CapturedStream, WireEncoder};
pub use registry::*;
pub use stream::{FileSource, InMemorySource, OnceSource, StreamKind, StreamSource, StreamValue};
pub use value::{Object, Primitive, Value};

/// First byte of every payload.
pub const PROTOCOL_VERSION: u8 = 0x05;

/// Graphs nested deeper than this are rejected on both sides.
pub const MAX_DEPTH: usize = 256;

/// Value tag bytes.
pub mod tags {
    pub const NULL: u8 = 0x70;
    pub const OBJECT: u8 = 0x73;
    pub const STRING: u8 = 0x74;
    pub const BYTES: u8 = 0x75;
    pub const LIST: u8 = 0x76;
}

pub(crate) fn bincode_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid stream header: expected protocol version {expected}, found {found}")]
    Version { expected: u8, found: u8 },

    #[error("unknown class '{0}'")]
    UnknownClass(String),

    #[error("unknown well-known class code 0x{0:02x}")]
    UnknownCode(u8),

    #[error("invalid class descriptor handle {0}")]
    BadHandle(u16),

    #[error("primitive descriptor where a class was expected")]
    MisplacedPrimitive,

    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("payload truncated")]
    Truncated,

    #[error("{0} trailing bytes after payload")]
    Trailing(usize),

    #[error("corrupt stream reference list: {0}")]
    StreamReferences(String),

    #[error("name of {0} bytes does not fit a UTF length prefix")]
    NameTooLong(usize),

    #[error("value of {0} bytes does not fit a length prefix")]
    ValueTooLong(usize),

    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("failed to encode primitive: {0}")]
    PrimitiveEncode(#[from] bincode::error::EncodeError),

    #[error("failed to decode primitive: {0}")]
    PrimitiveDecode(#[from] bincode::error::DecodeError),

    #[error("failed to capture {kind} stream: {source}")]
    StreamCapture {
        kind: StreamKind,
        #[source]
        source: io::Error,
    },

    #[error("remote {0} stream cannot be re-sent; materialize it first")]
    RemoteStream(StreamKind),

    #[error("object graph nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("expected {expected}, found {found}")]
    Unexpected { expected: String, found: String },

    #[error("missing field '{field}' in {class}")]
    MissingField { class: String, field: String },

    #[error("registry error: {0}")]
    Registry(String),
}

impl CodecError {
    pub(crate) fn unexpected(expected: &str, found: &Value) -> Self {
        CodecError::Unexpected {
            expected: expected.to_string(),
            found: found.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Read},
        sync::Arc,
    };

    use super::*;

    fn round_trip(value: &Value, types: &dyn TypeRegistry) -> Decoded {
        let well_known = WellKnownRegistry::default();
        let mut payload = Vec::new();
        let streams = WireEncoder::new(&well_known)
            .encode(value, &mut payload)
            .unwrap();
        assert!(streams.is_empty(), "helper only handles inline graphs");

        WireDecoder::new(&well_known, types)
            .decode(&payload, 1)
            .unwrap()
    }

    #[test]
    fn nested_graph_round_trip() {
        let types = SimpleTypeRegistry::with(["acme.Row", "acme.Batch"]);
        let rows = (0..3)
            .map(|i| {
                Value::from(
                    Object::new("acme.Row")
                        .with("id", i)
                        .with("score", f64::from(i) / 2.0)
                        .with("label", format!("row-{i}"))
                        .with("raw", vec![i as u8; 3])
                        .with("deleted", i == 2)
                        .with("note", Value::Null),
                )
            })
            .collect::<Vec<_>>();
        let value = Value::from(
            Object::new("acme.Batch")
                .with("rows", rows)
                .with("last", 1_i64 << 40),
        );

        let decoded = round_trip(&value, &types);
        assert_eq!(decoded.value, value);
        assert!(decoded.streams.is_empty());
    }

    #[test]
    fn unknown_class_is_rejected() {
        let value = Value::from(Object::new("acme.Secret").with("x", 1));
        let well_known = WellKnownRegistry::default();
        let mut payload = Vec::new();
        WireEncoder::new(&well_known)
            .encode(&value, &mut payload)
            .unwrap();

        let err = WireDecoder::new(&well_known, &DefaultTypeRegistry::default())
            .decode(&payload, 1)
            .unwrap_err();
        assert!(matches!(err, CodecError::UnknownClass(name) if name == "acme.Secret"));
    }

    #[test]
    fn bad_version_byte() {
        let well_known = WellKnownRegistry::default();
        let payload = [0x04, tags::NULL, tags::LIST, 0, 0, 0, 0];

        let err = WireDecoder::new(&well_known, &DefaultTypeRegistry::default())
            .decode(&payload, 1)
            .unwrap_err();
        assert!(matches!(err, CodecError::Version { expected: 5, found: 4 }));
    }

    #[test]
    fn failing_stream_capture_fails_encode() {
        struct Broken;
        impl StreamSource for Broken {
            fn open(&self) -> io::Result<Box<dyn Read + Send>> {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "lob locked"))
            }
        }

        let value = Value::from(StreamValue::from_source(StreamKind::Blob, Arc::new(Broken)));
        let err = WireEncoder::new(&WellKnownRegistry::default())
            .encode(&value, &mut Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("failed to capture blob stream"));
    }
}
