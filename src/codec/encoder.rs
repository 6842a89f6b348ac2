use std::{collections::HashMap, fmt, io::Read};

use bincode::encode_into_std_write;
use log::trace;

use super::{
    CodecError, MAX_DEPTH, PROTOCOL_VERSION, Primitive, Value, bincode_config,
    registry::{DESC_NAMED, DESC_PRIMITIVE, DESC_REFERENCE, WellKnownRegistry},
    stream::{StreamBody, StreamKind, StreamValue},
    tags,
};

/// A stream opened during encoding, to be sent as chunks after the frame.
pub struct CapturedStream {
    pub kind: StreamKind,
    pub reader: Box<dyn Read + Send>,
}

impl fmt::Debug for CapturedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedStream")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Writes one payload per call to [`WireEncoder::encode`].
pub struct WireEncoder<'a> {
    well_known: &'a WellKnownRegistry,
    handles: HashMap<String, u16>,
    placeholders: Vec<StreamKind>,
    captured: Vec<CapturedStream>,
}

impl<'a> WireEncoder<'a> {
    pub fn new(well_known: &'a WellKnownRegistry) -> Self {
        Self {
            well_known,
            handles: HashMap::new(),
            placeholders: Vec::new(),
            captured: Vec::new(),
        }
    }

    /// Appends the payload for `value` to `out` and returns the streams that
    /// were externalized, in placeholder index order.
    pub fn encode(
        mut self,
        value: &Value,
        out: &mut Vec<u8>,
    ) -> Result<Vec<CapturedStream>, CodecError> {
        out.push(PROTOCOL_VERSION);
        self.write_value(value, out, 0)?;

        // Reference list: the placeholders again, in index order.
        let placeholders = std::mem::take(&mut self.placeholders);
        out.push(tags::LIST);
        write_len(out, placeholders.len())?;
        for (index, kind) in placeholders.iter().enumerate() {
            self.write_placeholder(*kind, index as u32, out)?;
        }

        trace!(
            "encoded payload of {} bytes with {} streams",
            out.len(),
            self.captured.len()
        );
        Ok(self.captured)
    }

    fn write_value(&mut self, value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<(), CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }

        match value {
            Value::Null => out.push(tags::NULL),
            Value::Primitive(p) => self.write_primitive(p, out)?,
            Value::Str(s) => {
                out.push(tags::STRING);
                write_len(out, s.len())?;
                out.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                out.push(tags::BYTES);
                write_len(out, b.len())?;
                out.extend_from_slice(b);
            }
            Value::List(values) => {
                out.push(tags::LIST);
                write_len(out, values.len())?;
                for v in values {
                    self.write_value(v, out, depth + 1)?;
                }
            }
            Value::Object(object) => {
                out.push(tags::OBJECT);
                self.write_descriptor(object.class(), out)?;
                let count = u16::try_from(object.fields().len())
                    .map_err(|_| CodecError::ValueTooLong(object.fields().len()))?;
                out.extend_from_slice(&count.to_be_bytes());
                for (name, v) in object.fields() {
                    write_utf(out, name)?;
                    self.write_value(v, out, depth + 1)?;
                }
            }
            Value::Stream(stream) => self.write_stream(stream, out)?,
        }
        Ok(())
    }

    fn write_primitive(&mut self, p: &Primitive, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.push(tags::OBJECT);
        out.push(DESC_PRIMITIVE);
        encode_into_std_write(*p, out, bincode_config())?;
        Ok(())
    }

    /// Captures the underlying stream and substitutes a placeholder.
    fn write_stream(&mut self, stream: &StreamValue, out: &mut Vec<u8>) -> Result<(), CodecError> {
        let source = match &stream.body {
            StreamBody::Local(source) => source,
            StreamBody::Remote { .. } => return Err(CodecError::RemoteStream(stream.kind())),
        };
        let reader = source.open().map_err(|source| CodecError::StreamCapture {
            kind: stream.kind(),
            source,
        })?;

        let index = self.placeholders.len() as u32;
        self.placeholders.push(stream.kind());
        self.captured.push(CapturedStream {
            kind: stream.kind(),
            reader,
        });
        self.write_placeholder(stream.kind(), index, out)
    }

    fn write_placeholder(&mut self, kind: StreamKind, index: u32, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.push(tags::OBJECT);
        self.write_descriptor(kind.placeholder_class(), out)?;
        out.extend_from_slice(&index.to_be_bytes());
        Ok(())
    }

    fn write_descriptor(&mut self, class: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
        if let Some(handle) = self.handles.get(class) {
            out.push(DESC_REFERENCE);
            out.extend_from_slice(&handle.to_be_bytes());
            return Ok(());
        }

        let handle = u16::try_from(self.handles.len())
            .map_err(|_| CodecError::ValueTooLong(self.handles.len()))?;
        self.handles.insert(class.to_string(), handle);

        match self.well_known.code_of(class) {
            Some(code) => out.push(code),
            None => {
                out.push(DESC_NAMED);
                write_utf(out, class)?;
            }
        }
        Ok(())
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len).map_err(|_| CodecError::ValueTooLong(len))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn write_utf(out: &mut Vec<u8>, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::NameTooLong(s.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}
