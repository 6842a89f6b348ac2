use bincode::decode_from_slice;
use log::trace;

use super::{
    CodecError, MAX_DEPTH, PROTOCOL_VERSION, Primitive, Value, bincode_config,
    registry::{DESC_NAMED, DESC_PRIMITIVE, DESC_REFERENCE, TypeRegistry, WellKnownRegistry},
    stream::{StreamKind, StreamValue},
    tags,
    value::Object,
};

/// Result of decoding one payload.
#[derive(Debug)]
pub struct Decoded {
    pub value: Value,
    /// Kinds of the externalized streams, in chunk order.
    pub streams: Vec<StreamKind>,
}

#[derive(Debug, Clone)]
enum Descriptor {
    Primitive,
    Class(String),
}

/// Reads one payload per call to [`WireDecoder::decode`].
pub struct WireDecoder<'a> {
    well_known: &'a WellKnownRegistry,
    types: &'a dyn TypeRegistry,
    descriptors: Vec<String>,
    placeholders: Vec<StreamKind>,
    frame: u64,
}

impl<'a> WireDecoder<'a> {
    pub fn new(well_known: &'a WellKnownRegistry, types: &'a dyn TypeRegistry) -> Self {
        Self {
            well_known,
            types,
            descriptors: Vec::new(),
            placeholders: Vec::new(),
            frame: 0,
        }
    }

    /// Decodes `payload`, binding stream placeholders to `frame`.
    pub fn decode(mut self, payload: &[u8], frame: u64) -> Result<Decoded, CodecError> {
        self.frame = frame;
        let mut input = Input::new(payload);

        let version = input.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::Version {
                expected: PROTOCOL_VERSION,
                found: version,
            });
        }

        let value = self.read_value(&mut input, 0)?;
        self.read_references(&mut input)?;

        if input.remaining() > 0 {
            return Err(CodecError::Trailing(input.remaining()));
        }

        trace!(
            "decoded payload of {} bytes with {} streams",
            payload.len(),
            self.placeholders.len()
        );
        Ok(Decoded {
            value,
            streams: self.placeholders,
        })
    }

    /// Checks the trailing reference list against the placeholders already seen.
    fn read_references(&mut self, input: &mut Input<'_>) -> Result<(), CodecError> {
        let tag = input.u8()?;
        if tag != tags::LIST {
            return Err(CodecError::StreamReferences(format!(
                "expected list tag, found 0x{tag:02x}"
            )));
        }
        let count = input.u32()? as usize;
        if count != self.placeholders.len() {
            return Err(CodecError::StreamReferences(format!(
                "{count} references for {} placeholders",
                self.placeholders.len()
            )));
        }

        for i in 0..count {
            if input.u8()? != tags::OBJECT {
                return Err(CodecError::StreamReferences(format!(
                    "reference {i} is not an object"
                )));
            }
            let kind = match self.read_descriptor(input)? {
                Descriptor::Class(name) => StreamKind::from_placeholder_class(&name),
                Descriptor::Primitive => None,
            };
            let index = input.u32()? as usize;
            if kind != Some(self.placeholders[i]) || index != i {
                return Err(CodecError::StreamReferences(format!(
                    "reference {i} does not match its placeholder"
                )));
            }
        }
        Ok(())
    }

    fn read_value(&mut self, input: &mut Input<'_>, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }

        let value = match input.u8()? {
            tags::NULL => Value::Null,
            tags::STRING => {
                let len = input.u32()? as usize;
                Value::Str(String::from_utf8(input.bytes(len)?.to_vec())?)
            }
            tags::BYTES => {
                let len = input.u32()? as usize;
                Value::Bytes(input.bytes(len)?.to_vec())
            }
            tags::LIST => {
                let count = input.u32()? as usize;
                // every element takes at least one byte
                let mut values = Vec::with_capacity(count.min(input.remaining()));
                for _ in 0..count {
                    values.push(self.read_value(input, depth + 1)?);
                }
                Value::List(values)
            }
            tags::OBJECT => match self.read_descriptor(input)? {
                Descriptor::Primitive => {
                    let (p, used): (Primitive, usize) =
                        decode_from_slice(input.rest(), bincode_config())?;
                    input.skip(used)?;
                    Value::Primitive(p)
                }
                Descriptor::Class(name) => match StreamKind::from_placeholder_class(&name) {
                    Some(kind) => self.read_placeholder(input, kind)?,
                    None => self.read_object(input, name, depth)?,
                },
            },
            tag => return Err(CodecError::UnknownTag(tag)),
        };
        Ok(value)
    }

    fn read_object(
        &mut self,
        input: &mut Input<'_>,
        class: String,
        depth: usize,
    ) -> Result<Value, CodecError> {
        let count = input.u16()?;
        let mut object = Object::new(class);
        for _ in 0..count {
            let name = input.utf()?;
            let value = self.read_value(input, depth + 1)?;
            object.push(name, value);
        }
        Ok(Value::Object(object))
    }

    fn read_placeholder(&mut self, input: &mut Input<'_>, kind: StreamKind) -> Result<Value, CodecError> {
        let index = input.u32()?;
        if index as usize != self.placeholders.len() {
            return Err(CodecError::StreamReferences(format!(
                "placeholder index {index} out of order"
            )));
        }
        self.placeholders.push(kind);
        Ok(Value::Stream(StreamValue::remote(kind, self.frame, index)))
    }

    fn read_descriptor(&mut self, input: &mut Input<'_>) -> Result<Descriptor, CodecError> {
        let name = match input.u8()? {
            DESC_PRIMITIVE => return Ok(Descriptor::Primitive),
            DESC_REFERENCE => {
                let handle = input.u16()?;
                return self
                    .descriptors
                    .get(handle as usize)
                    .cloned()
                    .map(Descriptor::Class)
                    .ok_or(CodecError::BadHandle(handle));
            }
            DESC_NAMED => {
                let name = input.utf()?;
                if !self.types.is_known(&name) {
                    return Err(CodecError::UnknownClass(name));
                }
                name
            }
            code => self
                .well_known
                .name_of(code)
                .ok_or(CodecError::UnknownCode(code))?
                .to_string(),
        };

        self.descriptors.push(name.clone());
        Ok(Descriptor::Class(name))
    }
}

/// Bounds-checked cursor over a payload.
struct Input<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.bytes(n).map(|_| ())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn utf(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        Ok(String::from_utf8(self.bytes(len)?.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::{
        DefaultTypeRegistry, SimpleTypeRegistry, WireEncoder, registry::HANDSHAKE_CLASS,
    };

    use super::*;

    fn encode(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        WireEncoder::new(&WellKnownRegistry::default())
            .encode(value, &mut out)
            .unwrap();
        out
    }

    fn decode(payload: &[u8]) -> Result<Decoded, CodecError> {
        let well_known = WellKnownRegistry::default();
        let types = SimpleTypeRegistry::with(["acme.Row"]);
        WireDecoder::new(&well_known, &types).decode(payload, 9)
    }

    #[test]
    fn placeholders_bound_to_frame() {
        let value = Value::List(vec![
            Value::from(StreamValue::blob(vec![1u8])),
            Value::from(Object::new("acme.Row").with("doc", StreamValue::xml("<a/>"))),
        ]);

        let decoded = decode(&encode(&value)).unwrap();
        assert_eq!(decoded.streams, vec![StreamKind::Blob, StreamKind::Xml]);

        let list = decoded.value.into_list().unwrap();
        let first = list[0].clone().into_stream().unwrap();
        assert_eq!(first.remote_slot(), Some((9, 0)));
        let doc = list[1].clone().into_object().unwrap().take("doc").unwrap();
        assert_eq!(doc.into_stream().unwrap().remote_slot(), Some((9, 1)));
    }

    #[test]
    fn unknown_well_known_code() {
        let payload = [PROTOCOL_VERSION, tags::OBJECT, 0x80, 0, 0, tags::LIST, 0, 0, 0, 0];
        assert!(matches!(decode(&payload), Err(CodecError::UnknownCode(0x80))));
    }

    #[test]
    fn dangling_back_reference() {
        let payload = [PROTOCOL_VERSION, tags::OBJECT, DESC_REFERENCE, 0, 3];
        assert!(matches!(decode(&payload), Err(CodecError::BadHandle(3))));
    }

    #[test]
    fn unknown_value_tag() {
        let payload = [PROTOCOL_VERSION, 0x10];
        assert!(matches!(decode(&payload), Err(CodecError::UnknownTag(0x10))));
    }

    #[test]
    fn truncated_payload() {
        let payload = encode(&Value::from("hello world"));
        let err = decode(&payload[..payload.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut payload = encode(&Value::Null);
        payload.push(0);
        assert!(matches!(decode(&payload), Err(CodecError::Trailing(1))));
    }

    #[test]
    fn reference_list_must_match() {
        let mut payload = encode(&Value::from(StreamValue::blob(vec![1u8])));
        // drop the single reference and claim the list is empty
        let list_at = payload.len() - (1 + 1 + 2 + 4) - 5;
        payload.truncate(list_at);
        payload.extend_from_slice(&[tags::LIST, 0, 0, 0, 0]);

        let err = decode(&payload).unwrap_err();
        assert!(matches!(err, CodecError::StreamReferences(_)));
    }

    #[test]
    fn well_known_name_needs_no_registration() {
        let well_known = WellKnownRegistry::default();
        let payload = encode(&Value::from(Object::new(HANDSHAKE_CLASS)));

        let decoded = WireDecoder::new(&well_known, &DefaultTypeRegistry::default())
            .decode(&payload, 1)
            .unwrap();
        assert_eq!(decoded.value.into_object().unwrap().class(), HANDSHAKE_CLASS);
    }
}
