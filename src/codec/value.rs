use std::fmt;

use bincode::{Decode, Encode};

use super::{CodecError, stream::StreamValue};

/// Scalar values written through the primitive descriptor path.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq)]
pub enum Primitive {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
}

/// A node of the object graph carried by a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Primitive(Primitive),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Object(Object),
    Stream(StreamValue),
}

impl Value {
    /// Short name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Primitive(_) => "primitive",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Stream(_) => "stream",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn into_string(self) -> Result<String, CodecError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(CodecError::unexpected("string", &other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>, CodecError> {
        match self {
            Value::List(values) => Ok(values),
            other => Err(CodecError::unexpected("list", &other)),
        }
    }

    pub fn into_object(self) -> Result<Object, CodecError> {
        match self {
            Value::Object(object) => Ok(object),
            other => Err(CodecError::unexpected("object", &other)),
        }
    }

    pub fn into_stream(self) -> Result<StreamValue, CodecError> {
        match self {
            Value::Stream(stream) => Ok(stream),
            other => Err(CodecError::unexpected("stream", &other)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, CodecError> {
        match self {
            Value::Primitive(Primitive::Bool(b)) => Ok(*b),
            other => Err(CodecError::unexpected("bool", other)),
        }
    }

    pub fn as_i32(&self) -> Result<i32, CodecError> {
        match self {
            Value::Primitive(Primitive::Int(i)) => Ok(*i),
            other => Err(CodecError::unexpected("int", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64, CodecError> {
        match self {
            Value::Primitive(Primitive::Long(l)) => Ok(*l),
            Value::Primitive(Primitive::Int(i)) => Ok(i64::from(*i)),
            other => Err(CodecError::unexpected("long", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, CodecError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(CodecError::unexpected("string", other)),
        }
    }

    /// Visits every stream placeholder in graph (depth-first, declaration) order.
    pub(crate) fn for_each_stream_mut<E, F>(&mut self, f: &mut F) -> Result<(), E>
    where
        F: FnMut(&mut StreamValue) -> Result<(), E>,
    {
        match self {
            Value::Stream(stream) => f(stream),
            Value::List(values) => {
                for value in values {
                    value.for_each_stream_mut(f)?;
                }
                Ok(())
            }
            Value::Object(object) => {
                for (_, value) in object.fields.iter_mut() {
                    value.for_each_stream_mut(f)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Primitive(Primitive::Bool(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Primitive(Primitive::Int(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Primitive(Primitive::Long(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Primitive(Primitive::Double(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Object> for Value {
    fn from(value: Object) -> Self {
        Value::Object(value)
    }
}

impl From<StreamValue> for Value {
    fn from(value: StreamValue) -> Self {
        Value::Stream(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An instance of a named type: the class name plus ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    class: String,
    fields: Vec<(String, Value)>,
}

impl Object {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: Vec::new(),
        }
    }

    /// Appends a field, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Removes a field and returns it; a missing field is an error.
    pub fn take(&mut self, name: &str) -> Result<Value, CodecError> {
        let pos = self
            .fields
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| CodecError::MissingField {
                class: self.class.clone(),
                field: name.to_string(),
            })?;
        Ok(self.fields.remove(pos).1)
    }

    /// Like [`Object::take`] but yields [`Value::Null`] for absent fields.
    pub fn take_or_null(&mut self, name: &str) -> Value {
        self.take(name).unwrap_or(Value::Null)
    }

    pub(crate) fn push(&mut self, name: String, value: Value) {
        self.fields.push((name, value));
    }

    pub fn expect_class(&self, class: &str) -> Result<(), CodecError> {
        if self.class == class {
            Ok(())
        } else {
            Err(CodecError::Unexpected {
                expected: class.to_string(),
                found: self.class.clone(),
            })
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.class)?;
        for (i, (name, _)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_take_removes_field() {
        let mut obj = Object::new("acme.Row").with("id", 7).with("name", "seven");

        assert_eq!(obj.take("id").unwrap(), Value::from(7));
        assert!(obj.get("id").is_none());
        assert_eq!(obj.get("name").unwrap().as_str().unwrap(), "seven");
    }

    #[test]
    #[should_panic(expected = "MissingField")]
    fn object_take_missing_field() {
        let mut obj = Object::new("acme.Row");
        obj.take("id").unwrap();
    }

    #[test]
    fn option_into_value() {
        let none: Option<String> = None;
        assert!(Value::from(none).is_null());
        assert_eq!(Value::from(Some("x")), Value::Str("x".into()));
    }

    #[test]
    fn int_widens_to_long() {
        assert_eq!(Value::from(3).as_i64().unwrap(), 3);
        assert!(Value::from("3").as_i64().is_err());
    }

    #[test]
    fn object_display_lists_field_names() {
        let obj = Object::new("acme.Row").with("id", 1).with("name", "a");
        assert_eq!(obj.to_string(), "acme.Row{id, name}");
    }
}
