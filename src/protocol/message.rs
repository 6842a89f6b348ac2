use crate::codec::{
    CodecError, HANDSHAKE_CLASS, Object, PROCESS_INFO_CLASS, REMOTE_ERROR_CLASS,
    SERVICE_REQUEST_CLASS, SERVICE_RESPONSE_CLASS, Value,
};

/// Authentication scheme announced in the handshake.
pub const DEFAULT_AUTH_TYPE: &str = "USERPASSWORD";

/// Typed message carried as an object in a frame.
pub trait WireObject: Sized {
    const CLASS: &'static str;

    fn to_object(&self) -> Object;

    fn from_object(object: Object) -> Result<Self, CodecError>;

    fn to_value(&self) -> Value {
        Value::Object(self.to_object())
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        let object = value.into_object()?;
        object.expect_class(Self::CLASS)?;
        Self::from_object(object)
    }
}

/// Version exchange performed right after connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: String,
    pub auth_type: String,
}

impl Handshake {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            auth_type: DEFAULT_AUTH_TYPE.to_string(),
        }
    }
}

impl WireObject for Handshake {
    const CLASS: &'static str = HANDSHAKE_CLASS;

    fn to_object(&self) -> Object {
        Object::new(Self::CLASS)
            .with("version", self.version.as_str())
            .with("authType", self.auth_type.as_str())
    }

    fn from_object(mut object: Object) -> Result<Self, CodecError> {
        Ok(Self {
            version: object.take("version")?.into_string()?,
            auth_type: object.take("authType")?.into_string()?,
        })
    }
}

/// A remote method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub message_key: i64,
    pub service: String,
    pub method: String,
    pub args: Vec<Value>,
}

impl ServiceRequest {
    /// Creates a request; the key is assigned by the instance that sends it.
    pub fn new(service: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            message_key: 0,
            service: service.into(),
            method: method.into(),
            args,
        }
    }

    pub fn target(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

impl WireObject for ServiceRequest {
    const CLASS: &'static str = SERVICE_REQUEST_CLASS;

    fn to_object(&self) -> Object {
        Object::new(Self::CLASS)
            .with("key", self.message_key)
            .with("service", self.service.as_str())
            .with("method", self.method.as_str())
            .with("args", self.args.clone())
    }

    fn from_object(mut object: Object) -> Result<Self, CodecError> {
        Ok(Self {
            message_key: object.take("key")?.as_i64()?,
            service: object.take("service")?.into_string()?,
            method: object.take("method")?.into_string()?,
            args: object.take("args")?.into_list()?,
        })
    }
}

/// Reply to a [`ServiceRequest`], matched by message key.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub message_key: i64,
    pub outcome: Result<Value, RemoteError>,
}

impl ServiceResponse {
    pub fn ok(message_key: i64, value: Value) -> Self {
        Self {
            message_key,
            outcome: Ok(value),
        }
    }

    pub fn err(message_key: i64, error: RemoteError) -> Self {
        Self {
            message_key,
            outcome: Err(error),
        }
    }
}

impl WireObject for ServiceResponse {
    const CLASS: &'static str = SERVICE_RESPONSE_CLASS;

    fn to_object(&self) -> Object {
        let object = Object::new(Self::CLASS).with("key", self.message_key);
        match &self.outcome {
            Ok(value) => object.with("result", value.clone()).with("error", Value::Null),
            Err(error) => object.with("result", Value::Null).with("error", error.to_value()),
        }
    }

    fn from_object(mut object: Object) -> Result<Self, CodecError> {
        let message_key = object.take("key")?.as_i64()?;
        let result = object.take_or_null("result");
        let outcome = match object.take_or_null("error") {
            Value::Null => Ok(result),
            error => Err(RemoteError::from_value(error)?),
        };
        Ok(Self {
            message_key,
            outcome,
        })
    }
}

/// Wire form of an error raised on the server.
///
/// `hierarchy` holds the original type name first, then its ancestors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub class_name: String,
    pub message: String,
    pub code: Option<String>,
    pub hierarchy: Vec<String>,
    pub cause: Option<Box<RemoteError>>,
}

impl RemoteError {
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        let class_name = class_name.into();
        Self {
            hierarchy: vec![class_name.clone()],
            class_name,
            message: message.into(),
            code: None,
            cause: None,
        }
    }

    /// Sets the ancestors, nearest first. The type itself stays at the head.
    pub fn with_ancestors<I, S>(mut self, ancestors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hierarchy.truncate(1);
        self.hierarchy.extend(ancestors.into_iter().map(Into::into));
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl WireObject for RemoteError {
    const CLASS: &'static str = REMOTE_ERROR_CLASS;

    fn to_object(&self) -> Object {
        Object::new(Self::CLASS)
            .with("className", self.class_name.as_str())
            .with("message", self.message.as_str())
            .with("code", self.code.clone())
            .with(
                "hierarchy",
                self.hierarchy
                    .iter()
                    .map(|name| Value::from(name.as_str()))
                    .collect::<Vec<_>>(),
            )
            .with(
                "cause",
                self.cause
                    .as_ref()
                    .map(|cause| cause.to_value())
                    .unwrap_or(Value::Null),
            )
    }

    fn from_object(mut object: Object) -> Result<Self, CodecError> {
        let class_name = object.take("className")?.into_string()?;
        let message = object.take("message")?.into_string()?;
        let code = match object.take_or_null("code") {
            Value::Null => None,
            code => Some(code.into_string()?),
        };
        let hierarchy = object
            .take("hierarchy")?
            .into_list()?
            .into_iter()
            .map(Value::into_string)
            .collect::<Result<Vec<_>, _>>()?;
        let cause = match object.take_or_null("cause") {
            Value::Null => None,
            cause => Some(Box::new(RemoteError::from_value(cause)?)),
        };
        Ok(Self {
            class_name,
            message,
            code,
            hierarchy,
            cause,
        })
    }
}

/// One entry of a node's process listing, used by admin discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub process_name: String,
    pub host_name: String,
    pub port: u16,
    pub tls_port: Option<u16>,
    pub enabled: bool,
    pub running: bool,
}

impl ProcessInfo {
    /// Port to advertise for a plain or TLS connection.
    pub fn port_for(&self, tls: bool) -> Option<u16> {
        if tls { self.tls_port } else { Some(self.port) }
    }
}

impl WireObject for ProcessInfo {
    const CLASS: &'static str = PROCESS_INFO_CLASS;

    fn to_object(&self) -> Object {
        Object::new(Self::CLASS)
            .with("processName", self.process_name.as_str())
            .with("hostName", self.host_name.as_str())
            .with("port", i32::from(self.port))
            .with("tlsPort", self.tls_port.map(i32::from))
            .with("enabled", self.enabled)
            .with("running", self.running)
    }

    fn from_object(mut object: Object) -> Result<Self, CodecError> {
        let port = |value: Value| -> Result<u16, CodecError> {
            let raw = value.as_i32()?;
            u16::try_from(raw).map_err(|_| CodecError::Unexpected {
                expected: "port".to_string(),
                found: raw.to_string(),
            })
        };

        Ok(Self {
            process_name: object.take("processName")?.into_string()?,
            host_name: object.take("hostName")?.into_string()?,
            port: port(object.take("port")?)?,
            tls_port: match object.take_or_null("tlsPort") {
                Value::Null => None,
                value => Some(port(value)?),
            },
            enabled: object.take("enabled")?.as_bool()?,
            running: object.take("running")?.as_bool()?,
        })
    }
}
