use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    codec::{CodecError, REMOTE_EXCEPTION, TypeRegistry},
    protocol::{RemoteError, TransportError},
};

/// Failures surfaced by discovery, connects and calls.
///
/// The Display text of `HandshakeTimeout`, `VersionMismatch` and `NoValidHost`
/// is stable; callers match on it.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error(
        "Handshake failed due to version mismatch -- Client Version: {client}, Server Version: {server}"
    )]
    VersionMismatch { client: String, server: String },

    #[error("No valid host available. Attempted connections to: [{}]", .attempted.join(", "))]
    NoValidHost { attempted: Vec<String> },

    #[error("lost connection to {host}: {source}")]
    SingleInstance {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {host}: {source}")]
    Unreachable {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no response within {0:?}")]
    CallTimeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(#[from] TransportError),

    #[error(transparent)]
    Remote(#[from] RemoteServiceError),

    #[error("invalid connection configuration: {0}")]
    Config(String),

    #[error("connection is closed")]
    Closed,

    #[error("request was cancelled")]
    Cancelled,
}

impl ConnectionError {
    /// The bound server process failed, but the logical connection may still
    /// be served by another one.
    pub fn is_single_instance_failure(&self) -> bool {
        matches!(self, ConnectionError::SingleInstance { .. })
    }

    /// Whether trying again later, possibly against another host, could
    /// succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectionError::SingleInstance { .. }
                | ConnectionError::Unreachable { .. }
                | ConnectionError::HandshakeTimeout
                | ConnectionError::NoValidHost { .. }
        )
    }
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        ConnectionError::Protocol(TransportError::Codec(err))
    }
}

/// An exception raised by the server, rebuilt on this side.
///
/// When the original type is not known locally the error takes the nearest
/// known ancestor's name, and the message records the full original
/// hierarchy.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteServiceError {
    class_name: String,
    original_class: String,
    message: String,
    code: Option<String>,
    hierarchy: Vec<String>,
    #[source]
    cause: Option<Box<RemoteServiceError>>,
}

impl RemoteServiceError {
    pub fn resolve(error: RemoteError, types: &dyn TypeRegistry) -> Self {
        let cause = error
            .cause
            .map(|cause| Box::new(RemoteServiceError::resolve(*cause, types)));

        if types.is_known(&error.class_name) {
            return Self {
                original_class: error.class_name.clone(),
                class_name: error.class_name,
                message: error.message,
                code: error.code,
                hierarchy: error.hierarchy,
                cause,
            };
        }

        let class_name = error
            .hierarchy
            .iter()
            .filter(|name| **name != error.class_name)
            .find(|name| types.is_known(name))
            .cloned()
            .unwrap_or_else(|| REMOTE_EXCEPTION.to_string());
        let message = format!(
            "Remote exception: {} ... Original type hierarchy [{}].",
            error.message,
            error.hierarchy.join(", ")
        );

        Self {
            class_name,
            original_class: error.class_name,
            message,
            code: error.code,
            hierarchy: error.hierarchy,
            cause,
        }
    }

    /// Name of the type this error was resolved to.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Name of the type the server raised.
    pub fn original_class(&self) -> &str {
        &self.original_class
    }

    pub fn is_resolved_to_ancestor(&self) -> bool {
        self.class_name != self.original_class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn hierarchy(&self) -> &[String] {
        &self.hierarchy
    }

    pub fn cause(&self) -> Option<&RemoteServiceError> {
        self.cause.as_deref()
    }
}
