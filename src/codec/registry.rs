use std::collections::{HashMap, HashSet};

use super::{CodecError, stream::StreamKind};

/// Descriptor byte: the value is a primitive, encoded with bincode.
pub const DESC_PRIMITIVE: u8 = 0x00;
/// Descriptor byte: a named type follows as a UTF string.
pub const DESC_NAMED: u8 = 0x01;
/// Descriptor byte: back-reference to a descriptor already written.
pub const DESC_REFERENCE: u8 = 0xFF;

/// Lowest and highest codes available to well-known types.
pub const FIRST_WELL_KNOWN: u8 = 0x02;
pub const LAST_WELL_KNOWN: u8 = 0xFE;

pub const HANDSHAKE_CLASS: &str = "quarry.Handshake";
pub const SERVICE_REQUEST_CLASS: &str = "quarry.ServiceRequest";
pub const SERVICE_RESPONSE_CLASS: &str = "quarry.ServiceResponse";
pub const REMOTE_ERROR_CLASS: &str = "quarry.RemoteError";
pub const PROCESS_INFO_CLASS: &str = "quarry.ProcessInfo";

/// Root of the exception hierarchy every client understands.
pub const QUARRY_EXCEPTION: &str = "quarry.QuarryException";
pub const PROCESSING_EXCEPTION: &str = "quarry.ProcessingException";
pub const COMPONENT_EXCEPTION: &str = "quarry.ComponentException";
/// Type used when no part of a remote hierarchy can be resolved.
pub const REMOTE_EXCEPTION: &str = "quarry.RemoteException";

/// Bidirectional table of short codes for hot-path types.
///
/// Encoder and decoder must hold identical tables; a code missing on the
/// reading side is a decode error.
#[derive(Debug, Clone)]
pub struct WellKnownRegistry {
    by_code: HashMap<u8, String>,
    by_name: HashMap<String, u8>,
}

impl WellKnownRegistry {
    pub fn empty() -> Self {
        Self {
            by_code: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn register(&mut self, code: u8, name: impl Into<String>) -> Result<(), CodecError> {
        let name = name.into();
        if !(FIRST_WELL_KNOWN..=LAST_WELL_KNOWN).contains(&code) {
            return Err(CodecError::Registry(format!(
                "code 0x{code:02x} is reserved"
            )));
        }
        if let Some(existing) = self.by_code.get(&code) {
            return Err(CodecError::Registry(format!(
                "code 0x{code:02x} already maps to '{existing}'"
            )));
        }
        if self.by_name.contains_key(&name) {
            return Err(CodecError::Registry(format!(
                "'{name}' is already registered"
            )));
        }
        self.by_name.insert(name.clone(), code);
        self.by_code.insert(code, name);
        Ok(())
    }

    pub fn code_of(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, code: u8) -> Option<&str> {
        self.by_code.get(&code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

impl Default for WellKnownRegistry {
    /// Message types and stream placeholders, codes 0x02 onward.
    fn default() -> Self {
        let mut registry = Self::empty();
        let builtin = [
            HANDSHAKE_CLASS,
            SERVICE_REQUEST_CLASS,
            SERVICE_RESPONSE_CLASS,
            REMOTE_ERROR_CLASS,
            PROCESS_INFO_CLASS,
        ]
        .into_iter()
        .chain(StreamKind::ALL.into_iter().map(StreamKind::placeholder_class));

        for (code, name) in (FIRST_WELL_KNOWN..).zip(builtin) {
            registry.by_name.insert(name.to_string(), code);
            registry.by_code.insert(code, name.to_string());
        }
        registry
    }
}

/// Resolves type names read from the wire.
///
/// Passed explicitly to decoders and connections rather than held globally,
/// so two connections may accept different sets of types.
pub trait TypeRegistry: Send + Sync {
    /// Whether values of the named type can be rebuilt on this side.
    fn is_known(&self, name: &str) -> bool;
}

/// Knows the built-in message, placeholder and exception types.
#[derive(Debug, Default, Clone)]
pub struct DefaultTypeRegistry {
    well_known: WellKnownRegistry,
}

impl TypeRegistry for DefaultTypeRegistry {
    fn is_known(&self, name: &str) -> bool {
        self.well_known.code_of(name).is_some()
            || matches!(
                name,
                QUARRY_EXCEPTION | PROCESSING_EXCEPTION | COMPONENT_EXCEPTION | REMOTE_EXCEPTION
            )
    }
}

/// Application-supplied type names on top of the defaults.
#[derive(Debug, Default, Clone)]
pub struct SimpleTypeRegistry {
    names: HashSet<String>,
    fallback: DefaultTypeRegistry,
}

impl SimpleTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for name in names {
            registry.register(name);
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }
}

impl TypeRegistry for SimpleTypeRegistry {
    fn is_known(&self, name: &str) -> bool {
        self.names.contains(name) || self.fallback.is_known(name)
    }
}
