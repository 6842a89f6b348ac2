pub mod codec;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod protocol;

pub use codec::{Object, StreamKind, StreamValue, Value};
pub use connection::{ConnectionConfig, ResilientConnection};
pub use error::{ConnectionError, RemoteServiceError};
