//! Logical connections to a cluster.
//!
//! A [`ResilientConnection`] drives discovery, connect and handshake, binds to
//! one ready [`ServerInstance`] and dispatches service calls through it:
//!
//! ```text
//! Discovering -> Connecting -> Handshaking -> Ready
//!      ^                                        |
//!      +------------- instance failed ----------+
//! ```
//!
//! Every candidate that fails on the way is logged and skipped; only when all
//! of them fail does the caller see [`ConnectionError::NoValidHost`].
//!
//! [`ConnectionError::NoValidHost`]: crate::error::ConnectionError::NoValidHost
mod config;
mod future;
mod instance;
mod resilient;
mod tls;

pub use config::{
    ConnectionConfig, DEFAULT_CLIENT_VERSION, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DiscoveryStrategy,
};
pub use future::{Completer, ResultsFuture};
pub use instance::{
    ConnectProgress, Connector, InstanceFactory, ServerInstance, SocketInstanceFactory,
    SocketServerInstance, TcpConnector,
};
pub use resilient::{ConnectionBuilder, ConnectionState, ResilientConnection};
pub use tls::{TlsConnector, TlsStream, client_config, load_certs};
