//! Client-server communication protocol.
//!
//! Everything between a connected socket and a typed service call lives here:
//! framing, the chunk sub-protocol for externalized streams, the typed
//! messages carried in frames, the handshake, and a small node server.
//!
//! # Wire format
//!
//! ```text
//! frame  := [i32 length][payload]            length in 1..=max_frame_size
//! chunks := ([u16 n][n bytes])* [u16 0]      one run per externalized stream
//! ```
//!
//! A payload is produced by the [`codec`](crate::codec). When its object graph
//! contains streaming values, one run of chunks per stream follows the frame,
//! in placeholder order. All integers are big-endian.
//!
//! # Key Components
//!
//! - [`FrameTransport`]: frames and chunks over any [`Channel`].
//! - [`WireObject`]: conversion between typed messages and codec objects.
//! - [`HandshakeNegotiator`]: the version exchange that follows connect.
//! - [`NodeServer`]: accepts connections and dispatches to a [`ServiceHandler`].
mod handshake;
mod message;
mod server;
mod thread;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use handshake::{HandshakeNegotiator, accept_handshake};
pub use message::{
    DEFAULT_AUTH_TYPE, Handshake, ProcessInfo, RemoteError, ServiceRequest, ServiceResponse,
    WireObject,
};
pub use server::{
    NodeServer, NodeServices, ServiceHandler, StopHandle, UNKNOWN_SERVICE_EXCEPTION,
};
pub use thread::{Executor, InlineExecutor, Job, ThreadPool};
pub use transport::{
    Channel, ChunkReader, Closer, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_FRAME_SIZE, FrameTransport,
    MAX_CHUNK_SIZE, StreamReader, TransportConfig, TransportError,
};
