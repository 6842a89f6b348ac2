use std::time::{Duration, Instant};

use log::debug;

use crate::error::ConnectionError;

use super::{
    message::Handshake,
    transport::{Channel, FrameTransport, TransportError},
};

/// Client side of the version exchange that follows every raw connect.
#[derive(Debug, Clone)]
pub struct HandshakeNegotiator {
    version: String,
    timeout: Duration,
}

impl HandshakeNegotiator {
    pub fn new(version: impl Into<String>, timeout: Duration) -> Self {
        Self {
            version: version.into(),
            timeout,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends our handshake and waits at most `timeout` for the peer's whole
    /// reply, however slowly it arrives.
    ///
    /// Leaves the channel without a read timeout on success. On failure the
    /// caller discards the channel.
    pub fn negotiate<C: Channel>(
        &self,
        transport: &mut FrameTransport<C>,
    ) -> Result<Handshake, ConnectionError> {
        let deadline = Instant::now() + self.timeout;

        transport.write_message(&Handshake::new(self.version.as_str()))?;
        let reply: Handshake = match transport.read_message_before(deadline) {
            Ok(reply) => reply,
            Err(e) if e.is_timeout() => {
                debug!("no handshake reply within {:?}", self.timeout);
                return Err(ConnectionError::HandshakeTimeout);
            }
            Err(e) => return Err(e.into()),
        };

        if reply.version != self.version {
            return Err(ConnectionError::VersionMismatch {
                client: self.version.clone(),
                server: reply.version,
            });
        }

        transport.set_read_timeout(None).map_err(TransportError::Io)?;
        debug!("handshake complete, version {}", reply.version);
        Ok(reply)
    }
}

/// Server side: reads the client's handshake and answers with our version,
/// whether or not the versions agree. The client decides.
pub fn accept_handshake<C: Channel>(
    transport: &mut FrameTransport<C>,
    version: &str,
) -> Result<Handshake, TransportError> {
    let hello: Handshake = transport.read_message()?;
    debug!("client handshake: version {} auth {}", hello.version, hello.auth_type);
    transport.write_message(&Handshake::new(version))?;
    Ok(hello)
}
