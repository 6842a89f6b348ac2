use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, info};

use crate::{
    codec::{CodecError, TypeRegistry, Value, WellKnownRegistry},
    discovery::HostCandidate,
    error::{ConnectionError, RemoteServiceError},
    protocol::{
        Channel, Closer, FrameTransport, HandshakeNegotiator, ServiceRequest, ServiceResponse,
        TransportConfig, TransportError, WireObject,
    },
};

use super::{config::ConnectionConfig, tls::TlsConnector};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// One ready connection to one server process.
pub trait ServerInstance: Send + Sync {
    fn host(&self) -> &HostCandidate;

    /// Unique for the life of the process.
    fn id(&self) -> u64;

    /// Sends `request` and waits for its response. Streams in the result are
    /// already read into memory.
    fn call(&self, request: ServiceRequest) -> Result<Value, ConnectionError>;

    fn shutdown(&self);

    fn is_open(&self) -> bool;
}

/// Opens the raw channel to a candidate.
pub trait Connector: Send + Sync {
    fn connect(&self, host: &HostCandidate, timeout: Duration) -> io::Result<Box<dyn Channel>>;
}

/// Plain TCP. TLS candidates need a TLS-capable connector such as
/// [`TlsConnector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, host: &HostCandidate, timeout: Duration) -> io::Result<Box<dyn Channel>> {
        if host.tls {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS hosts need a TLS-capable connector",
            ));
        }
        Ok(Box::new(connect_tcp(host, timeout)?))
    }
}

/// Resolves `host` and connects to the first address that answers.
pub(crate) fn connect_tcp(host: &HostCandidate, timeout: Duration) -> io::Result<TcpStream> {
    let timeout = timeout.max(Duration::from_millis(1));
    let mut last_error = None;
    for address in (host.host.as_str(), host.port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                debug!("connect to {address} failed: {e}");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
    }))
}

/// Steps an instance goes through on its way to ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connecting,
    Handshaking,
    Ready,
}

/// Turns a candidate into a ready [`ServerInstance`].
pub trait InstanceFactory: Send + Sync {
    fn create(
        &self,
        host: &HostCandidate,
        progress: &mut dyn FnMut(ConnectProgress),
    ) -> Result<Arc<dyn ServerInstance>, ConnectionError>;
}

/// Connect, handshake, then wrap the socket in a [`SocketServerInstance`].
pub struct SocketInstanceFactory {
    connector: Arc<dyn Connector>,
    negotiator: HandshakeNegotiator,
    connect_timeout: Duration,
    call_timeout: Option<Duration>,
    transport: TransportConfig,
    well_known: Arc<WellKnownRegistry>,
    types: Arc<dyn TypeRegistry>,
    keys: Arc<AtomicI64>,
}

impl SocketInstanceFactory {
    /// Connects over TLS when the configuration is in TLS mode, trusting
    /// `tls_ca_file` if set and the webpki roots otherwise.
    pub fn new(config: &ConnectionConfig, types: Arc<dyn TypeRegistry>) -> Self {
        let connector: Arc<dyn Connector> = match (config.tls, &config.tls_ca_file) {
            (false, _) => Arc::new(TcpConnector),
            (true, Some(path)) => Arc::new(TlsConnector::with_ca_file(path)),
            (true, None) => Arc::new(TlsConnector::webpki()),
        };
        Self {
            connector,
            negotiator: HandshakeNegotiator::new(config.version.as_str(), config.handshake_timeout),
            connect_timeout: config.connect_timeout,
            call_timeout: config.call_timeout,
            transport: config.transport,
            well_known: Arc::new(WellKnownRegistry::default()),
            types,
            keys: Arc::new(AtomicI64::new(1)),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Message keys for requests that arrive without one. Share it with the
    /// code that keys the other requests on these sockets.
    pub fn with_keys(mut self, keys: Arc<AtomicI64>) -> Self {
        self.keys = keys;
        self
    }
}

impl InstanceFactory for SocketInstanceFactory {
    fn create(
        &self,
        host: &HostCandidate,
        progress: &mut dyn FnMut(ConnectProgress),
    ) -> Result<Arc<dyn ServerInstance>, ConnectionError> {
        progress(ConnectProgress::Connecting);
        let channel = self
            .connector
            .connect(host, self.connect_timeout)
            .map_err(|source| ConnectionError::Unreachable {
                host: host.to_string(),
                source,
            })?;

        let mut transport = FrameTransport::with_registries(
            channel,
            self.transport,
            Arc::clone(&self.well_known),
            Arc::clone(&self.types),
        );

        progress(ConnectProgress::Handshaking);
        if let Err(e) = self.negotiator.negotiate(&mut transport) {
            let _ = transport.shutdown();
            return Err(e);
        }

        let instance = SocketServerInstance::new(
            host.clone(),
            transport,
            self.call_timeout,
            Arc::clone(&self.keys),
        )
        .map_err(|source| ConnectionError::Unreachable {
            host: host.to_string(),
            source,
        })?;

        progress(ConnectProgress::Ready);
        info!("connected to {host}");
        Ok(Arc::new(instance))
    }
}

/// A handshaken socket. One call at a time; concurrent callers queue on
/// the transport lock.
pub struct SocketServerInstance {
    id: u64,
    host: HostCandidate,
    transport: Mutex<FrameTransport<Box<dyn Channel>>>,
    /// Closes the socket without waiting for the transport lock.
    closer: Arc<dyn Closer>,
    call_timeout: Option<Duration>,
    keys: Arc<AtomicI64>,
    open: AtomicBool,
}

/// A failed exchange, and whether the socket can still be used.
struct Failure {
    error: ConnectionError,
    broken: bool,
}

impl SocketServerInstance {
    /// Requests sent with key 0 are keyed from `keys`.
    pub fn new(
        host: HostCandidate,
        transport: FrameTransport<Box<dyn Channel>>,
        call_timeout: Option<Duration>,
        keys: Arc<AtomicI64>,
    ) -> io::Result<Self> {
        Ok(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            host,
            closer: transport.closer()?,
            transport: Mutex::new(transport),
            call_timeout,
            keys,
            open: AtomicBool::new(true),
        })
    }

    fn exchange(
        &self,
        transport: &mut FrameTransport<Box<dyn Channel>>,
        request: &ServiceRequest,
    ) -> Result<Value, Failure> {
        transport
            .set_read_timeout(self.call_timeout)
            .map_err(|e| self.broken(TransportError::Io(e)))?;

        match transport.write_message(request) {
            Ok(()) => {}
            // nothing reached the socket
            Err(e @ (TransportError::Codec(_) | TransportError::FrameLength { .. })) => {
                return Err(Failure {
                    error: e.into(),
                    broken: false,
                });
            }
            Err(e) => return Err(self.broken(e)),
        }

        let value = transport.read_object().map_err(|e| self.broken(e))?;
        let value = transport.materialize(value).map_err(|e| self.broken(e))?;
        let response = ServiceResponse::from_value(value).map_err(|e| self.broken(e.into()))?;

        if response.message_key != request.message_key {
            let mismatch = CodecError::Unexpected {
                expected: format!("response to request {}", request.message_key),
                found: format!("response to request {}", response.message_key),
            };
            return Err(self.broken(mismatch.into()));
        }

        response.outcome.map_err(|remote| Failure {
            error: RemoteServiceError::resolve(remote, transport.types().as_ref()).into(),
            broken: false,
        })
    }

    /// Classifies a transport failure that leaves the socket unusable.
    fn broken(&self, error: TransportError) -> Failure {
        let error = match error {
            TransportError::Io(e)
                if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                ConnectionError::CallTimeout(self.call_timeout.unwrap_or_default())
            }
            TransportError::Io(source) => ConnectionError::SingleInstance {
                host: self.host.to_string(),
                source,
            },
            other => ConnectionError::Protocol(other),
        };
        Failure {
            error,
            broken: true,
        }
    }
}

impl ServerInstance for SocketServerInstance {
    fn host(&self) -> &HostCandidate {
        &self.host
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn call(&self, mut request: ServiceRequest) -> Result<Value, ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::SingleInstance {
                host: self.host.to_string(),
                source: io::Error::new(io::ErrorKind::NotConnected, "instance is closed"),
            });
        }
        if request.message_key == 0 {
            request.message_key = self.keys.fetch_add(1, Ordering::Relaxed);
        }

        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        debug!("request {} to {}: {}", request.message_key, self.host, request.target());

        match self.exchange(&mut transport, &request) {
            Ok(value) => Ok(value),
            Err(Failure { error, broken }) => {
                if broken {
                    debug!("instance {} on {} failed: {error}", self.id, self.host);
                    self.open.store(false, Ordering::SeqCst);
                    let _ = transport.shutdown();
                }
                Err(error)
            }
        }
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("shutting down instance {} on {}", self.id, self.host);
            // wakes a call blocked on the socket
            let _ = self.closer.close();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
