use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};

use crate::codec::{
    COMPONENT_EXCEPTION, DefaultTypeRegistry, QUARRY_EXCEPTION, TypeRegistry, Value,
    WellKnownRegistry,
};

use super::{
    FrameTransport, ProcessInfo, RemoteError, ServiceRequest, ServiceResponse, ThreadPool,
    TransportConfig, WireObject,
    handshake::accept_handshake,
    thread::Executor,
    transport::TransportError,
};

const WORKERS: usize = 15;

/// Type raised for calls to a service method the node does not offer.
pub const UNKNOWN_SERVICE_EXCEPTION: &str = "quarry.UnknownServiceException";

/// Answers service calls on behalf of a node.
pub trait ServiceHandler: Send + Sync + 'static {
    fn handle(&self, request: ServiceRequest) -> Result<Value, RemoteError>;
}

/// The services every node offers: `session.ping`, `session.echo`,
/// `session.nodeName`, `session.cancelRequest` and `admin.getProcesses`.
#[derive(Debug, Clone)]
pub struct NodeServices {
    node_name: String,
    processes: Vec<ProcessInfo>,
}

impl NodeServices {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            processes: Vec::new(),
        }
    }

    /// Adds an entry to the topology reported by `admin.getProcesses`.
    pub fn with_process(mut self, process: ProcessInfo) -> Self {
        self.processes.push(process);
        self
    }
}

impl ServiceHandler for NodeServices {
    fn handle(&self, request: ServiceRequest) -> Result<Value, RemoteError> {
        match (request.service.as_str(), request.method.as_str()) {
            ("session", "ping") => Ok(Value::from("pong")),
            ("session", "echo") => Ok(request.args.into_iter().next().unwrap_or(Value::Null)),
            ("session", "nodeName") => Ok(Value::from(self.node_name.as_str())),
            ("session", "cancelRequest") => Ok(Value::Null),
            ("admin", "getProcesses") => Ok(Value::List(
                self.processes.iter().map(WireObject::to_value).collect(),
            )),
            _ => Err(RemoteError::new(
                UNKNOWN_SERVICE_EXCEPTION,
                format!("{} has no method {}", self.node_name, request.target()),
            )
            .with_ancestors([COMPONENT_EXCEPTION, QUARRY_EXCEPTION])),
        }
    }
}

/// Stops a listening [`NodeServer`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    address: SocketAddr,
}

impl StopHandle {
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            // wake the blocking accept
            let _ = TcpStream::connect(self.address);
        }
    }
}

/// A node endpoint: accepts connections, answers the handshake, then serves
/// [`ServiceRequest`]s until the client hangs up.
pub struct NodeServer {
    listener: TcpListener,
    address: SocketAddr,
    version: Arc<str>,
    handler: Arc<dyn ServiceHandler>,
    types: Arc<dyn TypeRegistry>,
    well_known: Arc<WellKnownRegistry>,
    config: TransportConfig,
    running: Arc<AtomicBool>,
    pool: ThreadPool,
}

impl NodeServer {
    pub fn bind(
        address: impl ToSocketAddrs,
        version: &str,
        handler: impl ServiceHandler,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        Ok(Self {
            listener,
            address,
            version: Arc::from(version),
            handler: Arc::new(handler),
            types: Arc::new(DefaultTypeRegistry::default()),
            well_known: Arc::new(WellKnownRegistry::default()),
            config: TransportConfig::default(),
            running: Arc::new(AtomicBool::new(true)),
            pool: ThreadPool::new(WORKERS),
        })
    }

    /// Replaces the handler, for handlers that need the bound address.
    pub fn with_handler(mut self, handler: impl ServiceHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Types the node accepts in requests, beyond the built-in ones.
    pub fn with_types(mut self, types: Arc<dyn TypeRegistry>) -> Self {
        self.types = types;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
            address: self.address,
        }
    }

    pub fn listen(self) -> Result<(), TransportError> {
        info!("listening at {}", self.address);

        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let session = Session {
                        version: Arc::clone(&self.version),
                        handler: Arc::clone(&self.handler),
                        types: Arc::clone(&self.types),
                        well_known: Arc::clone(&self.well_known),
                        config: self.config,
                    };
                    self.pool.execute(Box::new(move || {
                        let peer = stream.peer_addr().ok();
                        if let Err(e) = session.serve(stream) {
                            warn!("connection from {peer:?} ended with error: {e}");
                        }
                    }));
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("server at {} stopped", self.address);
        Ok(())
    }
}

struct Session {
    version: Arc<str>,
    handler: Arc<dyn ServiceHandler>,
    types: Arc<dyn TypeRegistry>,
    well_known: Arc<WellKnownRegistry>,
    config: TransportConfig,
}

impl Session {
    fn serve(self, stream: TcpStream) -> Result<(), TransportError> {
        let mut transport =
            FrameTransport::with_registries(stream, self.config, self.well_known, self.types);
        accept_handshake(&mut transport, &self.version)?;

        loop {
            let value = match transport.read_object() {
                Ok(value) => value,
                Err(TransportError::Io(e)) if is_hang_up(&e) => {
                    debug!("client hung up");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let value = transport.materialize(value)?;
            let request = ServiceRequest::from_value(value)?;
            let key = request.message_key;
            debug!("request {key}: {}", request.target());

            let response = match self.handler.handle(request) {
                Ok(result) => ServiceResponse::ok(key, result),
                Err(error) => ServiceResponse::err(key, error),
            };
            transport.write_message(&response)?;
        }
    }
}

fn is_hang_up(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}
