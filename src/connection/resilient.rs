use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicI64, Ordering},
    },
};

use log::{debug, info, warn};

use crate::{
    codec::{DefaultTypeRegistry, TypeRegistry, Value},
    discovery::{HostCandidate, ServerDiscovery},
    error::ConnectionError,
    protocol::{Executor, ServiceRequest, ThreadPool},
};

use super::{
    config::ConnectionConfig,
    future::ResultsFuture,
    instance::{ConnectProgress, Connector, InstanceFactory, ServerInstance, SocketInstanceFactory},
};

const ASYNC_WORKERS: usize = 4;

/// Where a [`ResilientConnection`] is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovering,
    Connecting,
    Handshaking,
    Ready,
    Failed,
    Closed,
}

impl From<ConnectProgress> for ConnectionState {
    fn from(progress: ConnectProgress) -> Self {
        match progress {
            ConnectProgress::Connecting => ConnectionState::Connecting,
            ConnectProgress::Handshaking => ConnectionState::Handshaking,
            ConnectProgress::Ready => ConnectionState::Ready,
        }
    }
}

struct Bound {
    instance: Option<Arc<dyn ServerInstance>>,
    last_good: Option<HostCandidate>,
    state: ConnectionState,
}

struct Inner {
    auto_failover: bool,
    discovery: Box<dyn ServerDiscovery>,
    factory: Arc<dyn InstanceFactory>,
    executor: Arc<dyn Executor>,
    bound: Mutex<Bound>,
    /// Held for the whole of a reconnect.
    reconnect: Mutex<()>,
    /// Keys every request of this connection, including the ones the
    /// default factory's instances send on their own.
    next_key: Arc<AtomicI64>,
}

/// A logical connection to a cluster that survives the loss of a single
/// server process.
///
/// Calls run against the currently bound instance. When that instance fails
/// and failover is enabled, the connection rebinds to another candidate and
/// retries the call once. Without failover the error reaches the caller and
/// the next call reconnects.
///
/// Cloning shares the connection.
#[derive(Clone)]
pub struct ResilientConnection {
    inner: Arc<Inner>,
}

/// Assembles a [`ResilientConnection`] from a [`ConnectionConfig`] and
/// optional replacements for its parts.
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    types: Option<Arc<dyn TypeRegistry>>,
    connector: Option<Arc<dyn Connector>>,
    factory: Option<Arc<dyn InstanceFactory>>,
    discovery: Option<Box<dyn ServerDiscovery>>,
    executor: Option<Arc<dyn Executor>>,
}

impl ConnectionBuilder {
    /// Types this connection can rebuild from responses and remote errors.
    pub fn types(mut self, types: Arc<dyn TypeRegistry>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn InstanceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn discovery(mut self, discovery: Box<dyn ServerDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Runs asynchronous calls; defaults to a small worker pool.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds the connection without connecting; the first call does.
    pub fn build(self) -> ResilientConnection {
        let next_key = Arc::new(AtomicI64::new(1));
        let factory = self.factory.unwrap_or_else(|| {
            let types = self
                .types
                .unwrap_or_else(|| Arc::new(DefaultTypeRegistry::default()));
            let factory =
                SocketInstanceFactory::new(&self.config, types).with_keys(Arc::clone(&next_key));
            Arc::new(match self.connector {
                Some(connector) => factory.with_connector(connector),
                None => factory,
            })
        });

        ResilientConnection {
            inner: Arc::new(Inner {
                auto_failover: self.config.auto_failover,
                discovery: self
                    .discovery
                    .unwrap_or_else(|| self.config.build_discovery()),
                factory,
                executor: self
                    .executor
                    .unwrap_or_else(|| Arc::new(ThreadPool::new(ASYNC_WORKERS))),
                bound: Mutex::new(Bound {
                    instance: None,
                    last_good: None,
                    state: ConnectionState::Discovering,
                }),
                reconnect: Mutex::new(()),
                next_key,
            }),
        }
    }

    /// Builds the connection and binds it to the first usable candidate.
    pub fn connect(self) -> Result<ResilientConnection, ConnectionError> {
        let connection = self.build();
        connection.inner.rebind(None)?;
        Ok(connection)
    }
}

impl ResilientConnection {
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder {
            config,
            types: None,
            connector: None,
            factory: None,
            discovery: None,
            executor: None,
        }
    }

    pub fn connect(config: ConnectionConfig) -> Result<Self, ConnectionError> {
        Self::builder(config).connect()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.bound().state
    }

    /// Host of the instance currently bound, if any.
    pub fn bound_host(&self) -> Option<HostCandidate> {
        self.inner
            .bound()
            .instance
            .as_ref()
            .map(|instance| instance.host().clone())
    }

    pub fn is_failover_enabled(&self) -> bool {
        self.inner.auto_failover
    }

    /// Calls `service.method(args)` on the cluster.
    pub fn invoke(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ConnectionError> {
        self.call(ServiceRequest::new(service, method, args))
    }

    pub fn call(&self, mut request: ServiceRequest) -> Result<Value, ConnectionError> {
        if request.message_key == 0 {
            request.message_key = self.inner.next_key();
        }
        self.inner.call(request)
    }

    /// Runs the call on the connection's executor.
    pub fn invoke_async(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
    ) -> ResultsFuture<Value> {
        let mut request = ServiceRequest::new(service, method, args);
        request.message_key = self.inner.next_key();

        let (future, completer) = ResultsFuture::pending(request.message_key);
        let inner = Arc::clone(&self.inner);
        self.inner
            .executor
            .execute(Box::new(move || completer.complete(inner.call(request))));
        future
    }

    /// Asks the server to stop working on `message_key`. Best effort.
    pub fn cancel_request(&self, message_key: i64) -> Result<(), ConnectionError> {
        debug!("cancelling request {message_key}");
        self.invoke("session", "cancelRequest", vec![Value::from(message_key)])
            .map(|_| ())
    }

    /// Whether both connections are bound to the same server process.
    pub fn is_same_instance(&self, other: &ResilientConnection) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let (Some(mine), Some(theirs)) = (self.inner.live(), other.inner.live()) else {
            return false;
        };
        mine.id() == theirs.id() || mine.host() == theirs.host()
    }

    /// Shuts the bound instance down. Later calls fail with
    /// [`ConnectionError::Closed`].
    pub fn close(&self) {
        let instance = {
            let mut bound = self.inner.bound();
            bound.state = ConnectionState::Closed;
            bound.instance.take()
        };
        if let Some(instance) = instance {
            info!("closing connection to {}", instance.host());
            instance.shutdown();
        }
    }
}

impl fmt::Debug for ResilientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("state", &self.state())
            .field("host", &self.bound_host())
            .field("auto_failover", &self.inner.auto_failover)
            .finish()
    }
}

impl Inner {
    fn bound(&self) -> MutexGuard<'_, Bound> {
        self.bound.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_key(&self) -> i64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut bound = self.bound();
        if bound.state != ConnectionState::Closed {
            bound.state = state;
        }
    }

    fn live(&self) -> Option<Arc<dyn ServerInstance>> {
        self.bound()
            .instance
            .as_ref()
            .filter(|instance| instance.is_open())
            .cloned()
    }

    /// The bound instance, connecting first if there is none.
    fn current(&self) -> Result<Arc<dyn ServerInstance>, ConnectionError> {
        if self.bound().state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        match self.live() {
            Some(instance) => Ok(instance),
            None => self.rebind(None),
        }
    }

    fn call(&self, request: ServiceRequest) -> Result<Value, ConnectionError> {
        let instance = self.current()?;
        let error = match instance.call(request.clone()) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if error.is_single_instance_failure() && self.auto_failover {
            warn!(
                "{} failed on {}, failing over: {error}",
                request.target(),
                instance.host()
            );
            let replacement = self.rebind(Some(instance.id()))?;
            return replacement.call(request);
        }

        if !instance.is_open() {
            self.unbind(instance.id());
        }
        Err(error)
    }

    /// Drops a failed instance so the next call reconnects.
    fn unbind(&self, id: u64) {
        let mut bound = self.bound();
        if bound.instance.as_ref().is_some_and(|i| i.id() == id) {
            debug!("dropping failed instance {id}");
            bound.instance = None;
            if bound.state != ConnectionState::Closed {
                bound.state = ConnectionState::Failed;
            }
        }
    }

    /// Runs discovery, connect and handshake until a candidate is ready.
    ///
    /// Reconnects are serialized: a caller that arrives while another one is
    /// reconnecting waits and then uses its result. `failed` names the
    /// instance the caller saw fail; any other open instance is reused.
    fn rebind(&self, failed: Option<u64>) -> Result<Arc<dyn ServerInstance>, ConnectionError> {
        let _reconnecting = self.reconnect.lock().unwrap_or_else(|e| e.into_inner());

        let (last_good, stale) = {
            let mut bound = self.bound();
            if bound.state == ConnectionState::Closed {
                return Err(ConnectionError::Closed);
            }
            if let Some(instance) = bound.instance.as_ref() {
                if Some(instance.id()) != failed && instance.is_open() {
                    return Ok(Arc::clone(instance));
                }
            }
            bound.state = ConnectionState::Discovering;
            (bound.last_good.clone(), bound.instance.take())
        };
        if let Some(stale) = stale {
            stale.shutdown();
        }

        let candidates = self.discovery.candidates(last_good.as_ref(), None);
        debug!("trying {} candidates", candidates.len());

        let mut attempted = Vec::with_capacity(candidates.len());
        for host in candidates {
            attempted.push(host.to_string());
            let instance = match self
                .factory
                .create(&host, &mut |progress| self.set_state(progress.into()))
            {
                Ok(instance) => instance,
                Err(e) => {
                    warn!("candidate {host} failed: {e}");
                    continue;
                }
            };

            self.discovery.connect_succeeded(&host);
            // learn the topology through the new instance
            self.discovery
                .candidates(Some(&host), Some(instance.as_ref()));

            let mut bound = self.bound();
            if bound.state == ConnectionState::Closed {
                instance.shutdown();
                return Err(ConnectionError::Closed);
            }
            info!("bound to {host}");
            bound.instance = Some(Arc::clone(&instance));
            bound.last_good = Some(host);
            bound.state = ConnectionState::Ready;
            return Ok(instance);
        }

        self.set_state(ConnectionState::Failed);
        Err(ConnectionError::NoValidHost { attempted })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io,
        sync::atomic::{AtomicBool, AtomicUsize},
        thread,
        time::Duration,
    };

    use crate::{
        codec::{COMPONENT_EXCEPTION, StreamValue},
        connection::DiscoveryStrategy,
        protocol::{
            InlineExecutor, NodeServer, NodeServices, ProcessInfo, RemoteError, ServiceHandler,
        },
    };

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        /// Connects; the first instance fails this many calls.
        Ready { failing_calls: usize },
        Unreachable,
        Mismatch,
        Silent,
    }

    struct MockInstance {
        id: u64,
        host: HostCandidate,
        failing_calls: AtomicUsize,
        calls: AtomicUsize,
        open: AtomicBool,
        generic_failure: bool,
    }

    impl ServerInstance for MockInstance {
        fn host(&self) -> &HostCandidate {
            &self.host
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn call(&self, request: ServiceRequest) -> Result<Value, ConnectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.open.load(Ordering::SeqCst) {
                return Err(self.lost());
            }
            if self.generic_failure {
                return Err(ConnectionError::Config("generic".into()));
            }
            let failing = self.failing_calls.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_calls.store(failing - 1, Ordering::SeqCst);
                self.open.store(false, Ordering::SeqCst);
                return Err(self.lost());
            }
            Ok(Value::from(format!("{} from {}", request.target(), self.host)))
        }

        fn shutdown(&self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    impl MockInstance {
        fn lost(&self) -> ConnectionError {
            ConnectionError::SingleInstance {
                host: self.host.to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionReset),
            }
        }
    }

    #[derive(Default)]
    struct MockFactory {
        hosts: Mutex<HashMap<String, Behavior>>,
        generic_failure: bool,
        created: Mutex<Vec<Arc<MockInstance>>>,
        attempts: Mutex<Vec<String>>,
    }

    impl MockFactory {
        fn with(hosts: &[(&str, Behavior)]) -> Self {
            Self {
                hosts: Mutex::new(hosts.iter().map(|(h, b)| (h.to_string(), *b)).collect()),
                ..Self::default()
            }
        }

        fn set(&self, host: &str, behavior: Behavior) {
            self.hosts.lock().unwrap().insert(host.to_string(), behavior);
        }

        fn created(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    impl InstanceFactory for MockFactory {
        fn create(
            &self,
            host: &HostCandidate,
            progress: &mut dyn FnMut(ConnectProgress),
        ) -> Result<Arc<dyn ServerInstance>, ConnectionError> {
            let name = host.to_string();
            self.attempts.lock().unwrap().push(name.clone());
            progress(ConnectProgress::Connecting);

            let behavior = self
                .hosts
                .lock()
                .unwrap()
                .get(&name)
                .copied()
                .unwrap_or(Behavior::Unreachable);
            let failing_calls = match behavior {
                Behavior::Ready { failing_calls } => failing_calls,
                Behavior::Unreachable => {
                    return Err(ConnectionError::Unreachable {
                        host: name,
                        source: io::Error::from(io::ErrorKind::ConnectionRefused),
                    });
                }
                Behavior::Mismatch => {
                    return Err(ConnectionError::VersionMismatch {
                        client: "05.00".into(),
                        server: "04.00".into(),
                    });
                }
                Behavior::Silent => return Err(ConnectionError::HandshakeTimeout),
            };
            progress(ConnectProgress::Handshaking);

            let mut created = self.created.lock().unwrap();
            let first_for_host = !created.iter().any(|i| i.host == *host);
            let instance = Arc::new(MockInstance {
                id: 1000 + created.len() as u64,
                host: host.clone(),
                failing_calls: AtomicUsize::new(if first_for_host { failing_calls } else { 0 }),
                calls: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                generic_failure: self.generic_failure,
            });
            created.push(Arc::clone(&instance));
            progress(ConnectProgress::Ready);
            Ok(instance)
        }
    }

    fn connection(url: &str, failover: bool, factory: &Arc<MockFactory>) -> ConnectionBuilder {
        let config = ConnectionConfig::new(url).unwrap().with_failover(failover);
        ResilientConnection::builder(config)
            .factory(Arc::clone(factory) as Arc<dyn InstanceFactory>)
            .executor(Arc::new(InlineExecutor))
    }

    #[test]
    fn no_valid_host_lists_every_attempt() {
        let factory = Arc::new(MockFactory::with(&[]));
        let err = connection("mm://host1:1,host2:2", false, &factory)
            .connect()
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "No valid host available. Attempted connections to: [host1:1, host2:2]"
        );
    }

    #[test]
    fn failing_candidates_are_skipped() {
        let factory = Arc::new(MockFactory::with(&[
            ("a:1", Behavior::Mismatch),
            ("b:1", Behavior::Silent),
            ("c:1", Behavior::Ready { failing_calls: 0 }),
        ]));
        let connection = connection("mm://a:1,b:1,c:1", false, &factory)
            .connect()
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Ready);
        assert_eq!(connection.bound_host(), Some(HostCandidate::new("c", 1, false)));
        assert_eq!(*factory.attempts.lock().unwrap(), ["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn failover_is_invisible_to_the_caller() {
        let factory = Arc::new(MockFactory::with(&[
            ("a:1", Behavior::Ready { failing_calls: 1 }),
            ("b:1", Behavior::Ready { failing_calls: 0 }),
        ]));
        let connection = connection("mm://a:1,b:1", true, &factory).connect().unwrap();

        let value = connection.invoke("session", "ping", vec![]).unwrap();
        assert_eq!(value, Value::from("session.ping from a:1"));
        // the failed instance was replaced by a fresh one on the first candidate
        assert_eq!(factory.created(), 2);
        assert_eq!(connection.state(), ConnectionState::Ready);
    }

    #[test]
    fn failover_moves_to_next_host_when_first_is_gone() {
        let factory = Arc::new(MockFactory::with(&[
            ("a:1", Behavior::Ready { failing_calls: 1 }),
            ("b:1", Behavior::Ready { failing_calls: 0 }),
        ]));
        let connection = connection("mm://a:1,b:1", true, &factory).connect().unwrap();
        factory.set("a:1", Behavior::Unreachable);

        let value = connection.invoke("session", "ping", vec![]).unwrap();
        assert_eq!(value, Value::from("session.ping from b:1"));
        assert_eq!(connection.bound_host(), Some(HostCandidate::new("b", 1, false)));
        assert_eq!(*factory.attempts.lock().unwrap(), ["a:1", "a:1", "b:1"]);
    }

    #[test]
    fn without_failover_errors_propagate_immediately() {
        let factory = Arc::new(MockFactory::with(&[("a:1", Behavior::Ready { failing_calls: 1 })]));
        let connection = connection("mm://a:1", false, &factory).connect().unwrap();

        let err = connection.invoke("session", "ping", vec![]).unwrap_err();
        assert!(err.is_single_instance_failure());
        assert_eq!(factory.created(), 1);
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(connection.bound_host(), None);

        // the next call reconnects
        assert!(connection.invoke("session", "ping", vec![]).is_ok());
        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn generic_errors_are_not_retried() {
        let mut factory = MockFactory::with(&[("a:1", Behavior::Ready { failing_calls: 0 })]);
        factory.generic_failure = true;
        let factory = Arc::new(factory);
        let connection = connection("mm://a:1", true, &factory).connect().unwrap();

        let err = connection.invoke("session", "ping", vec![]).unwrap_err();
        assert!(matches!(err, ConnectionError::Config(_)));
        let created = factory.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_failures_share_one_reconnect() {
        let factory = Arc::new(MockFactory::with(&[(
            "a:1",
            Behavior::Ready {
                failing_calls: usize::MAX,
            },
        )]));
        let connection = connection("mm://a:1", true, &factory).connect().unwrap();

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let connection = connection.clone();
                thread::spawn(move || connection.invoke("session", "ping", vec![]))
            })
            .collect();
        for caller in callers {
            assert!(caller.join().unwrap().is_ok());
        }

        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn same_instance_identity() {
        let factory = Arc::new(MockFactory::with(&[
            ("a:1", Behavior::Ready { failing_calls: 0 }),
            ("b:1", Behavior::Ready { failing_calls: 0 }),
        ]));
        let first = connection("mm://a:1", false, &factory).connect().unwrap();
        let second = connection("mm://b:1", false, &factory).connect().unwrap();
        let third = connection("mm://a:1", false, &factory).connect().unwrap();
        let unbound = connection("mm://a:1", false, &factory).build();

        assert!(first.is_same_instance(&first));
        assert!(first.is_same_instance(&first.clone()));
        assert!(!first.is_same_instance(&second));
        assert!(!second.is_same_instance(&first));
        assert!(first.is_same_instance(&third));
        assert!(!first.is_same_instance(&unbound));
        assert!(unbound.is_same_instance(&unbound));
    }

    #[test]
    fn build_connects_lazily() {
        let factory = Arc::new(MockFactory::with(&[("a:1", Behavior::Ready { failing_calls: 0 })]));
        let connection = connection("mm://a:1", false, &factory).build();
        assert_eq!(connection.state(), ConnectionState::Discovering);
        assert_eq!(factory.created(), 0);

        connection.invoke("session", "ping", vec![]).unwrap();
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn inline_async_call_completes_before_returning() {
        let factory = Arc::new(MockFactory::with(&[("a:1", Behavior::Ready { failing_calls: 0 })]));
        let connection = connection("mm://a:1", false, &factory).connect().unwrap();

        let future = connection.invoke_async("query", "run", vec![]);
        assert!(future.is_done());

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        future.on_completion(move |outcome| {
            *slot.lock().unwrap() = outcome.as_ref().ok().cloned();
        });
        assert_eq!(*seen.lock().unwrap(), Some(Value::from("query.run from a:1")));
        assert_eq!(future.get().unwrap(), Value::from("query.run from a:1"));
    }

    #[test]
    fn pooled_async_calls_get_distinct_keys() {
        let factory = Arc::new(MockFactory::with(&[("a:1", Behavior::Ready { failing_calls: 0 })]));
        let connection = connection("mm://a:1", false, &factory)
            .executor(Arc::new(ThreadPool::new(2)))
            .connect()
            .unwrap();

        let futures: Vec<_> = (0..4)
            .map(|_| connection.invoke_async("session", "ping", vec![]))
            .collect();
        let mut keys: Vec<i64> = futures.iter().map(ResultsFuture::message_key).collect();
        keys.dedup();
        assert_eq!(keys.len(), 4);

        for future in futures {
            assert!(future.get_timeout(Duration::from_secs(5)).is_ok());
        }
    }

    #[test]
    fn closed_connection_rejects_calls() {
        let factory = Arc::new(MockFactory::with(&[("a:1", Behavior::Ready { failing_calls: 0 })]));
        let connection = connection("mm://a:1", true, &factory).connect().unwrap();

        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!factory.created.lock().unwrap()[0].is_open());
        assert!(matches!(
            connection.invoke("session", "ping", vec![]),
            Err(ConnectionError::Closed)
        ));
    }

    fn node(name: &str, version: &str, services: NodeServices) -> (HostCandidate, crate::protocol::StopHandle) {
        let server = NodeServer::bind("127.0.0.1:0", version, services).unwrap();
        let address = server.local_addr();
        let stop = server.stop_handle();
        thread::spawn(move || server.listen());
        debug!("started {name} at {address}");
        (HostCandidate::new("127.0.0.1", address.port(), false), stop)
    }

    fn config(hosts: &[&HostCandidate]) -> ConnectionConfig {
        let list: Vec<String> = hosts.iter().map(ToString::to_string).collect();
        ConnectionConfig::new(&format!("mm://{}", list.join(",")))
            .unwrap()
            .with_handshake_timeout(Duration::from_secs(5))
    }

    #[test]
    fn end_to_end_calls_over_tcp() {
        let (host, stop) = node("node-a", "05.00", NodeServices::new("node-a"));
        let connection = ResilientConnection::connect(config(&[&host])).unwrap();

        assert_eq!(connection.invoke("session", "ping", vec![]).unwrap(), Value::from("pong"));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
        let echoed = connection
            .invoke("session", "echo", vec![Value::from(StreamValue::blob(payload.clone()))])
            .unwrap();
        assert_eq!(echoed.into_stream().unwrap().read_to_end().unwrap(), payload);

        let err = connection.invoke("session", "explode", vec![]).unwrap_err();
        match err {
            ConnectionError::Remote(remote) => {
                assert_eq!(remote.class_name(), COMPONENT_EXCEPTION);
                assert!(remote.message().contains("Original type hierarchy"));
            }
            other => panic!("unexpected error {other}"),
        }

        connection.cancel_request(1).unwrap();
        connection.close();
        stop.stop();
    }

    #[test]
    fn end_to_end_version_mismatch_moves_on() {
        let (old, stop_old) = node("old", "04.00", NodeServices::new("old"));
        let (new, stop_new) = node("new", "05.00", NodeServices::new("new"));

        let connection = ResilientConnection::connect(config(&[&old, &new])).unwrap();
        assert_eq!(connection.bound_host(), Some(new.clone()));
        assert_eq!(
            connection.invoke("session", "nodeName", vec![]).unwrap(),
            Value::from("new")
        );

        connection.close();
        stop_old.stop();
        stop_new.stop();
    }

    #[test]
    fn end_to_end_admin_discovery_uses_topology_ports() {
        let (second, stop_second) = node("second", "05.00", NodeServices::new("second"));
        let services = NodeServices::new("first").with_process(ProcessInfo {
            process_name: "second".into(),
            host_name: "unroutable.internal".into(),
            port: second.port,
            tls_port: None,
            enabled: true,
            running: true,
        });
        let (first, stop_first) = node("first", "05.00", services);

        let discovery_config = config(&[&first]).with_discovery(DiscoveryStrategy::Admin);
        let discovery = discovery_config.build_discovery();
        let connection = ResilientConnection::builder(discovery_config).connect().unwrap();
        assert_eq!(connection.bound_host(), Some(first.clone()));

        // the listing names an unroutable host; only its port is used
        let live = connection.inner.live().unwrap();
        let candidates = discovery.candidates(None, Some(live.as_ref()));
        assert_eq!(candidates, vec![first.clone(), second.clone()]);

        connection.close();
        stop_first.stop();
        stop_second.stop();
    }
    /// Records the key of every request before answering it.
    struct KeyRecorder {
        services: NodeServices,
        keys: Arc<Mutex<Vec<i64>>>,
    }

    impl ServiceHandler for KeyRecorder {
        fn handle(&self, request: ServiceRequest) -> Result<Value, RemoteError> {
            self.keys.lock().unwrap().push(request.message_key);
            self.services.handle(request)
        }
    }

    #[test]
    fn end_to_end_topology_query_shares_the_key_sequence() {
        let keys = Arc::new(Mutex::new(Vec::new()));
        let recorder = KeyRecorder {
            services: NodeServices::new("node-a"),
            keys: Arc::clone(&keys),
        };
        let server = NodeServer::bind("127.0.0.1:0", "05.00", recorder).unwrap();
        let host = HostCandidate::new("127.0.0.1", server.local_addr().port(), false);
        let stop = server.stop_handle();
        thread::spawn(move || server.listen());

        let config = config(&[&host]).with_discovery(DiscoveryStrategy::Admin);
        let connection = ResilientConnection::connect(config).unwrap();
        connection.invoke("session", "ping", vec![]).unwrap();
        connection.invoke_async("session", "ping", vec![]).get().unwrap();

        // getProcesses on bind, then the two pings
        assert_eq!(*keys.lock().unwrap(), [1, 2, 3]);

        connection.close();
        stop.stop();
    }
}
