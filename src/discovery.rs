//! Candidate hosts for a logical connection.
//!
//! A connection URL names one or more hosts:
//!
//! ```text
//! mm://host1:31000,host2:31000       plain sockets
//! mms://[::1]:31443                  TLS
//! ```
//!
//! [`StaticDiscovery`] always offers exactly those hosts. [`AdminDiscovery`]
//! also asks a live node for the cluster's process listing and offers every
//! enabled, running process, paired with the host name from the URL.
use std::{
    collections::HashSet,
    fmt,
    sync::Mutex,
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    connection::ServerInstance,
    error::ConnectionError,
    protocol::{ProcessInfo, ServiceRequest, WireObject},
};

pub const PLAIN_SCHEME: &str = "mm";
pub const TLS_SCHEME: &str = "mms";

/// Default interval between two topology queries.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// One `(name, port, tls)` tuple considered during connect or failover.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostCandidate {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl HostCandidate {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }
}

impl fmt::Display for HostCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses `scheme://host:port,host:port,...` into candidates, keeping the
/// first of any duplicates.
pub fn parse_hosts(url: &str) -> Result<Vec<HostCandidate>, ConnectionError> {
    let invalid = |reason: String| ConnectionError::Config(format!("{url}: {reason}"));

    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| invalid("missing scheme".into()))?;
    let tls = match scheme {
        PLAIN_SCHEME => false,
        TLS_SCHEME => true,
        other => return Err(invalid(format!("unknown scheme '{other}'"))),
    };

    let mut hosts = Vec::new();
    for entry in rest.split(',').map(str::trim) {
        if entry.is_empty() {
            return Err(invalid("empty host entry".into()));
        }
        let (host, port) = split_host_port(entry).ok_or_else(|| invalid(format!("'{entry}'")))?;
        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| invalid(format!("bad port in '{entry}'")))?;
        hosts.push(HostCandidate::new(host, port, tls));
    }
    Ok(dedup(hosts))
}

fn split_host_port(entry: &str) -> Option<(&str, &str)> {
    if let Some(bracketed) = entry.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']')?;
        let port = rest.strip_prefix(':')?;
        return (!host.is_empty()).then_some((host, port));
    }
    let (host, port) = entry.rsplit_once(':')?;
    (!host.is_empty() && !host.contains(':')).then_some((host, port))
}

fn dedup(hosts: impl IntoIterator<Item = HostCandidate>) -> Vec<HostCandidate> {
    let mut seen = HashSet::new();
    hosts
        .into_iter()
        .filter(|host| seen.insert((host.host.clone(), host.port)))
        .collect()
}

/// Produces the ordered, duplicate-free hosts to try when connecting.
pub trait ServerDiscovery: Send + Sync {
    /// `last_good` is the host of the most recent working instance, `live` the
    /// instance still bound to the connection, if any.
    fn candidates(
        &self,
        last_good: Option<&HostCandidate>,
        live: Option<&dyn ServerInstance>,
    ) -> Vec<HostCandidate>;

    fn connect_succeeded(&self, _host: &HostCandidate) {}
}

/// The hosts from the URL, nothing else.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    hosts: Vec<HostCandidate>,
}

impl StaticDiscovery {
    pub fn new(hosts: Vec<HostCandidate>) -> Self {
        Self { hosts: dedup(hosts) }
    }

    pub fn from_url(url: &str) -> Result<Self, ConnectionError> {
        Ok(Self::new(parse_hosts(url)?))
    }
}

impl ServerDiscovery for StaticDiscovery {
    fn candidates(
        &self,
        _last_good: Option<&HostCandidate>,
        _live: Option<&dyn ServerInstance>,
    ) -> Vec<HostCandidate> {
        self.hosts.clone()
    }
}

#[derive(Debug, Default)]
struct Topology {
    hosts: Vec<HostCandidate>,
    fetched_at: Option<Instant>,
}

/// URL hosts first, then the processes reported by `admin.getProcesses`.
///
/// Topology entries keep the host name of the URL host they were learned
/// through and take only the port from the listing, so a cluster behind
/// address translation stays reachable.
#[derive(Debug)]
pub struct AdminDiscovery {
    url_hosts: Vec<HostCandidate>,
    refresh: Duration,
    topology: Mutex<Topology>,
}

impl AdminDiscovery {
    pub fn new(url_hosts: Vec<HostCandidate>, refresh: Duration) -> Self {
        Self {
            url_hosts: dedup(url_hosts),
            refresh,
            topology: Mutex::new(Topology::default()),
        }
    }

    pub fn from_url(url: &str) -> Result<Self, ConnectionError> {
        Ok(Self::new(parse_hosts(url)?, DEFAULT_REFRESH_INTERVAL))
    }

    fn is_stale(&self, topology: &Topology) -> bool {
        topology
            .fetched_at
            .is_none_or(|at| at.elapsed() >= self.refresh)
    }

    fn query(&self, live: &dyn ServerInstance) -> Result<Vec<HostCandidate>, ConnectionError> {
        let listing = live.call(ServiceRequest::new("admin", "getProcesses", vec![]))?;
        let via = live.host();

        let mut hosts = Vec::new();
        for entry in listing.into_list()? {
            let process = ProcessInfo::from_value(entry)?;
            if !process.enabled || !process.running {
                continue;
            }
            match process.port_for(via.tls) {
                Some(port) => hosts.push(HostCandidate::new(via.host.as_str(), port, via.tls)),
                None => debug!("process {} has no port for this mode", process.process_name),
            }
        }
        Ok(hosts)
    }
}

impl ServerDiscovery for AdminDiscovery {
    fn candidates(
        &self,
        last_good: Option<&HostCandidate>,
        live: Option<&dyn ServerInstance>,
    ) -> Vec<HostCandidate> {
        let mut topology = self.topology.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(live) = live.filter(|_| self.is_stale(&topology)) {
            match self.query(live) {
                Ok(hosts) => {
                    debug!("topology via {}: {} processes", live.host(), hosts.len());
                    topology.hosts = hosts;
                    topology.fetched_at = Some(Instant::now());
                }
                Err(e) => warn!("failed to query topology from {}: {e}", live.host()),
            }
        } else if live.is_none() {
            if let Some(good) = last_good {
                // the bound instance is gone; the listing now reaches the
                // cluster through the last host that worked
                for host in topology.hosts.iter_mut() {
                    host.host.clone_from(&good.host);
                }
            }
        }

        dedup(self.url_hosts.iter().chain(topology.hosts.iter()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::codec::Value;

    use super::*;

    struct Lister {
        host: HostCandidate,
        processes: Vec<ProcessInfo>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Lister {
        fn new(host: HostCandidate, processes: Vec<ProcessInfo>) -> Self {
            Self {
                host,
                processes,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl ServerInstance for Lister {
        fn host(&self) -> &HostCandidate {
            &self.host
        }

        fn id(&self) -> u64 {
            1
        }

        fn call(&self, request: ServiceRequest) -> Result<Value, ConnectionError> {
            assert_eq!(request.target(), "admin.getProcesses");
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectionError::Closed);
            }
            Ok(Value::List(self.processes.iter().map(WireObject::to_value).collect()))
        }

        fn shutdown(&self) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    fn process(port: u16, tls_port: Option<u16>, enabled: bool, running: bool) -> ProcessInfo {
        ProcessInfo {
            process_name: format!("p{port}"),
            host_name: "10.1.1.1".into(),
            port,
            tls_port,
            enabled,
            running,
        }
    }

    #[test]
    fn parses_host_list() {
        let hosts = parse_hosts("mm://alpha:31000, beta:31001,[::1]:31002").unwrap();
        assert_eq!(
            hosts,
            vec![
                HostCandidate::new("alpha", 31000, false),
                HostCandidate::new("beta", 31001, false),
                HostCandidate::new("::1", 31002, false),
            ]
        );
        assert_eq!(hosts[2].to_string(), "[::1]:31002");
    }

    #[test]
    fn tls_scheme_marks_every_host() {
        let hosts = parse_hosts("mms://alpha:1,beta:2").unwrap();
        assert!(hosts.iter().all(|h| h.tls));
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let hosts = parse_hosts("mm://b:2,a:1,b:2").unwrap();
        let names: Vec<String> = hosts.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["b:2", "a:1"]);
    }

    #[test]
    fn rejects_malformed_urls() {
        for url in [
            "alpha:1",
            "http://alpha:1",
            "mm://",
            "mm://alpha",
            "mm://alpha:0",
            "mm://alpha:70000",
            "mm://alpha:1,,beta:2",
            "mm://::1:5",
        ] {
            assert!(
                matches!(parse_hosts(url), Err(ConnectionError::Config(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn static_discovery_is_stable() {
        let discovery = StaticDiscovery::from_url("mm://a:1,b:2").unwrap();
        let first = discovery.candidates(None, None);
        let good = first[1].clone();
        assert_eq!(discovery.candidates(Some(&good), None), first);
    }

    #[test]
    fn admin_discovery_starts_with_url_hosts() {
        let discovery = AdminDiscovery::from_url("mm://gateway:31000").unwrap();
        assert_eq!(
            discovery.candidates(None, None),
            vec![HostCandidate::new("gateway", 31000, false)]
        );
    }

    #[test]
    fn topology_ports_use_url_host_name() {
        let discovery = AdminDiscovery::from_url("mm://gateway:31000").unwrap();
        let live = Lister::new(
            HostCandidate::new("gateway", 31000, false),
            vec![
                process(31000, None, true, true),
                process(31001, None, true, true),
                process(31002, None, false, true),
                process(31003, None, true, false),
                process(31004, None, true, true),
            ],
        );

        let names: Vec<String> = discovery
            .candidates(None, Some(&live))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, ["gateway:31000", "gateway:31001", "gateway:31004"]);
    }

    #[test]
    fn tls_connections_take_tls_ports() {
        let discovery = AdminDiscovery::from_url("mms://gateway:31443").unwrap();
        let live = Lister::new(
            HostCandidate::new("gateway", 31443, true),
            vec![process(31000, Some(31444), true, true), process(31001, None, true, true)],
        );

        assert_eq!(
            discovery.candidates(None, Some(&live)),
            vec![
                HostCandidate::new("gateway", 31443, true),
                HostCandidate::new("gateway", 31444, true),
            ]
        );
    }

    #[test]
    fn topology_is_cached_until_refresh() {
        let discovery = AdminDiscovery::new(
            vec![HostCandidate::new("gateway", 1, false)],
            Duration::from_secs(3600),
        );
        let live = Lister::new(
            HostCandidate::new("gateway", 1, false),
            vec![process(2, None, true, true)],
        );

        discovery.candidates(None, Some(&live));
        let again = discovery.candidates(None, Some(&live));
        assert_eq!(live.calls.load(Ordering::SeqCst), 1);
        assert_eq!(again.len(), 2);

        let eager = AdminDiscovery::new(vec![], Duration::ZERO);
        eager.candidates(None, Some(&live));
        eager.candidates(None, Some(&live));
        assert_eq!(live.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failed_query_falls_back_to_url_hosts() {
        let discovery = AdminDiscovery::from_url("mm://gateway:1").unwrap();
        let mut live = Lister::new(HostCandidate::new("gateway", 1, false), vec![]);
        live.fail = true;

        assert_eq!(
            discovery.candidates(None, Some(&live)),
            vec![HostCandidate::new("gateway", 1, false)]
        );
    }

    #[test]
    fn known_topology_follows_last_good_host() {
        let discovery = AdminDiscovery::from_url("mm://a:1,b:1").unwrap();
        let live = Lister::new(HostCandidate::new("a", 1, false), vec![process(2, None, true, true)]);
        discovery.candidates(None, Some(&live));

        let good = HostCandidate::new("b", 1, false);
        let names: Vec<String> = discovery
            .candidates(Some(&good), None)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, ["a:1", "b:1", "b:2"]);
    }
}
