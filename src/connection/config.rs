use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{
    discovery::{
        AdminDiscovery, DEFAULT_REFRESH_INTERVAL, HostCandidate, ServerDiscovery, StaticDiscovery,
        TLS_SCHEME, parse_hosts,
    },
    error::ConnectionError,
    protocol::TransportConfig,
};

/// Protocol version string sent in the handshake.
pub const DEFAULT_CLIENT_VERSION: &str = "05.00";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryStrategy {
    /// Only the hosts named in the URL.
    #[default]
    Url,
    /// URL hosts plus the processes reported by the cluster.
    Admin,
}

impl FromStr for DiscoveryStrategy {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "url" => Ok(DiscoveryStrategy::Url),
            "admin" => Ok(DiscoveryStrategy::Admin),
            other => Err(ConnectionError::Config(format!(
                "unknown discovery strategy '{other}'"
            ))),
        }
    }
}

/// Settings of one logical connection.
///
/// Parsed from `scheme://h1:p1,h2:p2;key=value;...`, for example
/// `mm://a:31000,b:31000;autoFailover=true;handshakeTimeout=5000`.
/// Timeouts are in milliseconds.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hosts: Vec<HostCandidate>,
    /// Set by the `mms` scheme; connects through rustls.
    pub tls: bool,
    /// PEM file of the certificates trusted in TLS mode, instead of the
    /// webpki roots.
    pub tls_ca_file: Option<PathBuf>,
    pub version: String,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// Read timeout for a call; `None` waits forever.
    pub call_timeout: Option<Duration>,
    pub auto_failover: bool,
    pub discovery: DiscoveryStrategy,
    pub refresh_interval: Duration,
    pub transport: TransportConfig,
}

impl ConnectionConfig {
    pub fn new(url: &str) -> Result<Self, ConnectionError> {
        let hosts = parse_hosts(url)?;
        Ok(Self {
            tls: url.starts_with(TLS_SCHEME) && url[TLS_SCHEME.len()..].starts_with("://"),
            hosts,
            tls_ca_file: None,
            version: DEFAULT_CLIENT_VERSION.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
            auto_failover: false,
            discovery: DiscoveryStrategy::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            transport: TransportConfig::default(),
        })
    }

    pub fn with_failover(mut self, enabled: bool) -> Self {
        self.auto_failover = enabled;
        self
    }

    pub fn with_discovery(mut self, strategy: DiscoveryStrategy) -> Self {
        self.discovery = strategy;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_tls_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_ca_file = Some(path.into());
        self
    }

    /// Builds the discovery strategy this configuration selects.
    pub fn build_discovery(&self) -> Box<dyn ServerDiscovery> {
        match self.discovery {
            DiscoveryStrategy::Url => Box::new(StaticDiscovery::new(self.hosts.clone())),
            DiscoveryStrategy::Admin => {
                Box::new(AdminDiscovery::new(self.hosts.clone(), self.refresh_interval))
            }
        }
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConnectionError> {
        match key {
            "autoFailover" => self.auto_failover = parse_bool(key, value)?,
            "discoveryStrategy" => self.discovery = value.parse()?,
            "handshakeTimeout" => self.handshake_timeout = parse_millis(key, value)?,
            "connectTimeout" => self.connect_timeout = parse_millis(key, value)?,
            "socketTimeout" => {
                let timeout = parse_millis(key, value)?;
                self.call_timeout = (!timeout.is_zero()).then_some(timeout);
            }
            "maxFrameSize" => self.transport.max_frame_size = parse_size(key, value)?,
            "outputBufferSize" => self.transport.buffer_size = parse_size(key, value)?,
            "version" => self.version = value.to_string(),
            "tlsCaFile" if value.is_empty() => return Err(invalid(key, value)),
            "tlsCaFile" => self.tls_ca_file = Some(PathBuf::from(value)),
            _ => {
                return Err(ConnectionError::Config(format!(
                    "unknown connection property '{key}'"
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for ConnectionConfig {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(';');
        let url = parts.next().unwrap_or_default().trim();
        let mut config = ConnectionConfig::new(url)?;

        for property in parts.map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = property.split_once('=').ok_or_else(|| {
                ConnectionError::Config(format!("expected key=value, found '{property}'"))
            })?;
            config.apply(key.trim(), value.trim())?;
        }
        Ok(config)
    }
}

fn invalid(key: &str, value: &str) -> ConnectionError {
    ConnectionError::Config(format!("invalid value '{value}' for {key}"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConnectionError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConnectionError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, value))
}

fn parse_size(key: &str, value: &str) -> Result<usize, ConnectionError> {
    value
        .parse::<usize>()
        .ok()
        .filter(|size| *size > 0 && *size <= i32::MAX as usize)
        .ok_or_else(|| invalid(key, value))
}
