//! TLS channels on top of rustls.
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    net::{Shutdown, TcpStream},
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::Duration,
};

use log::debug;
use rustls::{
    ClientConfig, ClientConnection, RootCertStore, StreamOwned,
    pki_types::{CertificateDer, ServerName},
};

use crate::{
    discovery::HostCandidate,
    protocol::{Channel, Closer},
};

use super::instance::{Connector, connect_tcp};

/// A TLS session over a TCP socket.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

impl Channel for TlsStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.sock.shutdown(Shutdown::Both)
    }

    fn closer(&self) -> io::Result<Arc<dyn Closer>> {
        Ok(Arc::new(self.sock.try_clone()?))
    }
}

#[derive(Debug, Clone)]
enum Trust {
    WebPki,
    CaFile(PathBuf),
}

/// Connects TLS candidates through rustls and plain ones over TCP.
///
/// The client configuration is built on first use, so a missing CA file
/// surfaces as a connect failure of the candidate being tried.
#[derive(Debug)]
pub struct TlsConnector {
    trust: Trust,
    config: OnceLock<Arc<ClientConfig>>,
}

impl TlsConnector {
    /// Trusts the Mozilla root set shipped with webpki-roots.
    pub fn webpki() -> Self {
        Self {
            trust: Trust::WebPki,
            config: OnceLock::new(),
        }
    }

    /// Trusts only the certificates in a PEM file.
    pub fn with_ca_file(path: impl Into<PathBuf>) -> Self {
        Self {
            trust: Trust::CaFile(path.into()),
            config: OnceLock::new(),
        }
    }

    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            trust: Trust::WebPki,
            config: OnceLock::from(config),
        }
    }

    fn client_config(&self) -> io::Result<Arc<ClientConfig>> {
        if let Some(config) = self.config.get() {
            return Ok(Arc::clone(config));
        }

        let mut roots = RootCertStore::empty();
        match &self.trust {
            Trust::WebPki => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            Trust::CaFile(path) => {
                let mut reader = BufReader::new(File::open(path)?);
                for cert in load_certs(&mut reader)? {
                    roots.add(cert).map_err(io::Error::other)?;
                }
                debug!("trusting {} certificates from {}", roots.len(), path.display());
            }
        }
        let config = Arc::new(client_config(roots).map_err(io::Error::other)?);
        Ok(Arc::clone(self.config.get_or_init(|| config)))
    }
}

impl Connector for TlsConnector {
    fn connect(&self, host: &HostCandidate, timeout: Duration) -> io::Result<Box<dyn Channel>> {
        if !host.tls {
            return Ok(Box::new(connect_tcp(host, timeout)?));
        }

        let config = self.client_config()?;
        let name = ServerName::try_from(host.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut sock = connect_tcp(host, timeout)?;
        let mut conn = ClientConnection::new(config, name).map_err(io::Error::other)?;

        // the TLS handshake counts against the connect timeout
        let timeout = timeout.max(Duration::from_millis(1));
        sock.set_read_timeout(Some(timeout))?;
        sock.set_write_timeout(Some(timeout))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut sock)?;
        }
        sock.set_read_timeout(None)?;
        sock.set_write_timeout(None)?;

        debug!("TLS session with {host}: {:?}", conn.protocol_version());
        Ok(Box::new(StreamOwned::new(conn, sock)))
    }
}

/// A client configuration using the aws-lc-rs provider and no client
/// certificate.
pub fn client_config(roots: RootCertStore) -> Result<ClientConfig, rustls::Error> {
    Ok(
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

pub fn load_certs(reader: &mut dyn BufRead) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(reader).collect()
}
