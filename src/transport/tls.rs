//! TLS transport and the stream factory shared by all strategies.
//!
//! The grading connection is mutually authenticated when client material
//! is configured: the CA certificate pins the server, and the client
//! certificate identifies this builder to the server. Protocol versions
//! are restricted to an explicit allowlist rather than whatever the
//! runtime defaults to.

use crate::config::config::TlsMaterial;
use crate::config::types::{BuilderError, Result};
use crate::transport::{ShutdownHandle, Transport};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

/// TLS protocol versions the builder is willing to speak.
static ALLOWED_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| BuilderError::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(BuilderError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BuilderError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| BuilderError::Tls(format!("{}: no private key found", path.display())))
}

/// Build the client configuration from PEM material.
///
/// Client authentication is enabled only when both the certificate and
/// the key are configured; `BuilderConfig::validate` rejects a lone half.
pub fn load_client_config(material: &TlsMaterial) -> Result<Arc<ClientConfig>> {
    let ca_path = material
        .ca_cert_path
        .as_deref()
        .ok_or_else(|| BuilderError::Tls("no CA certificate configured".to_string()))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| BuilderError::Tls(format!("{}: {e}", ca_path.display())))?;
    }

    let builder = ClientConfig::builder_with_protocol_versions(ALLOWED_VERSIONS)
        .with_root_certificates(roots);
    let config = match (&material.cert_path, &material.key_path) {
        (Some(cert_path), Some(key_path)) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)
            .map_err(|e| BuilderError::Tls(e.to_string()))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// TLS connection over a TCP socket.
pub struct TlsTransport {
    stream: StreamOwned<ClientConnection, TcpStream>,
    handle: ShutdownHandle,
}

impl TlsTransport {
    pub fn connect(
        config: Arc<ClientConfig>,
        dial_host: &str,
        port: u16,
        server_name: &str,
    ) -> Result<Self> {
        let sock = TcpStream::connect((dial_host, port))?;
        sock.set_nodelay(true)?;
        let handle = ShutdownHandle::for_stream(sock.try_clone()?);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| BuilderError::Tls(format!("invalid server name {server_name}: {e}")))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Self {
            stream: StreamOwned::new(conn, sock),
            handle,
        })
    }
}

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TlsTransport {
    fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.stream.conn.send_close_notify();
        // Flush failures here are expected when the peer is already gone.
        let _ = self.stream.flush();
        self.stream.sock.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

/// Produces the inner byte stream for a connection attempt: TLS when
/// material is configured, plain TCP otherwise.
///
/// The TLS configuration is parsed once at startup and shared by every
/// worker. `server_name` is always the configured application host, even
/// when the dial target is a forwarded local port, so certificate
/// verification still checks the real server identity through a tunnel.
#[derive(Clone)]
pub struct StreamFactory {
    tls: Option<Arc<ClientConfig>>,
    server_name: String,
}

impl StreamFactory {
    pub fn new(tls: Option<Arc<ClientConfig>>, server_name: &str) -> Self {
        Self {
            tls,
            server_name: server_name.to_string(),
        }
    }

    pub fn connect(&self, dial_host: &str, port: u16) -> Result<Box<dyn Transport>> {
        match &self.tls {
            Some(config) => Ok(Box::new(TlsTransport::connect(
                Arc::clone(config),
                dial_host,
                port,
                &self.server_name,
            )?)),
            None => Ok(Box::new(crate::transport::TcpTransport::connect(
                dial_host, port,
            )?)),
        }
    }
}
