//! Transport strategies for the grading-server connection.
//!
//! Every worker holds exactly one [`Transport`]: a blocking, bidirectional
//! byte stream plus an out-of-band way to tear it down. Three strategies
//! are supported, mirroring the deployment topologies the builder is used
//! in:
//!
//! - a direct socket to the server, plain or TLS ([`TcpTransport`],
//!   [`tls::TlsTransport`]);
//! - an SSH subprocess forwarding a local port, with the inner stream
//!   connecting through it ([`ssh::SshTunnelTransport`]);
//! - an SSH subprocess whose stdio is the stream itself
//!   ([`ssh::DirectSshTransport`]).
//!
//! The [`ShutdownHandle`] exists for the watchdog: a worker blocked in
//! `read_exact` cannot observe a flag, so the only way to unstick it is to
//! close the underlying socket (or kill the tunnel subprocess) from
//! another thread, which makes the blocked read fail with an IO error the
//! worker already knows how to recover from.

pub mod factory;
pub mod ssh;
pub mod tls;

use crate::config::types::Result;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::process::Child;
use std::sync::{Arc, Mutex};

/// A blocking connection to the grading server.
pub trait Transport: Read + Write + Send {
    /// Handle that can force-close this transport from another thread.
    fn shutdown_handle(&self) -> ShutdownHandle;

    /// Orderly close. Releases sockets, subprocesses, and allocated ports.
    fn close(&mut self) -> Result<()>;
}

/// Cross-thread teardown handle for a [`Transport`].
///
/// Cheap to clone. `force_close` is idempotent and never fails: the
/// transport may already be half-dead when the watchdog fires, and the
/// worker's next read reports whatever state remains.
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    stream: Option<Arc<TcpStream>>,
    tunnel: Option<Arc<Mutex<Child>>>,
}

impl ShutdownHandle {
    pub fn for_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(Arc::new(stream)),
            tunnel: None,
        }
    }

    pub fn for_tunnel(inner: ShutdownHandle, tunnel: Arc<Mutex<Child>>) -> Self {
        Self {
            stream: inner.stream,
            tunnel: Some(tunnel),
        }
    }

    pub fn for_child(child: Arc<Mutex<Child>>) -> Self {
        Self {
            stream: None,
            tunnel: Some(child),
        }
    }

    /// Tear the transport down from outside the owning thread.
    pub fn force_close(&self) {
        if let Some(stream) = &self.stream {
            if let Err(e) = stream.shutdown(std::net::Shutdown::Both) {
                log::debug!("socket shutdown during force-close: {e}");
            }
        }
        if let Some(tunnel) = &self.tunnel {
            if let Ok(mut child) = tunnel.lock() {
                if let Err(e) = child.kill() {
                    log::debug!("tunnel kill during force-close: {e}");
                }
                if let Err(e) = child.wait() {
                    log::debug!("tunnel reap during force-close: {e}");
                }
            }
        }
    }
}

/// Plain TCP connection, used when encryption is disabled (development
/// setups and streams already protected by an SSH tunnel).
pub struct TcpTransport {
    stream: TcpStream,
    handle: ShutdownHandle,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let handle = ShutdownHandle::for_stream(stream.try_clone()?);
        Ok(Self { stream, handle })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn echo_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn tcp_transport_round_trips_bytes() {
        let (listener, port) = echo_server();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        });

        let mut transport = TcpTransport::connect("127.0.0.1", port).unwrap();
        transport.write_all(b"hello").unwrap();
        let mut back = [0u8; 5];
        transport.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"hello");
        transport.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn force_close_unblocks_a_blocked_read() {
        let (listener, port) = echo_server();
        // Server accepts and then never writes, so the client read blocks.
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(sock);
        });

        let mut transport = TcpTransport::connect("127.0.0.1", port).unwrap();
        let handle = transport.shutdown_handle();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            handle.force_close();
        });

        let mut buf = [0u8; 1];
        let result = transport.read_exact(&mut buf);
        assert!(result.is_err());
        closer.join().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn force_close_is_idempotent() {
        let (listener, port) = echo_server();
        let server = thread::spawn(move || {
            let _ = listener.accept().unwrap();
        });
        let transport = TcpTransport::connect("127.0.0.1", port).unwrap();
        let handle = transport.shutdown_handle();
        handle.force_close();
        handle.force_close();
        server.join().unwrap();
    }
}
