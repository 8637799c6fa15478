//! SSH-based transports.
//!
//! Both strategies run the system `ssh` binary as a child process and
//! assume key-based authentication is already set up for the configured
//! remote user; the builder never answers interactive prompts.

use crate::config::config::BuilderConfig;
use crate::config::types::{BuilderError, Result};
use crate::transport::tls::StreamFactory;
use crate::transport::{ShutdownHandle, Transport};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Hands out local ports for forwarded tunnels.
///
/// Allocation walks a configured range and wraps at the end; ports whose
/// tunnels are still alive are skipped. Several workers may be
/// reconnecting at once, so both the cursor and the active set are shared.
pub struct PortAllocator {
    start: u32,
    end: u32,
    next: AtomicU32,
    active: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u32) -> Self {
        Self {
            start: u32::from(start),
            end,
            next: AtomicU32::new(u32::from(start)),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let span = self.end - self.start;
        let mut active = self
            .active
            .lock()
            .map_err(|_| BuilderError::Transport("port allocator poisoned".to_string()))?;
        for _ in 0..span {
            let candidate = self.next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                Some(if p + 1 >= self.end { self.start } else { p + 1 })
            });
            // The closure always returns Some, so the update cannot fail.
            let port = candidate.unwrap_or(self.start) as u16;
            if active.insert(port) {
                return Ok(port);
            }
        }
        Err(BuilderError::Transport(format!(
            "no free tunnel port in {}..{}",
            self.start, self.end
        )))
    }

    pub fn release(&self, port: u16) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&port);
        }
    }
}

fn spawn_ssh(args: &[String]) -> Result<Child> {
    log::debug!("spawning ssh {}", args.join(" "));
    Command::new("ssh")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| BuilderError::Transport(format!("cannot spawn ssh: {e}")))
}

fn kill_and_reap(child: &Mutex<Child>) {
    if let Ok(mut child) = child.lock() {
        if let Err(e) = child.kill() {
            log::debug!("ssh kill: {e}");
        }
        if let Err(e) = child.wait() {
            log::debug!("ssh reap: {e}");
        }
    }
}

/// Local-port-forwarding tunnel: `ssh -L localport:host:port` plus an
/// inner stream (TLS or plain) dialed through the forwarded port.
///
/// The subprocess is given a warm-up grace period before the inner dial;
/// ssh reports a usable forward only by starting to accept connections.
pub struct SshTunnelTransport {
    inner: Box<dyn Transport>,
    tunnel: Arc<Mutex<Child>>,
    /// Taken on teardown so the kill/release sequence runs exactly once
    /// even though both `close()` and `Drop` trigger it.
    local_port: Option<u16>,
    ports: Arc<PortAllocator>,
}

impl SshTunnelTransport {
    pub fn connect(
        config: &BuilderConfig,
        streams: &StreamFactory,
        ports: Arc<PortAllocator>,
    ) -> Result<Self> {
        let local_port = ports.allocate()?;
        match Self::connect_inner(config, streams, local_port) {
            Ok((inner, tunnel)) => Ok(Self {
                inner,
                tunnel,
                local_port: Some(local_port),
                ports,
            }),
            Err(e) => {
                ports.release(local_port);
                Err(e)
            }
        }
    }

    fn connect_inner(
        config: &BuilderConfig,
        streams: &StreamFactory,
        local_port: u16,
    ) -> Result<(Box<dyn Transport>, Arc<Mutex<Child>>)> {
        let args = vec![
            "-o".to_string(),
            "TCPKeepAlive=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-T".to_string(),
            "-N".to_string(),
            "-L".to_string(),
            format!("{local_port}:localhost:{}", config.app_port),
            format!("{}@{}", config.ssh_remote_user, config.app_host),
        ];
        let tunnel = Arc::new(Mutex::new(spawn_ssh(&args)?));
        std::thread::sleep(config.ssh_warmup());
        match streams.connect("127.0.0.1", local_port) {
            Ok(inner) => Ok((inner, tunnel)),
            Err(e) => {
                kill_and_reap(&tunnel);
                Err(e)
            }
        }
    }
}

impl Read for SshTunnelTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for SshTunnelTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for SshTunnelTransport {
    fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::for_tunnel(self.inner.shutdown_handle(), Arc::clone(&self.tunnel))
    }

    fn close(&mut self) -> Result<()> {
        let port = match self.local_port.take() {
            Some(port) => port,
            None => return Ok(()),
        };
        // Kill the tunnel first so the inner close never blocks on a
        // forward that has stopped moving bytes.
        kill_and_reap(&self.tunnel);
        let result = self.inner.close();
        self.ports.release(port);
        result
    }
}

impl Drop for SshTunnelTransport {
    fn drop(&mut self) {
        // Only if close() never ran; a stale second release here could
        // free a port that has since been handed to another tunnel.
        if let Some(port) = self.local_port.take() {
            kill_and_reap(&self.tunnel);
            self.ports.release(port);
        }
    }
}

/// Stdio-forwarding tunnel: `ssh -W localhost:port`. The child's stdin
/// and stdout are the connection; no local port and no nested TLS.
pub struct DirectSshTransport {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl DirectSshTransport {
    pub fn connect(config: &BuilderConfig) -> Result<Self> {
        let args = vec![
            "-o".to_string(),
            "TCPKeepAlive=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-T".to_string(),
            "-W".to_string(),
            format!("localhost:{}", config.app_port),
            format!("{}@{}", config.ssh_remote_user, config.app_host),
        ];
        let mut child = spawn_ssh(&args)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BuilderError::Transport("ssh child has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BuilderError::Transport("ssh child has no stdout".to_string()))?;
        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout,
        })
    }
}

impl Read for DirectSshTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Write for DirectSshTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stdin.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stdin.flush()
    }
}

impl Transport for DirectSshTransport {
    fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::for_child(Arc::clone(&self.child))
    }

    fn close(&mut self) -> Result<()> {
        kill_and_reap(&self.child);
        Ok(())
    }
}

impl Drop for DirectSshTransport {
    fn drop(&mut self) {
        kill_and_reap(&self.child);
    }
}
