//! Per-worker watchdog for hung connections.
//!
//! A worker blocked in a control-message read cannot notice that the
//! server went away without sending a FIN (crashed host, dropped tunnel,
//! stateful firewall timing out). The server sends a keepalive well
//! within the idle timeout, so an idle wait that outlives it means the
//! connection is dead; the watchdog force-closes the transport, which
//! fails the blocked read and pushes the worker into its normal
//! reconnect path.

use crate::worker::WorkerShared;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

pub struct Watchdog {
    worker_id: Uuid,
    shared: Arc<WorkerShared>,
    timeout: Duration,
    stop_rx: Receiver<()>,
}

/// Controls a running watchdog thread.
pub struct WatchdogHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    /// Spawn the watchdog thread for one worker.
    pub fn spawn(
        worker_id: Uuid,
        shared: Arc<WorkerShared>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> std::io::Result<WatchdogHandle> {
        let (stop_tx, stop_rx) = bounded(1);
        let watchdog = Watchdog {
            worker_id,
            shared,
            timeout,
            stop_rx,
        };
        let thread = std::thread::Builder::new()
            .name(format!("watchdog-{worker_id}"))
            .spawn(move || watchdog.run(poll_interval))?;
        Ok(WatchdogHandle { stop_tx, thread })
    }

    fn run(&self, poll_interval: Duration) {
        loop {
            match self.stop_rx.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => self.check(),
            }
        }
    }

    fn check(&self) {
        // Never pull the connection out from under an in-flight
        // submission, no matter how long grading takes.
        if self.shared.is_working() {
            return;
        }
        if let Some(elapsed) = self.shared.idle_wait_elapsed() {
            if elapsed > self.timeout {
                log::warn!(
                    "worker {}: no traffic from grading server for {:?}, closing connection",
                    self.worker_id,
                    elapsed
                );
                self.shared.force_close_transport();
            }
        }
    }
}

impl WatchdogHandle {
    /// Stop the watchdog and wait for its thread to exit.
    pub fn stop(self) {
        // A send failure means the thread already exited.
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            log::error!("watchdog thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ShutdownHandle;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn hung_connection() -> (TcpStream, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(3));
            drop(sock);
        });
        (TcpStream::connect(addr).unwrap(), server)
    }

    #[test]
    fn watchdog_closes_an_overdue_idle_connection() {
        let (stream, server) = hung_connection();
        let shared = Arc::new(WorkerShared::new());
        shared.set_transport_handle(Some(ShutdownHandle::for_stream(
            stream.try_clone().unwrap(),
        )));
        shared.begin_idle_wait();

        let handle = Watchdog::spawn(
            Uuid::new_v4(),
            Arc::clone(&shared),
            Duration::from_millis(50),
            Duration::from_millis(20),
        )
        .unwrap();

        // The blocked read fails once the watchdog fires.
        let mut sock = stream;
        let mut buf = [0u8; 1];
        let started = std::time::Instant::now();
        assert!(sock.read_exact(&mut buf).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));

        handle.stop();
        server.join().unwrap();
    }

    #[test]
    fn watchdog_never_fires_while_working() {
        let (stream, server) = hung_connection();
        let shared = Arc::new(WorkerShared::new());
        shared.set_transport_handle(Some(ShutdownHandle::for_stream(
            stream.try_clone().unwrap(),
        )));
        shared.begin_idle_wait();
        shared.set_working(true);

        let handle = Watchdog::spawn(
            Uuid::new_v4(),
            Arc::clone(&shared),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(150));
        // Still alive: writing to the socket succeeds.
        assert!(std::io::Write::write_all(&mut { stream.try_clone().unwrap() }, b"x").is_ok());

        handle.stop();
        server.join().unwrap();
    }

    #[test]
    fn watchdog_ignores_a_worker_that_is_not_waiting() {
        let (stream, server) = hung_connection();
        let shared = Arc::new(WorkerShared::new());
        shared.set_transport_handle(Some(ShutdownHandle::for_stream(
            stream.try_clone().unwrap(),
        )));
        // No begin_idle_wait: the worker is between cycles.

        let handle = Watchdog::spawn(
            Uuid::new_v4(),
            Arc::clone(&shared),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(std::io::Write::write_all(&mut { stream.try_clone().unwrap() }, b"x").is_ok());

        handle.stop();
        server.join().unwrap();
    }
}
