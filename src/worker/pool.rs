//! Worker pool lifecycle: start N workers, each with its own watchdog,
//! and take them down again without losing in-flight submissions.

use crate::config::config::BuilderConfig;
use crate::config::types::Result;
use crate::tester::registry::TesterRegistry;
use crate::tester::SandboxPolicy;
use crate::transport::factory::ConnectionFactory;
use crate::worker::watchdog::{Watchdog, WatchdogHandle};
use crate::worker::{WorkerLoop, WorkerShared};
use std::sync::Arc;
use std::thread::JoinHandle;
use uuid::Uuid;

struct WorkerHandle {
    id: Uuid,
    shared: Arc<WorkerShared>,
    watchdog: WatchdogHandle,
    thread: JoinHandle<()>,
}

/// A running pool of builder workers.
pub struct Pool {
    workers: Vec<WorkerHandle>,
}

impl Pool {
    /// Start the configured number of workers.
    ///
    /// Fails fast on configuration problems (bad TLS material, thread
    /// spawn limits) before any worker has touched the network.
    pub fn start(config: BuilderConfig, testers: Arc<TesterRegistry>) -> Result<Self> {
        let policy = SandboxPolicy::process(&config);
        let factory = Arc::new(ConnectionFactory::new(config.clone())?);
        let mut workers = Vec::with_capacity(config.num_workers);
        for n in 0..config.num_workers {
            let shared = Arc::new(WorkerShared::new());
            let mut worker = WorkerLoop::new(
                Arc::clone(&shared),
                Arc::clone(&factory),
                Arc::clone(&testers),
                policy,
            );
            let id = worker.id();
            let watchdog = Watchdog::spawn(
                id,
                Arc::clone(&shared),
                config.watchdog_timeout(),
                config.watchdog_poll_interval(),
            )?;
            let thread = std::thread::Builder::new()
                .name(format!("builder-worker-{n}"))
                .spawn(move || worker.run())?;
            workers.push(WorkerHandle {
                id,
                shared,
                watchdog,
                thread,
            });
        }
        log::info!("started {} builder workers", workers.len());
        Ok(Self { workers })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Graceful shutdown: every worker finishes the submission it is
    /// grading, idle workers are unblocked immediately, and all threads
    /// are joined before this returns.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.shared.request_shutdown();
        }
        for worker in self.workers {
            worker.watchdog.stop();
            if worker.shared.is_working() {
                log::info!(
                    "worker {}: busy, waiting for in-flight submission to finish",
                    worker.id
                );
            } else {
                worker.shared.force_close_transport();
            }
            if worker.thread.join().is_err() {
                log::error!("worker {} panicked", worker.id);
            }
        }
        log::info!("all builder workers stopped");
    }
}
