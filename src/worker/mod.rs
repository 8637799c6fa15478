//! Worker threads: each owns one connection to the grading server and
//! runs the blocking request/response loop over it.

pub mod pool;
pub mod watchdog;

use crate::config::types::{BuilderError, Result, SubmissionResult, WorkItem};
use crate::proto::{self, RecordKind};
use crate::tester::registry::TesterRegistry;
use crate::tester::SandboxPolicy;
use crate::transport::factory::ConnectionFactory;
use crate::transport::{ShutdownHandle, Transport};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// State one worker shares with its watchdog and the pool manager.
///
/// The owning thread spends most of its life blocked in a socket read, so
/// everything here is written for cross-thread access: flags for intent,
/// a timestamp for the idle wait, and a teardown handle for the transport
/// currently in use.
pub struct WorkerShared {
    shutdown_requested: AtomicBool,
    working: AtomicBool,
    /// Epoch milliseconds at which the current blocking control-read
    /// started; zero when the worker is not waiting.
    wait_started_at_ms: AtomicU64,
    transport_handle: Mutex<Option<ShutdownHandle>>,
}

impl WorkerShared {
    pub fn new() -> Self {
        Self {
            shutdown_requested: AtomicBool::new(false),
            working: AtomicBool::new(false),
            wait_started_at_ms: AtomicU64::new(0),
            transport_handle: Mutex::new(None),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn set_working(&self, working: bool) {
        self.working.store(working, Ordering::SeqCst);
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(1)
    }

    pub fn begin_idle_wait(&self) {
        self.wait_started_at_ms.store(Self::now_ms(), Ordering::SeqCst);
    }

    pub fn end_idle_wait(&self) {
        self.wait_started_at_ms.store(0, Ordering::SeqCst);
    }

    /// How long the worker has been blocked waiting for a control
    /// message, or `None` when it is not waiting.
    pub fn idle_wait_elapsed(&self) -> Option<Duration> {
        let started = self.wait_started_at_ms.load(Ordering::SeqCst);
        if started == 0 {
            return None;
        }
        Some(Duration::from_millis(Self::now_ms().saturating_sub(started)))
    }

    pub fn set_transport_handle(&self, handle: Option<ShutdownHandle>) {
        if let Ok(mut slot) = self.transport_handle.lock() {
            *slot = handle;
        }
    }

    /// Tear down the worker's transport from another thread. Used by the
    /// watchdog on a hung connection and by the pool manager on shutdown.
    pub fn force_close_transport(&self) {
        if let Ok(slot) = self.transport_handle.lock() {
            if let Some(handle) = slot.as_ref() {
                handle.force_close();
            }
        }
    }
}

impl Default for WorkerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Throttles connection-failure logging so an unreachable server produces
/// one warning per interval instead of one per backoff tick.
struct ConnectFailureLog {
    failures: u64,
    last_logged: Option<Instant>,
    interval: Duration,
}

impl ConnectFailureLog {
    fn new() -> Self {
        Self {
            failures: 0,
            last_logged: None,
            interval: Duration::from_secs(60),
        }
    }

    fn failure(&mut self, worker: Uuid, err: &BuilderError) {
        self.failures += 1;
        let due = match self.last_logged {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };
        if due {
            log::warn!(
                "worker {worker}: cannot connect to grading server ({} attempts): {err}",
                self.failures
            );
            self.last_logged = Some(Instant::now());
        }
    }

    fn success(&mut self, worker: Uuid) {
        if self.failures > 0 {
            log::info!(
                "worker {worker}: connected after {} failed attempts",
                self.failures
            );
        }
        self.failures = 0;
        self.last_logged = None;
    }
}

/// Outcome of one protocol cycle.
enum Cycle {
    Keepalive,
    Graded,
}

/// The per-thread builder loop: connect, serve cycles, reconnect on
/// transient failure, stop on shutdown or protocol mismatch.
pub struct WorkerLoop {
    id: Uuid,
    shared: Arc<WorkerShared>,
    factory: Arc<ConnectionFactory>,
    testers: Arc<TesterRegistry>,
    policy: &'static SandboxPolicy,
    transport: Option<Box<dyn Transport>>,
    connect_log: ConnectFailureLog,
}

impl WorkerLoop {
    pub fn new(
        shared: Arc<WorkerShared>,
        factory: Arc<ConnectionFactory>,
        testers: Arc<TesterRegistry>,
        policy: &'static SandboxPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            shared,
            factory,
            testers,
            policy,
            transport: None,
            connect_log: ConnectFailureLog::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run until shutdown is requested or a protocol mismatch is seen.
    pub fn run(&mut self) {
        log::info!("worker {} starting", self.id);
        while !self.shared.is_shutdown_requested() {
            match self.run_once() {
                Ok(()) => {}
                Err(e) if e.is_worker_fatal() => {
                    log::error!(
                        "worker {}: protocol mismatch with grading server, giving up: {e}",
                        self.id
                    );
                    break;
                }
                Err(e) => {
                    if !self.shared.is_shutdown_requested() {
                        log::warn!("worker {}: connection lost: {e}", self.id);
                    }
                    self.drop_transport();
                }
            }
        }
        self.drop_transport();
        log::info!("worker {} stopped", self.id);
    }

    /// One unit of progress: either a connection attempt or one protocol
    /// cycle on the live connection.
    fn run_once(&mut self) -> Result<()> {
        if self.transport.is_none() {
            match self.factory.connect() {
                Ok(transport) => {
                    self.connect_log.success(self.id);
                    self.shared
                        .set_transport_handle(Some(transport.shutdown_handle()));
                    self.transport = Some(transport);
                }
                Err(e) => {
                    self.connect_log.failure(self.id, &e);
                    self.backoff_sleep();
                }
            }
            return Ok(());
        }
        let mut transport = match self.transport.take() {
            Some(t) => t,
            None => return Ok(()),
        };
        let result = self.run_cycle(transport.as_mut());
        match result {
            Ok(Cycle::Keepalive) => {
                log::debug!("worker {}: keepalive", self.id);
                self.transport = Some(transport);
                Ok(())
            }
            Ok(Cycle::Graded) => {
                self.transport = Some(transport);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One request/response cycle on a live connection.
    fn run_cycle(&mut self, transport: &mut dyn Transport) -> Result<Cycle> {
        self.shared.begin_idle_wait();
        let control = read_control_tracked(&self.shared, transport)?;
        if control < 0 {
            return Ok(Cycle::Keepalive);
        }

        // From the moment a submission is announced until its result is
        // written, neither the watchdog nor a graceful shutdown may pull
        // the connection out from under us.
        self.shared.set_working(true);
        let result = self.grade_cycle(transport, control);
        self.shared.set_working(false);
        result?;
        Ok(Cycle::Graded)
    }

    fn grade_cycle(&mut self, transport: &mut dyn Transport, problem_id: i32) -> Result<()> {
        // Workers never cache problem data; the server re-sends everything.
        proto::write_flag(transport, false)?;
        let problem = proto::read_record(transport, RecordKind::Problem)?;
        let test_cases = proto::read_record(transport, RecordKind::TestCaseList)?;
        let program_text = proto::read_record(transport, RecordKind::ProgramText)?;
        let item = WorkItem {
            problem,
            test_cases,
            program_text,
        };
        if item.problem.problem_id != problem_id {
            log::warn!(
                "worker {}: control announced problem {problem_id} but record carries {}",
                self.id,
                item.problem.problem_id
            );
        }

        log::info!(
            "worker {}: grading submission for problem {} ({})",
            self.id,
            item.problem.problem_id,
            item.problem.problem_type
        );
        let submission_result = self.grade(&item);
        proto::write_record(transport, RecordKind::SubmissionResult, &submission_result)?;
        Ok(())
    }

    /// Grade a work item, degrading every internal failure to a
    /// builder-error result. This function itself never fails: the server
    /// must receive exactly one result per submission.
    fn grade(&self, item: &WorkItem) -> SubmissionResult {
        let problem_type = item.problem.problem_type;
        let tester = match self.testers.tester_for(problem_type) {
            Some(tester) => tester,
            None => {
                log::error!(
                    "worker {}: no tester registered for problem type {problem_type}",
                    self.id
                );
                return SubmissionResult::builder_error(&format!(
                    "no tester available for problem type {problem_type}"
                ));
            }
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| tester.execute(self.policy, item)));
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                log::error!("worker {}: tester failed: {e}", self.id);
                SubmissionResult::builder_error(&format!("tester failed: {e}"))
            }
            Err(_) => {
                log::error!(
                    "worker {}: tester panicked grading problem {}",
                    self.id,
                    item.problem.problem_id
                );
                SubmissionResult::builder_error("tester panicked")
            }
        }
    }

    fn drop_transport(&mut self) {
        self.shared.set_transport_handle(None);
        self.shared.end_idle_wait();
        self.shared.set_working(false);
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                log::debug!("worker {}: transport close: {e}", self.id);
            }
        }
    }

    /// Sleep out the reconnect backoff, in slices so a shutdown request
    /// is honored promptly.
    fn backoff_sleep(&self) {
        let total = self.factory.config().reconnect_backoff();
        let slice = Duration::from_millis(100);
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.shared.is_shutdown_requested() {
            std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

/// Read the control message, clearing the idle-wait marker on every exit
/// path so the watchdog never acts on a stale timestamp.
fn read_control_tracked(shared: &WorkerShared, transport: &mut dyn Transport) -> Result<i32> {
    let result = proto::read_control(transport);
    shared.end_idle_wait();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::BuilderConfig;
    use crate::config::types::{
        CompilationOutcome, CompilationResult, Problem, ProblemType, TestCase, TestResult,
    };
    use crate::tester::Tester;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    struct FixedTester {
        problem_type: ProblemType,
        behavior: Behavior,
    }

    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    impl Tester for FixedTester {
        fn problem_type(&self) -> ProblemType {
            self.problem_type
        }

        fn execute(&self, _policy: &SandboxPolicy, item: &WorkItem) -> Result<SubmissionResult> {
            match self.behavior {
                Behavior::Succeed => Ok(SubmissionResult::new(
                    CompilationResult::new(CompilationOutcome::Success),
                    item.test_cases
                        .iter()
                        .map(|tc| TestResult::passed(&tc.test_case_name))
                        .collect(),
                )),
                Behavior::Fail => Err(BuilderError::Tester("compiler missing".to_string())),
                Behavior::Panic => panic!("tester bug"),
            }
        }
    }

    fn test_policy() -> &'static SandboxPolicy {
        SandboxPolicy::process(&BuilderConfig::default())
    }

    fn registry_with(behavior: Behavior) -> Arc<TesterRegistry> {
        let mut registry = TesterRegistry::new();
        registry.register(Box::new(FixedTester {
            problem_type: ProblemType::CProgram,
            behavior,
        }));
        Arc::new(registry)
    }

    fn sample_item() -> WorkItem {
        WorkItem {
            problem: Problem {
                problem_id: 7,
                problem_type: ProblemType::CProgram,
                test_name: "hello".to_string(),
                brief_description: "Print hello".to_string(),
                schema_version: 1,
            },
            test_cases: vec![TestCase {
                test_case_id: 1,
                problem_id: 7,
                test_case_name: "t0".to_string(),
                input: String::new(),
                output: "hello\n".to_string(),
                secret: false,
            }],
            program_text: "int main(void) { return 0; }".to_string(),
        }
    }

    fn loop_against(port: u16, testers: Arc<TesterRegistry>) -> WorkerLoop {
        let config = BuilderConfig {
            app_host: "127.0.0.1".to_string(),
            app_port: port,
            use_tls: false,
            reconnect_backoff_ms: 10,
            ..BuilderConfig::default()
        };
        let factory = Arc::new(ConnectionFactory::new(config).unwrap());
        WorkerLoop::new(Arc::new(WorkerShared::new()), factory, testers, test_policy())
    }

    /// Drive one server-side grading cycle over `sock`.
    fn serve_one_submission(sock: &mut TcpStream, item: &WorkItem) -> SubmissionResult {
        proto::write_control(sock, item.problem.problem_id).unwrap();
        assert!(!proto::read_flag(sock).unwrap(), "cache flag must be false");
        proto::write_record(sock, RecordKind::Problem, &item.problem).unwrap();
        proto::write_record(sock, RecordKind::TestCaseList, &item.test_cases).unwrap();
        proto::write_record(sock, RecordKind::ProgramText, &item.program_text).unwrap();
        proto::read_record(sock, RecordKind::SubmissionResult).unwrap()
    }

    fn run_scripted_cycle(testers: Arc<TesterRegistry>) -> SubmissionResult {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let item = sample_item();
        let server_item = item.clone();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            serve_one_submission(&mut sock, &server_item)
        });

        let mut worker = loop_against(port, testers);
        worker.run_once().unwrap(); // connect
        worker.run_once().unwrap(); // grade
        server.join().unwrap()
    }

    #[test]
    fn successful_tester_result_reaches_the_server() {
        let result = run_scripted_cycle(registry_with(Behavior::Succeed));
        assert_eq!(result.compilation.outcome, CompilationOutcome::Success);
        assert_eq!(result.test_results.len(), 1);
        assert_eq!(result.test_results[0].outcome, crate::config::types::TestOutcome::Passed);
    }

    #[test]
    fn tester_error_degrades_to_builder_error_result() {
        let result = run_scripted_cycle(registry_with(Behavior::Fail));
        assert!(result.is_builder_error());
        assert!(result.compilation.diagnostics[0]
            .message
            .contains("compiler missing"));
    }

    #[test]
    fn tester_panic_degrades_to_builder_error_result() {
        let result = run_scripted_cycle(registry_with(Behavior::Panic));
        assert!(result.is_builder_error());
    }

    #[test]
    fn missing_tester_degrades_to_builder_error_result() {
        let result = run_scripted_cycle(Arc::new(TesterRegistry::new()));
        assert!(result.is_builder_error());
        assert!(result.compilation.diagnostics[0]
            .message
            .contains("no tester available"));
    }

    #[test]
    fn keepalive_leaves_the_connection_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            proto::write_control(&mut sock, -1).unwrap();
            // A keepalive has no reply; the next read sees only the next
            // cycle's cache flag.
            proto::write_control(&mut sock, 7).unwrap();
            assert!(!proto::read_flag(&mut sock).unwrap());
        });

        let mut worker = loop_against(port, registry_with(Behavior::Succeed));
        worker.run_once().unwrap(); // connect
        worker.run_once().unwrap(); // keepalive cycle
        assert!(!worker.shared.is_working());

        // Start the next cycle far enough to prove no stray bytes were
        // written for the keepalive.
        let transport = worker.transport.as_mut().unwrap();
        let control = proto::read_control(transport.as_mut()).unwrap();
        assert_eq!(control, 7);
        proto::write_flag(transport.as_mut(), false).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn working_flag_is_clear_after_a_cycle_and_after_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // Announce a submission, then drop mid-payload.
            proto::write_control(&mut sock, 7).unwrap();
            let _ = proto::read_flag(&mut sock);
        });

        let mut worker = loop_against(port, registry_with(Behavior::Succeed));
        worker.run_once().unwrap(); // connect
        let err = worker.run_once().unwrap_err();
        assert!(!err.is_worker_fatal());
        assert!(!worker.shared.is_working());
        server.join().unwrap();
    }

    #[test]
    fn protocol_mismatch_is_fatal_for_the_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            proto::write_control(&mut sock, 7).unwrap();
            let _ = proto::read_flag(&mut sock);
            // Wrong record kind where the problem should be.
            sock.write_all(&[0xee, 0, 0, 0, 0]).unwrap();
        });

        let mut worker = loop_against(port, registry_with(Behavior::Succeed));
        worker.run_once().unwrap();
        let err = worker.run_once().unwrap_err();
        assert!(err.is_worker_fatal());
        assert!(!worker.shared.is_working());
        server.join().unwrap();
    }

    #[test]
    fn failed_connect_backs_off_without_error() {
        // Nothing listens on the port; run_once must swallow the failure
        // and return after the (shortened) backoff.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut worker = loop_against(port, registry_with(Behavior::Succeed));
        worker.run_once().unwrap();
        assert!(worker.transport.is_none());
    }

    #[test]
    fn idle_wait_tracking_starts_and_stops() {
        let shared = WorkerShared::new();
        assert!(shared.idle_wait_elapsed().is_none());
        shared.begin_idle_wait();
        assert!(shared.idle_wait_elapsed().is_some());
        shared.end_idle_wait();
        assert!(shared.idle_wait_elapsed().is_none());
    }
}
