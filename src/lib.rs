//! # buildbox
//!
//! Out-of-process builder for a code-grading service. A pool of worker
//! threads keeps long-lived connections to the central grading server,
//! pulls submissions over a compact blocking protocol, grades them
//! through pluggable per-language testers, and pushes results back.
//!
//! ## Architecture
//!
//! - [`config`]: configuration loading and the shared data model
//!   (problems, test cases, submission results, errors).
//! - [`proto`]: the blocking wire protocol spoken with the server.
//! - [`transport`]: connection strategies, direct TLS or SSH tunneled,
//!   behind a single [`transport::Transport`] trait.
//! - [`worker`]: the per-thread grading loop, its hung-connection
//!   watchdog, and the pool manager.
//! - [`tester`]: the capability boundary to language-specific grading.
//! - [`daemon`] / [`cli`]: process lifecycle and the admin interface.
//!
//! ## Design notes
//!
//! All I/O is blocking and thread-per-connection: a worker is either
//! waiting for the server, grading, or reconnecting, and never does two
//! of those at once. Connections are torn down from outside only through
//! [`transport::ShutdownHandle`], which is what lets the watchdog and a
//! graceful shutdown unstick a worker blocked in a read.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod proto;
pub mod tester;
pub mod transport;
pub mod worker;

pub use config::config::{BuilderConfig, TunnelMode};
pub use config::types::{
    BuilderError, Problem, ProblemType, Result, SubmissionResult, TestCase, WorkItem,
};
pub use daemon::BuilderDaemon;
pub use tester::{SandboxPolicy, Tester};
pub use worker::pool::Pool;
