//! Tester boundary: the interface between connection management and the
//! language-specific compile/execute machinery.
//!
//! Workers never know how a submission is judged. They look up a
//! [`Tester`] by problem type and hand it the work item together with the
//! process-wide [`SandboxPolicy`]; everything that can go wrong inside a
//! tester, including a panic, is degraded to a builder-error result so the
//! server always gets an answer.

pub mod registry;

use crate::config::config::{BuilderConfig, SandboxSettings};
use crate::config::types::{ProblemType, Result, SubmissionResult, WorkItem};
use std::path::PathBuf;
use std::sync::OnceLock;

/// Resolved sandbox policy applied to every tester invocation.
#[derive(Clone, Debug)]
pub struct SandboxPolicy {
    pub sandbox_enabled: bool,
    pub heap_size_bytes: u64,
    pub scratch_dir: PathBuf,
}

impl SandboxPolicy {
    fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            sandbox_enabled: settings.enabled,
            heap_size_bytes: settings.heap_size_bytes,
            scratch_dir: settings
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }

    /// The process-wide policy, resolved once from the first configuration
    /// seen. Later calls ignore their argument.
    pub fn process(config: &BuilderConfig) -> &'static SandboxPolicy {
        static POLICY: OnceLock<SandboxPolicy> = OnceLock::new();
        POLICY.get_or_init(|| SandboxPolicy::from_settings(&config.sandbox))
    }
}

/// Grades submissions of one problem type.
///
/// Implementations must be safe to call from several worker threads at
/// once and should report internal failures through `Err` rather than
/// panicking; the worker converts both into a degraded result.
pub trait Tester: Send + Sync {
    fn problem_type(&self) -> ProblemType;

    fn execute(&self, policy: &SandboxPolicy, item: &WorkItem) -> Result<SubmissionResult>;
}
