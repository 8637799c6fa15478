//! Problem-type to tester dispatch.

use crate::config::types::ProblemType;
use crate::tester::Tester;
use std::collections::HashMap;

/// Registry of testers keyed by problem type.
///
/// Built once at daemon startup and shared read-only by the workers.
/// A problem type without a registered tester is not an error at lookup
/// time; the worker reports it as a builder-error result for that
/// submission, since the server may serve problem types this builder
/// installation was never provisioned for.
#[derive(Default)]
pub struct TesterRegistry {
    testers: HashMap<ProblemType, Box<dyn Tester>>,
}

impl TesterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tester, replacing any previous one for the same type.
    pub fn register(&mut self, tester: Box<dyn Tester>) {
        let problem_type = tester.problem_type();
        if self.testers.insert(problem_type, tester).is_some() {
            log::warn!("replacing tester for problem type {problem_type}");
        }
    }

    pub fn tester_for(&self, problem_type: ProblemType) -> Option<&dyn Tester> {
        self.testers.get(&problem_type).map(|t| t.as_ref())
    }

    pub fn supported_types(&self) -> Vec<ProblemType> {
        self.testers.keys().copied().collect()
    }
}
