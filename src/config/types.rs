/// Core types and structures shared across the builder
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Problem-type tag used to select the tester for a submission.
///
/// The set is closed: a payload carrying a tag outside this enum fails
/// deserialization, which the worker treats as a protocol-version mismatch.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProblemType {
    #[serde(rename = "java_method")]
    JavaMethod,
    #[serde(rename = "python_function")]
    PythonFunction,
    #[serde(rename = "c_function")]
    CFunction,
    #[serde(rename = "c_program")]
    CProgram,
    #[serde(rename = "java_program")]
    JavaProgram,
    #[serde(rename = "ruby_method")]
    RubyMethod,
}

impl std::fmt::Display for ProblemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProblemType::JavaMethod => "java_method",
            ProblemType::PythonFunction => "python_function",
            ProblemType::CFunction => "c_function",
            ProblemType::CProgram => "c_program",
            ProblemType::JavaProgram => "java_program",
            ProblemType::RubyMethod => "ruby_method",
        };
        f.write_str(name)
    }
}

/// An exercise definition as sent by the grading server.
///
/// Received fresh every cycle: the server may edit a problem at any time,
/// so the worker never caches these by id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub problem_id: i32,
    pub problem_type: ProblemType,
    pub test_name: String,
    pub brief_description: String,
    /// Schema version of the problem record on the server side.
    #[serde(default)]
    pub schema_version: i32,
}

/// One test case for a problem.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub test_case_id: i32,
    pub problem_id: i32,
    pub test_case_name: String,
    pub input: String,
    pub output: String,
    /// Secret test cases are not shown to students.
    pub secret: bool,
}

/// One submission to grade: a problem, its test cases, and program text.
///
/// Has no identity beyond a single request/response cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkItem {
    pub problem: Problem,
    pub test_cases: Vec<TestCase>,
    pub program_text: String,
}

/// Outcome of the compilation stage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompilationOutcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failure")]
    Failure,
    #[serde(rename = "unexpected_compiler_error")]
    UnexpectedCompilerError,
    /// The builder itself failed; the submission was never judged.
    #[serde(rename = "builder_error")]
    BuilderError,
}

/// A single compiler diagnostic with its source span.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CompilerDiagnostic {
    pub start_line: i32,
    pub start_column: i32,
    pub end_line: i32,
    pub end_column: i32,
    pub message: String,
}

/// Result of the compilation stage.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CompilationResult {
    pub outcome: CompilationOutcome,
    pub diagnostics: Vec<CompilerDiagnostic>,
}

impl CompilationResult {
    pub fn new(outcome: CompilationOutcome) -> Self {
        Self {
            outcome,
            diagnostics: Vec::new(),
        }
    }
}

/// Outcome of executing one test case.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TestOutcome {
    #[serde(rename = "passed")]
    Passed,
    #[serde(rename = "failed_assertion")]
    FailedAssertion,
    #[serde(rename = "failed_with_exception")]
    FailedWithException,
    #[serde(rename = "failed_by_security_manager")]
    FailedBySecurityManager,
    #[serde(rename = "failed_from_timeout")]
    FailedFromTimeout,
    #[serde(rename = "internal_error")]
    InternalError,
}

/// Result of executing one test case.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub outcome: TestOutcome,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

impl TestResult {
    pub fn passed(test_case_name: &str) -> Self {
        Self {
            outcome: TestOutcome::Passed,
            message: format!("{test_case_name}: passed"),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// The full outcome record for one graded submission.
///
/// Produced exactly once per [`WorkItem`], even when the tester fails
/// internally: the degraded form carries a builder-error compilation
/// outcome and zero test results, so the server always receives an answer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubmissionResult {
    pub compilation: CompilationResult,
    pub test_results: Vec<TestResult>,
}

impl SubmissionResult {
    pub fn new(compilation: CompilationResult, test_results: Vec<TestResult>) -> Self {
        Self {
            compilation,
            test_results,
        }
    }

    /// Degraded result reported when the tester failed internally.
    pub fn builder_error(message: &str) -> Self {
        let mut compilation = CompilationResult::new(CompilationOutcome::BuilderError);
        compilation.diagnostics.push(CompilerDiagnostic {
            message: message.to_string(),
            ..CompilerDiagnostic::default()
        });
        Self {
            compilation,
            test_results: Vec::new(),
        }
    }

    pub fn is_builder_error(&self) -> bool {
        self.compilation.outcome == CompilationOutcome::BuilderError
    }
}

/// Custom error types for the builder
#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Framing or record-type resolution failure. Implies a protocol or
    /// version mismatch with the server; unrecoverable for the worker
    /// thread that observed it.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tester error: {0}")]
    Tester(String),
}

impl BuilderError {
    /// Whether this error terminates the observing worker thread.
    ///
    /// Everything except a protocol-format failure is recoverable by
    /// dropping the transport and reconnecting.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(self, BuilderError::Protocol(_))
    }
}

impl From<rustls::Error> for BuilderError {
    fn from(err: rustls::Error) -> Self {
        BuilderError::Tls(err.to_string())
    }
}

/// Result type alias for builder operations
pub type Result<T> = std::result::Result<T, BuilderError>;
