use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;

use crate::protocol::HostEnvironment;

/// Everything needed to run a program once for one request.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    program: PathBuf,
    timeout: Duration,
    variables: Vec<(String, String)>,
    stdin: Bytes,
}

impl InvocationRequest {
    /// `variables` are the request derived environment entries, in the order they are applied.
    #[must_use]
    pub fn new(
        program: impl Into<PathBuf>,
        timeout: Duration,
        variables: Vec<(String, String)>,
        stdin: Bytes,
    ) -> Self {
        Self {
            program: program.into(),
            timeout,
            variables,
            stdin,
        }
    }

    /// Absolute path of the program.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// The program's file name, for log messages.
    #[must_use]
    pub fn program_name(&self) -> String {
        self.program.file_name().map_or_else(
            || self.program.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Request derived entries, without the inherited environment.
    #[must_use]
    pub fn variables(&self) -> &[(String, String)] {
        &self.variables
    }

    /// Looks up the last value assigned to `name` by the request.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The complete environment of the child process.
    #[must_use]
    pub fn environment(&self, host: &HostEnvironment) -> Vec<(OsString, OsString)> {
        host.layered(&self.variables)
    }

    /// The raw request body, written to the program's stdin.
    #[must_use]
    pub fn stdin(&self) -> &Bytes {
        &self.stdin
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The program exited on its own.
    /// The exit code is `None` if it was terminated by a signal.
    Completed { exit_code: Option<i32> },
    /// The program ran into the timeout and was killed.
    KilledByTimeout,
    /// The program could not be started at all.
    FailedToStart,
}

impl Outcome {
    /// Whether the program exited on its own with exit code zero.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Outcome::Completed { exit_code: Some(0) }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed { exit_code: Some(code) } => write!(f, "completed (exit code {code})"),
            Outcome::Completed { exit_code: None } => f.write_str("completed (terminated by signal)"),
            Outcome::KilledByTimeout => f.write_str("killed-by-timeout"),
            Outcome::FailedToStart => f.write_str("failed-to-start"),
        }
    }
}

/// Combined stdout and stderr of one invocation.
///
/// The output is kept regardless of the outcome; a killed program returns what it
/// printed until it was killed, a program that failed to start returns nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    output: Vec<u8>,
    outcome: Outcome,
}

impl InvocationResult {
    #[must_use]
    pub fn new(output: Vec<u8>, outcome: Outcome) -> Self {
        Self { output, outcome }
    }

    #[must_use]
    pub fn failed_to_start() -> Self {
        Self::new(Vec::new(), Outcome::FailedToStart)
    }

    #[must_use]
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    #[must_use]
    pub fn into_output(self) -> Vec<u8> {
        self.output
    }
}
