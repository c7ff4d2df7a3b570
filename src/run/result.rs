//! Process invocation results and the errors that carry them.
//!
//! A [`RunResult`] is an immutable record of one child process: the command
//! line in string and tokenized form, the exit code and both captured
//! streams. Results can be dumped as YAML for logs and error reports.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Literal replacement for credential values in any dump or log line.
pub(crate) const SCRUB_TAG: &str = "<scrubbed>";

// -------------------------------------------------------------------------------------------------
// Secret
// -------------------------------------------------------------------------------------------------

/// A credential-bearing string.
///
/// The value is only reachable through [`Secret::reveal`]; `Debug`, `Display`
/// and `Serialize` all emit [`SCRUB_TAG`], so a secret cannot leak through a
/// context dump, a log line or a serialized result.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Secret(String);

impl Secret {
    pub(crate) fn new<S: Into<String>>(value: S) -> Self {
        Secret(value.into())
    }

    /// Returns the actual secret value.
    pub(crate) fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SCRUB_TAG)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SCRUB_TAG)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(SCRUB_TAG)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_string())
    }
}

// -------------------------------------------------------------------------------------------------
// RunResult
// -------------------------------------------------------------------------------------------------

/// Outcome of a finished child process.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct RunResult {
    /// The command as a single shell line.
    pub(crate) args: String,
    /// The command as a token vector.
    pub(crate) argv: Vec<String>,
    /// Exit code; negative for a terminating signal.
    pub(crate) code: i32,
    /// Everything the child wrote to fd 1.
    pub(crate) stdout: String,
    /// Everything the child wrote to fd 2.
    pub(crate) stderr: String,
}

impl RunResult {
    pub(crate) fn success(&self) -> bool {
        self.code == 0
    }

    /// YAML rendering with the `run.result` top-level tag.
    pub(crate) fn dump(&self) -> String {
        self.dump_tagged("run.result")
    }

    fn dump_tagged(&self, tag: &str) -> String {
        let mut doc = BTreeMap::new();
        doc.insert(tag, self);
        serde_yaml::to_string(&doc).unwrap_or_default()
    }

    /// Emits the dump line by line through tracing at debug level.
    pub(crate) fn log(&self) {
        for line in self.dump().lines() {
            tracing::debug!("  {}", line);
        }
    }
}

// -------------------------------------------------------------------------------------------------
// RunError
// -------------------------------------------------------------------------------------------------

/// Errors raised by the process runner.
#[derive(Debug, Error)]
pub(crate) enum RunError {
    /// The process exited, but with a code other than the enforced one.
    #[error("process exited with code {}: {}", .0.code, .0.args)]
    Enforce(Box<RunResult>),

    /// The command line could not be tokenized or joined.
    #[error("malformed command line: {args}")]
    Parse { args: String },

    /// The child could not be started; carries the platform error, so a
    /// missing binary surfaces as the usual not-found error.
    #[error("failed to spawn `{args}`")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while driving a running child.
    #[error("i/o error while running `{args}`")]
    Io {
        args: String,
        #[source]
        source: std::io::Error,
    },

    /// Pseudo-terminal setup or teardown failure.
    #[error("pty error while running `{args}`: {message}")]
    Pty { args: String, message: String },

    /// The sudo helper never observed its success sentinel.
    #[error("timed out waiting for sudo: {args}")]
    SudoTimeout { args: String },
}

impl RunError {
    /// YAML rendering of the carried result, when there is one.
    pub(crate) fn dump(&self) -> Option<String> {
        match self {
            RunError::Enforce(result) => Some(result.dump_tagged("run.error")),
            _ => None,
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------
