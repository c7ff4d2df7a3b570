//! Process execution runtime.
//!
//! The pieces fit together like this: [`runner::run`] merges the static
//! defaults with the thread-scoped [`context`] and the explicit call
//! options, then executes in one of three modes — plain popen, a
//! pseudo-terminal, or elevation through the [`sudo`] askpass helper — while
//! [`tee`] fans the child's streams into capture buffers and any caller
//! sinks.

pub(crate) mod context;
pub(crate) mod result;
pub(crate) mod runner;
pub(crate) mod sudo;
pub(crate) mod tee;

pub(crate) use context::{RunOpts, SudoOpts};
pub(crate) use result::{RunError, RunResult, Secret};
pub(crate) use runner::run;
