//! Thread-scoped defaults for process invocations.
//!
//! Every thread owns a stack of partial run options. Scope guards snapshot
//! the current state on entry and restore it when dropped, so defaults are
//! rolled back on every exit path, panics included. When the outermost guard
//! leaves, any residual state is logged (scrubbed) and cleared.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::run::result::Secret;
use crate::run::tee::{LineSink, Sink, StreamMode, sink};

/// Execution mode of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    /// Plain fork/exec with captured pipes.
    Popen,
    /// Spawn under a pseudo-terminal; combined output, no stdin.
    Pty,
    /// Elevate through the sudo askpass helper.
    Sudo,
}

/// What the child sees on fd 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum StdinMode {
    #[default]
    Null,
    Inherit,
}

/// Credentials and switches for the sudo mode.
#[derive(Debug, Clone, Default)]
pub(crate) struct SudoOpts {
    pub(crate) user: Option<String>,
    pub(crate) group: Option<String>,
    pub(crate) password: Option<Secret>,
    pub(crate) login: bool,
    pub(crate) timeout: Option<Duration>,
}

// -------------------------------------------------------------------------------------------------
// RunOpts
// -------------------------------------------------------------------------------------------------

/// Partial options for a process invocation.
///
/// `None` means "not set at this layer". Three layers merge into the
/// effective options: static defaults, the thread context, and the explicit
/// call arguments (highest priority). The sink lists concatenate instead.
#[derive(Clone, Default)]
pub(crate) struct RunOpts {
    pub(crate) mode: Option<RunMode>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) shell: Option<bool>,
    pub(crate) env: Option<BTreeMap<String, String>>,
    pub(crate) env_replace: Option<bool>,
    pub(crate) stdin: Option<StdinMode>,
    pub(crate) stdout: Vec<Sink>,
    pub(crate) stderr: Vec<Sink>,
    pub(crate) stream: Option<StreamMode>,
    pub(crate) enforce: Option<bool>,
    pub(crate) enforce_code: Option<i32>,
    pub(crate) sudo_user: Option<String>,
    pub(crate) sudo_group: Option<String>,
    pub(crate) sudo_password: Option<Secret>,
    pub(crate) sudo_login: Option<bool>,
    pub(crate) sudo_timeout: Option<Duration>,
}

impl RunOpts {
    pub(crate) fn new() -> Self {
        RunOpts::default()
    }

    pub(crate) fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub(crate) fn with_cwd<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub(crate) fn with_shell(mut self, shell: bool) -> Self {
        self.shell = Some(shell);
        self
    }

    pub(crate) fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub(crate) fn with_env_replace(mut self, replace: bool) -> Self {
        self.env_replace = Some(replace);
        self
    }

    pub(crate) fn with_enforce(mut self, enforce: bool) -> Self {
        self.enforce = Some(enforce);
        self
    }

    pub(crate) fn with_enforce_code(mut self, code: i32) -> Self {
        self.enforce_code = Some(code);
        self
    }

    pub(crate) fn with_stdout(mut self, sinks: Vec<Sink>) -> Self {
        self.stdout = sinks;
        self
    }

    pub(crate) fn with_stderr(mut self, sinks: Vec<Sink>) -> Self {
        self.stderr = sinks;
        self
    }

    pub(crate) fn with_sudo(mut self, sudo: SudoOpts) -> Self {
        self.mode = Some(RunMode::Sudo);
        self.sudo_user = sudo.user;
        self.sudo_group = sudo.group;
        self.sudo_password = sudo.password;
        self.sudo_login = Some(sudo.login);
        self.sudo_timeout = sudo.timeout;
        self
    }

    /// True when nothing is set at this layer.
    fn is_clear(&self) -> bool {
        self.mode.is_none()
            && self.cwd.is_none()
            && self.shell.is_none()
            && self.env.is_none()
            && self.env_replace.is_none()
            && self.stdin.is_none()
            && self.stdout.is_empty()
            && self.stderr.is_empty()
            && self.stream.is_none()
            && self.enforce.is_none()
            && self.enforce_code.is_none()
            && self.sudo_user.is_none()
            && self.sudo_group.is_none()
            && self.sudo_password.is_none()
            && self.sudo_login.is_none()
            && self.sudo_timeout.is_none()
    }
}

impl fmt::Debug for RunOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOpts")
            .field("mode", &self.mode)
            .field("cwd", &self.cwd)
            .field("shell", &self.shell)
            .field("env", &self.env)
            .field("env_replace", &self.env_replace)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout.len())
            .field("stderr", &self.stderr.len())
            .field("stream", &self.stream)
            .field("enforce", &self.enforce)
            .field("enforce_code", &self.enforce_code)
            .field("sudo_user", &self.sudo_user)
            .field("sudo_group", &self.sudo_group)
            .field("sudo_password", &self.sudo_password)
            .field("sudo_login", &self.sudo_login)
            .field("sudo_timeout", &self.sudo_timeout)
            .finish()
    }
}

// -------------------------------------------------------------------------------------------------
// Effective options
// -------------------------------------------------------------------------------------------------

/// Fully resolved options for one invocation.
pub(crate) struct EffectiveOpts {
    pub(crate) mode: RunMode,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) shell: bool,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) env_replace: bool,
    pub(crate) stdin: StdinMode,
    pub(crate) stdout: Vec<Sink>,
    pub(crate) stderr: Vec<Sink>,
    pub(crate) stream: StreamMode,
    pub(crate) enforce: bool,
    pub(crate) enforce_code: i32,
    pub(crate) sudo_user: Option<String>,
    pub(crate) sudo_group: Option<String>,
    pub(crate) sudo_password: Option<Secret>,
    pub(crate) sudo_login: bool,
    pub(crate) sudo_timeout: Duration,
}

/// Default overall timeout for the sudo helper.
pub(crate) const SUDO_TIMEOUT: Duration = Duration::from_secs(5);

/// Merges static defaults, the thread context and the call arguments.
///
/// Scalar options: call wins over context, context over defaults. Sink
/// lists: caller sinks first, context sinks appended.
pub(crate) fn effective(call: RunOpts) -> EffectiveOpts {
    CONTEXT.with(|cell| {
        let ctx = cell.borrow();
        let scoped = &ctx.opts;

        let mut stdout = call.stdout;
        stdout.extend(scoped.stdout.iter().cloned());
        let mut stderr = call.stderr;
        stderr.extend(scoped.stderr.iter().cloned());

        EffectiveOpts {
            mode: call.mode.or(scoped.mode).unwrap_or(RunMode::Popen),
            cwd: call.cwd.or_else(|| scoped.cwd.clone()),
            shell: call.shell.or(scoped.shell).unwrap_or(false),
            env: call.env.or_else(|| scoped.env.clone()).unwrap_or_default(),
            env_replace: call.env_replace.or(scoped.env_replace).unwrap_or(false),
            stdin: call.stdin.or(scoped.stdin).unwrap_or_default(),
            stdout,
            stderr,
            stream: call.stream.or(scoped.stream).unwrap_or_default(),
            enforce: call.enforce.or(scoped.enforce).unwrap_or(true),
            enforce_code: call.enforce_code.or(scoped.enforce_code).unwrap_or(0),
            sudo_user: call.sudo_user.or_else(|| scoped.sudo_user.clone()),
            sudo_group: call.sudo_group.or_else(|| scoped.sudo_group.clone()),
            sudo_password: call
                .sudo_password
                .or_else(|| scoped.sudo_password.clone()),
            sudo_login: call.sudo_login.or(scoped.sudo_login).unwrap_or(false),
            sudo_timeout: call
                .sudo_timeout
                .or(scoped.sudo_timeout)
                .unwrap_or(SUDO_TIMEOUT),
        }
    })
}

// -------------------------------------------------------------------------------------------------
// Thread context and scope guards
// -------------------------------------------------------------------------------------------------

struct ContextState {
    depth: usize,
    opts: RunOpts,
}

thread_local! {
    static CONTEXT: RefCell<ContextState> = RefCell::new(ContextState {
        depth: 0,
        opts: RunOpts::default(),
    });
}

/// Restores the context snapshot taken at scope entry.
pub(crate) struct ScopeGuard {
    saved: Option<RunOpts>,
}

fn enter<F: FnOnce(&mut RunOpts)>(apply: F) -> ScopeGuard {
    CONTEXT.with(|cell| {
        let mut ctx = cell.borrow_mut();
        ctx.depth += 1;
        let saved = ctx.opts.clone();
        apply(&mut ctx.opts);
        ScopeGuard { saved: Some(saved) }
    })
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CONTEXT.with(|cell| {
            let mut ctx = cell.borrow_mut();
            if let Some(saved) = self.saved.take() {
                ctx.opts = saved;
            }
            ctx.depth = ctx.depth.saturating_sub(1);
            if ctx.depth == 0 && !ctx.opts.is_clear() {
                debug!(residue = ?ctx.opts, "run context not empty at top level, clearing");
                ctx.opts = RunOpts::default();
            }
        });
    }
}

/// Current guard nesting depth of this thread.
pub(crate) fn depth() -> usize {
    CONTEXT.with(|cell| cell.borrow().depth)
}

/// Disables exit-code enforcement within the scope.
pub(crate) fn quash() -> ScopeGuard {
    enter(|opts| opts.enforce = Some(false))
}

/// Enforces the given exit code within the scope.
pub(crate) fn enforce(code: i32) -> ScopeGuard {
    enter(|opts| {
        opts.enforce = Some(true);
        opts.enforce_code = Some(code);
    })
}

/// Sets the working directory for invocations within the scope.
pub(crate) fn cwd<P: Into<PathBuf>>(dir: P) -> ScopeGuard {
    let dir = dir.into();
    enter(|opts| opts.cwd = Some(dir))
}

/// Runs commands through the shell within the scope.
pub(crate) fn shell() -> ScopeGuard {
    enter(|opts| opts.shell = Some(true))
}

/// Overlays environment variables within the scope.
pub(crate) fn env(vars: BTreeMap<String, String>) -> ScopeGuard {
    enter(|opts| match &mut opts.env {
        Some(existing) => existing.extend(vars),
        None => opts.env = Some(vars),
    })
}

/// Appends (or, with `excl`, replaces) the scoped sink lists.
pub(crate) fn stdio(stdout: Vec<Sink>, stderr: Vec<Sink>, excl: bool) -> ScopeGuard {
    enter(move |opts| {
        if excl {
            opts.stdout = stdout;
            opts.stderr = stderr;
        } else {
            opts.stdout.extend(stdout);
            opts.stderr.extend(stderr);
        }
    })
}

/// Routes child output into the log stream at the given level.
pub(crate) fn log_to(level: tracing::Level) -> ScopeGuard {
    stdio(
        vec![sink(LineSink::new("[stdout]", level))],
        vec![sink(LineSink::new("[stderr]", level))],
        false,
    )
}

/// Switches invocations within the scope to the sudo mode.
pub(crate) fn sudo(sudo: SudoOpts) -> ScopeGuard {
    enter(move |opts| {
        opts.mode = Some(RunMode::Sudo);
        opts.sudo_user = sudo.user;
        opts.sudo_group = sudo.group;
        opts.sudo_password = sudo.password;
        opts.sudo_login = Some(sudo.login);
        opts.sudo_timeout = sudo.timeout;
    })
}

/// Hides all current context entries; the previous state comes back on drop.
pub(crate) fn new_scope() -> ScopeGuard {
    enter(|opts| *opts = RunOpts::default())
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting_depth_returns_to_zero() {
        assert_eq!(depth(), 0);
        {
            let _a = quash();
            assert_eq!(depth(), 1);
            {
                let _b = cwd("/tmp");
                assert_eq!(depth(), 2);
            }
            assert_eq!(depth(), 1);
        }
        assert_eq!(depth(), 0);
    }

    #[test]
    fn test_guards_restore_on_exit() {
        {
            let _g = enforce(7);
            let eff = effective(RunOpts::new());
            assert!(eff.enforce);
            assert_eq!(eff.enforce_code, 7);
        }
        let eff = effective(RunOpts::new());
        assert_eq!(eff.enforce_code, 0);
    }

    #[test]
    fn test_guards_restore_on_panic() {
        let result = std::panic::catch_unwind(|| {
            let _g = quash();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(depth(), 0);
        assert!(effective(RunOpts::new()).enforce);
    }

    #[test]
    fn test_call_arguments_beat_context() {
        let _g = enforce(3);
        let eff = effective(RunOpts::new().with_enforce_code(9));
        assert_eq!(eff.enforce_code, 9);
    }

    #[test]
    fn test_env_scopes_overlay() {
        let outer: BTreeMap<_, _> = [("A".to_string(), "1".to_string())].into();
        let inner: BTreeMap<_, _> = [("B".to_string(), "2".to_string())].into();
        let _a = env(outer);
        {
            let _b = env(inner);
            let eff = effective(RunOpts::new());
            assert_eq!(eff.env.get("A").map(String::as_str), Some("1"));
            assert_eq!(eff.env.get("B").map(String::as_str), Some("2"));
        }
        let eff = effective(RunOpts::new());
        assert_eq!(eff.env.get("A").map(String::as_str), Some("1"));
        assert!(!eff.env.contains_key("B"));
    }

    #[test]
    fn test_stdio_appends_caller_first() {
        use crate::run::tee::CaptureSink;
        let scoped = CaptureSink::new();
        let _g = stdio(vec![sink(scoped)], vec![], false);
        let caller = CaptureSink::new();
        let eff = effective(RunOpts::new().with_stdout(vec![sink(caller)]));
        // Caller sink first, scoped sink second.
        assert_eq!(eff.stdout.len(), 2);
    }

    #[test]
    fn test_new_scope_hides_everything() {
        let _outer = sudo(SudoOpts {
            password: Some(Secret::new("pw")),
            ..SudoOpts::default()
        });
        {
            let _inner = new_scope();
            let eff = effective(RunOpts::new());
            assert_eq!(eff.mode, RunMode::Popen);
            assert!(eff.sudo_password.is_none());
        }
        let eff = effective(RunOpts::new());
        assert_eq!(eff.mode, RunMode::Sudo);
        assert!(eff.sudo_password.is_some());
    }

    #[test]
    fn test_debug_dump_scrubs_password() {
        let opts = RunOpts::new().with_sudo(SudoOpts {
            password: Some(Secret::new("hunter2")),
            ..SudoOpts::default()
        });
        let dump = format!("{:?}", opts);
        assert!(!dump.contains("hunter2"));
        assert!(dump.contains(crate::run::result::SCRUB_TAG));
    }
}
