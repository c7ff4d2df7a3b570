//! The subprocess front-end.
//!
//! [`run`] merges three option layers (static defaults, the thread-scoped
//! context, the explicit call arguments), normalizes the command into both a
//! shell line and a token vector, executes it in one of three modes and
//! returns a [`RunResult`] — or a [`RunError`] when enforcement is on and
//! the exit code does not match.

use lazy_static::lazy_static;
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

use crate::run::context::{self, EffectiveOpts, RunMode, RunOpts, StdinMode};
use crate::run::result::{RunError, RunResult};
use crate::run::sudo;
use crate::run::tee::{CaptureSink, StreamMode, StreamTee, sink};

/// Upper bound of the child-exit poll interval. Polling keeps the waiting
/// thread responsive to interrupts; the interval escalates from 1 ms so
/// short-lived commands return promptly.
const WAIT_POLL_MAX: Duration = Duration::from_secs(1);

lazy_static! {
    static ref DEFAULT_SHELL: String =
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
}

/// The shell used for `shell=true` invocations and the sudo command line.
pub(crate) fn default_shell() -> String {
    DEFAULT_SHELL.clone()
}

/// A command, either as one shell line or as a token vector.
#[derive(Debug, Clone)]
pub(crate) enum RunCmd {
    Line(String),
    Argv(Vec<String>),
}

impl From<&str> for RunCmd {
    fn from(value: &str) -> Self {
        RunCmd::Line(value.to_string())
    }
}

impl From<String> for RunCmd {
    fn from(value: String) -> Self {
        RunCmd::Line(value)
    }
}

impl From<Vec<String>> for RunCmd {
    fn from(value: Vec<String>) -> Self {
        RunCmd::Argv(value)
    }
}

impl From<&[&str]> for RunCmd {
    fn from(value: &[&str]) -> Self {
        RunCmd::Argv(value.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RunCmd {
    fn from(value: [&str; N]) -> Self {
        RunCmd::Argv(value.iter().map(|s| s.to_string()).collect())
    }
}

/// Runs a command with the merged options and enforces the exit code.
pub(crate) fn run<C: Into<RunCmd>>(cmd: C, opts: RunOpts) -> Result<RunResult, RunError> {
    let eff = context::effective(opts);
    let (args, argv) = normalize(cmd.into())?;
    trace!(cmd = %args, mode = ?eff.mode, "run");

    let result = match eff.mode {
        RunMode::Popen => run_popen(&argv, &args, &eff)?,
        RunMode::Pty => run_pty(&argv, &args, &eff)?,
        RunMode::Sudo => run_sudo(&argv, &args, &eff)?,
    };

    if eff.enforce && result.code != eff.enforce_code {
        result.log();
        return Err(RunError::Enforce(Box::new(result)));
    }
    Ok(result)
}

/// Convenience wrapper forcing the popen mode.
pub(crate) fn popen<C: Into<RunCmd>>(cmd: C, opts: RunOpts) -> Result<RunResult, RunError> {
    run(cmd, opts.with_mode(RunMode::Popen))
}

/// Convenience wrapper forcing the pty mode.
pub(crate) fn pty<C: Into<RunCmd>>(cmd: C, opts: RunOpts) -> Result<RunResult, RunError> {
    run(cmd, opts.with_mode(RunMode::Pty))
}

/// Convenience wrapper forcing the sudo mode.
pub(crate) fn run_elevated<C: Into<RunCmd>>(cmd: C, opts: RunOpts) -> Result<RunResult, RunError> {
    run(cmd, opts.with_mode(RunMode::Sudo))
}

/// Produces the `(shell line, token vector)` pair for any command form.
fn normalize(cmd: RunCmd) -> Result<(String, Vec<String>), RunError> {
    match cmd {
        RunCmd::Line(line) => {
            let argv = shlex::split(&line).ok_or_else(|| RunError::Parse {
                args: line.clone(),
            })?;
            if argv.is_empty() {
                return Err(RunError::Parse { args: line });
            }
            Ok((line, argv))
        }
        RunCmd::Argv(argv) => {
            if argv.is_empty() {
                return Err(RunError::Parse {
                    args: String::new(),
                });
            }
            let line = shlex::try_join(argv.iter().map(String::as_str)).map_err(|_| {
                RunError::Parse {
                    args: argv.join(" "),
                }
            })?;
            Ok((line, argv))
        }
    }
}

// -------------------------------------------------------------------------------------------------
// popen mode
// -------------------------------------------------------------------------------------------------

fn run_popen(argv: &[String], args: &str, eff: &EffectiveOpts) -> Result<RunResult, RunError> {
    let mut cmd = if eff.shell {
        let mut c = Command::new(default_shell());
        c.arg("-c").arg(args);
        c
    } else {
        let mut c = Command::new(&argv[0]);
        c.args(&argv[1..]);
        c
    };
    if eff.env_replace {
        cmd.env_clear();
    }
    cmd.envs(&eff.env);
    if let Some(cwd) = &eff.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(match eff.stdin {
        StdinMode::Inherit => Stdio::inherit(),
        StdinMode::Null => Stdio::null(),
    });

    let child = cmd.spawn().map_err(|e| RunError::Spawn {
        args: args.to_string(),
        source: e,
    })?;
    finish_child(child, argv, args, eff)
}

/// Fans the child's pipes into capture buffers plus the caller sinks, waits
/// for exit, then joins the pumps. The child is killed and reaped on every
/// error path.
fn finish_child(
    mut child: Child,
    argv: &[String],
    args: &str,
    eff: &EffectiveOpts,
) -> Result<RunResult, RunError> {
    let out_capture = CaptureSink::new();
    let err_capture = CaptureSink::new();

    let mut out_sinks = vec![sink(out_capture.clone())];
    out_sinks.extend(eff.stdout.iter().cloned());
    let mut err_sinks = vec![sink(err_capture.clone())];
    err_sinks.extend(eff.stderr.iter().cloned());

    let out_tee = child
        .stdout
        .take()
        .map(|stream| StreamTee::spawn(stream, out_sinks, eff.stream));
    let err_tee = child
        .stderr
        .take()
        .map(|stream| StreamTee::spawn(stream, err_sinks, eff.stream));

    let status = match wait_child(&mut child) {
        Ok(status) => status,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(tee) = &out_tee {
                tee.stop();
            }
            if let Some(tee) = &err_tee {
                tee.stop();
            }
            if let Some(tee) = out_tee {
                tee.join();
            }
            if let Some(tee) = err_tee {
                tee.join();
            }
            return Err(RunError::Io {
                args: args.to_string(),
                source: e,
            });
        }
    };

    if let Some(tee) = out_tee {
        tee.join();
    }
    if let Some(tee) = err_tee {
        tee.join();
    }

    Ok(RunResult {
        args: args.to_string(),
        argv: argv.to_vec(),
        code: exit_code(status),
        stdout: out_capture.take_string(),
        stderr: err_capture.take_string(),
    })
}

/// Waits for the child with an escalating poll interval capped at
/// [`WAIT_POLL_MAX`].
fn wait_child(child: &mut Child) -> std::io::Result<ExitStatus> {
    let mut pause = Duration::from_millis(1);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(pause);
        pause = (pause * 2).min(WAIT_POLL_MAX);
    }
}

/// Exit code of a finished process; a terminating signal maps to its
/// negative number.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

// -------------------------------------------------------------------------------------------------
// pty mode
// -------------------------------------------------------------------------------------------------

fn run_pty(argv: &[String], args: &str, eff: &EffectiveOpts) -> Result<RunResult, RunError> {
    let pty_err = |message: String| RunError::Pty {
        args: args.to_string(),
        message,
    };

    // Under a shell, the whole line becomes `<shell> -c <args>`.
    let (argv, args) = if eff.shell {
        let v = vec![default_shell(), "-c".to_string(), args.to_string()];
        let line = shlex::try_join(v.iter().map(String::as_str)).map_err(|_| {
            RunError::Parse {
                args: args.to_string(),
            }
        })?;
        (v, line)
    } else {
        (argv.to_vec(), args.to_string())
    };

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| pty_err(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&argv[0]);
    cmd.args(&argv[1..]);
    if eff.env_replace {
        cmd.env_clear();
    }
    for (key, value) in &eff.env {
        cmd.env(key, value);
    }
    if let Some(cwd) = &eff.cwd {
        cmd.cwd(cwd);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| pty_err(e.to_string()))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| pty_err(e.to_string()))?;

    let capture = CaptureSink::new();
    let mut sinks = vec![sink(capture.clone())];
    sinks.extend(eff.stdout.iter().cloned());
    let tee = StreamTee::spawn(reader, sinks, StreamMode::Text);

    let status = match child.wait() {
        Ok(status) => status,
        Err(e) => {
            let _ = child.kill();
            tee.stop();
            drop(pair.master);
            tee.join();
            return Err(RunError::Io {
                args,
                source: e,
            });
        }
    };
    // Closing the master lets the reader reach EOF.
    drop(pair.master);
    tee.join();

    // A pty joins both streams and uses CRLF line endings.
    let stdout = capture.take_string().replace("\r\n", "\n");
    Ok(RunResult {
        args,
        argv,
        code: status.exit_code() as i32,
        stdout,
        stderr: String::new(),
    })
}

// -------------------------------------------------------------------------------------------------
// sudo mode
// -------------------------------------------------------------------------------------------------

fn run_sudo(argv: &[String], args: &str, eff: &EffectiveOpts) -> Result<RunResult, RunError> {
    debug!(cmd = %args, user = ?eff.sudo_user, "elevating through sudo helper");
    let child = sudo::popen(args, eff)?;
    finish_child(child, argv, args, eff)
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::context;
    use std::collections::BTreeMap;

    #[test]
    fn test_echo_capture() {
        let result = run(["echo", "hi"], RunOpts::new()).unwrap();
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.stderr, "");
        assert_eq!(result.code, 0);
        assert_eq!(result.args, "echo hi");
        assert_eq!(result.argv, vec!["echo", "hi"]);
    }

    #[test]
    fn test_true_is_silent_success() {
        let result = popen("true", RunOpts::new()).unwrap();
        assert_eq!(result.code, 0);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_false_raises_enforce() {
        let err = run("false", RunOpts::new()).unwrap_err();
        match err {
            RunError::Enforce(result) => assert_eq!(result.code, 1),
            other => panic!("expected enforce error, got {other:?}"),
        }
    }

    #[test]
    fn test_false_inside_quash_returns_result() {
        let _quash = context::quash();
        let result = run("false", RunOpts::new()).unwrap();
        assert_eq!(result.code, 1);
    }

    #[test]
    fn test_enforce_code_override() {
        let result = run(
            "sh -c 'exit 7'",
            RunOpts::new().with_shell(true).with_enforce_code(7),
        )
        .unwrap();
        assert_eq!(result.code, 7);
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let err = run("definitely-not-a-binary-xyzzy", RunOpts::new()).unwrap_err();
        match err {
            RunError::Spawn { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound)
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }

    #[test]
    fn test_shell_expansion_with_env_overlay() {
        let _shell = context::shell();
        let env: BTreeMap<_, _> = [("HOME".to_string(), "/x".to_string())].into();
        let result = run(
            "echo $HOME",
            RunOpts::new().with_env(env).with_env_replace(false),
        )
        .unwrap();
        assert!(result.stdout.starts_with("/x"), "stdout: {}", result.stdout);
    }

    #[test]
    fn test_stderr_is_separate() {
        let result = run(
            "sh -c 'echo out; echo err >&2'",
            RunOpts::new().with_shell(true),
        )
        .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn test_stdout_preserves_order() {
        let result = run(
            "sh -c 'for i in 1 2 3 4 5; do echo $i; done'",
            RunOpts::new().with_shell(true),
        )
        .unwrap();
        assert_eq!(result.stdout, "1\n2\n3\n4\n5\n");
    }

    #[test]
    fn test_tokenization_respects_quoting() {
        let (args, argv) = normalize(RunCmd::Line("echo 'a b' c".to_string())).unwrap();
        assert_eq!(args, "echo 'a b' c");
        assert_eq!(argv, vec!["echo", "a b", "c"]);
    }

    #[test]
    fn test_join_quotes_spaces() {
        let (args, _) =
            normalize(RunCmd::Argv(vec!["echo".to_string(), "a b".to_string()])).unwrap();
        assert_eq!(args, "echo 'a b'");
    }

    #[test]
    fn test_unbalanced_quote_is_parse_error() {
        let err = run("echo 'oops", RunOpts::new()).unwrap_err();
        assert!(matches!(err, RunError::Parse { .. }));
    }

    #[test]
    fn test_cwd_scope() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let _cwd = context::cwd(canonical.clone());
        let result = run("pwd", RunOpts::new()).unwrap();
        assert_eq!(result.stdout.trim(), canonical.to_string_lossy());
    }

    #[test]
    fn test_caller_sinks_receive_output() {
        let observed = CaptureSink::new();
        let result = run(
            ["echo", "fan-out"],
            RunOpts::new().with_stdout(vec![sink(observed.clone())]),
        )
        .unwrap();
        assert_eq!(result.stdout, "fan-out\n");
        assert_eq!(observed.take_string(), "fan-out\n");
    }

    #[test]
    fn test_pty_combines_streams() {
        let result = pty("echo pty-check", RunOpts::new().with_shell(true)).unwrap();
        assert_eq!(result.code, 0);
        assert!(result.stdout.contains("pty-check"));
        assert_eq!(result.stderr, "");
    }

    #[test]
    fn test_signal_maps_to_negative_code() {
        let _quash = context::quash();
        let result = run(["sh", "-c", "kill -TERM $$"], RunOpts::new()).unwrap();
        assert_eq!(result.code, -15);
    }
}
