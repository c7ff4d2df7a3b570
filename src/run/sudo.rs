//! Password delivery for `sudo -A` through a private askpass hook.
//!
//! `sudo(1)` refuses to read a password from a pipe on stdin; with `-A` it
//! instead executes the program named by `SUDO_ASKPASS`. The helper below
//! drives that hook from the unprivileged parent without ever putting the
//! password on a command line or in a persistent file:
//!
//! 1. A scratch directory (mode 0700) is created with three entries:
//!    `askpass` (a 0700 script that re-executes this binary's `askpass`
//!    subcommand), `pipe` (a named FIFO) and, eventually, `ok`.
//! 2. The elevated command is spawned as
//!    `sudo -A ... <shell> -c "touch <ok> && exec <command>"` with
//!    `SUDO_ASKPASS` pointing at the script. The `touch` is the success
//!    signal: `ok` can only appear once sudo has authenticated.
//! 3. The parent pushes the password into the FIFO with non-blocking
//!    writes. `ENXIO`/`EAGAIN` are expected while sudo has not started the
//!    askpass program yet. The `ok` sentinel is rechecked on every turn and
//!    is the only authoritative success signal; a completed FIFO write
//!    without `ok` still times out.
//!
//! The scratch directory is deleted as soon as delivery settles, unless
//! `FLEETFORM_SUDO_KEEP` is set for debugging.

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::run::context::{EffectiveOpts, StdinMode};
use crate::run::result::RunError;
use crate::run::runner::default_shell;

/// Poll pause while waiting on the FIFO and the ok sentinel.
pub(crate) const SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Keep-scratch-directory debug switch.
const KEEP_ENV: &str = "FLEETFORM_SUDO_KEEP";

/// Spawns `command` elevated through sudo and returns the child with piped
/// stdout/stderr, ready for the regular stream plumbing.
///
/// `command` is a single shell line; it runs under `<shell> -c` together
/// with the sentinel touch.
pub(crate) fn popen(command: &str, eff: &EffectiveOpts) -> Result<Child, RunError> {
    which::which("sudo").map_err(|_| RunError::Spawn {
        args: command.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "sudo not found in PATH"),
    })?;

    let scratch = Scratch::create(command)?;
    let sudo_argv = sudo_argv(command, &scratch, eff);
    let args = shlex::try_join(sudo_argv.iter().map(String::as_str))
        .map_err(|_| RunError::Parse {
            args: command.to_string(),
        })?;
    debug!(cmd = %args, "spawning elevated process");

    let mut cmd = Command::new(&sudo_argv[0]);
    cmd.args(&sudo_argv[1..]);
    if eff.env_replace {
        cmd.env_clear();
    }
    cmd.envs(&eff.env);
    cmd.env("SUDO_ASKPASS", &scratch.askpass);
    if let Some(cwd) = &eff.cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(match eff.stdin {
        StdinMode::Inherit => Stdio::inherit(),
        StdinMode::Null => Stdio::null(),
    });

    let mut child = cmd.spawn().map_err(|e| RunError::Spawn {
        args: args.clone(),
        source: e,
    })?;

    let password = eff.sudo_password.as_ref().map(|p| p.reveal().to_string());
    if let Err(e) = scratch.deliver(password.as_deref(), eff.sudo_timeout) {
        debug!(error = %e, "sudo password delivery failed, killing child");
        let _ = child.kill();
        let _ = child.wait();
        return Err(RunError::SudoTimeout { args });
    }
    Ok(child)
}

/// Builds the full sudo command line. The password never appears here.
fn sudo_argv(command: &str, scratch: &Scratch, eff: &EffectiveOpts) -> Vec<String> {
    let mut argv = vec!["sudo".to_string(), "-A".to_string()];
    if let Some(user) = &eff.sudo_user {
        argv.push("-u".to_string());
        argv.push(user.clone());
    }
    if let Some(group) = &eff.sudo_group {
        argv.push("-g".to_string());
        argv.push(group.clone());
    }
    if eff.sudo_login {
        argv.push("-i".to_string());
    }
    argv.push(default_shell());
    argv.push("-c".to_string());
    argv.push(format!(
        "touch {} && exec {}",
        quoted(&scratch.ok.to_string_lossy()),
        command
    ));
    argv
}

fn quoted(value: &str) -> String {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

// -------------------------------------------------------------------------------------------------
// Scratch directory
// -------------------------------------------------------------------------------------------------

/// Owner-only scratch holding the askpass script, the FIFO and the sentinel.
struct Scratch {
    dir: Option<tempfile::TempDir>,
    askpass: PathBuf,
    pipe: PathBuf,
    ok: PathBuf,
}

impl Scratch {
    fn create(command: &str) -> Result<Self, RunError> {
        let io_err = |source| RunError::Io {
            args: command.to_string(),
            source,
        };

        let dir = tempfile::Builder::new()
            .prefix("fleetform-sudo-")
            .tempdir()
            .map_err(io_err)?;
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700)).map_err(io_err)?;

        let askpass = dir.path().join("askpass");
        let pipe = dir.path().join("pipe");
        let ok = dir.path().join("ok");

        mkfifo(&pipe, Mode::from_bits_truncate(0o600))
            .map_err(|e| io_err(io::Error::from(e)))?;

        let exe = std::env::current_exe().map_err(io_err)?;
        let script = format!(
            "#!{}\nexec {} askpass {} {}\n",
            default_shell(),
            quoted(&exe.to_string_lossy()),
            quoted(&pipe.to_string_lossy()),
            SUDO_ASKPASS_READ_TIMEOUT.as_secs(),
        );
        fs::write(&askpass, script).map_err(io_err)?;
        fs::set_permissions(&askpass, fs::Permissions::from_mode(0o700)).map_err(io_err)?;

        Ok(Scratch {
            dir: Some(dir),
            askpass,
            pipe,
            ok,
        })
    }

    fn ok_exists(&self) -> bool {
        self.ok.is_file()
    }

    /// Pushes the password into the FIFO and waits for the ok sentinel.
    fn deliver(&self, password: Option<&str>, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "sudo sentinel never appeared");

        if let Some(password) = password {
            // Open the write end without blocking; ENXIO means the askpass
            // child has not opened the read end yet.
            let mut fifo = loop {
                if self.ok_exists() {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(timed_out());
                }
                match fs::OpenOptions::new()
                    .write(true)
                    .custom_flags(nix::libc::O_NONBLOCK)
                    .open(&self.pipe)
                {
                    Ok(file) => break file,
                    Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => {
                        thread::sleep(SLEEP_INTERVAL)
                    }
                    Err(e) => return Err(e),
                }
            };

            let bytes = password.as_bytes();
            let mut written = 0;
            while written < bytes.len() {
                if self.ok_exists() {
                    // An earlier attempt already satisfied sudo.
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(timed_out());
                }
                match fifo.write(&bytes[written..]) {
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(SLEEP_INTERVAL)
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        while !self.ok_exists() {
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            thread::sleep(SLEEP_INTERVAL);
        }
        Ok(())
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if std::env::var_os(KEEP_ENV).is_some() {
            if let Some(dir) = self.dir.take() {
                let kept = dir.keep();
                debug!(path = %kept.display(), "keeping sudo scratch directory");
            }
        }
        // Otherwise the TempDir removes itself.
    }
}

// -------------------------------------------------------------------------------------------------
// askpass subcommand
// -------------------------------------------------------------------------------------------------

/// How long the askpass child waits for the password to arrive.
const SUDO_ASKPASS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of the `askpass <fifo> <timeout>` subcommand.
///
/// Invoked by sudo as a short-lived child: reads the password from the FIFO,
/// writes it verbatim on stdout and exits 0. A self-timer exits 1 when
/// nothing arrives in the configured window.
pub(crate) fn askpass_main(fifo: &Path, timeout: Duration) -> ! {
    if !fifo.exists() {
        if let Err(e) = mkfifo(fifo, Mode::from_bits_truncate(0o600)) {
            eprintln!("askpass: cannot create fifo {}: {}", fifo.display(), e);
            std::process::exit(1);
        }
    }

    let fifo_display = fifo.display().to_string();
    thread::spawn(move || {
        thread::sleep(timeout);
        eprintln!("askpass: timed out reading password from fifo: {fifo_display}");
        std::process::exit(1);
    });

    match fs::read_to_string(fifo) {
        Ok(password) => {
            print!("{password}");
            let _ = io::stdout().flush();
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("askpass: failed to read fifo {}: {}", fifo.display(), e);
            std::process::exit(1);
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------
