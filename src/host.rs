//! Host abstraction.
//!
//! A [`Host`] offers one operations surface — command invocation, file
//! predicates and mutators, content transfer, downloads, introspection —
//! backed either by local fork/exec or by a persistent ssh session. Every
//! operation is issued as a shell line with quoted filenames, so local and
//! remote behavior stay identical.
//!
//! Privilege elevation is scoped: inside `host.sudo(..)` every call runs
//! elevated (the local backend switches the process runner into its sudo
//! mode, the ssh backend prepends a `sudo -S` wrapper fed through stdin),
//! and `host.nosudo()` suspends it again.

pub(crate) mod ssh;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::run::{self, RunError, RunOpts, RunResult, Secret, SudoOpts};
use ssh::{SshConfig, SshSession};

/// Operating system family of a host, as detected from its package tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OsFamily {
    Debian,
    RedHat,
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsFamily::Debian => f.write_str("Debian"),
            OsFamily::RedHat => f.write_str("RedHat"),
        }
    }
}

#[derive(Debug, Clone)]
struct PrivilegeState {
    use_sudo: bool,
    sudo_user: Option<String>,
    sudo_login: bool,
}

impl Default for PrivilegeState {
    fn default() -> Self {
        PrivilegeState {
            use_sudo: false,
            sudo_user: None,
            sudo_login: true,
        }
    }
}

#[derive(Debug)]
enum Backend {
    Local { sudo_password: Option<Secret> },
    Ssh(SshSession),
}

/// One deployment target.
#[derive(Debug)]
pub(crate) struct Host {
    name: String,
    host: String,
    privilege: RefCell<PrivilegeState>,
    backend: Backend,
}

/// Restores the previous privilege state when dropped.
pub(crate) struct PrivilegeScope<'h> {
    host: &'h Host,
    saved: PrivilegeState,
}

impl Drop for PrivilegeScope<'_> {
    fn drop(&mut self) {
        *self.host.privilege.borrow_mut() = self.saved.clone();
    }
}

/// Shell-quotes one token.
fn q(value: &str) -> String {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Hex sha256 of a byte slice, for download verification.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl Host {
    // ---------------------------------------------------------------------------------------------
    // Construction and identity
    // ---------------------------------------------------------------------------------------------

    /// A host backed by local fork/exec.
    pub(crate) fn local<S: Into<String>>(name: Option<S>) -> Host {
        let host = "localhost".to_string();
        Host {
            name: name.map(Into::into).unwrap_or_else(|| host.clone()),
            host,
            privilege: RefCell::new(PrivilegeState::default()),
            backend: Backend::Local {
                sudo_password: None,
            },
        }
    }

    /// A host backed by a persistent ssh session.
    pub(crate) fn ssh<S: Into<String>>(name: Option<S>, config: SshConfig) -> Host {
        let host = config.host.clone();
        Host {
            name: name.map(Into::into).unwrap_or_else(|| host.clone()),
            host,
            privilege: RefCell::new(PrivilegeState::default()),
            backend: Backend::Ssh(SshSession::new(config)),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn address(&self) -> &str {
        &self.host
    }

    pub(crate) fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local { .. })
    }

    /// Makes privilege elevation the default for this host.
    pub(crate) fn enable_sudo(&self, user: Option<String>, login: bool) {
        let mut state = self.privilege.borrow_mut();
        state.use_sudo = true;
        state.sudo_user = user;
        state.sudo_login = login;
    }

    /// Sets the password used by the local sudo helper.
    pub(crate) fn set_sudo_password(&mut self, password: Secret) {
        if let Backend::Local { sudo_password } = &mut self.backend {
            *sudo_password = Some(password);
        }
    }

    pub(crate) fn has_sudo_password(&self) -> bool {
        match &self.backend {
            Backend::Local { sudo_password } => sudo_password.is_some(),
            Backend::Ssh(session) => session.sudo_password().is_some(),
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Privilege scopes
    // ---------------------------------------------------------------------------------------------

    /// Elevates every call inside the returned scope.
    pub(crate) fn sudo(&self, user: Option<&str>, login: bool) -> PrivilegeScope<'_> {
        let saved = self.privilege.borrow().clone();
        {
            let mut state = self.privilege.borrow_mut();
            state.use_sudo = true;
            state.sudo_user = user.map(str::to_string);
            state.sudo_login = login;
        }
        PrivilegeScope { host: self, saved }
    }

    /// Suspends privilege elevation inside the returned scope.
    pub(crate) fn nosudo(&self) -> PrivilegeScope<'_> {
        let saved = self.privilege.borrow().clone();
        self.privilege.borrow_mut().use_sudo = false;
        PrivilegeScope { host: self, saved }
    }

    // ---------------------------------------------------------------------------------------------
    // Command invocation
    // ---------------------------------------------------------------------------------------------

    /// Runs a shell line on the host, enforcing exit code 0.
    pub(crate) fn run(&self, cmd: &str) -> Result<RunResult, RunError> {
        self.run_with(cmd, RunOpts::new())
    }

    /// Runs a shell line with explicit options.
    pub(crate) fn run_with(&self, cmd: &str, opts: RunOpts) -> Result<RunResult, RunError> {
        match &self.backend {
            Backend::Local { sudo_password } => {
                let state = self.privilege.borrow().clone();
                let mut opts = opts.with_shell(true);
                if state.use_sudo {
                    opts = opts.with_sudo(SudoOpts {
                        user: state.sudo_user.clone(),
                        group: None,
                        password: sudo_password.clone(),
                        login: state.sudo_login,
                        timeout: None,
                    });
                }
                run::run(cmd, opts)
            }
            Backend::Ssh(session) => self.run_ssh(session, cmd, opts),
        }
    }

    fn run_ssh(
        &self,
        session: &SshSession,
        cmd: &str,
        opts: RunOpts,
    ) -> Result<RunResult, RunError> {
        let enforce = opts.enforce.unwrap_or(true);
        let enforce_code = opts.enforce_code.unwrap_or(0);
        let env = opts.env.unwrap_or_default();
        let state = self.privilege.borrow().clone();

        // Environment assignments ride inside the remote line so they apply
        // on the far side of the connection.
        let mut inner = cmd.to_string();
        if !env.is_empty() {
            let exports = env
                .iter()
                .map(|(k, v)| format!("{}={}", k, q(v)))
                .collect::<Vec<_>>()
                .join(" ");
            inner = format!("export {exports}; {inner}");
        }

        let (line, stdin) = if state.use_sudo {
            let mut sudo = vec!["sudo".to_string(), "-S".to_string(), "-p".to_string(),
                "''".to_string()];
            if state.sudo_login {
                sudo.push("-i".to_string());
            }
            if let Some(user) = &state.sudo_user {
                sudo.push("-u".to_string());
                sudo.push(user.clone());
            }
            sudo.push("/bin/sh".to_string());
            sudo.push("-c".to_string());
            sudo.push(q(&inner));
            let stdin = session
                .sudo_password()
                .map(|p| format!("{}\n", p.reveal()).into_bytes());
            (sudo.join(" "), stdin)
        } else {
            (inner, None)
        };

        let (code, stdout, stderr) = session
            .exec(&line, stdin.as_deref())
            .map_err(|e| RunError::Io {
                args: line.clone(),
                source: std::io::Error::other(format!("{e:#}")),
            })?;

        let result = RunResult {
            argv: shlex::split(&line).unwrap_or_default(),
            args: line,
            code,
            stdout,
            stderr,
        };
        if enforce && result.code != enforce_code {
            return Err(RunError::Enforce(Box::new(result)));
        }
        Ok(result)
    }

    /// True when the command exits zero. Never raises on a nonzero exit.
    pub(crate) fn zero(&self, cmd: &str) -> Result<bool, RunError> {
        Ok(self
            .run_with(cmd, RunOpts::new().with_enforce(false))?
            .success())
    }

    /// True when the command exits nonzero.
    pub(crate) fn nonzero(&self, cmd: &str) -> Result<bool, RunError> {
        Ok(!self.zero(cmd)?)
    }

    /// Captured stdout of an enforced run.
    pub(crate) fn stdout_of(&self, cmd: &str) -> Result<String, RunError> {
        Ok(self.run(cmd)?.stdout)
    }

    /// Captured stdout, split into lines.
    pub(crate) fn lines(&self, cmd: &str) -> Result<Vec<String>, RunError> {
        Ok(self
            .run(cmd)?
            .stdout
            .trim_end_matches('\n')
            .split('\n')
            .map(String::from)
            .collect())
    }

    // ---------------------------------------------------------------------------------------------
    // Predicates
    // ---------------------------------------------------------------------------------------------

    pub(crate) fn exists(&self, path: &str) -> Result<bool, RunError> {
        self.zero(&format!("test -e {}", q(path)))
    }

    pub(crate) fn isfile(&self, path: &str) -> Result<bool, RunError> {
        self.zero(&format!("test -f {}", q(path)))
    }

    pub(crate) fn isdir(&self, path: &str) -> Result<bool, RunError> {
        self.zero(&format!("test -d {}", q(path)))
    }

    pub(crate) fn islink(&self, path: &str) -> Result<bool, RunError> {
        self.zero(&format!("test -L {}", q(path)))
    }

    pub(crate) fn isfifo(&self, path: &str) -> Result<bool, RunError> {
        Ok(self
            .stdout_of(&format!("stat -c %F {}", q(path)))?
            .trim()
            == "fifo")
    }

    /// True when the octal mode of `path` equals `mode`.
    pub(crate) fn ismode(&self, path: &str, mode: u32) -> Result<bool, RunError> {
        let actual = self.stdout_of(&format!("stat -c %a {}", q(path)))?;
        Ok(actual.trim() == format!("{mode:o}"))
    }

    // ---------------------------------------------------------------------------------------------
    // Mutators
    // ---------------------------------------------------------------------------------------------

    pub(crate) fn cpf(&self, src: &str, dst: &str) -> Result<(), RunError> {
        self.run(&format!("cp -f {} {}", q(src), q(dst)))?;
        Ok(())
    }

    pub(crate) fn cprf(&self, src: &str, dst: &str) -> Result<(), RunError> {
        self.run(&format!("cp -rf {} {}", q(src), q(dst)))?;
        Ok(())
    }

    pub(crate) fn mvf(&self, src: &str, dst: &str) -> Result<(), RunError> {
        self.run(&format!("mv -f {} {}", q(src), q(dst)))?;
        Ok(())
    }

    pub(crate) fn rmf(&self, path: &str) -> Result<(), RunError> {
        self.run(&format!("rm -f {}", q(path)))?;
        Ok(())
    }

    pub(crate) fn rmrf(&self, path: &str) -> Result<(), RunError> {
        self.run(&format!("rm -rf {}", q(path)))?;
        Ok(())
    }

    pub(crate) fn ln(&self, src: &str, dst: &str) -> Result<(), RunError> {
        self.run(&format!("ln {} {}", q(src), q(dst)))?;
        Ok(())
    }

    pub(crate) fn lns(&self, src: &str, dst: &str) -> Result<(), RunError> {
        self.run(&format!("ln -s {} {}", q(src), q(dst)))?;
        Ok(())
    }

    pub(crate) fn chmod(&self, path: &str, mode: u32, recurse: bool) -> Result<(), RunError> {
        let flag = if recurse { "-R " } else { "" };
        self.run(&format!("chmod {}{:o} {}", flag, mode, q(path)))?;
        Ok(())
    }

    pub(crate) fn chown(&self, path: &str, spec: &str, recurse: bool) -> Result<(), RunError> {
        let flag = if recurse { "-R " } else { "" };
        self.run(&format!("chown {}{} {}", flag, q(spec), q(path)))?;
        Ok(())
    }

    pub(crate) fn chgrp(&self, path: &str, group: &str, recurse: bool) -> Result<(), RunError> {
        let flag = if recurse { "-R " } else { "" };
        self.run(&format!("chgrp {}{} {}", flag, q(group), q(path)))?;
        Ok(())
    }

    pub(crate) fn touch(&self, path: &str) -> Result<(), RunError> {
        self.run(&format!("touch {}", q(path)))?;
        Ok(())
    }

    pub(crate) fn mkdir(&self, dir: &str) -> Result<(), RunError> {
        if self.isdir(dir)? {
            return Ok(());
        }
        self.run(&format!("mkdir {}", q(dir)))?;
        Ok(())
    }

    pub(crate) fn mkdirp(&self, dir: &str) -> Result<(), RunError> {
        if self.isdir(dir)? {
            return Ok(());
        }
        self.run(&format!("mkdir -p {}", q(dir)))?;
        Ok(())
    }

    pub(crate) fn rmdir(&self, dir: &str) -> Result<(), RunError> {
        if !self.isdir(dir)? {
            return Ok(());
        }
        self.run(&format!("rmdir {}", q(dir)))?;
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Transfer
    // ---------------------------------------------------------------------------------------------

    /// Runs `f` with a fresh scratch directory on the host, removing it
    /// afterwards on every path.
    pub(crate) fn with_tempdir<T>(&self, f: impl FnOnce(&str) -> Result<T>) -> Result<T> {
        let out = self
            .run("mktemp -p /tmp -d fleetform.XXXXXXXXXXXX")
            .wrap_err("Failed to create host scratch directory")?;
        let path = out.stdout.trim().to_string();
        let result = f(&path);
        if let Err(e) = self.rmrf(&path) {
            warn!(path = %path, error = %e, "failed to remove host scratch directory");
        }
        result
    }

    /// Copies a local file onto the host at `dst`, under the active
    /// privilege.
    ///
    /// The remote path is reached through a scratch directory owned by the
    /// session user, so the transfer itself never needs elevated
    /// credentials and no root-owned intermediate is left behind.
    pub(crate) fn put(&self, src: &Path, dst: &str) -> Result<()> {
        match &self.backend {
            Backend::Local { .. } => {
                self.cpf(&src.to_string_lossy(), dst)
                    .wrap_err_with(|| format!("Failed to place {}", dst))?;
                Ok(())
            }
            Backend::Ssh(session) => {
                let user = {
                    let _plain = self.nosudo();
                    self.whoami()?
                };
                self.with_tempdir(|tmp| {
                    self.chown(tmp, &user, false)?;
                    let staged = format!("{}/{}", tmp, basename(dst));
                    session.put_file(src, &staged)?;
                    self.cpf(&staged, dst)?;
                    Ok(())
                })
                .wrap_err_with(|| format!("Failed to put {} -> {}", src.display(), dst))
            }
        }
    }

    /// Fetches a file from the host into the local path `dst`, under the
    /// active privilege.
    pub(crate) fn get(&self, src: &str, dst: &Path) -> Result<()> {
        match &self.backend {
            Backend::Local { .. } => {
                self.cpf(src, &dst.to_string_lossy())
                    .wrap_err_with(|| format!("Failed to fetch {}", src))?;
                Ok(())
            }
            Backend::Ssh(session) => {
                let user = {
                    let _plain = self.nosudo();
                    self.whoami()?
                };
                self.with_tempdir(|tmp| {
                    let staged = format!("{}/{}", tmp, basename(src));
                    self.cpf(src, &staged)?;
                    self.chown(tmp, &user, true)?;
                    session.get_file(&staged, dst)?;
                    Ok(())
                })
                .wrap_err_with(|| format!("Failed to get {} -> {}", src, dst.display()))
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Content
    // ---------------------------------------------------------------------------------------------

    /// Reads a host file as bytes.
    pub(crate) fn load(&self, path: &str) -> Result<Vec<u8>> {
        let staging = tempfile::tempdir().wrap_err("Failed to create staging directory")?;
        let local = staging.path().join(basename(path));
        self.get(path, &local)?;
        fs::read(&local).wrap_err_with(|| format!("Failed to read staged copy of {path}"))
    }

    /// Reads a host file as a string.
    pub(crate) fn loads(&self, path: &str) -> Result<String> {
        let staging = tempfile::tempdir().wrap_err("Failed to create staging directory")?;
        let local = staging.path().join(basename(path));
        self.get(path, &local)?;
        fs::read_to_string(&local)
            .wrap_err_with(|| format!("Failed to read staged copy of {path}"))
    }

    /// Writes bytes to a host file.
    pub(crate) fn dump(&self, path: &str, data: &[u8]) -> Result<()> {
        let staging = tempfile::tempdir().wrap_err("Failed to create staging directory")?;
        let local = staging.path().join(basename(path));
        fs::write(&local, data).wrap_err("Failed to stage content")?;
        self.put(&local, path)
    }

    /// Writes a string to a host file.
    pub(crate) fn dumps(&self, path: &str, data: &str) -> Result<()> {
        self.dump(path, data.as_bytes())
    }

    // ---------------------------------------------------------------------------------------------
    // Fetch
    // ---------------------------------------------------------------------------------------------

    /// Downloads `url` to `dst` on the host, optionally verifying a sha256
    /// checksum via the host's own tooling.
    pub(crate) fn wget(&self, url: &str, dst: &str, checksum: Option<&str>) -> Result<()> {
        self.run(&format!("curl -fsSL -o {} {}", q(dst), q(url)))
            .wrap_err_with(|| format!("Failed to download {url}"))?;
        if let Some(expected) = checksum {
            let out = self.stdout_of(&format!("sha256sum {}", q(dst)))?;
            let actual = out.split_whitespace().next().unwrap_or("").to_string();
            if actual != expected {
                self.rmf(dst)?;
                bail!("Checksum mismatch for {url}: expected {expected}, got {actual}");
            }
        }
        Ok(())
    }

    /// Downloads `url` and returns the bytes, verifying the checksum
    /// locally when given.
    pub(crate) fn wload(&self, url: &str, checksum: Option<&str>) -> Result<Vec<u8>> {
        let data = self.with_tempdir(|tmp| {
            let dst = format!("{tmp}/download");
            self.wget(url, &dst, None)?;
            self.load(&dst)
        })?;
        if let Some(expected) = checksum {
            let actual = sha256_hex(&data);
            if actual != expected {
                bail!("Checksum mismatch for {url}: expected {expected}, got {actual}");
            }
        }
        Ok(data)
    }

    /// Downloads `url` and returns the content as a string.
    pub(crate) fn wloads(&self, url: &str, checksum: Option<&str>) -> Result<String> {
        let data = self.wload(url, checksum)?;
        String::from_utf8(data).wrap_err_with(|| format!("{url} is not valid utf-8"))
    }

    // ---------------------------------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------------------------------

    pub(crate) fn whoami(&self) -> Result<String, RunError> {
        Ok(self.stdout_of("whoami")?.trim().to_string())
    }

    /// Directory entries of `path`, without `.` and `..`.
    pub(crate) fn ls(&self, path: &str) -> Result<Vec<String>, RunError> {
        let out = self.stdout_of(&format!(
            "/bin/ls -a --indicator-style=none {} | cat",
            q(path)
        ))?;
        Ok(out
            .lines()
            .filter(|entry| !entry.is_empty() && *entry != "." && *entry != "..")
            .map(String::from)
            .collect())
    }

    /// First of `names` found in the host's PATH.
    pub(crate) fn which_of(&self, names: &[&str]) -> Result<Option<String>, RunError> {
        let list = names.iter().map(|n| q(n)).collect::<Vec<_>>().join(" ");
        let result = self.run_with(
            &format!("which {list}"),
            RunOpts::new().with_enforce(false),
        )?;
        Ok(result
            .stdout
            .lines()
            .next()
            .filter(|line| !line.is_empty())
            .map(String::from))
    }

    pub(crate) fn hostname(&self) -> Result<String, RunError> {
        Ok(self.stdout_of("cat /etc/hostname")?.trim().to_string())
    }

    /// Name of the shell running the host's commands.
    pub(crate) fn shell_name(&self) -> Result<String, RunError> {
        Ok(self.stdout_of("echo $0")?.trim().to_string())
    }

    /// Detects the OS family from the available package tooling.
    pub(crate) fn os_family(&self) -> Result<OsFamily> {
        if self.which_of(&["apt-get", "apt"])?.is_some() {
            debug!(host = %self.name, "detected Debian family");
            return Ok(OsFamily::Debian);
        }
        if self.which_of(&["yum"])?.is_some() {
            debug!(host = %self.name, "detected RedHat family");
            return Ok(OsFamily::RedHat);
        }
        Err(eyre!("Unknown operating system on host {}", self.name))
    }
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tmppath(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_touch_and_predicates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let file = tmppath(&dir, "probe");

        assert!(!host.exists(&file)?);
        host.touch(&file)?;
        assert!(host.exists(&file)?);
        assert!(host.isfile(&file)?);
        assert!(!host.isdir(&file)?);
        assert!(!host.islink(&file)?);
        Ok(())
    }

    #[test]
    fn test_quoting_survives_spaces() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let file = tmppath(&dir, "with space.txt");

        host.touch(&file)?;
        assert!(host.isfile(&file)?);
        host.rmf(&file)?;
        assert!(!host.exists(&file)?);
        Ok(())
    }

    #[test]
    fn test_mkdirp_ls_rmdir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let nested = tmppath(&dir, "a/b/c");

        host.mkdirp(&nested)?;
        assert!(host.isdir(&nested)?);
        // Idempotent.
        host.mkdirp(&nested)?;

        host.touch(&format!("{nested}/one"))?;
        host.touch(&format!("{nested}/two"))?;
        let mut entries = host.ls(&nested)?;
        entries.sort();
        assert_eq!(entries, vec!["one", "two"]);

        host.rmf(&format!("{nested}/one"))?;
        host.rmf(&format!("{nested}/two"))?;
        host.rmdir(&nested)?;
        assert!(!host.isdir(&nested)?);
        Ok(())
    }

    #[test]
    fn test_symlink_and_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let target = tmppath(&dir, "target");
        let link = tmppath(&dir, "link");

        host.touch(&target)?;
        host.lns(&target, &link)?;
        assert!(host.islink(&link)?);

        host.chmod(&target, 0o640, false)?;
        assert!(host.ismode(&target, 0o640)?);
        assert!(!host.ismode(&target, 0o644)?);
        Ok(())
    }

    #[test]
    fn test_put_get_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let src = dir.path().join("src.bin");
        let remote = tmppath(&dir, "remote.bin");
        let back = dir.path().join("back.bin");

        fs::write(&src, b"round trip payload")?;
        host.put(&src, &remote)?;
        host.get(&remote, &back)?;
        assert_eq!(fs::read(&back)?, b"round trip payload");
        Ok(())
    }

    #[test]
    fn test_dumps_loads_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let path = tmppath(&dir, "content.txt");

        host.dumps(&path, "declarative state\n")?;
        assert_eq!(host.loads(&path)?, "declarative state\n");
        Ok(())
    }

    #[test]
    fn test_zero_nonzero() -> Result<()> {
        let host = Host::local(Some("t"));
        assert!(host.zero("true")?);
        assert!(host.nonzero("false")?);
        Ok(())
    }

    #[test]
    fn test_run_enforces_by_default() {
        let host = Host::local(Some("t"));
        let err = host.run("false").unwrap_err();
        assert!(matches!(err, RunError::Enforce(_)));
    }

    #[test]
    fn test_whoami_and_which() -> Result<()> {
        let host = Host::local(Some("t"));
        assert!(!host.whoami()?.is_empty());
        assert!(host.which_of(&["sh"])?.is_some());
        assert!(host.which_of(&["no-such-tool-xyzzy"])?.is_none());
        // First present name wins.
        let found = host.which_of(&["no-such-tool-xyzzy", "sh"])?;
        assert!(found.is_some_and(|p| p.ends_with("sh")));
        Ok(())
    }

    #[test]
    fn test_name_defaults_to_host() {
        let host = Host::local(None::<String>);
        assert_eq!(host.name(), "localhost");
        assert_eq!(host.address(), "localhost");
        assert!(host.is_local());
    }

    #[test]
    fn test_privilege_scopes_restore() {
        let host = Host::local(Some("t"));
        assert!(!host.privilege.borrow().use_sudo);
        {
            let _elevated = host.sudo(Some("root"), true);
            assert!(host.privilege.borrow().use_sudo);
            {
                let _plain = host.nosudo();
                assert!(!host.privilege.borrow().use_sudo);
                // The user override survives a nosudo scope.
                assert_eq!(
                    host.privilege.borrow().sudo_user.as_deref(),
                    Some("root")
                );
            }
            assert!(host.privilege.borrow().use_sudo);
        }
        assert!(!host.privilege.borrow().use_sudo);
    }

    #[test]
    fn test_with_tempdir_cleans_up() -> Result<()> {
        let host = Host::local(Some("t"));
        let mut kept = String::new();
        host.with_tempdir(|tmp| {
            kept = tmp.to_string();
            assert!(host.isdir(tmp)?);
            Ok(())
        })?;
        assert!(!host.exists(&kept)?);
        Ok(())
    }

    #[test]
    fn test_mvf_and_cprf() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let a = tmppath(&dir, "a");
        let b = tmppath(&dir, "b");
        let tree = tmppath(&dir, "tree");
        let copy = tmppath(&dir, "copy");

        host.dumps(&a, "payload")?;
        host.mvf(&a, &b)?;
        assert!(!host.exists(&a)?);
        assert_eq!(host.loads(&b)?, "payload");

        host.mkdirp(&format!("{tree}/sub"))?;
        host.touch(&format!("{tree}/sub/leaf"))?;
        host.cprf(&tree, &copy)?;
        assert!(host.isfile(&format!("{copy}/sub/leaf"))?);
        Ok(())
    }

    #[test]
    fn test_lines_splits_stdout() -> Result<()> {
        let host = Host::local(Some("t"));
        let lines = host.lines("printf 'one\\ntwo\\n'")?;
        assert_eq!(lines, vec!["one", "two"]);
        Ok(())
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_ls_quoting_on_spaced_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("t"));
        let spaced = tmppath(&dir, "spaced dir");
        host.mkdirp(&spaced)?;
        host.touch(&format!("{spaced}/inner"))?;
        assert_eq!(host.ls(&spaced)?, vec!["inner"]);
        Ok(())
    }
}
