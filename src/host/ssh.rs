//! Ssh backend: a persistent session per host with exec and file transfer.

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use ssh2::Session;
use std::cell::RefCell;
use std::fs::File;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::run::Secret;

/// Connection parameters for one remote host.
#[derive(Debug, Clone)]
pub(crate) struct SshConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<Secret>,
    pub(crate) key_file: Option<PathBuf>,
    pub(crate) key_passphrase: Option<Secret>,
    pub(crate) connect_timeout: Duration,
    pub(crate) auth_timeout: Duration,
    pub(crate) sudo_password: Option<Secret>,
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            host: String::new(),
            port: 22,
            user: None,
            password: None,
            key_file: None,
            key_passphrase: None,
            connect_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(60),
            sudo_password: None,
        }
    }
}

/// A lazily-connected ssh session. The connection is established on first
/// use and kept for the lifetime of the host.
pub(crate) struct SshSession {
    config: SshConfig,
    session: RefCell<Option<Session>>,
}

impl SshSession {
    pub(crate) fn new(config: SshConfig) -> Self {
        SshSession {
            config,
            session: RefCell::new(None),
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.config.host
    }

    pub(crate) fn user(&self) -> String {
        self.config
            .user
            .clone()
            .unwrap_or_else(whoami::username)
    }

    pub(crate) fn sudo_password(&self) -> Option<Secret> {
        self.config.sudo_password.clone()
    }

    fn connect(&self) -> Result<Session> {
        let cfg = &self.config;
        debug!(host = %cfg.host, port = cfg.port, "connecting");

        let addr = (cfg.host.as_str(), cfg.port)
            .to_socket_addrs()
            .wrap_err_with(|| format!("Failed to resolve {}:{}", cfg.host, cfg.port))?
            .next()
            .ok_or_else(|| eyre!("No address for {}:{}", cfg.host, cfg.port))?;
        let tcp = TcpStream::connect_timeout(&addr, cfg.connect_timeout)
            .wrap_err_with(|| format!("Failed to connect to {addr}"))?;

        let mut session = Session::new().wrap_err("Failed to create ssh session")?;
        session.set_tcp_stream(tcp);
        session.set_timeout(cfg.auth_timeout.as_millis() as u32);
        session
            .handshake()
            .wrap_err_with(|| format!("Ssh handshake with {} failed", cfg.host))?;

        let user = self.user();
        if let Some(key_file) = &cfg.key_file {
            session
                .userauth_pubkey_file(
                    &user,
                    None,
                    key_file,
                    cfg.key_passphrase.as_ref().map(Secret::reveal),
                )
                .wrap_err_with(|| {
                    format!("Key authentication for {user}@{} failed", cfg.host)
                })?;
        } else if let Some(password) = &cfg.password {
            session
                .userauth_password(&user, password.reveal())
                .wrap_err_with(|| {
                    format!("Password authentication for {user}@{} failed", cfg.host)
                })?;
        } else {
            session.userauth_agent(&user).wrap_err_with(|| {
                format!("Agent authentication for {user}@{} failed", cfg.host)
            })?;
        }

        // Commands may run arbitrarily long; only connect/auth are bounded.
        session.set_timeout(0);
        debug!(host = %cfg.host, user = %user, "connected");
        Ok(session)
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let mut slot = self.session.borrow_mut();
        if slot.is_none() {
            *slot = Some(self.connect()?);
        }
        f(slot.as_ref().ok_or_else(|| eyre!("Ssh session lost"))?)
    }

    /// Runs one shell line remotely; optional bytes are fed to the channel's
    /// stdin first (used for `sudo -S` password delivery).
    pub(crate) fn exec(
        &self,
        line: &str,
        stdin: Option<&[u8]>,
    ) -> Result<(i32, String, String)> {
        self.with_session(|session| {
            debug!(host = %self.config.host, cmd = %line, "exec");
            let mut channel = session
                .channel_session()
                .wrap_err("Failed to open ssh channel")?;
            channel.exec(line).wrap_err("Failed to exec over ssh")?;

            if let Some(data) = stdin {
                channel
                    .write_all(data)
                    .wrap_err("Failed to write channel stdin")?;
            }
            channel.send_eof().wrap_err("Failed to close channel stdin")?;

            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .wrap_err("Failed to read remote stdout")?;
            let mut stderr = String::new();
            channel
                .stderr()
                .read_to_string(&mut stderr)
                .wrap_err("Failed to read remote stderr")?;

            channel.wait_close().wrap_err("Failed to close channel")?;
            let code = channel.exit_status().wrap_err("No remote exit status")?;
            Ok((code, stdout, stderr))
        })
    }

    /// Uploads a local file to a remote path the session user can write.
    pub(crate) fn put_file(&self, src: &Path, dst: &str) -> Result<()> {
        self.with_session(|session| {
            debug!(host = %self.config.host, src = %src.display(), dst = %dst, "put");
            let mut local = File::open(src)
                .wrap_err_with(|| format!("Failed to open {}", src.display()))?;
            let size = local
                .metadata()
                .wrap_err_with(|| format!("Failed to stat {}", src.display()))?
                .len();
            let mut remote = session
                .scp_send(Path::new(dst), 0o644, size, None)
                .wrap_err_with(|| format!("Failed to start upload to {dst}"))?;
            std::io::copy(&mut local, &mut remote)
                .wrap_err_with(|| format!("Failed to upload {}", src.display()))?;
            remote.send_eof().wrap_err("Failed to finish upload")?;
            remote.wait_eof().wrap_err("Failed to finish upload")?;
            remote.close().wrap_err("Failed to close upload channel")?;
            remote.wait_close().wrap_err("Failed to close upload channel")?;
            Ok(())
        })
    }

    /// Downloads a remote file readable by the session user.
    pub(crate) fn get_file(&self, src: &str, dst: &Path) -> Result<()> {
        self.with_session(|session| {
            debug!(host = %self.config.host, src = %src, dst = %dst.display(), "get");
            let (mut remote, _stat) = session
                .scp_recv(Path::new(src))
                .wrap_err_with(|| format!("Failed to start download of {src}"))?;
            let mut local = File::create(dst)
                .wrap_err_with(|| format!("Failed to create {}", dst.display()))?;
            std::io::copy(&mut remote, &mut local)
                .wrap_err_with(|| format!("Failed to download {src}"))?;
            Ok(())
        })
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.config.user)
            .field("connected", &self.session.borrow().is_some())
            .finish()
    }
}
