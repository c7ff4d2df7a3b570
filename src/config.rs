//! Fleet manifests.
//!
//! A fleet manifest is a TOML file naming the target hosts and the
//! deployment options. Hosts addressed as `localhost` (or a loopback
//! address) get the local backend; everything else gets ssh. Credentials
//! are never written into the manifest itself — entries name environment
//! variables instead.
//!
//! ```toml
//! workers = 4
//! synchronize = true
//! fail_early = true
//!
//! [[hosts]]
//! name = "web1"
//! host = "10.20.0.11"
//! user = "deploy"
//! key_file = "~/.ssh/id_ed25519"
//! sudo = true
//! sudo_password_env = "FLEET_SUDO_PW"
//! ```

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

use crate::host::Host;
use crate::host::ssh::SshConfig;
use crate::run::Secret;

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    60
}

/// One `[[hosts]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HostDecl {
    /// Display name; defaults to the address.
    pub(crate) name: Option<String>,
    /// Address to reach the host at. Loopback names select the local
    /// backend.
    pub(crate) host: String,
    #[serde(default = "default_port")]
    pub(crate) port: u16,
    pub(crate) user: Option<String>,
    /// Private key path; `~` and environment variables are expanded.
    pub(crate) key_file: Option<String>,
    /// Environment variable holding the key passphrase.
    pub(crate) key_passphrase_env: Option<String>,
    /// Environment variable holding the login password.
    pub(crate) password_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub(crate) connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub(crate) auth_timeout_secs: u64,
    /// Run every operation on this host with privilege elevation.
    #[serde(default)]
    pub(crate) sudo: bool,
    pub(crate) sudo_user: Option<String>,
    #[serde(default = "default_true")]
    pub(crate) sudo_login: bool,
    /// Environment variable holding the sudo password.
    pub(crate) sudo_password_env: Option<String>,
}

/// The parsed fleet manifest.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FleetFile {
    pub(crate) workers: Option<usize>,
    #[serde(default = "default_true")]
    pub(crate) synchronize: bool,
    #[serde(default = "default_true")]
    pub(crate) fail_early: bool,
    pub(crate) hosts: Vec<HostDecl>,
}

impl FleetFile {
    pub(crate) fn from_toml_str(raw: &str) -> Result<FleetFile> {
        toml::from_str(raw).wrap_err("Malformed fleet manifest")
    }

    pub(crate) fn load(path: &Path) -> Result<FleetFile> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read fleet manifest {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// The implicit single-host fleet used when no manifest is given.
    pub(crate) fn localhost() -> FleetFile {
        FleetFile {
            workers: Some(1),
            synchronize: true,
            fail_early: true,
            hosts: vec![HostDecl {
                name: Some(local_hostname()),
                host: "localhost".to_string(),
                port: default_port(),
                user: None,
                key_file: None,
                key_passphrase_env: None,
                password_env: None,
                connect_timeout_secs: default_timeout_secs(),
                auth_timeout_secs: default_timeout_secs(),
                sudo: false,
                sudo_user: None,
                sudo_login: true,
                sudo_password_env: None,
            }],
        }
    }

    /// Materializes the declared hosts, resolving credentials from the
    /// environment. `fallback_sudo_password` backs any sudo-enabled host
    /// without its own `sudo_password_env`.
    pub(crate) fn build_hosts(
        &self,
        fallback_sudo_password: Option<&Secret>,
    ) -> Result<Vec<Host>> {
        self.hosts
            .iter()
            .map(|decl| decl.build(fallback_sudo_password))
            .collect()
    }
}

impl HostDecl {
    fn build(&self, fallback_sudo_password: Option<&Secret>) -> Result<Host> {
        let sudo_password = match &self.sudo_password_env {
            Some(var) => Some(env_secret(var)?),
            None => fallback_sudo_password.cloned(),
        };

        let host = if is_loopback(&self.host) {
            let mut host = Host::local(self.name.as_deref());
            if let Some(password) = sudo_password {
                host.set_sudo_password(password);
            }
            host
        } else {
            let config = SshConfig {
                host: self.host.clone(),
                port: self.port,
                user: self.user.clone(),
                password: self
                    .password_env
                    .as_deref()
                    .map(env_secret)
                    .transpose()?,
                key_file: self
                    .key_file
                    .as_deref()
                    .map(expand_path)
                    .transpose()?,
                key_passphrase: self
                    .key_passphrase_env
                    .as_deref()
                    .map(env_secret)
                    .transpose()?,
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                auth_timeout: Duration::from_secs(self.auth_timeout_secs),
                sudo_password,
            };
            Host::ssh(self.name.as_deref(), config)
        };

        if self.sudo {
            host.enable_sudo(self.sudo_user.clone(), self.sudo_login);
        }
        debug!(name = host.name(), address = host.address(), local = host.is_local(),
               "declared host");
        Ok(host)
    }
}

/// Addresses that select the local backend.
fn is_loopback(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "local")
}

fn env_secret(var: &str) -> Result<Secret> {
    std::env::var(var)
        .map(Secret::new)
        .map_err(|_| eyre!("Environment variable {var} is not set"))
}

/// Expands `~` and environment variables in a manifest path.
fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(path)
        .map_err(|e| eyre!("Failed to expand path {path}: {e}"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// This machine's hostname, used to name the implicit local host.
pub(crate) fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(e) => {
            error!("Could not determine hostname, defaulting to 'localhost': {e}");
            "localhost".to_string()
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------
