//! Package management across host families.
//!
//! [`PackageManagers`] is a lazy multiplexer: the OS-level manager (Debian
//! or RedHat, picked by probing the host) and the Python manager are only
//! constructed when first used. All managers cache the installed-package
//! map; anything that changes the installed set drops the cache.

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::host::{Host, OsFamily};
use crate::run::RunOpts;

/// Python interpreters probed for the pip backend, in preference order.
pub(crate) const PYTHON_CANDIDATES: &[&str] = &["python3.7", "python3.6", "python3"];

/// Lazy access to a host's package managers.
pub(crate) struct PackageManagers<'h> {
    host: &'h Host,
    os: Option<OsManager<'h>>,
    pip: Option<PipManager<'h>>,
}

impl<'h> PackageManagers<'h> {
    pub(crate) fn new(host: &'h Host) -> Self {
        PackageManagers {
            host,
            os: None,
            pip: None,
        }
    }

    /// The OS-level manager, constructed on first use.
    pub(crate) fn os(&mut self) -> Result<&mut OsManager<'h>> {
        if self.os.is_none() {
            self.os = Some(OsManager::new(self.host)?);
        }
        Ok(self.os.as_mut().expect("just initialized"))
    }

    /// The pip manager, constructed on first use.
    pub(crate) fn pip(&mut self) -> Result<&mut PipManager<'h>> {
        if self.pip.is_none() {
            self.pip = Some(PipManager::new(self.host, PYTHON_CANDIDATES)?);
        }
        Ok(self.pip.as_mut().expect("just initialized"))
    }
}

// -------------------------------------------------------------------------------------------------
// OS packages
// -------------------------------------------------------------------------------------------------

/// Debian or RedHat package operations on one host.
pub(crate) struct OsManager<'h> {
    host: &'h Host,
    family: OsFamily,
    installed: Option<BTreeMap<String, String>>,
}

impl<'h> OsManager<'h> {
    fn new(host: &'h Host) -> Result<Self> {
        Ok(OsManager {
            host,
            family: host.os_family()?,
            installed: None,
        })
    }

    pub(crate) fn family(&self) -> OsFamily {
        self.family
    }

    fn installed_map(&mut self) -> Result<&BTreeMap<String, String>> {
        if self.installed.is_none() {
            let query = match self.family {
                OsFamily::Debian => r"dpkg-query -W -f='${binary:Package}|${Version}&'",
                OsFamily::RedHat => r"rpm -qa --queryformat '%{NAME}|%{VERSION}&'",
            };
            let raw = self
                .host
                .stdout_of(query)
                .wrap_err("Failed to list installed packages")?;
            let map = parse_package_list(&raw);
            debug!(count = map.len(), family = %self.family, "cached installed packages");
            self.installed = Some(map);
        }
        Ok(self.installed.as_ref().expect("just cached"))
    }

    fn invalidate(&mut self) {
        self.installed = None;
    }

    pub(crate) fn contains(&mut self, package: &str) -> Result<bool> {
        Ok(self.installed_map()?.contains_key(package))
    }

    pub(crate) fn version_of(&mut self, package: &str) -> Result<Option<String>> {
        Ok(self.installed_map()?.get(package).cloned())
    }

    /// True when every named package is installed.
    pub(crate) fn installed(&mut self, packages: &[String]) -> Result<bool> {
        let map = self.installed_map()?;
        Ok(packages.iter().all(|p| map.contains_key(p)))
    }

    pub(crate) fn install(&mut self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let list = quote_all(packages);
        match self.family {
            OsFamily::Debian => {
                self.host
                    .run_with(
                        &format!("apt-get install -y {list}"),
                        RunOpts::new().with_env(noninteractive_env()),
                    )
                    .wrap_err("apt-get install failed")?;
            }
            OsFamily::RedHat => {
                self.host
                    .run(&format!("yum install -y {list}"))
                    .wrap_err("yum install failed")?;
            }
        }
        self.invalidate();
        Ok(())
    }

    /// Installs packages straight from URLs.
    pub(crate) fn install_url(&mut self, urls: &[String]) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }
        match self.family {
            OsFamily::RedHat => {
                self.host
                    .run(&format!("yum install -y {}", quote_all(urls)))
                    .wrap_err("yum install from url failed")?;
            }
            OsFamily::Debian => {
                // apt installs local archives, so stage the downloads first.
                let host = self.host;
                for url in urls {
                    host.with_tempdir(|tmp| {
                        let archive = format!("{tmp}/package.deb");
                        host.wget(url, &archive, None)?;
                        host.run_with(
                            &format!("apt-get install -y {}", shell_quote(&archive)),
                            RunOpts::new().with_env(noninteractive_env()),
                        )
                        .wrap_err_with(|| format!("apt-get install of {url} failed"))?;
                        Ok(())
                    })?;
                }
            }
        }
        self.invalidate();
        Ok(())
    }

    pub(crate) fn remove(&mut self, packages: &[String], purge: bool) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        let list = quote_all(packages);
        match self.family {
            OsFamily::Debian => {
                let purge_flag = if purge { "--purge " } else { "" };
                self.host
                    .run_with(
                        &format!("apt-get remove -y {purge_flag}{list}"),
                        RunOpts::new().with_env(noninteractive_env()),
                    )
                    .wrap_err("apt-get remove failed")?;
            }
            OsFamily::RedHat => {
                self.host
                    .run(&format!("yum remove -y {list}"))
                    .wrap_err("yum remove failed")?;
            }
        }
        self.invalidate();
        Ok(())
    }

    /// Resynchronizes the package metadata; a no-op on RedHat.
    pub(crate) fn refresh(&mut self) -> Result<()> {
        if self.family == OsFamily::Debian {
            self.host
                .run_with(
                    "apt-get update",
                    RunOpts::new().with_env(noninteractive_env()),
                )
                .wrap_err("apt-get update failed")?;
        }
        self.invalidate();
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
// Python packages
// -------------------------------------------------------------------------------------------------

/// Pip operations through the host's preferred Python interpreter.
pub(crate) struct PipManager<'h> {
    host: &'h Host,
    python: String,
    installed: Option<BTreeMap<String, String>>,
}

impl<'h> PipManager<'h> {
    fn new(host: &'h Host, candidates: &[&str]) -> Result<Self> {
        let Some(python) = host.which_of(candidates)? else {
            bail!(
                "No python interpreter found on host {} (tried {})",
                host.name(),
                candidates.join(", ")
            );
        };
        Ok(PipManager {
            host,
            python,
            installed: None,
        })
    }

    fn installed_map(&mut self) -> Result<&BTreeMap<String, String>> {
        if self.installed.is_none() {
            let raw = self
                .host
                .stdout_of(&format!("{} -m pip list --format json", self.python))
                .wrap_err("pip list failed")?;
            self.installed = Some(parse_pip_json(&raw)?);
        }
        Ok(self.installed.as_ref().expect("just cached"))
    }

    fn invalidate(&mut self) {
        self.installed = None;
    }

    pub(crate) fn contains(&mut self, package: &str) -> Result<bool> {
        Ok(self.installed_map()?.contains_key(package))
    }

    pub(crate) fn installed(&mut self, packages: &[String]) -> Result<bool> {
        let map = self.installed_map()?;
        Ok(packages.iter().all(|p| map.contains_key(p)))
    }

    pub(crate) fn install(&mut self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.host
            .run(&format!(
                "{} -m pip install {}",
                self.python,
                quote_all(packages)
            ))
            .wrap_err("pip install failed")?;
        self.invalidate();
        Ok(())
    }

    /// Pip treats URLs like any other requirement.
    pub(crate) fn install_url(&mut self, urls: &[String]) -> Result<()> {
        self.install(urls)
    }

    pub(crate) fn remove(&mut self, packages: &[String], _purge: bool) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.host
            .run(&format!(
                "{} -m pip uninstall -y {}",
                self.python,
                quote_all(packages)
            ))
            .wrap_err("pip uninstall failed")?;
        self.invalidate();
        Ok(())
    }

    pub(crate) fn refresh(&mut self) -> Result<()> {
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
// Parsing helpers
// -------------------------------------------------------------------------------------------------

fn noninteractive_env() -> BTreeMap<String, String> {
    [(
        "DEBIAN_FRONTEND".to_string(),
        "noninteractive".to_string(),
    )]
    .into()
}

fn shell_quote(value: &str) -> String {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn quote_all(values: &[String]) -> String {
    values
        .iter()
        .map(|v| shell_quote(v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses the `name|version&name|version&` listings produced by dpkg-query
/// and rpm.
pub(crate) fn parse_package_list(raw: &str) -> BTreeMap<String, String> {
    raw.trim_end_matches('&')
        .split('&')
        .filter_map(|entry| {
            let (name, version) = entry.split_once('|')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), version.to_string()))
        })
        .collect()
}

/// Parses `pip list --format json` output.
pub(crate) fn parse_pip_json(raw: &str) -> Result<BTreeMap<String, String>> {
    #[derive(Deserialize)]
    struct PipEntry {
        name: String,
        version: String,
    }

    let entries: Vec<PipEntry> =
        serde_json::from_str(raw).wrap_err("Malformed pip list output")?;
    Ok(entries
        .into_iter()
        .map(|e| (e.name, e.version))
        .collect())
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dpkg_style_listing() {
        let raw = "bash|5.1-2&coreutils|8.32-4.1&libc6|2.31-13&";
        let map = parse_package_list(raw);
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("bash").map(String::as_str), Some("5.1-2"));
        assert_eq!(map.get("libc6").map(String::as_str), Some("2.31-13"));
        assert!(!map.contains_key("vim"));
    }

    #[test]
    fn test_parse_rpm_style_listing() {
        let raw = "bash|5.1.8&glibc|2.34&";
        let map = parse_package_list(raw);
        assert_eq!(map.get("glibc").map(String::as_str), Some("2.34"));
    }

    #[test]
    fn test_parse_empty_listing() {
        assert!(parse_package_list("").is_empty());
        assert!(parse_package_list("&").is_empty());
    }

    #[test]
    fn test_parse_version_with_extra_separator() {
        // Only the first separator splits; the rest stays in the version.
        let map = parse_package_list("weird|1:2.0|x&");
        assert_eq!(map.get("weird").map(String::as_str), Some("1:2.0|x"));
    }

    #[test]
    fn test_parse_pip_json() {
        let raw = r#"[{"name": "requests", "version": "2.31.0"},
                      {"name": "pyyaml", "version": "6.0"}]"#;
        let map = parse_pip_json(raw).unwrap();
        assert_eq!(map.get("requests").map(String::as_str), Some("2.31.0"));
        assert_eq!(map.get("pyyaml").map(String::as_str), Some("6.0"));
    }

    #[test]
    fn test_parse_pip_json_rejects_garbage() {
        assert!(parse_pip_json("not json").is_err());
    }

    #[test]
    fn test_quote_all_protects_specifiers() {
        let quoted = quote_all(&["requests>=2.0".to_string()]);
        assert_eq!(quoted, "'requests>=2.0'");
    }
}
