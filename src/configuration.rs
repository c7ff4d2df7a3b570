//! Declarative configurations and their lifecycle.
//!
//! A [`Configuration`] declares the desired state of a host — packages,
//! directories, files, templates, symlinks — and exposes three operations:
//! `apply`, `delete` and `is_applied`. All three walk the same lifecycle:
//! park at the `ready` barrier, run any included sub-configurations, fire
//! the start hook, execute the declared steps (each inside a [`Task`] scope
//! that yields one uniform log line and counts changes), fire the finish
//! hook, park at `done`.
//!
//! Between steps the configuration calls `sync()`, which parks at the
//! `sync` barrier so parallel host workers advance in lockstep. A step
//! error cancels the coordinator (under fail-early) and unwinds as
//! [`OpError::Failed`]; an observed cancellation unwinds as
//! [`OpError::Cancelled`]. Both carry the change count accumulated so far.

use color_eyre::eyre::{Report, Result, WrapErr, bail, eyre};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::coordinator::{Coordinator, Phase};
use crate::host::Host;
use crate::packages::PackageManagers;
use crate::template;

/// Default `ready` barrier timeout.
pub(crate) const READY_TIMEOUT: Duration = Duration::from_secs(2);

fn default_name() -> String {
    "(name not set)".to_string()
}

fn default_true() -> bool {
    true
}

// -------------------------------------------------------------------------------------------------
// Desired state
// -------------------------------------------------------------------------------------------------

/// The declaration surface of a configuration. Lists are applied in
/// declaration order; deletion walks the reverse order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct DesiredState {
    pub(crate) name: String,
    /// Pairs of `(package name, archive url)`.
    pub(crate) os_package_urls: Vec<(String, String)>,
    pub(crate) os_packages: Vec<String>,
    pub(crate) python_packages: Vec<String>,
    pub(crate) directories: Vec<String>,
    /// Pairs of `(local source, host destination)`.
    pub(crate) files: Vec<(String, String)>,
    /// Pairs of `(asset key, host destination)`.
    pub(crate) assets: Vec<(String, String)>,
    pub(crate) template_files: Vec<(String, String)>,
    pub(crate) template_assets: Vec<(String, String)>,
    /// Pairs of `(link target, link path)`.
    pub(crate) symlinks: Vec<(String, String)>,
    pub(crate) template_env: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub(crate) keep_os_packages: bool,
    #[serde(default = "default_true")]
    pub(crate) keep_python_packages: bool,
    #[serde(default = "default_true")]
    pub(crate) keep_nonempty_dirs: bool,
}

impl Default for DesiredState {
    fn default() -> Self {
        DesiredState {
            name: default_name(),
            os_package_urls: Vec::new(),
            os_packages: Vec::new(),
            python_packages: Vec::new(),
            directories: Vec::new(),
            files: Vec::new(),
            assets: Vec::new(),
            template_files: Vec::new(),
            template_assets: Vec::new(),
            symlinks: Vec::new(),
            template_env: BTreeMap::new(),
            keep_os_packages: true,
            keep_python_packages: true,
            keep_nonempty_dirs: true,
        }
    }
}

impl DesiredState {
    /// Every OS package this state mentions, URL-installed ones included.
    fn all_os_packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = self
            .os_package_urls
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        packages.extend(self.os_packages.iter().cloned());
        packages
    }

    /// Every file or symlink destination this state places on a host.
    fn all_files(&self) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        files.extend(self.files.iter().map(|(_, dst)| dst.clone()));
        files.extend(self.assets.iter().map(|(_, dst)| dst.clone()));
        files.extend(self.template_files.iter().map(|(_, dst)| dst.clone()));
        files.extend(self.template_assets.iter().map(|(_, dst)| dst.clone()));
        files.extend(self.symlinks.iter().map(|(_, dst)| dst.clone()));
        files
    }
}

// -------------------------------------------------------------------------------------------------
// Collaborator traits
// -------------------------------------------------------------------------------------------------

/// Source of packaged assets referenced by `assets` / `template_assets`.
pub(crate) trait AssetSource: Send + Sync {
    fn load(&self, key: &str) -> Result<Vec<u8>>;

    fn loads(&self, key: &str) -> Result<String> {
        String::from_utf8(self.load(key)?).map_err(|_| eyre!("Asset {key} is not valid utf-8"))
    }
}

/// Directory-backed asset source.
pub(crate) struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub(crate) fn new<P: Into<PathBuf>>(root: P) -> Self {
        DirAssets { root: root.into() }
    }
}

impl AssetSource for DirAssets {
    fn load(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.root.join(key);
        fs::read(&path).wrap_err_with(|| format!("Failed to read asset {}", path.display()))
    }
}

/// Embedder extension points around each operation. All default to no-ops;
/// the engine's own progress logging happens regardless.
#[allow(unused_variables)]
pub(crate) trait Hooks: Send + Sync {
    fn on_apply_start(&self, host: &Host) -> Result<()> {
        Ok(())
    }
    fn on_apply_finish(&self, host: &Host) -> Result<()> {
        Ok(())
    }
    fn on_apply_error(&self, host: &Host) {}
    fn on_apply_cancel(&self, host: &Host) {}

    fn on_delete_start(&self, host: &Host) -> Result<()> {
        Ok(())
    }
    fn on_delete_finish(&self, host: &Host) -> Result<()> {
        Ok(())
    }
    fn on_delete_error(&self, host: &Host) {}
    fn on_delete_cancel(&self, host: &Host) {}

    fn on_is_applied_start(&self, host: &Host) -> Result<()> {
        Ok(())
    }
    fn on_is_applied_finish(&self, host: &Host) -> Result<()> {
        Ok(())
    }
    fn on_is_applied_error(&self, host: &Host) {}
    fn on_is_applied_cancel(&self, host: &Host) {}
}

// -------------------------------------------------------------------------------------------------
// Errors
// -------------------------------------------------------------------------------------------------

/// Marker raised when a wait observes coordinator cancellation.
#[derive(Debug, Error)]
#[error("configuration cancelled")]
pub(crate) struct Cancelled;

/// Terminal outcome of a failed operation, carrying the changes made
/// before the failure.
#[derive(Debug)]
pub(crate) enum OpError {
    Cancelled { changes: u64 },
    Failed { changes: u64, error: Report },
}

impl OpError {
    pub(crate) fn changes(&self) -> u64 {
        match self {
            OpError::Cancelled { changes } => *changes,
            OpError::Failed { changes, .. } => *changes,
        }
    }
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::Cancelled { changes } => {
                write!(f, "cancelled after {changes} changes")
            }
            OpError::Failed { changes, error } => {
                write!(f, "failed after {changes} changes: {error:#}")
            }
        }
    }
}

impl std::error::Error for OpError {}

// -------------------------------------------------------------------------------------------------
// Operations and tasks
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Apply,
    Delete,
    IsApplied,
}

impl Op {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Op::Apply => "apply",
            Op::Delete => "delete",
            Op::IsApplied => "is_applied",
        }
    }
}

/// Change accounting for one step. The surrounding scope emits the uniform
/// `(    ok)` / `(change)` / `( error)` line and folds the counter into the
/// configuration total.
pub(crate) struct Task {
    changes: u64,
}

impl Task {
    fn new() -> Self {
        Task { changes: 0 }
    }

    /// Records one change.
    pub(crate) fn change(&mut self) {
        self.changes += 1;
    }

    fn changed(&self) -> bool {
        self.changes > 0
    }
}

struct OpContext<'r> {
    host: &'r Host,
    coord: Option<&'r Arc<Coordinator>>,
    packages: PackageManagers<'r>,
}

/// Deregisters a root replica from the coordinator on scope exit.
struct Registration<'a>(Option<&'a Arc<Coordinator>>);

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Some(coord) = self.0 {
            coord.deregister();
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Configuration
// -------------------------------------------------------------------------------------------------

/// A desired-state unit plus its nested sub-configurations and runtime
/// accounting.
#[derive(Clone)]
pub(crate) struct Configuration {
    pub(crate) desired: DesiredState,
    /// Sub-configurations run before this one's own steps (after, in
    /// reverse order, on delete).
    pub(crate) include: Vec<Configuration>,
    pub(crate) hooks: Option<Arc<dyn Hooks>>,
    pub(crate) assets_source: Option<Arc<dyn AssetSource>>,
    pub(crate) ready_timeout: Duration,
    pub(crate) sync_timeout: Option<Duration>,
    pub(crate) done_timeout: Option<Duration>,
    changes: u64,
}

impl std::fmt::Debug for Configuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Configuration")
            .field("name", &self.desired.name)
            .field("include", &self.include.len())
            .field("changes", &self.changes)
            .finish()
    }
}

impl From<DesiredState> for Configuration {
    fn from(desired: DesiredState) -> Self {
        Configuration {
            desired,
            include: Vec::new(),
            hooks: None,
            assets_source: None,
            ready_timeout: READY_TIMEOUT,
            sync_timeout: None,
            done_timeout: None,
            changes: 0,
        }
    }
}

/// Serde shape of a configuration manifest: the desired-state surface plus
/// nested `[[include]]` blocks.
#[derive(Debug, Deserialize)]
struct ConfigurationDecl {
    #[serde(flatten)]
    desired: DesiredState,
    #[serde(default)]
    include: Vec<ConfigurationDecl>,
}

impl From<ConfigurationDecl> for Configuration {
    fn from(decl: ConfigurationDecl) -> Self {
        let mut config = Configuration::from(decl.desired);
        config.include = decl.include.into_iter().map(Configuration::from).collect();
        config
    }
}

impl Configuration {
    /// Parses a TOML configuration manifest.
    pub(crate) fn from_toml_str(raw: &str) -> Result<Configuration> {
        let decl: ConfigurationDecl =
            toml::from_str(raw).wrap_err("Malformed configuration manifest")?;
        Ok(decl.into())
    }

    /// Loads a TOML configuration manifest from disk.
    pub(crate) fn from_toml_file(path: &Path) -> Result<Configuration> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub(crate) fn name(&self) -> &str {
        &self.desired.name
    }

    /// Attaches an asset source to this configuration and every include.
    pub(crate) fn attach_assets(&mut self, source: Arc<dyn AssetSource>) {
        for child in &mut self.include {
            child.attach_assets(Arc::clone(&source));
        }
        self.assets_source = Some(source);
    }

    /// A fresh copy with zeroed change accounting, for binding to one host.
    pub(crate) fn replica(&self) -> Configuration {
        let mut copy = self.clone();
        copy.reset();
        copy
    }

    fn reset(&mut self) {
        self.changes = 0;
        for child in &mut self.include {
            child.reset();
        }
    }

    pub(crate) fn changes(&self) -> u64 {
        self.changes
    }

    // ---------------------------------------------------------------------------------------------
    // Public operations
    // ---------------------------------------------------------------------------------------------

    /// Brings the host into the declared state; returns the change count.
    pub(crate) fn apply(
        &mut self,
        host: &Host,
        coord: Option<&Arc<Coordinator>>,
    ) -> Result<u64, OpError> {
        self.run_op(Op::Apply, host, coord).map(|(changes, _)| changes)
    }

    /// Removes the declared state from the host; returns the change count.
    pub(crate) fn delete(
        &mut self,
        host: &Host,
        coord: Option<&Arc<Coordinator>>,
    ) -> Result<u64, OpError> {
        self.run_op(Op::Delete, host, coord).map(|(changes, _)| changes)
    }

    /// True when the host already satisfies the declared state.
    pub(crate) fn is_applied(
        &mut self,
        host: &Host,
        coord: Option<&Arc<Coordinator>>,
    ) -> Result<bool, OpError> {
        self.run_op(Op::IsApplied, host, coord)
            .map(|(_, applied)| applied)
    }

    // ---------------------------------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------------------------------

    fn run_op(
        &mut self,
        op: Op,
        host: &Host,
        coord: Option<&Arc<Coordinator>>,
    ) -> Result<(u64, bool), OpError> {
        self.reset();
        let mut ctx = OpContext {
            host,
            coord,
            packages: PackageManagers::new(host),
        };
        if let Some(coord) = coord {
            coord.register();
        }
        let _registration = Registration(coord);

        match self.run_op_inner(op, &mut ctx, false) {
            Ok(applied) => Ok((self.changes, applied)),
            Err(error) => Err(self.classify(op, host, coord, error)),
        }
    }

    /// Runs an operation nested inside a running parent, adopting its host,
    /// coordinator and package cache.
    fn run_nested(&mut self, op: Op, ctx: &mut OpContext<'_>) -> Result<(u64, bool)> {
        self.reset();
        match self.run_op_inner(op, ctx, true) {
            Ok(applied) => Ok((self.changes, applied)),
            Err(error) => {
                // Hooks fire at the level that failed; classification and
                // coordinator cancellation happen once, at the root.
                if error.downcast_ref::<Cancelled>().is_some() {
                    self.dispatch_cancel(op, ctx.host);
                    Err(error)
                } else {
                    self.dispatch_error(op, ctx.host);
                    Err(error.wrap_err(format!(
                        "included configuration {} failed",
                        self.desired.name
                    )))
                }
            }
        }
    }

    fn classify(
        &mut self,
        op: Op,
        host: &Host,
        coord: Option<&Arc<Coordinator>>,
        error: Report,
    ) -> OpError {
        if error.downcast_ref::<Cancelled>().is_some() {
            self.dispatch_cancel(op, host);
            OpError::Cancelled {
                changes: self.changes,
            }
        } else {
            if let Some(coord) = coord {
                if coord.fail_early() {
                    coord.cancel();
                }
            }
            self.dispatch_error(op, host);
            OpError::Failed {
                changes: self.changes,
                error,
            }
        }
    }

    fn run_op_inner(&mut self, op: Op, ctx: &mut OpContext<'_>, nested: bool) -> Result<bool> {
        // Only the root configuration parks at ready/done; nested ones ride
        // their parent's barrier schedule.
        if nested {
            self.sync(ctx)?;
        } else {
            self.wait_phase(ctx, Phase::Ready, Some(self.ready_timeout))?;
        }

        let mut included_applied = true;
        let mut included_changes = 0u64;
        let mut failure: Option<Report> = None;
        {
            let children: Box<dyn Iterator<Item = &mut Configuration> + '_> = match op {
                Op::Delete => Box::new(self.include.iter_mut().rev()),
                _ => Box::new(self.include.iter_mut()),
            };
            for child in children {
                match child.run_nested(op, ctx) {
                    Ok((child_changes, child_applied)) => {
                        if op != Op::IsApplied {
                            included_changes += child_changes;
                        }
                        included_applied = included_applied && child_applied;
                    }
                    Err(error) => {
                        included_changes += child.changes;
                        failure = Some(error);
                        break;
                    }
                }
            }
        }
        self.changes += included_changes;
        if let Some(error) = failure {
            return Err(error);
        }

        self.dispatch_start(op, ctx)?;
        let applied = match op {
            Op::Apply => {
                self.run_apply_steps(ctx)?;
                true
            }
            Op::Delete => {
                self.run_delete_steps(ctx)?;
                true
            }
            Op::IsApplied => self.check_applied(ctx)?,
        };
        self.dispatch_finish(op, ctx)?;

        if nested {
            self.sync(ctx)?;
        } else {
            self.wait_phase(ctx, Phase::Done, self.done_timeout)?;
        }
        Ok(included_applied && applied)
    }

    // ---------------------------------------------------------------------------------------------
    // Barrier waits
    // ---------------------------------------------------------------------------------------------

    fn wait_phase(
        &self,
        ctx: &OpContext<'_>,
        phase: Phase,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let Some(coord) = ctx.coord else {
            return Ok(());
        };
        if coord.is_cancelled() {
            return Err(Cancelled.into());
        }
        coord.wait(phase, timeout)?;
        if coord.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }

    /// Parks at the `sync` barrier so all host workers advance in lockstep.
    fn sync(&self, ctx: &OpContext<'_>) -> Result<()> {
        self.wait_phase(ctx, Phase::Sync, self.sync_timeout)
    }

    // ---------------------------------------------------------------------------------------------
    // Hooks and progress lines
    // ---------------------------------------------------------------------------------------------

    fn dispatch_start(&mut self, op: Op, ctx: &mut OpContext<'_>) -> Result<()> {
        self.sync(ctx)?;
        let host = ctx.host;
        match op {
            Op::Apply => info!("[{}] Applying configuration {}", host.name(), self.name()),
            Op::Delete => info!("[{}] Deleting configuration {}", host.name(), self.name()),
            Op::IsApplied => {}
        }
        if let Some(hooks) = self.hooks.clone() {
            match op {
                Op::Apply => hooks.on_apply_start(host)?,
                Op::Delete => hooks.on_delete_start(host)?,
                Op::IsApplied => hooks.on_is_applied_start(host)?,
            }
        }
        Ok(())
    }

    fn dispatch_finish(&mut self, op: Op, ctx: &mut OpContext<'_>) -> Result<()> {
        self.sync(ctx)?;
        let host = ctx.host;
        match op {
            Op::Apply => info!("[{}] Applied configuration {}", host.name(), self.name()),
            Op::Delete => info!("[{}] Deleted configuration {}", host.name(), self.name()),
            Op::IsApplied => {}
        }
        if let Some(hooks) = self.hooks.clone() {
            match op {
                Op::Apply => hooks.on_apply_finish(host)?,
                Op::Delete => hooks.on_delete_finish(host)?,
                Op::IsApplied => hooks.on_is_applied_finish(host)?,
            }
        }
        Ok(())
    }

    fn dispatch_error(&self, op: Op, host: &Host) {
        error!(
            "[{}] {} of configuration {} failed",
            host.name(),
            op.label(),
            self.name()
        );
        if let Some(hooks) = &self.hooks {
            match op {
                Op::Apply => hooks.on_apply_error(host),
                Op::Delete => hooks.on_delete_error(host),
                Op::IsApplied => hooks.on_is_applied_error(host),
            }
        }
    }

    fn dispatch_cancel(&self, op: Op, host: &Host) {
        info!(
            "[{}] {} of configuration {} cancelled",
            host.name(),
            op.label(),
            self.name()
        );
        if let Some(hooks) = &self.hooks {
            match op {
                Op::Apply => hooks.on_apply_cancel(host),
                Op::Delete => hooks.on_delete_cancel(host),
                Op::IsApplied => hooks.on_is_applied_cancel(host),
            }
        }
    }

    /// Runs one step inside a task scope: sync on entry, one uniform log
    /// line on exit, change accounting folded into the configuration.
    fn task<T>(
        &mut self,
        ctx: &mut OpContext<'_>,
        msg: &str,
        silent: bool,
        f: impl FnOnce(&mut Task, &mut OpContext<'_>) -> Result<T>,
    ) -> Result<T> {
        self.sync(ctx)?;
        let mut task = Task::new();
        let result = f(&mut task, &mut *ctx);
        self.changes += task.changes;
        if !silent {
            let host = ctx.host.name();
            match &result {
                Err(_) => info!("[{host}] ( error) {msg}"),
                Ok(_) if task.changed() => info!("[{host}] (change) {msg}"),
                Ok(_) => info!("[{host}] (    ok) {msg}"),
            }
        }
        result
    }

    // ---------------------------------------------------------------------------------------------
    // Apply steps
    // ---------------------------------------------------------------------------------------------

    fn run_apply_steps(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        self.apply_os_package_list_update(ctx)?;
        self.apply_os_package_urls(ctx)?;
        self.apply_os_packages(ctx)?;
        self.apply_python_packages(ctx)?;
        self.apply_directories(ctx)?;
        self.apply_files(ctx)?;
        self.apply_assets(ctx)?;
        self.apply_template_files(ctx)?;
        self.apply_template_assets(ctx)?;
        self.apply_symlinks(ctx)?;
        Ok(())
    }

    fn apply_os_package_list_update(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let packages = self.desired.all_os_packages();
        self.task(
            ctx,
            "Apply os package list update",
            packages.is_empty(),
            |task, ctx| {
                if packages.is_empty() {
                    return Ok(());
                }
                if ctx.packages.os()?.installed(&packages)? {
                    return Ok(());
                }
                ctx.packages.os()?.refresh()?;
                task.change();
                Ok(())
            },
        )
    }

    fn apply_os_package_urls(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let pairs = self.desired.os_package_urls.clone();
        let msg = format!("Apply {} os package urls", pairs.len());
        self.task(ctx, &msg, pairs.is_empty(), |task, ctx| {
            for (package, url) in &pairs {
                if ctx.packages.os()?.contains(package)? {
                    continue;
                }
                ctx.packages.os()?.install_url(&[url.clone()])?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_os_packages(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let packages = self.desired.os_packages.clone();
        let msg = format!("Apply {} os packages", packages.len());
        self.task(ctx, &msg, packages.is_empty(), |task, ctx| {
            for package in &packages {
                if ctx.packages.os()?.contains(package)? {
                    continue;
                }
                ctx.packages.os()?.install(&[package.clone()])?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_python_packages(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let packages = self.desired.python_packages.clone();
        let msg = format!("Apply {} python packages", packages.len());
        self.task(ctx, &msg, packages.is_empty(), |task, ctx| {
            for package in &packages {
                if ctx.packages.pip()?.contains(package)? {
                    continue;
                }
                ctx.packages.pip()?.install(&[package.clone()])?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_directories(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let directories = self.desired.directories.clone();
        let msg = format!("Apply {} directories", directories.len());
        self.task(ctx, &msg, directories.is_empty(), |task, ctx| {
            for dir in &directories {
                if ctx.host.isdir(dir)? {
                    continue;
                }
                ctx.host.mkdirp(dir)?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_files(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let files = self.desired.files.clone();
        let msg = format!("Apply {} files", files.len());
        self.task(ctx, &msg, files.is_empty(), |task, ctx| {
            for (src, dst) in &files {
                if ctx.host.isfile(dst)? {
                    continue;
                }
                ctx.host.put(Path::new(src), dst)?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_assets(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let assets = self.desired.assets.clone();
        let source = self.assets_source.clone();
        let msg = format!("Apply {} assets", assets.len());
        self.task(ctx, &msg, assets.is_empty(), |task, ctx| {
            if assets.is_empty() {
                return Ok(());
            }
            let Some(source) = source else {
                bail!("Configuration declares assets but no asset source is attached");
            };
            let staging = tempfile::tempdir().wrap_err("Failed to create staging directory")?;
            for (key, dst) in &assets {
                if ctx.host.isfile(dst)? {
                    continue;
                }
                let staged = staging.path().join(basename(dst));
                fs::write(&staged, source.load(key)?)
                    .wrap_err_with(|| format!("Failed to stage asset {key}"))?;
                ctx.host.put(&staged, dst)?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_template_files(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let templates = self.desired.template_files.clone();
        let env = self.template_context(ctx.host);
        let msg = format!("Apply {} template files", templates.len());
        self.task(ctx, &msg, templates.is_empty(), |task, ctx| {
            let staging = tempfile::tempdir().wrap_err("Failed to create staging directory")?;
            for (src, dst) in &templates {
                if ctx.host.isfile(dst)? {
                    continue;
                }
                let rendered = staging.path().join(basename(dst));
                template::expand_file(Path::new(src), &rendered, &env)?;
                ctx.host.put(&rendered, dst)?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_template_assets(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let templates = self.desired.template_assets.clone();
        let source = self.assets_source.clone();
        let env = self.template_context(ctx.host);
        let msg = format!("Apply {} template assets", templates.len());
        self.task(ctx, &msg, templates.is_empty(), |task, ctx| {
            if templates.is_empty() {
                return Ok(());
            }
            let Some(source) = source else {
                bail!("Configuration declares template assets but no asset source is attached");
            };
            let staging = tempfile::tempdir().wrap_err("Failed to create staging directory")?;
            for (key, dst) in &templates {
                if ctx.host.isfile(dst)? {
                    continue;
                }
                let rendered = template::expand_str(&source.loads(key)?, &env)?;
                let staged = staging.path().join(basename(dst));
                fs::write(&staged, rendered)
                    .wrap_err_with(|| format!("Failed to stage template asset {key}"))?;
                ctx.host.put(&staged, dst)?;
                task.change();
            }
            Ok(())
        })
    }

    fn apply_symlinks(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let symlinks = self.desired.symlinks.clone();
        let msg = format!("Apply {} symlinks", symlinks.len());
        self.task(ctx, &msg, symlinks.is_empty(), |task, ctx| {
            for (src, dst) in &symlinks {
                if ctx.host.islink(dst)? {
                    continue;
                }
                ctx.host.lns(src, dst)?;
                task.change();
            }
            Ok(())
        })
    }

    // ---------------------------------------------------------------------------------------------
    // Delete steps
    // ---------------------------------------------------------------------------------------------

    fn run_delete_steps(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        self.delete_python_packages(ctx)?;
        self.delete_os_packages(ctx)?;
        self.delete_files(ctx)?;
        self.delete_directories(ctx)?;
        Ok(())
    }

    fn delete_python_packages(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let mut packages = self.desired.python_packages.clone();
        packages.reverse();
        let keep = self.desired.keep_python_packages;
        let msg = format!("Delete {} python packages", packages.len());
        self.task(ctx, &msg, packages.is_empty(), |task, ctx| {
            if keep {
                return Ok(());
            }
            for package in &packages {
                if !ctx.packages.pip()?.contains(package)? {
                    continue;
                }
                ctx.packages.pip()?.remove(&[package.clone()], false)?;
                task.change();
            }
            Ok(())
        })
    }

    fn delete_os_packages(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let mut packages = self.desired.all_os_packages();
        packages.reverse();
        let keep = self.desired.keep_os_packages;
        let msg = format!("Delete {} os packages", packages.len());
        self.task(ctx, &msg, packages.is_empty(), |task, ctx| {
            if keep {
                return Ok(());
            }
            for package in &packages {
                if !ctx.packages.os()?.contains(package)? {
                    continue;
                }
                ctx.packages.os()?.remove(&[package.clone()], false)?;
                task.change();
            }
            Ok(())
        })
    }

    fn delete_files(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let mut files = self.desired.all_files();
        files.reverse();
        let msg = format!("Delete {} files", files.len());
        self.task(ctx, &msg, files.is_empty(), |task, ctx| {
            for file in &files {
                if !ctx.host.isfile(file)? && !ctx.host.islink(file)? {
                    continue;
                }
                ctx.host.rmf(file)?;
                task.change();
            }
            Ok(())
        })
    }

    fn delete_directories(&mut self, ctx: &mut OpContext<'_>) -> Result<()> {
        let mut directories = self.desired.directories.clone();
        directories.reverse();
        let keep_nonempty = self.desired.keep_nonempty_dirs;
        let msg = format!("Delete {} directories", directories.len());
        self.task(ctx, &msg, directories.is_empty(), |task, ctx| {
            for dir in &directories {
                if !ctx.host.isdir(dir)? {
                    continue;
                }
                if keep_nonempty && !ctx.host.ls(dir)?.is_empty() {
                    continue;
                }
                ctx.host.rmrf(dir)?;
                task.change();
            }
            Ok(())
        })
    }

    // ---------------------------------------------------------------------------------------------
    // Applied check
    // ---------------------------------------------------------------------------------------------

    fn check_applied(&mut self, ctx: &mut OpContext<'_>) -> Result<bool> {
        let os_packages = self.desired.all_os_packages();
        if !os_packages.is_empty() && !ctx.packages.os()?.installed(&os_packages)? {
            return Ok(false);
        }
        let python_packages = self.desired.python_packages.clone();
        if !python_packages.is_empty() && !ctx.packages.pip()?.installed(&python_packages)? {
            return Ok(false);
        }
        for file in self.desired.all_files() {
            if !ctx.host.exists(&file)? && !ctx.host.islink(&file)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Environment visible to template expansion: the declared env plus
    /// host facts.
    fn template_context(&self, host: &Host) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.desired.template_env {
            map.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        map.insert(
            "host".to_string(),
            serde_json::json!({ "name": host.name(), "address": host.address() }),
        );
        map.insert(
            "name".to_string(),
            serde_json::Value::String(self.desired.name.clone()),
        );
        serde_json::Value::Object(map)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_files(dir: &tempfile::TempDir) -> Result<DesiredState> {
        let src = dir.path().join("motd.src");
        fs::write(&src, "welcome\n")?;
        let mut state = DesiredState {
            name: "files-only".to_string(),
            ..DesiredState::default()
        };
        state.directories = vec![dir.path().join("managed").to_string_lossy().into_owned()];
        state.files = vec![(
            src.to_string_lossy().into_owned(),
            dir.path().join("managed/motd").to_string_lossy().into_owned(),
        )];
        state.symlinks = vec![(
            dir.path().join("managed/motd").to_string_lossy().into_owned(),
            dir.path().join("motd.link").to_string_lossy().into_owned(),
        )];
        Ok(state)
    }

    #[test]
    fn test_manifest_defaults() {
        let config = Configuration::from_toml_str("").unwrap();
        assert_eq!(config.name(), "(name not set)");
        assert!(config.desired.keep_os_packages);
        assert!(config.desired.keep_python_packages);
        assert!(config.desired.keep_nonempty_dirs);
        assert!(config.desired.files.is_empty());
        assert!(config.include.is_empty());
    }

    #[test]
    fn test_manifest_round_trip() {
        let raw = r#"
            name = "edge"
            os_packages = ["curl", "jq"]
            python_packages = ["requests"]
            directories = ["/opt/edge"]
            files = [["conf/edge.conf", "/opt/edge/edge.conf"]]
            symlinks = [["/opt/edge/edge.conf", "/etc/edge.conf"]]
            os_package_urls = [["netprobe", "https://example.com/netprobe.deb"]]
            keep_os_packages = false

            [template_env]
            port = "9100"

            [[include]]
            name = "base"
            os_packages = ["ca-certificates"]
        "#;
        let config = Configuration::from_toml_str(raw).unwrap();
        assert_eq!(config.name(), "edge");
        assert_eq!(config.desired.os_packages, vec!["curl", "jq"]);
        assert!(!config.desired.keep_os_packages);
        assert_eq!(
            config.desired.os_package_urls,
            vec![(
                "netprobe".to_string(),
                "https://example.com/netprobe.deb".to_string()
            )]
        );
        assert_eq!(
            config.desired.template_env.get("port").map(String::as_str),
            Some("9100")
        );
        assert_eq!(config.include.len(), 1);
        assert_eq!(config.include[0].name(), "base");
        assert_eq!(config.include[0].desired.os_packages, vec!["ca-certificates"]);
    }

    #[test]
    fn test_all_files_covers_every_list() {
        let state = DesiredState {
            files: vec![("a".into(), "/dst/a".into())],
            assets: vec![("b".into(), "/dst/b".into())],
            template_files: vec![("c".into(), "/dst/c".into())],
            template_assets: vec![("d".into(), "/dst/d".into())],
            symlinks: vec![("e".into(), "/dst/e".into())],
            ..DesiredState::default()
        };
        assert_eq!(
            state.all_files(),
            vec!["/dst/a", "/dst/b", "/dst/c", "/dst/d", "/dst/e"]
        );
    }

    #[test]
    fn test_all_os_packages_includes_url_names() {
        let state = DesiredState {
            os_package_urls: vec![("probe".into(), "https://x/probe.rpm".into())],
            os_packages: vec!["jq".into()],
            ..DesiredState::default()
        };
        assert_eq!(state.all_os_packages(), vec!["probe", "jq"]);
    }

    #[test]
    fn test_apply_files_and_idempotence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("unit"));
        let mut config = Configuration::from(state_with_files(&dir)?);

        // First apply creates a directory, a file and a symlink.
        let changes = config.apply(&host, None).map_err(Report::from)?;
        assert_eq!(changes, 3);
        assert!(host.isfile(&config.desired.files[0].1)?);
        assert!(host.islink(&config.desired.symlinks[0].1)?);

        // Second apply changes nothing.
        let changes = config.apply(&host, None).map_err(Report::from)?;
        assert_eq!(changes, 0);

        assert!(config.is_applied(&host, None).map_err(Report::from)?);
        Ok(())
    }

    #[test]
    fn test_delete_walks_reverse_and_respects_keep() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("unit"));
        let mut config = Configuration::from(state_with_files(&dir)?);

        config.apply(&host, None).map_err(Report::from)?;
        let changes = config.delete(&host, None).map_err(Report::from)?;
        // File and symlink removed, directory now empty and removed too.
        assert_eq!(changes, 3);
        assert!(!host.exists(&config.desired.files[0].1)?);
        assert!(!host.islink(&config.desired.symlinks[0].1)?);
        assert!(!host.isdir(&config.desired.directories[0])?);
        assert!(!config.is_applied(&host, None).map_err(Report::from)?);
        Ok(())
    }

    #[test]
    fn test_delete_keeps_nonempty_directories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("unit"));
        let mut config = Configuration::from(state_with_files(&dir)?);

        config.apply(&host, None).map_err(Report::from)?;
        // An unmanaged file appears in the managed directory.
        let stray = dir.path().join("managed/stray");
        fs::write(&stray, "keep me")?;

        config.delete(&host, None).map_err(Report::from)?;
        assert!(host.isdir(&config.desired.directories[0])?);
        assert!(stray.exists());
        Ok(())
    }

    #[test]
    fn test_template_files_render_host_facts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("render-host"));
        let src = dir.path().join("banner.tmpl");
        fs::write(&src, "host={{host.name}} greeting={{greeting}}\n")?;

        let mut state = DesiredState {
            name: "banner".to_string(),
            ..DesiredState::default()
        };
        state.template_files = vec![(
            src.to_string_lossy().into_owned(),
            dir.path().join("banner.out").to_string_lossy().into_owned(),
        )];
        state
            .template_env
            .insert("greeting".to_string(), "hello".to_string());

        let mut config = Configuration::from(state);
        config.apply(&host, None).map_err(Report::from)?;
        let rendered = fs::read_to_string(dir.path().join("banner.out"))?;
        assert_eq!(rendered, "host=render-host greeting=hello\n");
        Ok(())
    }

    #[test]
    fn test_assets_require_source() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::local(Some("unit"));
        let state = DesiredState {
            assets: vec![(
                "motd".to_string(),
                dir.path().join("motd").to_string_lossy().into_owned(),
            )],
            ..DesiredState::default()
        };
        let mut config = Configuration::from(state);
        let err = config.apply(&host, None).unwrap_err();
        assert!(matches!(err, OpError::Failed { .. }));
        assert!(err.to_string().contains("no asset source"));
    }

    #[test]
    fn test_assets_from_directory_source() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let assets_root = dir.path().join("assets");
        fs::create_dir_all(&assets_root)?;
        fs::write(assets_root.join("motd"), "asset body\n")?;

        let host = Host::local(Some("unit"));
        let state = DesiredState {
            assets: vec![(
                "motd".to_string(),
                dir.path().join("out/motd").to_string_lossy().into_owned(),
            )],
            directories: vec![dir.path().join("out").to_string_lossy().into_owned()],
            ..DesiredState::default()
        };
        let mut config = Configuration::from(state);
        config.attach_assets(Arc::new(DirAssets::new(&assets_root)));
        config.apply(&host, None).map_err(Report::from)?;
        assert_eq!(
            fs::read_to_string(dir.path().join("out/motd"))?,
            "asset body\n"
        );
        Ok(())
    }

    #[test]
    fn test_includes_run_before_parent_and_sum_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("unit"));

        let child_marker = dir.path().join("child.marker");
        let parent_marker = dir.path().join("parent.marker");
        fs::write(dir.path().join("src"), "x")?;

        let mut child = DesiredState::default();
        child.name = "child".to_string();
        child.files = vec![(
            dir.path().join("src").to_string_lossy().into_owned(),
            child_marker.to_string_lossy().into_owned(),
        )];
        let mut parent_state = DesiredState::default();
        parent_state.name = "parent".to_string();
        parent_state.files = vec![(
            dir.path().join("src").to_string_lossy().into_owned(),
            parent_marker.to_string_lossy().into_owned(),
        )];

        let mut parent = Configuration::from(parent_state);
        parent.include.push(Configuration::from(child));

        let changes = parent.apply(&host, None).map_err(Report::from)?;
        assert_eq!(changes, 2);
        assert!(child_marker.exists());
        assert!(parent_marker.exists());

        // Conjunction over includes for the applied check.
        assert!(parent.is_applied(&host, None).map_err(Report::from)?);
        fs::remove_file(&child_marker)?;
        assert!(!parent.is_applied(&host, None).map_err(Report::from)?);
        Ok(())
    }

    #[test]
    fn test_failed_step_reports_accumulated_changes() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host::local(Some("unit"));

        let mut state = DesiredState::default();
        state.name = "broken".to_string();
        state.directories = vec![dir.path().join("made").to_string_lossy().into_owned()];
        // Source file does not exist, so the file step fails after the
        // directory step already made a change.
        state.files = vec![(
            dir.path().join("missing.src").to_string_lossy().into_owned(),
            dir.path().join("made/out").to_string_lossy().into_owned(),
        )];

        let mut config = Configuration::from(state);
        let err = config.apply(&host, None).unwrap_err();
        assert!(matches!(err, OpError::Failed { .. }));
        assert_eq!(err.changes(), 1);
    }

    #[test]
    fn test_replica_resets_change_accounting() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = Host::local(Some("unit"));
        let mut config = Configuration::from(state_with_files(&dir)?);
        config.apply(&host, None).map_err(Report::from)?;

        let replica = config.replica();
        assert_eq!(replica.changes(), 0);
        Ok(())
    }
}
