//! Fleet deployment driver.
//!
//! A [`Deployment`] clones a configuration prototype once per host, spawns
//! a bounded worker pool, and drives the replicas through the coordinator's
//! barrier schedule: wait until every replica has bound its host, release
//! `ready`, pulse `sync` whenever all live replicas are parked, and release
//! `done` at the end. Any drive-loop error cancels the coordinator, joins
//! the pool and propagates.
//!
//! Results come back as two buckets: `ok` with each successful host's value
//! (change count or applied flag) and `err` with each failed host's error.
//! A host stopped by fail-fast cancellation kept its partial change count
//! and lands in `ok` with it; only genuine failures land in `err`.

use color_eyre::Result;
use color_eyre::eyre::bail;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use threadpool::ThreadPool;
use tracing::{debug, info, warn};

use crate::configuration::{Configuration, Op, OpError};
use crate::coordinator::{Coordinator, Phase};
use crate::host::Host;

/// Per-host outcome of one deployment operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpValue {
    /// Number of changes made by apply/delete.
    Changes(u64),
    /// Result of an is_applied check.
    Applied(bool),
}

impl std::fmt::Display for OpValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpValue::Changes(n) => write!(f, "{n} changes"),
            OpValue::Applied(b) => write!(f, "applied: {b}"),
        }
    }
}

/// Classified per-host results of one deployment operation.
#[derive(Debug)]
pub(crate) struct DeployReport {
    pub(crate) ok: Vec<(String, OpValue)>,
    pub(crate) err: Vec<(String, OpError)>,
}

impl DeployReport {
    pub(crate) fn all_ok(&self) -> bool {
        self.err.is_empty()
    }

    /// For is_applied runs: every host reported applied.
    pub(crate) fn all_applied(&self) -> bool {
        self.err.is_empty()
            && self
                .ok
                .iter()
                .all(|(_, value)| !matches!(value, OpValue::Applied(false)))
    }
}

/// Fleet-wide executor for one configuration.
pub(crate) struct Deployment {
    pub(crate) synchronize: bool,
    pub(crate) fail_early: bool,
    /// Worker thread bound; clamped to the host count. Defaults to the
    /// number of CPUs.
    pub(crate) workers: Option<usize>,
    /// How long replicas may take to bind their hosts.
    pub(crate) start_timeout: Duration,
    /// How long the fleet may take to assemble at `ready`.
    pub(crate) ready_timeout: Duration,
    /// Drive-loop polling interval.
    pub(crate) pause: Duration,
}

impl Default for Deployment {
    fn default() -> Self {
        Deployment {
            synchronize: true,
            fail_early: true,
            workers: None,
            start_timeout: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(10),
            pause: Duration::from_millis(50),
        }
    }
}

impl Deployment {
    /// Applies the configuration to every host.
    pub(crate) fn apply(&self, config: &Configuration, hosts: Vec<Host>) -> Result<DeployReport> {
        info!("Applying deployment {}", config.name());
        let report = self.run(Op::Apply, config, hosts)?;
        if report.all_ok() {
            info!("Applied deployment {}", config.name());
        } else {
            warn!("Applied deployment {} with errors", config.name());
        }
        Ok(report)
    }

    /// Deletes the configuration from every host.
    pub(crate) fn delete(&self, config: &Configuration, hosts: Vec<Host>) -> Result<DeployReport> {
        info!("Deleting deployment {}", config.name());
        let report = self.run(Op::Delete, config, hosts)?;
        if report.all_ok() {
            info!("Deleted deployment {}", config.name());
        } else {
            warn!("Deleted deployment {} with errors", config.name());
        }
        Ok(report)
    }

    /// Checks whether every host satisfies the configuration.
    pub(crate) fn is_applied(
        &self,
        config: &Configuration,
        hosts: Vec<Host>,
    ) -> Result<DeployReport> {
        self.run(Op::IsApplied, config, hosts)
    }

    fn run(&self, op: Op, config: &Configuration, hosts: Vec<Host>) -> Result<DeployReport> {
        if hosts.is_empty() {
            bail!("Deployment has no hosts");
        }
        let replicas = hosts.len();
        let workers = self
            .workers
            .unwrap_or_else(num_cpus::get)
            .clamp(1, replicas);
        debug!(replicas, workers, op = op.label(), "starting worker pool");

        let coord = Arc::new(Coordinator::new(self.synchronize, self.fail_early));
        let pool = ThreadPool::new(workers);
        let (tx, rx) = mpsc::channel();

        for (index, host) in hosts.into_iter().enumerate() {
            let mut replica = config.replica();
            let coord = Arc::clone(&coord);
            let tx = tx.clone();
            pool.execute(move || {
                let name = host.name().to_string();
                let value = match op {
                    Op::Apply => replica.apply(&host, Some(&coord)).map(OpValue::Changes),
                    Op::Delete => replica.delete(&host, Some(&coord)).map(OpValue::Changes),
                    Op::IsApplied => replica
                        .is_applied(&host, Some(&coord))
                        .map(OpValue::Applied),
                };
                let _ = tx.send((index, name, value));
            });
        }
        drop(tx);

        if let Err(e) = self.drive(&coord, replicas) {
            coord.cancel();
            pool.join();
            return Err(e);
        }
        pool.join();

        let mut results: Vec<_> = rx.into_iter().collect();
        results.sort_by_key(|(index, _, _)| *index);

        let mut ok = Vec::new();
        let mut err = Vec::new();
        for (_, name, value) in results {
            match value {
                Ok(value) => ok.push((name, value)),
                Err(OpError::Cancelled { changes }) if op != Op::IsApplied => {
                    // The host stopped cleanly at a barrier; its work so far
                    // counts.
                    info!("[{name}] cancelled after {changes} changes");
                    ok.push((name, OpValue::Changes(changes)));
                }
                Err(error) => err.push((name, error)),
            }
        }
        Ok(DeployReport { ok, err })
    }

    /// The barrier schedule: bind, ready, sync pulses, done.
    fn drive(&self, coord: &Coordinator, replicas: usize) -> Result<()> {
        if !poll_until(
            || coord.active() == replicas,
            self.start_timeout,
            Duration::from_millis(1),
        ) {
            bail!(
                "Workers did not start within {:?} ({} of {} bound)",
                self.start_timeout,
                coord.active(),
                replicas
            );
        }
        if !coord.poll(Phase::Ready, self.ready_timeout, self.pause) {
            bail!("Workers did not ready within {:?}", self.ready_timeout);
        }
        coord.notify(Phase::Ready);
        debug!("fleet ready");

        loop {
            if coord.awaiting(Phase::Done) || coord.is_cancelled() {
                break;
            }
            if coord.awaiting(Phase::Sync) {
                coord.notify(Phase::Sync);
            }
            thread::sleep(self.pause);
        }
        if !coord.is_cancelled() {
            coord.notify(Phase::Done);
        }
        debug!(cancelled = coord.is_cancelled(), "fleet drive finished");
        Ok(())
    }
}

fn poll_until(test: impl Fn() -> bool, timeout: Duration, pause: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if test() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(pause);
    }
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{DesiredState, Hooks};
    use color_eyre::eyre::eyre;
    use std::sync::Mutex;

    fn empty_config(name: &str) -> Configuration {
        Configuration::from(DesiredState {
            name: name.to_string(),
            ..DesiredState::default()
        })
    }

    fn fleet(names: &[&str]) -> Vec<Host> {
        names.iter().map(|n| Host::local(Some(*n))).collect()
    }

    /// Records lifecycle hook firings per host.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Hooks for Recorder {
        fn on_apply_start(&self, host: &Host) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("start:{}", host.name()));
            Ok(())
        }
        fn on_apply_finish(&self, host: &Host) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("finish:{}", host.name()));
            Ok(())
        }
    }

    /// Fails the finish hook on one named host.
    struct FailOn(&'static str);

    impl Hooks for FailOn {
        fn on_apply_finish(&self, host: &Host) -> Result<()> {
            if host.name() == self.0 {
                return Err(eyre!("injected failure on {}", host.name()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_apply_across_fleet() {
        let recorder = Arc::new(Recorder::default());
        let mut config = empty_config("noop");
        config.hooks = Some(recorder.clone());

        let deployment = Deployment {
            workers: Some(3),
            ..Deployment::default()
        };
        let report = deployment
            .apply(&config, fleet(&["alpha", "beta", "gamma"]))
            .unwrap();

        assert!(report.all_ok());
        assert_eq!(report.ok.len(), 3);
        for (host, value) in &report.ok {
            assert_eq!(*value, OpValue::Changes(0), "host {host}");
        }
        // Hosts come back in input order.
        let names: Vec<_> = report.ok.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);

        let events = recorder.events.lock().unwrap();
        for host in ["alpha", "beta", "gamma"] {
            assert!(events.contains(&format!("start:{host}")));
            assert!(events.contains(&format!("finish:{host}")));
        }
    }

    #[test]
    fn test_fail_fast_cancels_rest_of_fleet() {
        let mut config = empty_config("doomed");
        config.hooks = Some(Arc::new(FailOn("beta")));

        let deployment = Deployment {
            workers: Some(3),
            ..Deployment::default()
        };
        let report = deployment
            .apply(&config, fleet(&["alpha", "beta", "gamma"]))
            .unwrap();

        assert_eq!(report.err.len(), 1);
        let (failed_host, error) = &report.err[0];
        assert_eq!(failed_host, "beta");
        assert!(matches!(error, OpError::Failed { .. }));
        assert!(error.to_string().contains("injected failure"));

        // The survivors stopped at a barrier and report their work so far.
        let names: Vec<_> = report.ok.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(names, vec!["alpha", "gamma"]);
        assert!(!report.all_ok());
    }

    #[test]
    fn test_without_fail_early_the_rest_completes() {
        let mut config = empty_config("tolerant");
        config.hooks = Some(Arc::new(FailOn("beta")));

        let deployment = Deployment {
            fail_early: false,
            workers: Some(3),
            ..Deployment::default()
        };
        let report = deployment
            .apply(&config, fleet(&["alpha", "beta", "gamma"]))
            .unwrap();

        assert_eq!(report.err.len(), 1);
        assert_eq!(report.ok.len(), 2);
        for (_, value) in &report.ok {
            assert_eq!(*value, OpValue::Changes(0));
        }
    }

    #[test]
    fn test_is_applied_across_fleet() {
        let config = empty_config("noop");
        let deployment = Deployment {
            workers: Some(2),
            ..Deployment::default()
        };
        let report = deployment
            .is_applied(&config, fleet(&["one", "two"]))
            .unwrap();
        assert!(report.all_applied());
        for (_, value) in &report.ok {
            assert_eq!(*value, OpValue::Applied(true));
        }
    }

    #[test]
    fn test_unsynchronized_deployment() {
        let config = empty_config("loose");
        let deployment = Deployment {
            synchronize: false,
            workers: Some(2),
            ..Deployment::default()
        };
        let report = deployment.apply(&config, fleet(&["a", "b"])).unwrap();
        assert!(report.all_ok());
    }

    #[test]
    fn test_too_few_workers_is_a_start_timeout() {
        let config = empty_config("starved");
        let deployment = Deployment {
            workers: Some(1),
            start_timeout: Duration::from_millis(200),
            ..Deployment::default()
        };
        // Two replicas, one worker: the second replica can never bind while
        // the first is parked at a barrier.
        let err = deployment.apply(&config, fleet(&["a", "b"])).unwrap_err();
        assert!(err.to_string().contains("did not start"));
    }

    #[test]
    fn test_empty_fleet_is_an_error() {
        let config = empty_config("empty");
        let deployment = Deployment::default();
        assert!(deployment.apply(&config, Vec::new()).is_err());
    }

    #[test]
    fn test_single_host_fleet() {
        let config = empty_config("solo");
        let deployment = Deployment {
            workers: Some(8),
            ..Deployment::default()
        };
        let report = deployment.apply(&config, fleet(&["only"])).unwrap();
        assert_eq!(report.ok.len(), 1);
    }
}
