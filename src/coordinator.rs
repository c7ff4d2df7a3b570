//! Fleet-wide synchronization barriers.
//!
//! One [`Coordinator`] exists per deployment. Replicas park on three named
//! barriers — `ready` before any step runs, `sync` between steps, `done`
//! after the last — and the drive loop releases each barrier once every
//! live replica has arrived. Arrivals are counted explicitly; a generation
//! counter distinguishes consecutive releases of the same barrier.
//!
//! Cancellation is sticky: once [`Coordinator::cancel`] runs, every current
//! and future waiter returns promptly and observes the flag.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// The three barrier phases of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Ready,
    Sync,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Ready => f.write_str("ready"),
            Phase::Sync => f.write_str("sync"),
            Phase::Done => f.write_str("done"),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum CoordError {
    #[error("coordinator did not signal \"{phase}\" within {timeout:?}")]
    Timeout { phase: Phase, timeout: Duration },
}

#[derive(Default)]
struct BarrierState {
    arrivals: usize,
    generation: u64,
}

#[derive(Default)]
struct Barrier {
    state: Mutex<BarrierState>,
    released: Condvar,
}

/// Barrier set, cancellation flag and live-replica accounting for one
/// deployment.
pub(crate) struct Coordinator {
    ready: Barrier,
    sync: Barrier,
    done: Barrier,
    synchronize: bool,
    fail_early: bool,
    cancelled: AtomicBool,
    active: AtomicUsize,
}

impl Coordinator {
    pub(crate) fn new(synchronize: bool, fail_early: bool) -> Self {
        Coordinator {
            ready: Barrier::default(),
            sync: Barrier::default(),
            done: Barrier::default(),
            synchronize,
            fail_early,
            cancelled: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        }
    }

    fn barrier(&self, phase: Phase) -> &Barrier {
        match phase {
            Phase::Ready => &self.ready,
            Phase::Sync => &self.sync,
            Phase::Done => &self.done,
        }
    }

    pub(crate) fn fail_early(&self) -> bool {
        self.fail_early
    }

    /// A replica has bound its host.
    pub(crate) fn register(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    /// A replica has finished (or failed) and left the deployment.
    pub(crate) fn deregister(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of replicas currently bound to a host.
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Parks the caller on the named barrier until it is released, the
    /// coordinator is cancelled, or the timeout elapses.
    ///
    /// Waiting on `sync` with synchronization disabled returns immediately.
    /// The caller is responsible for checking [`Coordinator::is_cancelled`]
    /// after return.
    pub(crate) fn wait(&self, phase: Phase, timeout: Option<Duration>) -> Result<(), CoordError> {
        if phase == Phase::Sync && !self.synchronize {
            return Ok(());
        }
        let barrier = self.barrier(phase);
        let mut state = barrier
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entry_generation = state.generation;
        state.arrivals += 1;
        trace!(phase = %phase, arrivals = state.arrivals, "parked");

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if state.generation != entry_generation {
                // Released by notify; arrivals were reset there.
                return Ok(());
            }
            if self.is_cancelled() {
                state.arrivals = state.arrivals.saturating_sub(1);
                return Ok(());
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.arrivals = state.arrivals.saturating_sub(1);
                        return Err(CoordError::Timeout {
                            phase,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    barrier
                        .released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => barrier
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// True when every live replica is parked on the named barrier.
    pub(crate) fn awaiting(&self, phase: Phase) -> bool {
        if phase == Phase::Sync && !self.synchronize {
            return false;
        }
        let state = self
            .barrier(phase)
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.arrivals >= self.active()
    }

    /// Polls [`Coordinator::awaiting`] until it holds or `timeout` elapses.
    pub(crate) fn poll(&self, phase: Phase, timeout: Duration, pause: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.awaiting(phase) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(pause);
        }
    }

    /// Releases every waiter currently parked on the named barrier.
    pub(crate) fn notify(&self, phase: Phase) {
        let barrier = self.barrier(phase);
        let mut state = barrier
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        state.arrivals = 0;
        trace!(phase = %phase, generation = state.generation, "released");
        barrier.released.notify_all();
    }

    /// Sets the sticky cancellation flag and wakes every barrier.
    pub(crate) fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("coordinator cancelled");
        for phase in [Phase::Ready, Phase::Sync, Phase::Done] {
            let barrier = self.barrier(phase);
            let _state = barrier
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            barrier.released.notify_all();
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const PAUSE: Duration = Duration::from_millis(5);

    #[test]
    fn test_sync_short_circuits_when_disabled() {
        let coord = Coordinator::new(false, true);
        // Returns immediately instead of parking forever.
        coord.wait(Phase::Sync, None).unwrap();
        assert!(!coord.awaiting(Phase::Sync));
    }

    #[test]
    fn test_wait_times_out() {
        let coord = Coordinator::new(true, true);
        let err = coord
            .wait(Phase::Ready, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, CoordError::Timeout { phase: Phase::Ready, .. }));
        // The timed-out waiter retracted its arrival.
        let state = coord.ready.state.lock().unwrap();
        assert_eq!(state.arrivals, 0);
    }

    #[test]
    fn test_barrier_liveness() {
        let coord = Arc::new(Coordinator::new(true, true));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let coord = Arc::clone(&coord);
                thread::spawn(move || {
                    coord.register();
                    coord.wait(Phase::Ready, Some(Duration::from_secs(5))).unwrap();
                    coord.deregister();
                })
            })
            .collect();

        assert!(coord.poll(Phase::Ready, Duration::from_secs(5), PAUSE));
        coord.notify(Phase::Ready);
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(coord.active(), 0);
    }

    #[test]
    fn test_cancel_unblocks_all_waiters() {
        let coord = Arc::new(Coordinator::new(true, true));
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let coord = Arc::clone(&coord);
                thread::spawn(move || {
                    coord.register();
                    coord.wait(Phase::Sync, None).unwrap();
                    coord.is_cancelled()
                })
            })
            .collect();

        assert!(coord.poll(Phase::Sync, Duration::from_secs(5), PAUSE));
        coord.cancel();
        for worker in workers {
            // Each waiter returned and observed the flag.
            assert!(worker.join().unwrap());
        }
    }

    #[test]
    fn test_wait_after_cancel_returns_immediately() {
        let coord = Coordinator::new(true, true);
        coord.cancel();
        coord.wait(Phase::Done, None).unwrap();
        assert!(coord.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let coord = Coordinator::new(true, true);
        coord.cancel();
        coord.cancel();
        assert!(coord.is_cancelled());
    }

    #[test]
    fn test_generations_separate_consecutive_syncs() {
        let coord = Arc::new(Coordinator::new(true, true));
        coord.register();
        coord.register();

        let reached = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let coord = Arc::clone(&coord);
                let reached = Arc::clone(&reached);
                thread::spawn(move || {
                    for _ in 0..5 {
                        coord.wait(Phase::Sync, Some(Duration::from_secs(5))).unwrap();
                    }
                    reached.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for _ in 0..5 {
            assert!(coord.poll(Phase::Sync, Duration::from_secs(5), PAUSE));
            coord.notify(Phase::Sync);
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(reached.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_awaiting_requires_all_active() {
        let coord = Arc::new(Coordinator::new(true, true));
        coord.register();
        coord.register();

        let one = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || {
                coord.wait(Phase::Sync, Some(Duration::from_secs(5))).unwrap()
            })
        };
        // One of two parked: not awaiting yet.
        thread::sleep(Duration::from_millis(50));
        assert!(!coord.awaiting(Phase::Sync));

        let two = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || {
                coord.wait(Phase::Sync, Some(Duration::from_secs(5))).unwrap()
            })
        };
        assert!(coord.poll(Phase::Sync, Duration::from_secs(5), PAUSE));
        coord.notify(Phase::Sync);
        one.join().unwrap();
        two.join().unwrap();
    }
}
