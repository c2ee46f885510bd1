//! Deploy dispatcher: serializes rebuilds and coalesces updates
//!
//! The state is a tri-state in an `AtomicU8`, moved only by compare-and-swap:
//!
//! ```text
//!   Idle --HashChanged--> Running --HashChanged--> Pending --HashChanged--> Pending
//!    ^                      |  ^                      |
//!    +---- finished --------+  +------ finished ------+  (run latest pending hash)
//! ```
//!
//! Hashes that arrive while a rebuild runs go into a single-slot mailbox that
//! always holds the newest one. Producers fill the slot before moving the
//! state to `Pending`; the finishing task empties it only after its own CAS
//! out of `Pending` succeeded, so a hash that races with completion is either
//! picked up by that task or leaves the state in `Pending` for it to see.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::deploy::Deployer;
use crate::repo::{CommitHash, RepositoryIdentity};

/// Dispatcher state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle = 0,
    Running = 1,
    Pending = 2,
}

impl DispatchState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatchState::Running,
            2 => DispatchState::Pending,
            _ => DispatchState::Idle,
        }
    }
}

/// What a `HashChanged` event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Was idle; a rebuild was started for this hash
    Started,
    /// A rebuild is running; this hash will follow it
    Queued,
    /// Replaced an earlier queued hash
    Replaced,
}

/// Counters exposed for logs and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub rebuilds_started: u64,
    pub hashes_coalesced: u64,
}

struct Inner {
    state: AtomicU8,
    pending: Mutex<Option<CommitHash>>,
    deployer: Arc<dyn Deployer>,
    repo: RepositoryIdentity,
    idle: Notify,
    rebuilds_started: AtomicU64,
    hashes_coalesced: AtomicU64,
}

impl Inner {
    fn load(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: DispatchState, to: DispatchState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn put_pending(&self, hash: CommitHash) -> Option<CommitHash> {
        let mut slot = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.replace(hash)
    }

    fn take_pending(&self) -> Option<CommitHash> {
        let mut slot = self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.take()
    }
}

/// Handle to the dispatcher; clones share one state machine
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create an idle dispatcher that rebuilds `repo` through `deployer`
    pub fn new(repo: RepositoryIdentity, deployer: Arc<dyn Deployer>) -> Self {
        debug!(%repo, "Dispatcher::new: called");
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(DispatchState::Idle as u8),
                pending: Mutex::new(None),
                deployer,
                repo,
                idle: Notify::new(),
                rebuilds_started: AtomicU64::new(0),
                hashes_coalesced: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> DispatchState {
        self.inner.load()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            rebuilds_started: self.inner.rebuilds_started.load(Ordering::Relaxed),
            hashes_coalesced: self.inner.hashes_coalesced.load(Ordering::Relaxed),
        }
    }

    /// Feed a new hash into the state machine
    ///
    /// Never blocks: at most it spawns the rebuild task. Must be called from
    /// within a tokio runtime.
    pub fn on_hash_changed(&self, hash: CommitHash) -> DispatchOutcome {
        let inner = &self.inner;
        loop {
            let current = inner.load();
            match current {
                DispatchState::Idle => {
                    // Anything left in the slot was already applied or superseded.
                    inner.take_pending();
                    if inner.transition(DispatchState::Idle, DispatchState::Running) {
                        info!(hash = %hash, "Dispatcher: idle, starting rebuild");
                        self.spawn_rebuild(hash);
                        return DispatchOutcome::Started;
                    }
                }
                DispatchState::Running | DispatchState::Pending => {
                    let previous = inner.put_pending(hash.clone());
                    if inner.transition(current, DispatchState::Pending) {
                        if current == DispatchState::Running {
                            info!(hash = %hash, "Dispatcher: rebuild in flight, queued");
                            return DispatchOutcome::Queued;
                        }
                        inner.hashes_coalesced.fetch_add(1, Ordering::Relaxed);
                        info!(
                            hash = %hash,
                            replaced = previous.as_ref().map(|h| h.to_string()),
                            "Dispatcher: replaced pending hash"
                        );
                        return DispatchOutcome::Replaced;
                    }
                }
            }
            debug!(?current, "Dispatcher::on_hash_changed: lost CAS race, retrying");
        }
    }

    /// Wait until no rebuild is running or pending
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == DispatchState::Idle {
                return;
            }
            notified.await;
        }
    }

    fn spawn_rebuild(&self, hash: CommitHash) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_until_settled(inner, hash));
    }
}

async fn apply_once(inner: &Inner, hash: &CommitHash) {
    inner.rebuilds_started.fetch_add(1, Ordering::Relaxed);
    let attempt = AssertUnwindSafe(inner.deployer.apply(&inner.repo, hash)).catch_unwind();
    match attempt.await {
        Ok(Ok(())) => debug!(hash = %hash, "apply_once: rebuild completed"),
        // Failure is not retried; only a newer hash triggers another attempt.
        Ok(Err(e)) => warn!(hash = %hash, error = %e, "Rebuild attempt failed"),
        Err(_) => error!(hash = %hash, "Rebuild attempt panicked"),
    }
}

async fn run_until_settled(inner: Arc<Inner>, first: CommitHash) {
    let mut hash = first;
    loop {
        apply_once(&inner, &hash).await;

        let next = loop {
            if inner.transition(DispatchState::Running, DispatchState::Idle) {
                debug!(hash = %hash, "run_until_settled: no pending hash, going idle");
                inner.idle.notify_waiters();
                return;
            }
            if inner.transition(DispatchState::Pending, DispatchState::Running) {
                match inner.take_pending() {
                    Some(next) if next != hash => break next,
                    Some(_) => debug!(hash = %hash, "run_until_settled: pending hash was just applied"),
                    None => debug!("run_until_settled: pending slot already drained"),
                }
            }
            std::hint::spin_loop();
        };

        info!(hash = %next, "Dispatcher: starting coalesced rebuild");
        hash = next;
    }
}
