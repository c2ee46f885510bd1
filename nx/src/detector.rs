//! Change detector: polls on an interval and emits hashes that differ from
//! the last one seen

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::poller::{PollError, fetch_head};
use crate::repo::{CommitHash, RepositoryIdentity};
use crate::transport::Transport;

/// Buffer between the poll task and the consumer
const STREAM_CAPACITY: usize = 16;

/// Polls one repository for head changes
pub struct ChangeDetector {
    transport: Arc<dyn Transport>,
    repo: RepositoryIdentity,
    interval: Duration,
}

impl ChangeDetector {
    pub fn new(transport: Arc<dyn Transport>, repo: RepositoryIdentity, interval: Duration) -> Self {
        Self {
            transport,
            repo,
            interval,
        }
    }

    /// Establish the baseline and start the poll task
    ///
    /// Fails if the baseline poll fails. The poll task stops when `shutdown`
    /// receives a message or its sender is dropped, and when the returned
    /// stream is dropped. Shutdown is only observed between polls.
    pub async fn start(self, mut shutdown: mpsc::Receiver<()>) -> Result<CommitStream, PollError> {
        debug!(repo = %self.repo, interval = ?self.interval, "ChangeDetector::start: called");
        let baseline = fetch_head(self.transport.as_ref(), &self.repo).await?;
        info!(repo = %self.repo, hash = %baseline, "Baseline established");

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let first = baseline.clone();
        let task = tokio::spawn(async move {
            let mut last = first;
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => {
                        info!("Shutdown requested, poll loop stopping");
                        break;
                    }
                    _ = tx.closed() => {
                        debug!("ChangeDetector: stream dropped, poll loop stopping");
                        break;
                    }
                }

                match fetch_head(self.transport.as_ref(), &self.repo).await {
                    Err(e) => warn!(repo = %self.repo, error = %e, "Poll failed, keeping baseline"),
                    Ok(hash) if hash == last => debug!(hash = %hash, "ChangeDetector: head unchanged"),
                    Ok(hash) => {
                        info!(old = %last, new = %hash, "New commit detected");
                        last = hash.clone();
                        if tx.send(hash).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(CommitStream { baseline, rx, task })
    }
}

/// Hashes emitted by a running [`ChangeDetector`]
pub struct CommitStream {
    baseline: CommitHash,
    rx: mpsc::Receiver<CommitHash>,
    task: JoinHandle<()>,
}

impl CommitStream {
    /// Hash observed by the baseline poll
    pub fn baseline(&self) -> &CommitHash {
        &self.baseline
    }

    /// Next changed hash, or `None` once the poll loop has stopped
    pub async fn next(&mut self) -> Option<CommitHash> {
        self.rx.recv().await
    }
}

impl Drop for CommitStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
