//! Engine: wires the change detector into the dispatcher and notifier

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DeployConfig;
use crate::deploy::Deployer;
use crate::detector::ChangeDetector;
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::notifier::{Notifier, new_commit_message};
use crate::poller::PollError;
use crate::repo::{CommitHash, RepositoryIdentity};
use crate::transport::Transport;

/// Timing and identity the engine runs with
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub repo: RepositoryIdentity,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&DeployConfig> for EngineSettings {
    fn from(config: &DeployConfig) -> Self {
        Self {
            repo: config.repo.clone(),
            poll_interval: config.poll_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Summary returned when [`Engine::run`] finishes
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub baseline: CommitHash,
    /// Head changes seen after the baseline
    pub detected: u64,
    pub stats: DispatchStats,
    /// False if shutdown gave up waiting on a rebuild
    pub settled: bool,
}

pub struct Engine {
    settings: EngineSettings,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    notifier: Notifier,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        transport: Arc<dyn Transport>,
        deployer: Arc<dyn Deployer>,
        notifier: Notifier,
    ) -> Self {
        let dispatcher = Dispatcher::new(settings.repo.clone(), deployer);
        Self {
            settings,
            transport,
            dispatcher,
            notifier,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Poll until `shutdown` fires, deploying every change
    ///
    /// Returns an error only if the baseline poll fails. After the poll loop
    /// stops, waits up to the shutdown timeout for rebuild work to drain.
    pub async fn run(&self, shutdown: mpsc::Receiver<()>) -> Result<EngineReport, PollError> {
        debug!(repo = %self.settings.repo, "Engine::run: called");
        let detector = ChangeDetector::new(
            Arc::clone(&self.transport),
            self.settings.repo.clone(),
            self.settings.poll_interval,
        );
        let mut stream = detector.start(shutdown).await?;
        let baseline = stream.baseline().clone();
        info!(
            repo = %self.settings.repo,
            host = self.transport.host(),
            baseline = %baseline,
            interval = ?self.settings.poll_interval,
            "Watching for new commits"
        );

        let mut detected = 0u64;
        while let Some(hash) = stream.next().await {
            detected += 1;
            self.notifier.notify(new_commit_message(&hash));
            let outcome = self.dispatcher.on_hash_changed(hash);
            debug!(?outcome, "Engine::run: hash dispatched");
        }

        info!("Poll loop stopped, waiting for rebuilds to finish");
        let settled = tokio::time::timeout(self.settings.shutdown_timeout, self.dispatcher.wait_idle())
            .await
            .is_ok();
        if !settled {
            warn!(
                timeout = ?self.settings.shutdown_timeout,
                state = ?self.dispatcher.state(),
                "Rebuild still running at shutdown, giving up"
            );
        }

        let stats = self.dispatcher.stats();
        info!(
            detected,
            rebuilds = stats.rebuilds_started,
            coalesced = stats.hashes_coalesced,
            "Engine stopped"
        );
        Ok(EngineReport {
            baseline,
            detected,
            stats,
            settled,
        })
    }
}
