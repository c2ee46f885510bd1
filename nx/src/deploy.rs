//! Deploy executor: runs the rebuild command for one commit

use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::repo::{CommitHash, RepositoryIdentity};

/// Errors from a single rebuild attempt
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}")]
    Failed { program: String, status: String },
}

/// Applies a commit to the machine
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Rebuild for `hash`, returning once the attempt has finished
    async fn apply(&self, repo: &RepositoryIdentity, hash: &CommitHash) -> Result<(), DeployError>;
}

/// Where the flake source is fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlakeSource {
    pub scheme: String,
    pub user: String,
    pub host: String,
    /// Attribute under `nixosConfigurations` to build
    pub target: String,
}

impl FlakeSource {
    /// `<scheme>://<user>@<host>/<owner>/<name>?ref=<branch>&rev=<hash>#<target>`
    pub fn locator(&self, repo: &RepositoryIdentity, hash: &CommitHash) -> String {
        format!(
            "{}://{}@{}/{}/{}?ref={}&rev={}#{}",
            self.scheme,
            self.user,
            self.host,
            repo.owner(),
            repo.name(),
            repo.branch(),
            hash,
            self.target
        )
    }
}

/// Runs `<program> <args...> <locator>` with inherited stdio
#[derive(Debug, Clone)]
pub struct RebuildCommand {
    program: String,
    args: Vec<String>,
    source: FlakeSource,
}

impl RebuildCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>, source: FlakeSource) -> Self {
        Self {
            program: program.into(),
            args,
            source,
        }
    }

    /// Full argument list for one rebuild
    pub fn argv(&self, repo: &RepositoryIdentity, hash: &CommitHash) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(self.source.locator(repo, hash));
        argv
    }
}

#[async_trait]
impl Deployer for RebuildCommand {
    async fn apply(&self, repo: &RepositoryIdentity, hash: &CommitHash) -> Result<(), DeployError> {
        let argv = self.argv(repo, hash);
        info!(program = %self.program, ?argv, "Starting rebuild");

        let status = Command::new(&self.program)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| {
                error!(program = %self.program, error = %source, "Failed to start rebuild");
                DeployError::Spawn {
                    program: self.program.clone(),
                    source,
                }
            })?;

        if !status.success() {
            error!(program = %self.program, %status, hash = %hash, "Rebuild failed");
            return Err(DeployError::Failed {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }

        debug!(%status, "RebuildCommand::apply: finished");
        info!(hash = %hash, "Rebuild succeeded");
        Ok(())
    }
}
