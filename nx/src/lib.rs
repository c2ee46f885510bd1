//! nxcd - pull-based continuous deployment for NixOS hosts
//!
//! The host polls a remote git branch over SSH and, whenever the head commit
//! moves, runs `nixos-rebuild switch` against the flake at that exact
//! revision. Only the commit hash is read from the remote; nothing is cloned.
//!
//! # Core Concepts
//!
//! - **Advertisement only**: `git-upload-pack` is started and its first ref
//!   line gives the head hash
//! - **One rebuild at a time**: updates that arrive mid-rebuild coalesce into
//!   the newest one, which runs next
//! - **Best effort**: failed polls and failed rebuilds are logged; the next
//!   new commit tries again
//!
//! # Modules
//!
//! - [`repo`] - Repository identity and commit hashes
//! - [`protocol`] - Pkt-line framing and head extraction
//! - [`transport`] - Remote session trait and the OpenSSH implementation
//! - [`poller`] - One-shot remote head lookup
//! - [`detector`] - Interval polling and change detection
//! - [`dispatcher`] - Rebuild serialization and coalescing
//! - [`deploy`] - Rebuild command execution
//! - [`notifier`] - Best-effort status messages
//! - [`engine`] - Wiring and shutdown
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod deploy;
pub mod detector;
pub mod dispatcher;
pub mod engine;
pub mod notifier;
pub mod poller;
pub mod protocol;
pub mod repo;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, ConfigError, DeployConfig};
pub use deploy::{DeployError, Deployer, FlakeSource, RebuildCommand};
pub use detector::{ChangeDetector, CommitStream};
pub use dispatcher::{DispatchOutcome, DispatchState, DispatchStats, Dispatcher};
pub use engine::{Engine, EngineReport, EngineSettings};
pub use notifier::{LogSink, MatrixConfig, MatrixSink, Notifier, NotifyError, NotifySink, new_commit_message};
pub use poller::{PollError, fetch_head};
pub use protocol::{ProtocolError, read_advertised_head};
pub use repo::{CommitHash, RepoError, RepositoryIdentity};
pub use transport::{OpenSshTransport, RemoteStream, Session, SshOptions, Transport, TransportError};
