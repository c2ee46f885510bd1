//! Transport seam between the poller and the remote host
//!
//! A [`Transport`] opens sessions; a [`Session`] runs exactly one remote
//! command and exposes its stdout. Callers must call [`Session::close`] on
//! every path, and implementations should also tear down on drop.

mod ssh;

pub use ssh::{OpenSshTransport, SshOptions, usable_identities};

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Byte stream produced by a remote command
pub type RemoteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Errors raised by a transport or one of its sessions
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("failed to open session: {0}")]
    Session(String),

    #[error("failed to start remote command '{command}': {message}")]
    CommandStart { command: String, message: String },

    #[error("remote command exited with {0}")]
    RemoteCommand(String),

    #[error("no usable SSH private key among {0:?}")]
    NoUsableKeys(Vec<PathBuf>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Factory for authenticated sessions to one remote host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session
    async fn open(&self) -> Result<Box<dyn Session>, TransportError>;

    /// Host name used in log lines
    fn host(&self) -> &str;
}

/// One session on the remote host
#[async_trait]
pub trait Session: Send {
    /// Start `command` remotely and return its stdout
    async fn exec(&mut self, command: &str) -> Result<RemoteStream, TransportError>;

    /// Tear the session down
    ///
    /// Returns an error when the session's own exit status shows that the
    /// transport failed, even if the caller already saw its stream end.
    async fn close(&mut self) -> Result<(), TransportError>;
}
