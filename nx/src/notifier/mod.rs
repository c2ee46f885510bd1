//! Best-effort status notifications
//!
//! [`Notifier::notify`] never blocks: messages go into a bounded channel that
//! a single task drains into a [`NotifySink`]. When the buffer is full the
//! newest message is dropped and a warning is logged; messages already
//! buffered are delivered in order.

mod matrix;

pub use matrix::{MatrixConfig, MatrixSink};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::repo::CommitHash;

/// Default number of undelivered messages held before dropping
pub const DEFAULT_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} rejected the request with {status}: {body}")]
    Rejected {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// Somewhere messages are delivered
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn deliver(&self, message: &str) -> Result<(), NotifyError>;
}

/// Sink that only writes messages to the log
pub struct LogSink;

#[async_trait]
impl NotifySink for LogSink {
    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        info!(%message, "notification");
        Ok(())
    }
}

/// Message sent for every detected commit
pub fn new_commit_message(hash: &CommitHash) -> String {
    format!("new commit on repo: {hash}")
}

/// Non-blocking handle feeding the delivery task
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl Notifier {
    /// Spawn the delivery task for `sink`
    pub fn spawn(sink: Arc<dyn NotifySink>, buffer: usize) -> (Self, JoinHandle<()>) {
        debug!(buffer, "Notifier::spawn: called");
        let (tx, mut rx) = mpsc::channel::<String>(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.deliver(&message).await {
                    warn!(error = %e, %message, "Notification delivery failed");
                }
            }
            debug!("Notifier: all handles dropped, delivery task exiting");
        });

        let notifier = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (notifier, handle)
    }

    /// Queue `message`; drops it if the buffer is full or the task is gone
    pub fn notify(&self, message: impl Into<String>) {
        match self.tx.try_send(message.into()) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%message, "Notification buffer full, dropping message");
            }
            Err(TrySendError::Closed(message)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%message, "Notification task stopped, dropping message");
            }
        }
    }

    /// Messages dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct RecordingSink {
        gate: Semaphore,
        delivered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotifySink for RecordingSink {
        async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
            self.gate.acquire().await.unwrap().forget();
            self.delivered.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_new_commit_message_format() {
        let hash = CommitHash::new("bbb222").unwrap();
        assert_eq!(new_commit_message(&hash), "new commit on repo: bbb222");
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let sink = Arc::new(RecordingSink {
            gate: Semaphore::new(100),
            delivered: Mutex::new(Vec::new()),
        });
        let (notifier, handle) = Notifier::spawn(sink.clone(), 8);

        for i in 0..5 {
            notifier.notify(format!("m{i}"));
        }
        drop(notifier);
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(*sink.delivered.lock().unwrap(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_newest_without_blocking() {
        let sink = Arc::new(RecordingSink {
            gate: Semaphore::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let (notifier, handle) = Notifier::spawn(sink.clone(), 2);

        notifier.notify("first");
        // Let the task pull "first" and park on the gate.
        tokio::time::sleep(Duration::from_millis(20)).await;
        notifier.notify("second");
        notifier.notify("third");
        notifier.notify("fourth");
        assert_eq!(notifier.dropped(), 1);

        sink.gate.add_permits(10);
        drop(notifier);
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();

        assert_eq!(*sink.delivered.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        assert!(LogSink.deliver("hello").await.is_ok());
    }
}
