//! Remote ref poller: one session, one `git-upload-pack`, one hash

use thiserror::Error;
use tracing::debug;

use crate::protocol::{ProtocolError, read_advertised_head};
use crate::repo::{CommitHash, RepositoryIdentity};
use crate::transport::{Transport, TransportError};

/// Why a poll produced no hash
#[derive(Debug, Error)]
pub enum PollError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol failure: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Remote command that advertises refs for `repo`
///
/// The path is single-quoted; [`RepositoryIdentity`] guarantees it holds no
/// quote or shell metacharacter.
pub fn upload_pack_command(repo: &RepositoryIdentity) -> String {
    format!("git-upload-pack '{}'", repo.path())
}

/// Fetch the hash currently advertised by the remote
///
/// The session is closed on every path. When the stream failed to parse and
/// the close shows the connection itself failed, the connection failure is
/// reported instead since it is the root cause. A non-zero exit of the remote
/// command does not replace a parse failure. No retries happen here.
pub async fn fetch_head(transport: &dyn Transport, repo: &RepositoryIdentity) -> Result<CommitHash, PollError> {
    debug!(host = transport.host(), %repo, "fetch_head: called");
    let mut session = transport.open().await?;

    let command = upload_pack_command(repo);
    let outcome: Result<CommitHash, PollError> = async {
        let stream = session.exec(&command).await?;
        Ok(read_advertised_head(stream).await?)
    }
    .await;

    let closed = session.close().await;
    match (outcome, closed) {
        (Ok(hash), Err(e)) => {
            debug!(error = %e, "fetch_head: close reported an error after a successful read");
            Ok(hash)
        }
        (Ok(hash), Ok(())) => Ok(hash),
        (Err(PollError::Protocol(parse)), Err(close @ TransportError::Connect { .. })) => {
            debug!(error = %parse, "fetch_head: parse failed, reporting transport failure instead");
            Err(PollError::Transport(close))
        }
        (Err(e), Err(close)) => {
            debug!(error = %close, "fetch_head: close also failed");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}
