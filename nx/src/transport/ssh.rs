//! Transport backed by the system OpenSSH client
//!
//! Every session is one `ssh` child process. stdin is closed, so the remote
//! `git-upload-pack` sees end-of-input right after the advertisement and
//! exits on its own; `kill_on_drop` covers every other path.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{RemoteStream, Session, Transport, TransportError};

/// How long `close` waits for ssh to exit before killing it
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Exit status ssh reserves for its own failures (connect, auth, ...)
const SSH_FAILURE_STATUS: i32 = 255;

/// Connection settings for [`OpenSshTransport`]
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub program: String,
    pub user: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub identities: Vec<PathBuf>,
}

fn looks_like_private_key(content: &str) -> bool {
    content.lines().any(|line| {
        let line = line.trim();
        line.starts_with("-----BEGIN") && line.ends_with("PRIVATE KEY-----")
    })
}

/// Keep the key files that are readable and hold a private key block
///
/// Unusable files are logged and skipped; an empty result is an error.
pub fn usable_identities(paths: &[PathBuf]) -> Result<Vec<PathBuf>, TransportError> {
    let mut usable = Vec::new();
    for path in paths {
        match std::fs::read_to_string(path) {
            Ok(content) if looks_like_private_key(&content) => usable.push(path.clone()),
            Ok(_) => warn!(path = %path.display(), "file does not contain a private key, skipping"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read private key file, skipping"),
        }
    }

    if usable.is_empty() {
        return Err(TransportError::NoUsableKeys(paths.to_vec()));
    }
    Ok(usable)
}

/// [`Transport`] that shells out to `ssh`
#[derive(Debug, Clone)]
pub struct OpenSshTransport {
    options: SshOptions,
}

impl OpenSshTransport {
    /// Build the transport, filtering `options.identities` down to usable keys
    pub fn new(mut options: SshOptions) -> Result<Self, TransportError> {
        debug!(host = %options.host, keys = options.identities.len(), "OpenSshTransport::new: called");
        options.identities = usable_identities(&options.identities)?;
        Ok(Self { options })
    }

    fn args(&self, command: &str) -> Vec<String> {
        let opts = &self.options;
        let mut args = vec![
            "-T".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", opts.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ServerAliveInterval={}", opts.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-p".to_string(),
            opts.port.to_string(),
        ];
        for key in &opts.identities {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", opts.user, opts.host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn open(&self) -> Result<Box<dyn Session>, TransportError> {
        debug!(host = %self.options.host, "OpenSshTransport::open: called");
        Ok(Box::new(OpenSshSession {
            transport: self.clone(),
            child: None,
        }))
    }

    fn host(&self) -> &str {
        &self.options.host
    }
}

struct OpenSshSession {
    transport: OpenSshTransport,
    child: Option<Child>,
}

impl OpenSshSession {
    fn status_error(&self, status: ExitStatus) -> Option<TransportError> {
        match status.code() {
            Some(0) => None,
            Some(SSH_FAILURE_STATUS) => Some(TransportError::Connect {
                host: self.transport.options.host.clone(),
                message: format!("ssh exited with status {SSH_FAILURE_STATUS}"),
            }),
            _ => Some(TransportError::RemoteCommand(status.to_string())),
        }
    }
}

#[async_trait]
impl Session for OpenSshSession {
    async fn exec(&mut self, command: &str) -> Result<RemoteStream, TransportError> {
        if self.child.is_some() {
            return Err(TransportError::Session("session already ran a command".to_string()));
        }

        let args = self.transport.args(command);
        debug!(program = %self.transport.options.program, ?args, "OpenSshSession::exec: spawning");

        let mut child = Command::new(&self.transport.options.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::CommandStart {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        self.child = Some(child);

        match stdout {
            Some(stdout) => Ok(Box::new(stdout)),
            None => Err(TransportError::Session("ssh stdout was not captured".to_string())),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "OpenSshSession::close: ssh exited");
                match self.status_error(status) {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => {
                debug!("OpenSshSession::close: grace period elapsed, killing ssh");
                child.kill().await?;
                Ok(())
            }
        }
    }
}
