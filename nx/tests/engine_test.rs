//! End-to-end engine scenarios against a scripted remote and a gated rebuild

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nxcd::protocol::encode_frame;
use nxcd::{
    CommitHash, DeployError, Deployer, DispatchState, Engine, EngineSettings, Notifier, NotifyError, NotifySink,
    RemoteStream, RepositoryIdentity, Session, Transport, TransportError,
};
use tokio::sync::{Semaphore, mpsc};

// =============================================================================
// Test doubles
// =============================================================================

/// Remote whose advertised head the test can move; `None` fails the poll
struct ScriptedRemote {
    head: Mutex<Option<String>>,
    polls: AtomicUsize,
}

impl ScriptedRemote {
    fn new(head: &str) -> Arc<Self> {
        Arc::new(Self {
            head: Mutex::new(Some(head.to_string())),
            polls: AtomicUsize::new(0),
        })
    }

    fn set_head(&self, head: Option<&str>) {
        *self.head.lock().unwrap() = head.map(str::to_string);
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

struct ScriptedSession(Option<String>);

#[async_trait]
impl Transport for ScriptedRemote {
    async fn open(&self) -> Result<Box<dyn Session>, TransportError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession(self.head.lock().unwrap().clone())))
    }

    fn host(&self) -> &str {
        "git.example.org"
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn exec(&mut self, command: &str) -> Result<RemoteStream, TransportError> {
        assert_eq!(command, "git-upload-pack 'owner/infra'");
        let Some(hash) = self.0.take() else {
            return Err(TransportError::Connect {
                host: "git.example.org".to_string(),
                message: "connection refused".to_string(),
            });
        };
        let mut bytes = encode_frame(b"# service=git-upload-pack\n");
        bytes.extend(encode_frame(
            format!("{hash} HEAD\0multi_ack side-band-64k symref=HEAD:refs/heads/main\n").as_bytes(),
        ));
        bytes.extend(b"0000");
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Deployer that holds every rebuild until the test releases a permit
struct GatedDeployer {
    gate: Semaphore,
    started: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedDeployer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deployer for GatedDeployer {
    async fn apply(&self, _repo: &RepositoryIdentity, hash: &CommitHash) -> Result<(), DeployError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(hash.to_string());

        self.gate.acquire().await.unwrap().forget();

        self.finished.lock().unwrap().push(hash.to_string());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl NotifySink for RecordingSink {
    async fn deliver(&self, message: &str) -> Result<(), NotifyError> {
        self.messages.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    remote: Arc<ScriptedRemote>,
    deployer: Arc<GatedDeployer>,
    sink: Arc<RecordingSink>,
    state: Box<dyn Fn() -> DispatchState + Send>,
    shutdown: mpsc::Sender<()>,
    handle: tokio::task::JoinHandle<Result<nxcd::EngineReport, nxcd::PollError>>,
}

fn start(baseline: &str) -> Harness {
    let remote = ScriptedRemote::new(baseline);
    let deployer = GatedDeployer::new();
    let sink = Arc::new(RecordingSink::default());
    let (notifier, _delivery) = Notifier::spawn(sink.clone(), 16);

    let engine = Engine::new(
        EngineSettings {
            repo: RepositoryIdentity::new("owner/infra", "main").unwrap(),
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
        },
        remote.clone(),
        deployer.clone(),
        notifier,
    );
    let dispatcher = engine.dispatcher().clone();
    let (shutdown, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move { engine.run(rx).await });

    Harness {
        remote,
        deployer,
        sink,
        state: Box::new(move || dispatcher.state()),
        shutdown,
        handle,
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

impl Harness {
    async fn wait_polls(&self, more: usize) {
        let target = self.remote.polls() + more;
        let remote = self.remote.clone();
        eventually("polls", move || remote.polls() >= target).await;
    }

    /// Messages are queued right before dispatch, so delivery implies the
    /// dispatcher has seen the hash.
    async fn wait_for_message(&self, message: &str) {
        let sink = self.sink.clone();
        let message = message.to_string();
        eventually("notification", move || sink.messages.lock().unwrap().contains(&message)).await;
    }

    async fn stop(self) -> nxcd::EngineReport {
        self.shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("engine did not stop")
            .unwrap()
            .unwrap()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_unchanged_head_never_rebuilds() {
    let h = start("aaa111");
    h.wait_polls(6).await;

    assert!(h.deployer.started().is_empty());
    assert!(h.sink.messages.lock().unwrap().is_empty());

    let report = h.stop().await;
    assert_eq!(report.baseline.as_str(), "aaa111");
    assert_eq!(report.detected, 0);
    assert_eq!(report.stats.rebuilds_started, 0);
    assert!(report.settled);
}

#[tokio::test]
async fn test_update_during_rebuild_runs_next() {
    let h = start("aaa111");
    h.wait_polls(1).await;

    h.remote.set_head(Some("bbb222"));
    let deployer = h.deployer.clone();
    eventually("bbb222 rebuild", move || deployer.started() == ["bbb222"]).await;

    h.remote.set_head(Some("ccc333"));
    eventually("ccc333 queued", || (h.state)() == DispatchState::Pending).await;
    assert_eq!(h.deployer.started(), ["bbb222"]);

    h.deployer.gate.add_permits(2);
    let deployer = h.deployer.clone();
    eventually("both rebuilds", move || deployer.finished().len() == 2).await;
    h.wait_polls(3).await;

    assert_eq!(h.deployer.finished(), ["bbb222", "ccc333"]);
    assert_eq!(h.deployer.max_in_flight.load(Ordering::SeqCst), 1);

    let sink = h.sink.clone();
    eventually("notifications", move || sink.messages.lock().unwrap().len() == 2).await;
    assert_eq!(
        *h.sink.messages.lock().unwrap(),
        ["new commit on repo: bbb222", "new commit on repo: ccc333"]
    );

    let report = h.stop().await;
    assert_eq!(report.detected, 2);
    assert_eq!(report.stats.rebuilds_started, 2);
}

#[tokio::test]
async fn test_burst_during_rebuild_coalesces_to_latest() {
    let h = start("aaa111");
    h.wait_polls(1).await;

    h.remote.set_head(Some("bbb222"));
    let deployer = h.deployer.clone();
    eventually("bbb222 rebuild", move || deployer.started() == ["bbb222"]).await;

    for head in ["ccc333", "ddd444", "eee555"] {
        h.remote.set_head(Some(head));
        h.wait_for_message(&format!("new commit on repo: {head}")).await;
    }

    h.deployer.gate.add_permits(10);
    let deployer = h.deployer.clone();
    eventually("rebuilds settle", move || deployer.finished().len() == 2).await;
    h.wait_polls(3).await;

    assert_eq!(h.deployer.finished(), ["bbb222", "eee555"]);
    let report = h.stop().await;
    assert_eq!(report.detected, 4);
    assert_eq!(report.stats.rebuilds_started, 2);
    assert_eq!(report.stats.hashes_coalesced, 2);
}

#[tokio::test]
async fn test_failed_poll_keeps_baseline() {
    let h = start("aaa111");
    h.wait_polls(1).await;

    h.remote.set_head(None);
    h.wait_polls(3).await;
    h.remote.set_head(Some("aaa111"));
    h.wait_polls(3).await;

    assert!(h.deployer.started().is_empty());
    assert!(h.sink.messages.lock().unwrap().is_empty());

    h.deployer.gate.add_permits(1);
    h.remote.set_head(Some("bbb222"));
    let deployer = h.deployer.clone();
    eventually("bbb222 rebuild", move || deployer.finished() == ["bbb222"]).await;

    let report = h.stop().await;
    assert_eq!(report.detected, 1);
    assert_eq!(report.stats.rebuilds_started, 1);
}

#[tokio::test]
async fn test_baseline_failure_is_fatal() {
    let remote = ScriptedRemote::new("aaa111");
    remote.set_head(None);
    let (notifier, _delivery) = Notifier::spawn(Arc::new(RecordingSink::default()), 4);
    let engine = Engine::new(
        EngineSettings {
            repo: RepositoryIdentity::new("owner/infra", "main").unwrap(),
            poll_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(1),
        },
        remote.clone(),
        GatedDeployer::new(),
        notifier,
    );
    let (_tx, rx) = mpsc::channel(1);

    let err = engine.run(rx).await.err().unwrap();
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(remote.polls(), 1);
}
