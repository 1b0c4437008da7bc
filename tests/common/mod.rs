// tests/common/mod.rs

#![allow(dead_code)]

use dlqueue::config::QueueConfig;
use dlqueue::models::{DownloadInfo, RequestDescriptor, TransferKind};
use dlqueue::observer::QueueObserver;
use dlqueue::paths::partial_path;
use dlqueue::queue::{DownloadQueue, QueueHandle};
use dlqueue::session_store::SessionStore;
use dlqueue::transfer::{EventSink, Transfer, TransferCore, TransferError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A transfer with no transport: the test drives its events by hand.
pub struct ScriptedTransfer {
    core: TransferCore,
    sink: Arc<Mutex<Option<EventSink>>>,
    launches: Arc<AtomicUsize>,
    halts: Arc<AtomicUsize>,
    /// When set, every launch leaves behind a run that writes the partial
    /// file this long after starting.
    late_write: Option<Duration>,
    run: Option<JoinHandle<()>>,
}

/// The test's remote control for a [`ScriptedTransfer`].
#[derive(Clone)]
pub struct Script {
    sink: Arc<Mutex<Option<EventSink>>>,
    launches: Arc<AtomicUsize>,
    halts: Arc<AtomicUsize>,
}

pub fn scripted(session_id: u64, expected: Option<u64>, dir: &Path) -> (Box<dyn Transfer>, Script) {
    let destination = dir.join(format!("file-{}.bin", session_id));
    build(session_id, expected, destination, None)
}

/// Like [`scripted`] but aimed at a caller-chosen destination.
pub fn scripted_to(session_id: u64, expected: Option<u64>, destination: PathBuf) -> (Box<dyn Transfer>, Script) {
    build(session_id, expected, destination, None)
}

/// A scripted transfer whose runs keep writing the partial file for `delay`
/// after they are told to stop.
pub fn lingering(session_id: u64, dir: &Path, delay: Duration) -> (Box<dyn Transfer>, Script) {
    let destination = dir.join(format!("file-{}.bin", session_id));
    build(session_id, Some(100), destination, Some(delay))
}

fn build(
    session_id: u64,
    expected: Option<u64>,
    destination: PathBuf,
    late_write: Option<Duration>,
) -> (Box<dyn Transfer>, Script) {
    let name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let core = TransferCore::new(
        session_id,
        RequestDescriptor::get(format!("http://example.invalid/{}", name)),
        name,
        "application/octet-stream",
        destination,
        expected,
    );
    let sink = Arc::new(Mutex::new(None));
    let launches = Arc::new(AtomicUsize::new(0));
    let halts = Arc::new(AtomicUsize::new(0));
    let transfer = ScriptedTransfer {
        core,
        sink: sink.clone(),
        launches: launches.clone(),
        halts: halts.clone(),
        late_write,
        run: None,
    };
    (
        Box::new(transfer),
        Script {
            sink,
            launches,
            halts,
        },
    )
}

impl Transfer for ScriptedTransfer {
    fn kind(&self) -> TransferKind {
        TransferKind::Http
    }

    fn core(&self) -> &TransferCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TransferCore {
        &mut self.core
    }

    fn launch(&mut self, sink: EventSink) {
        self.launches.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);

        if let Some(delay) = self.late_write {
            let partial = partial_path(&self.core.destination);
            self.run = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                tokio::fs::write(&partial, b"late bytes").await.unwrap();
            }));
        }
    }

    fn halt(&mut self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    fn take_run(&mut self) -> Option<JoinHandle<()>> {
        self.run.take()
    }
}

impl Script {
    /// The delegate of the most recent run.
    pub fn sink(&self) -> EventSink {
        self.sink.lock().unwrap().clone().expect("transfer was never launched")
    }

    pub fn progress(&self, bytes: u64, total: Option<u64>) {
        self.sink().progress(bytes, total);
    }

    pub fn finish(&self, location: PathBuf) {
        self.sink().finished(location);
    }

    pub fn fail(&self, error: TransferError) {
        self.sink().failed(error);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Started(u64),
    Removed(u64),
    Combined(u64, Option<u64>),
    Finished(u64, PathBuf),
    Failed(u64, bool),
    Empty(bool),
}

/// Observer that keeps every callback in arrival order.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
    changed: Notify,
}

impl Recorder {
    fn push(&self, event: Seen) {
        self.seen.lock().unwrap().push(event);
        self.changed.notify_one();
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last_combined(&self) -> Option<(u64, Option<u64>)> {
        self.seen().into_iter().rev().find_map(|event| match event {
            Seen::Combined(bytes, total) => Some((bytes, total)),
            _ => None,
        })
    }

    pub fn count(&self, wanted: &Seen) -> usize {
        self.seen().iter().filter(|event| *event == wanted).count()
    }

    /// Waits until `done` holds over the recorded events.
    pub async fn wait_for(&self, done: impl Fn(&[Seen]) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if done(&self.seen()) {
                    return;
                }
                self.changed.notified().await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out; saw {:?}", self.seen());
    }
}

impl QueueObserver for Recorder {
    fn on_download_started(&self, download: &DownloadInfo) {
        self.push(Seen::Started(download.session_id));
    }

    fn on_download_removed(&self, download: &DownloadInfo) {
        self.push(Seen::Removed(download.session_id));
    }

    fn on_combined_progress(&self, bytes_downloaded: u64, total_expected: Option<u64>) {
        self.push(Seen::Combined(bytes_downloaded, total_expected));
    }

    fn on_download_finished(&self, download: &DownloadInfo, destination: &Path) {
        self.push(Seen::Finished(download.session_id, destination.to_path_buf()));
    }

    fn on_download_failed(&self, session_id: u64, error: &TransferError) {
        self.push(Seen::Failed(session_id, error.is_cancellation()));
    }

    fn on_queue_empty_changed(&self, is_empty: bool) {
        self.push(Seen::Empty(is_empty));
    }
}

pub fn finished(session_id: u64) -> impl Fn(&[Seen]) -> bool {
    move |seen| seen.iter().any(|e| matches!(e, Seen::Finished(id, _) if *id == session_id))
}

pub fn failed(session_id: u64) -> impl Fn(&[Seen]) -> bool {
    move |seen| seen.iter().any(|e| matches!(e, Seen::Failed(id, _) if *id == session_id))
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: QueueConfig,
    pub store: SessionStore,
    pub queue: QueueHandle,
    pub recorder: Arc<Recorder>,
    pub subscription: dlqueue::observer::Subscription,
}

impl Harness {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::in_memory().await.unwrap();
        Self::with_store(dir, store).await
    }

    pub async fn with_store(dir: tempfile::TempDir, store: SessionStore) -> Self {
        let config = QueueConfig::rooted_at(dir.path());
        Self::with_config(dir, store, config).await
    }

    /// A queue over a database file at `config.database_path`, so a second
    /// connection can interfere with its writes.
    pub async fn on_disk(config: impl FnOnce(QueueConfig) -> QueueConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = config(QueueConfig::rooted_at(dir.path()));
        let store = SessionStore::open(&config.database_path).await.unwrap();
        Self::with_config(dir, store, config).await
    }

    pub async fn with_config(dir: tempfile::TempDir, store: SessionStore, config: QueueConfig) -> Self {
        let client = config.http_client().unwrap();
        let queue = DownloadQueue::start(store.clone(), &config, client).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let subscription = queue.subscribe(&recorder).unwrap();
        Self {
            dir,
            config,
            store,
            queue,
            recorder,
            subscription,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Makes every write to the session table fail until [`Harness::allow_writes`].
    pub fn block_writes(&self) {
        let conn = rusqlite::Connection::open(&self.config.database_path).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER block_insert BEFORE INSERT ON sessions
                BEGIN SELECT RAISE(FAIL, 'disk full'); END;
             CREATE TRIGGER block_update BEFORE UPDATE ON sessions
                BEGIN SELECT RAISE(FAIL, 'disk full'); END;
             CREATE TRIGGER block_delete BEFORE DELETE ON sessions
                BEGIN SELECT RAISE(FAIL, 'disk full'); END;",
        )
        .unwrap();
    }

    pub fn allow_writes(&self) {
        let conn = rusqlite::Connection::open(&self.config.database_path).unwrap();
        conn.execute_batch(
            "DROP TRIGGER block_insert;
             DROP TRIGGER block_update;
             DROP TRIGGER block_delete;",
        )
        .unwrap();
    }
}
