// src/queue.rs

//! The download queue: the single owner of live transfers.
//!
//! All mutation happens inside one task. Commands from [`QueueHandle`] and
//! reports from transfers arrive on the same channel, so a pause and a
//! completion racing for one session are applied in arrival order and never
//! interleave mid-update.

use crate::config::QueueConfig;
use crate::models::{
    BatchReport, EnqueueRequest, QueueSnapshot, SessionRecord, SessionStatus, TransferState,
};
use crate::observer::{self, ObserverHandle, QueueObserver, Subscription};
use crate::paths::{filename_from_url, occupied_on_disk, partial_path, sanitize_filename, unique_destination};
use crate::session_store::{SessionStore, StoreError};
use crate::transfer::{
    DataTransfer, EventSink, HttpTransfer, Transfer, TransferCore, TransferError, TransferEvent,
    TransferReport,
};
use log::{debug, info, warn};
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a cancelled run may take to let go of its partial file.
const RUN_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("download {0} not found")]
    NotFound(u64),
    #[error("download {0} is already in the queue")]
    Conflict(u64),
    #[error("{} is already the destination of download {session_id}", destination.display())]
    DestinationClaimed { session_id: u64, destination: PathBuf },
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("download queue has shut down")]
    Shutdown,
}

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

pub(crate) enum Command {
    Enqueue { transfer: Box<dyn Transfer>, reply: Reply<u64> },
    EnqueueRequest { request: EnqueueRequest, reply: Reply<u64> },
    Dequeue { session_id: u64, delete: bool, reply: Reply<()> },
    Pause { session_id: u64, reply: Reply<()> },
    Resume { session_id: u64, reply: Reply<()> },
    Cancel { session_id: u64, reply: Reply<()> },
    PauseAll { reply: oneshot::Sender<BatchReport> },
    ResumeAll { reply: oneshot::Sender<BatchReport> },
    CancelAll { reply: oneshot::Sender<BatchReport> },
    List { reply: Reply<Vec<SessionRecord>> },
    Snapshot { reply: oneshot::Sender<QueueSnapshot> },
    AllocateSessionId { reply: Reply<u64> },
    Subscribe { observer: ObserverHandle },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Everything the queue task receives, in one ordered stream.
pub(crate) enum QueueMessage {
    Command(Command),
    Report(TransferReport),
}

/// Cloneable front door to a running [`DownloadQueue`].
///
/// Every call returns as soon as the queue has applied the command; none of
/// them wait on the network. When the last handle is dropped the queue
/// pauses whatever is still running and stops.
#[derive(Clone)]
pub struct QueueHandle {
    tx: UnboundedSender<QueueMessage>,
}

impl QueueHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Command(make(reply)))
            .map_err(|_| QueueError::Shutdown)?;
        rx.await.map_err(|_| QueueError::Shutdown)
    }

    /// Adds a caller-built transfer. Fails with `Conflict` or
    /// `DestinationClaimed` (and changes
    /// nothing) if its session id is already a member.
    pub async fn enqueue(&self, transfer: Box<dyn Transfer>) -> Result<u64, QueueError> {
        self.request(|reply| Command::Enqueue { transfer, reply }).await?
    }

    /// Allocates a session id if needed, picks a collision-free destination
    /// and builds the matching transfer variant.
    pub async fn enqueue_request(&self, request: EnqueueRequest) -> Result<u64, QueueError> {
        self.request(|reply| Command::EnqueueRequest { request, reply }).await?
    }

    /// Removes a member. With `delete` the transport, the record and the
    /// partial file go too; without it the record keeps its last status.
    pub async fn dequeue(&self, session_id: u64, delete: bool) -> Result<(), QueueError> {
        self.request(|reply| Command::Dequeue { session_id, delete, reply }).await?
    }

    pub async fn pause_download(&self, session_id: u64) -> Result<(), QueueError> {
        self.request(|reply| Command::Pause { session_id, reply }).await?
    }

    /// Resumes a paused member, or restores a paused/failed session from the
    /// store when it is not a member (e.g. after a restart).
    pub async fn resume_download(&self, session_id: u64) -> Result<(), QueueError> {
        self.request(|reply| Command::Resume { session_id, reply }).await?
    }

    /// Deletes the download and its persisted session, whether or not it
    /// is a live member.
    pub async fn delete_download(&self, session_id: u64) -> Result<(), QueueError> {
        self.dequeue(session_id, true).await
    }

    /// Cancels a member, discarding its partial file. The record stays as
    /// `fail` so the download can be retried.
    pub async fn cancel_download(&self, session_id: u64) -> Result<(), QueueError> {
        self.request(|reply| Command::Cancel { session_id, reply }).await?
    }

    pub async fn pause_all(&self) -> Result<BatchReport, QueueError> {
        self.request(|reply| Command::PauseAll { reply }).await
    }

    pub async fn resume_all(&self) -> Result<BatchReport, QueueError> {
        self.request(|reply| Command::ResumeAll { reply }).await
    }

    pub async fn cancel_all(&self) -> Result<BatchReport, QueueError> {
        self.request(|reply| Command::CancelAll { reply }).await
    }

    /// Every persisted session, ordered by session id.
    pub async fn list(&self) -> Result<Vec<SessionRecord>, QueueError> {
        self.request(|reply| Command::List { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn allocate_session_id(&self) -> Result<u64, QueueError> {
        self.request(|reply| Command::AllocateSessionId { reply }).await?
    }

    /// Registers `observer` without keeping it alive. Replaces any previous
    /// observer; dropping the returned [`Subscription`] stops delivery.
    pub fn subscribe<O>(&self, observer: &Arc<O>) -> Result<Subscription, QueueError>
    where
        O: QueueObserver + 'static,
    {
        let (handle, subscription) = observer::register(observer);
        self.tx
            .send(QueueMessage::Command(Command::Subscribe { observer: handle }))
            .map_err(|_| QueueError::Shutdown)?;
        Ok(subscription)
    }

    /// Pauses and persists every member, then stops the queue.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// A store write that failed and will be retried on the next state change.
enum UnsyncedWrite {
    Upsert(SessionRecord),
    Remove,
}

/// The queue state. Lives inside its own task; reach it through [`QueueHandle`].
pub struct DownloadQueue {
    rx: UnboundedReceiver<QueueMessage>,
    tx: WeakUnboundedSender<QueueMessage>,
    store: SessionStore,
    client: Client,
    download_dir: PathBuf,
    progress_persist_interval: Duration,
    downloads: Vec<Box<dyn Transfer>>,
    observer: Option<ObserverHandle>,
    combined_bytes_downloaded: u64,
    combined_total_bytes_expected: Option<u64>,
    is_empty: bool,
    last_persisted: HashMap<u64, Instant>,
    unsynced: HashMap<u64, UnsyncedWrite>,
}

impl DownloadQueue {
    /// Reconciles stalled sessions in `store` and starts the queue task.
    pub async fn start(
        store: SessionStore,
        config: &QueueConfig,
        client: Client,
    ) -> Result<QueueHandle, StoreError> {
        store.reconcile_stale().await?;
        let (queue, handle) = Self::new(store, config, client);
        tokio::spawn(queue.run());
        Ok(handle)
    }

    fn new(store: SessionStore, config: &QueueConfig, client: Client) -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            rx,
            tx: tx.downgrade(),
            store,
            client,
            download_dir: config.download_dir.clone(),
            progress_persist_interval: config.progress_persist_interval(),
            downloads: Vec::new(),
            observer: None,
            combined_bytes_downloaded: 0,
            combined_total_bytes_expected: Some(0),
            is_empty: true,
            last_persisted: HashMap::new(),
            unsynced: HashMap::new(),
        };
        (queue, QueueHandle { tx })
    }

    async fn run(mut self) {
        info!("Queue: started.");
        while let Some(message) = self.rx.recv().await {
            match message {
                QueueMessage::Command(Command::Shutdown { reply }) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                QueueMessage::Command(command) => self.handle_command(command).await,
                QueueMessage::Report(report) => self.handle_report(report).await,
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        self.flush_unsynced().await;

        match command {
            Command::Enqueue { transfer, reply } => {
                let _ = reply.send(self.enqueue(transfer).await);
            }
            Command::EnqueueRequest { request, reply } => {
                let _ = reply.send(self.enqueue_request(request).await);
            }
            Command::Dequeue { session_id, delete, reply } => {
                let _ = reply.send(self.dequeue(session_id, delete).await);
            }
            Command::Pause { session_id, reply } => {
                let _ = reply.send(self.pause(session_id).await);
            }
            Command::Resume { session_id, reply } => {
                let _ = reply.send(self.resume(session_id).await);
            }
            Command::Cancel { session_id, reply } => {
                let _ = reply.send(self.cancel(session_id).await);
            }
            Command::PauseAll { reply } => {
                let _ = reply.send(self.pause_all().await);
            }
            Command::ResumeAll { reply } => {
                let _ = reply.send(self.resume_all().await);
            }
            Command::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all().await);
            }
            Command::List { reply } => {
                let _ = reply.send(self.list().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::AllocateSessionId { reply } => {
                let result = self.store.allocate_session_id().await.map_err(QueueError::from);
                let _ = reply.send(result);
            }
            Command::Subscribe { observer } => {
                self.observer = Some(observer);
            }
            Command::Shutdown { reply } => {
                // Handled by `run`; kept for exhaustiveness.
                let _ = reply.send(());
            }
        }
    }

    async fn handle_report(&mut self, report: TransferReport) {
        let Some(index) = self.position(report.session_id) else {
            debug!("Queue: dropping report for departed session {}.", report.session_id);
            return;
        };
        if self.downloads[index].generation() != report.generation {
            debug!(
                "Queue: dropping report from superseded run {} of session {}.",
                report.generation, report.session_id
            );
            return;
        }

        self.flush_unsynced().await;
        match report.event {
            TransferEvent::Progress {
                bytes_downloaded,
                total_bytes_expected,
            } => self.on_progress(index, bytes_downloaded, total_bytes_expected).await,
            TransferEvent::Finished { location } => self.on_finished(index, location).await,
            TransferEvent::Failed { error } => self.on_failed(index, error).await,
        }
    }

    fn position(&self, session_id: u64) -> Option<usize> {
        self.downloads.iter().position(|t| t.session_id() == session_id)
    }

    fn member(&self, session_id: u64) -> Result<usize, QueueError> {
        self.position(session_id).ok_or_else(|| {
            warn!("Queue: session {} is not in the queue.", session_id);
            QueueError::NotFound(session_id)
        })
    }

    async fn enqueue(&mut self, mut transfer: Box<dyn Transfer>) -> Result<u64, QueueError> {
        let session_id = transfer.session_id();
        if self.position(session_id).is_some() {
            warn!("Queue: session {} is already queued, ignoring.", session_id);
            return Err(QueueError::Conflict(session_id));
        }
        if let Some(holder) = self
            .downloads
            .iter()
            .find(|t| t.destination() == transfer.destination())
        {
            warn!(
                "Queue: session {} wants {}, already claimed by session {}.",
                session_id,
                transfer.destination().display(),
                holder.session_id()
            );
            return Err(QueueError::DestinationClaimed {
                session_id: holder.session_id(),
                destination: transfer.destination().to_path_buf(),
            });
        }

        transfer.start(EventSink::new(session_id, self.tx.clone()));
        let record = transfer.to_record(None);
        let info = transfer.info();
        self.downloads.push(transfer);

        // A failed write is retried on the next state change.
        let _ = self.write(record).await;

        info!("Queue: started session {} ({}).", session_id, info.filename);
        self.notify(|o| o.on_download_started(&info));
        self.publish();
        Ok(session_id)
    }

    async fn enqueue_request(&mut self, request: EnqueueRequest) -> Result<u64, QueueError> {
        if let Some(session_id) = request.session_id {
            if self.position(session_id).is_some() {
                warn!("Queue: session {} is already queued, ignoring.", session_id);
                return Err(QueueError::Conflict(session_id));
            }
        }
        let session_id = match request.session_id {
            Some(session_id) => session_id,
            None => self.store.allocate_session_id().await?,
        };

        let filename = if request.filename.trim().is_empty() {
            filename_from_url(&request.request.url)
                .map(|name| sanitize_filename(&name))
                .unwrap_or_else(|| sanitize_filename(""))
        } else {
            sanitize_filename(&request.filename)
        };
        let destination = self.resolve_destination(&filename).await;
        let filename = destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(filename);

        let transfer: Box<dyn Transfer> = if request.request.is_data_url() {
            Box::new(DataTransfer::from_data_url(
                session_id,
                request.request,
                filename,
                request.mime_type,
                destination,
            )?)
        } else {
            let core = TransferCore::new(
                session_id,
                request.request,
                filename,
                request.mime_type,
                destination,
                request.expected_file_size,
            );
            Box::new(HttpTransfer::new(self.client.clone(), core))
        };
        self.enqueue(transfer).await
    }

    /// A path under the download folder that no live session and no file on
    /// disk already claims.
    async fn resolve_destination(&mut self, filename: &str) -> PathBuf {
        let mut claimed: HashSet<PathBuf> = self
            .downloads
            .iter()
            .map(|t| t.destination().to_path_buf())
            .collect();
        match self.store.list_all().await {
            Ok(records) => claimed.extend(
                records
                    .into_iter()
                    .filter(|r| r.status.holds_destination())
                    .map(|r| r.destination),
            ),
            Err(e) => warn!("Queue: could not read sessions while naming {}: {}", filename, e),
        }
        unique_destination(&self.download_dir, filename, |candidate| {
            claimed.contains(candidate) || occupied_on_disk(candidate)
        })
    }

    async fn dequeue(&mut self, session_id: u64, delete: bool) -> Result<(), QueueError> {
        let Some(index) = self.position(session_id) else {
            if delete {
                return self.delete_orphan(session_id).await;
            }
            warn!("Queue: session {} is not in the queue.", session_id);
            return Err(QueueError::NotFound(session_id));
        };

        let transfer = self.downloads.remove(index);
        let result = if delete {
            self.delete_member(transfer).await
        } else {
            self.release_member(transfer).await
        };
        self.publish();
        result.map_err(QueueError::from)
    }

    /// Cancels a member and forgets it entirely.
    async fn delete_member(&mut self, mut transfer: Box<dyn Transfer>) -> Result<(), StoreError> {
        let session_id = transfer.session_id();
        transfer.cancel();
        let run = transfer.take_run();
        let info = transfer.info();
        drop(transfer);
        settle(session_id, run).await;
        remove_partial(&info.destination).await;

        let result = self.erase(session_id).await;
        info!("Queue: deleted session {}.", session_id);
        self.notify(|o| o.on_download_failed(session_id, &TransferError::Cancelled));
        self.notify(|o| o.on_download_removed(&info));
        result
    }

    /// Takes a member out of the queue but keeps its session for later.
    async fn release_member(&mut self, mut transfer: Box<dyn Transfer>) -> Result<(), StoreError> {
        transfer.pause();
        let info = transfer.info();
        let record = transfer.to_record(None);
        drop(transfer);

        let result = self.write(record).await;
        info!("Queue: released session {} as {:?}.", info.session_id, info.state);
        self.notify(|o| o.on_download_removed(&info));
        result
    }

    /// Delete for a session that only exists in the store.
    async fn delete_orphan(&mut self, session_id: u64) -> Result<(), QueueError> {
        let Some(record) = self.store.get(session_id).await? else {
            warn!("Queue: no session {} to delete.", session_id);
            return Err(QueueError::NotFound(session_id));
        };
        if record.status != SessionStatus::Completed {
            remove_partial(&record.destination).await;
        }
        self.erase(session_id).await?;
        info!("Queue: deleted stored session {}.", session_id);
        Ok(())
    }

    async fn pause(&mut self, session_id: u64) -> Result<(), QueueError> {
        let index = self.member(session_id)?;
        self.pause_member(index).await.map_err(QueueError::from)
    }

    async fn pause_member(&mut self, index: usize) -> Result<(), StoreError> {
        let transfer = &mut self.downloads[index];
        transfer.pause();
        if transfer.state() != TransferState::Paused {
            return Ok(());
        }
        let record = transfer.to_record(None);
        info!("Queue: paused session {} at {} bytes.", record.session_id, record.bytes_downloaded);
        self.write(record).await
    }

    async fn resume(&mut self, session_id: u64) -> Result<(), QueueError> {
        match self.position(session_id) {
            Some(index) => self.resume_member(index).await.map_err(QueueError::from),
            None => self.restore(session_id).await,
        }
    }

    async fn resume_member(&mut self, index: usize) -> Result<(), StoreError> {
        let transfer = &mut self.downloads[index];
        transfer.resume();
        if transfer.state() != TransferState::Running {
            return Ok(());
        }
        let record = transfer.to_record(None);
        info!("Queue: resumed session {} from {} bytes.", record.session_id, record.bytes_downloaded);
        self.write(record).await
    }

    /// Brings a stored paused or failed session back as a live transfer.
    async fn restore(&mut self, session_id: u64) -> Result<(), QueueError> {
        let Some(record) = self.store.get(session_id).await? else {
            warn!("Queue: no session {} to resume.", session_id);
            return Err(QueueError::NotFound(session_id));
        };
        if record.status == SessionStatus::Completed {
            info!("Queue: session {} is already complete.", session_id);
            return Ok(());
        }

        let transfer: Box<dyn Transfer> = if record.request.is_data_url() {
            Box::new(DataTransfer::from_data_url(
                record.session_id,
                record.request.clone(),
                record.filename.clone(),
                record.mime_type.clone(),
                record.destination.clone(),
            )?)
        } else {
            Box::new(HttpTransfer::new(self.client.clone(), TransferCore::from_record(&record)))
        };
        self.enqueue(transfer).await.map(|_| ())
    }

    async fn cancel(&mut self, session_id: u64) -> Result<(), QueueError> {
        let index = self.member(session_id)?;
        let transfer = self.downloads.remove(index);
        let result = self.cancel_member(transfer).await;
        self.publish();
        result.map_err(QueueError::from)
    }

    async fn cancel_member(&mut self, mut transfer: Box<dyn Transfer>) -> Result<(), StoreError> {
        let session_id = transfer.session_id();
        transfer.cancel();
        let run = transfer.take_run();
        let info = transfer.info();
        let mut record = transfer.to_record(Some(TransferError::Cancelled.to_string()));
        record.bytes_downloaded = 0;
        drop(transfer);
        settle(session_id, run).await;
        remove_partial(&info.destination).await;

        let result = self.write(record).await;
        info!("Queue: cancelled session {}.", session_id);
        self.notify(|o| o.on_download_failed(session_id, &TransferError::Cancelled));
        self.notify(|o| o.on_download_removed(&info));
        result
    }

    async fn pause_all(&mut self) -> BatchReport {
        let mut report = BatchReport::default();
        for index in 0..self.downloads.len() {
            let session_id = self.downloads[index].session_id();
            match self.pause_member(index).await {
                Ok(()) => report.applied.push(session_id),
                Err(e) => report.failed.push((session_id, e.to_string())),
            }
        }
        report
    }

    async fn resume_all(&mut self) -> BatchReport {
        let mut report = BatchReport::default();
        for index in 0..self.downloads.len() {
            let session_id = self.downloads[index].session_id();
            match self.resume_member(index).await {
                Ok(()) => report.applied.push(session_id),
                Err(e) => report.failed.push((session_id, e.to_string())),
            }
        }
        report
    }

    async fn cancel_all(&mut self) -> BatchReport {
        let mut report = BatchReport::default();
        let members = std::mem::take(&mut self.downloads);
        for transfer in members {
            let session_id = transfer.session_id();
            match self.cancel_member(transfer).await {
                Ok(()) => report.applied.push(session_id),
                Err(e) => report.failed.push((session_id, e.to_string())),
            }
        }
        self.publish();
        report
    }

    async fn list(&mut self) -> Result<Vec<SessionRecord>, QueueError> {
        let mut records = self.store.list_all().await?;
        records.sort_by_key(|r| r.session_id);
        Ok(records)
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            downloads: self.downloads.iter().map(|t| t.info()).collect(),
            combined_bytes_downloaded: self.combined_bytes_downloaded,
            combined_total_bytes_expected: self.combined_total_bytes_expected,
        }
    }

    async fn on_progress(&mut self, index: usize, bytes_downloaded: u64, total_bytes_expected: Option<u64>) {
        let transfer = &mut self.downloads[index];
        let size_before = transfer.total_bytes_expected();
        transfer.record_progress(bytes_downloaded, total_bytes_expected);

        let session_id = transfer.session_id();
        let status = transfer.state().session_status();
        let size_learned = transfer.total_bytes_expected() != size_before;
        let record = transfer.to_record(None);

        let due = self
            .last_persisted
            .get(&session_id)
            .map_or(true, |at| at.elapsed() >= self.progress_persist_interval);
        if size_learned {
            let _ = self.write(record).await;
        } else if due {
            match self.store.update_progress(session_id, bytes_downloaded, status).await {
                Ok(()) => {
                    self.last_persisted.insert(session_id, Instant::now());
                }
                Err(e) => {
                    warn!("Queue: failed to persist progress of session {}: {}", session_id, e);
                    self.unsynced.insert(session_id, UnsyncedWrite::Upsert(record));
                }
            }
        }

        self.publish();
    }

    async fn on_finished(&mut self, index: usize, location: PathBuf) {
        let mut transfer = self.downloads.remove(index);
        transfer.mark_completed();
        let info = transfer.info();
        let record = transfer.to_record(None);
        drop(transfer);

        let _ = self.write(record).await;
        info!("Queue: session {} finished to {}.", info.session_id, location.display());
        self.notify(|o| o.on_download_finished(&info, &location));
        self.notify(|o| o.on_download_removed(&info));
        self.publish();
    }

    async fn on_failed(&mut self, index: usize, error: TransferError) {
        let mut transfer = self.downloads.remove(index);
        transfer.mark_failed();
        let info = transfer.info();
        let record = transfer.to_record(Some(error.to_string()));
        drop(transfer);

        let _ = self.write(record).await;
        warn!("Queue: session {} failed: {}", info.session_id, error);
        self.notify(|o| o.on_download_failed(info.session_id, &error));
        self.notify(|o| o.on_download_removed(&info));
        self.publish();
    }

    /// Recomputes the aggregate counters from the member set and tells the
    /// observer, including any empty/non-empty transition.
    fn publish(&mut self) {
        self.combined_bytes_downloaded = self.downloads.iter().map(|t| t.bytes_downloaded()).sum();
        self.combined_total_bytes_expected = self
            .downloads
            .iter()
            .map(|t| t.total_bytes_expected())
            .sum::<Option<u64>>();

        let (bytes, total) = (self.combined_bytes_downloaded, self.combined_total_bytes_expected);
        self.notify(|o| o.on_combined_progress(bytes, total));

        let is_empty = self.downloads.is_empty();
        if is_empty != self.is_empty {
            self.is_empty = is_empty;
            self.notify(|o| o.on_queue_empty_changed(is_empty));
        }
    }

    fn notify(&self, deliver: impl FnOnce(&dyn QueueObserver)) {
        if let Some(observer) = &self.observer {
            observer.notify(deliver);
        }
    }

    async fn write(&mut self, record: SessionRecord) -> Result<(), StoreError> {
        let session_id = record.session_id;
        let is_member = self.position(session_id).is_some();
        if !is_member {
            self.last_persisted.remove(&session_id);
        }
        match self.store.upsert(&record).await {
            Ok(()) => {
                self.unsynced.remove(&session_id);
                if is_member {
                    self.last_persisted.insert(session_id, Instant::now());
                }
                Ok(())
            }
            Err(e) => {
                warn!("Queue: failed to persist session {}: {}. Will retry.", session_id, e);
                self.unsynced.insert(session_id, UnsyncedWrite::Upsert(record));
                Err(e)
            }
        }
    }

    async fn erase(&mut self, session_id: u64) -> Result<(), StoreError> {
        self.last_persisted.remove(&session_id);
        match self.store.remove(session_id).await {
            Ok(()) => {
                self.unsynced.remove(&session_id);
                Ok(())
            }
            Err(e) => {
                warn!("Queue: failed to remove session {}: {}. Will retry.", session_id, e);
                self.unsynced.insert(session_id, UnsyncedWrite::Remove);
                Err(e)
            }
        }
    }

    /// Retries store writes that failed earlier. Members are written from
    /// their current state rather than the stale record.
    async fn flush_unsynced(&mut self) {
        if self.unsynced.is_empty() {
            return;
        }
        let pending: Vec<(u64, UnsyncedWrite)> = self.unsynced.drain().collect();
        for (session_id, write) in pending {
            let _ = match write {
                UnsyncedWrite::Remove => self.erase(session_id).await,
                UnsyncedWrite::Upsert(record) => {
                    let record = match self.position(session_id) {
                        Some(index) => self.downloads[index].to_record(record.error),
                        None => record,
                    };
                    self.write(record).await
                }
            };
        }
    }

    async fn shutdown(&mut self) {
        let members = std::mem::take(&mut self.downloads);
        let count = members.len();
        for mut transfer in members {
            transfer.pause();
            let record = transfer.to_record(None);
            drop(transfer);
            let _ = self.write(record).await;
        }
        self.flush_unsynced().await;
        info!("Queue: stopped, {} session(s) left paused.", count);
    }
}

/// Waits for a cancelled run to stop touching its partial file.
async fn settle(session_id: u64, run: Option<JoinHandle<()>>) {
    let Some(mut run) = run else {
        return;
    };
    if tokio::time::timeout(RUN_SETTLE_TIMEOUT, &mut run).await.is_err() {
        warn!("Queue: run of session {} did not stop in time, aborting it.", session_id);
        run.abort();
    }
}

async fn remove_partial(destination: &Path) {
    let partial = partial_path(destination);
    match tokio::fs::remove_file(&partial).await {
        Ok(()) => debug!("Queue: removed partial file {}.", partial.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Queue: could not remove {}: {}", partial.display(), e),
    }
}
