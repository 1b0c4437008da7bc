// src/transfer/mod.rs

//! Live transfers and the delegate they report through.
//!
//! The queue only ever talks to the [`Transfer`] capability set; concrete
//! variants (HTTP, `data:` URIs) supply the transport through
//! [`Transfer::launch`] and [`Transfer::halt`] and share the state machine in
//! [`TransferCore`].

pub mod data;
pub mod http;

use crate::models::{DownloadInfo, RequestDescriptor, SessionRecord, TransferKind, TransferState};
use crate::queue::QueueMessage;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

pub use data::DataTransfer;
pub use http::HttpTransfer;

/// Errors that end a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("download cancelled")]
    Cancelled,
}

impl TransferError {
    /// Distinguishes a user cancellation from a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

/// Something a transfer run reports back to its queue.
#[derive(Debug)]
pub enum TransferEvent {
    Progress {
        bytes_downloaded: u64,
        total_bytes_expected: Option<u64>,
    },
    Finished {
        location: PathBuf,
    },
    Failed {
        error: TransferError,
    },
}

/// A transfer event tagged with the session and run that produced it.
#[derive(Debug)]
pub struct TransferReport {
    pub session_id: u64,
    pub generation: u64,
    pub event: TransferEvent,
}

/// Non-owning delegate a transfer reports through.
///
/// Holds only a weak sender, so a transfer never keeps its queue alive; once
/// the queue is gone every report is silently dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: u64,
    generation: u64,
    tx: WeakUnboundedSender<QueueMessage>,
}

impl EventSink {
    pub(crate) fn new(session_id: u64, tx: WeakUnboundedSender<QueueMessage>) -> Self {
        Self {
            session_id,
            generation: 0,
            tx,
        }
    }

    /// The same delegate, stamped for a particular run.
    pub fn for_generation(&self, generation: u64) -> Self {
        Self {
            generation,
            ..self.clone()
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn progress(&self, bytes_downloaded: u64, total_bytes_expected: Option<u64>) {
        self.send(TransferEvent::Progress {
            bytes_downloaded,
            total_bytes_expected,
        });
    }

    pub fn finished(&self, location: PathBuf) {
        self.send(TransferEvent::Finished { location });
    }

    pub fn failed(&self, error: TransferError) {
        self.send(TransferEvent::Failed { error });
    }

    fn send(&self, event: TransferEvent) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let _ = tx.send(QueueMessage::Report(TransferReport {
            session_id: self.session_id,
            generation: self.generation,
            event,
        }));
    }
}

/// Identity, counters and state shared by every transfer variant.
#[derive(Debug)]
pub struct TransferCore {
    pub session_id: u64,
    pub request: RequestDescriptor,
    pub filename: String,
    pub mime_type: String,
    pub destination: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes_expected: Option<u64>,
    state: TransferState,
    generation: u64,
    sink: Option<EventSink>,
}

impl TransferCore {
    pub fn new(
        session_id: u64,
        request: RequestDescriptor,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        destination: PathBuf,
        total_bytes_expected: Option<u64>,
    ) -> Self {
        Self {
            session_id,
            request,
            filename: filename.into(),
            mime_type: mime_type.into(),
            destination,
            bytes_downloaded: 0,
            total_bytes_expected,
            state: TransferState::Created,
            generation: 0,
            sink: None,
        }
    }

    /// Rebuilds the core of a session that was interrupted earlier.
    pub fn from_record(record: &SessionRecord) -> Self {
        let mut core = Self::new(
            record.session_id,
            record.request.clone(),
            record.filename.clone(),
            record.mime_type.clone(),
            record.destination.clone(),
            record.total_bytes_expected,
        );
        core.bytes_downloaded = record.bytes_downloaded;
        core
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn run_sink(&self) -> Option<EventSink> {
        self.sink.as_ref().map(|s| s.for_generation(self.generation))
    }
}

/// Capability set every transfer kind offers the queue.
///
/// Implementors provide the transport (`launch`/`halt`); the state machine
/// in the provided methods decides when those are called.
pub trait Transfer: Send + Sync {
    fn kind(&self) -> TransferKind;
    fn core(&self) -> &TransferCore;
    fn core_mut(&mut self) -> &mut TransferCore;

    /// Starts moving bytes, reporting through `sink`.
    fn launch(&mut self, sink: EventSink);

    /// Stops in-flight transport work promptly. Bytes already on disk stay.
    fn halt(&mut self);

    /// Hands over the task of the latest run, so a caller that is about to
    /// discard the partial file can wait for the run to let go of it.
    fn take_run(&mut self) -> Option<JoinHandle<()>> {
        None
    }

    fn session_id(&self) -> u64 {
        self.core().session_id
    }

    fn state(&self) -> TransferState {
        self.core().state
    }

    fn generation(&self) -> u64 {
        self.core().generation
    }

    fn destination(&self) -> &Path {
        &self.core().destination
    }

    fn bytes_downloaded(&self) -> u64 {
        self.core().bytes_downloaded
    }

    fn total_bytes_expected(&self) -> Option<u64> {
        self.core().total_bytes_expected
    }

    fn is_complete(&self) -> bool {
        self.state() == TransferState::Completed
    }

    /// `created -> running`. Installs the delegate.
    fn start(&mut self, sink: EventSink) {
        if self.state() != TransferState::Created {
            return;
        }
        let core = self.core_mut();
        core.sink = Some(sink);
        core.state = TransferState::Running;
        if let Some(run) = core.run_sink() {
            self.launch(run);
        }
    }

    /// `running -> paused`; no-op from any other state.
    fn pause(&mut self) {
        if self.state() != TransferState::Running {
            return;
        }
        self.halt();
        self.core_mut().state = TransferState::Paused;
    }

    /// `paused -> running` as a new run; no-op from any other state.
    fn resume(&mut self) {
        if self.state() != TransferState::Paused {
            return;
        }
        let core = self.core_mut();
        core.generation += 1;
        core.state = TransferState::Running;
        if let Some(run) = core.run_sink() {
            self.launch(run);
        }
    }

    /// Tears the transport down. Idempotent; terminal states are left alone.
    fn cancel(&mut self) {
        match self.state() {
            TransferState::Completed | TransferState::Canceled | TransferState::Failed => {}
            _ => {
                self.halt();
                self.core_mut().state = TransferState::Canceled;
            }
        }
    }

    fn record_progress(&mut self, bytes_downloaded: u64, total_bytes_expected: Option<u64>) {
        let core = self.core_mut();
        core.bytes_downloaded = bytes_downloaded;
        if total_bytes_expected.is_some() {
            core.total_bytes_expected = total_bytes_expected;
        }
    }

    fn mark_completed(&mut self) {
        let core = self.core_mut();
        core.state = TransferState::Completed;
        if let Some(total) = core.total_bytes_expected {
            core.bytes_downloaded = core.bytes_downloaded.max(total);
        }
    }

    fn mark_failed(&mut self) {
        self.halt();
        self.core_mut().state = TransferState::Failed;
    }

    fn info(&self) -> DownloadInfo {
        let core = self.core();
        DownloadInfo {
            session_id: core.session_id,
            kind: self.kind(),
            url: core.request.url.clone(),
            filename: core.filename.clone(),
            mime_type: core.mime_type.clone(),
            destination: core.destination.clone(),
            bytes_downloaded: core.bytes_downloaded,
            total_bytes_expected: core.total_bytes_expected,
            state: core.state,
        }
    }

    fn to_record(&self, error: Option<String>) -> SessionRecord {
        let core = self.core();
        SessionRecord {
            session_id: core.session_id,
            request: core.request.clone(),
            filename: core.filename.clone(),
            mime_type: core.mime_type.clone(),
            destination: core.destination.clone(),
            total_bytes_expected: core.total_bytes_expected,
            bytes_downloaded: core.bytes_downloaded,
            status: core.state.session_status(),
            error,
        }
    }
}
