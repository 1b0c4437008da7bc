// src/transfer/http.rs

use super::{EventSink, Transfer, TransferCore, TransferError};
use crate::models::{RequestDescriptor, TransferKind};
use crate::paths::partial_path;
use futures_util::StreamExt;
use log::{debug, error, info};
use reqwest::header::RANGE;
use reqwest::{Client, Method, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Emit a progress report at least every this many bytes.
const PROGRESS_STEP: u64 = 64 * 1024;

/// One download over HTTP(S), resumable through `Range` requests.
pub struct HttpTransfer {
    core: TransferCore,
    client: Client,
    cancellation_token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl HttpTransfer {
    pub fn new(client: Client, core: TransferCore) -> Self {
        Self {
            core,
            client,
            cancellation_token: None,
            task: None,
        }
    }
}

impl Transfer for HttpTransfer {
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
        self.halt();

        let token = CancellationToken::new();
        let run = Run {
            previous: self.task.take(),
            client: self.client.clone(),
            request: self.core.request.clone(),
            destination: self.core.destination.clone(),
            expected: self.core.total_bytes_expected,
            token: token.clone(),
        };
        self.cancellation_token = Some(token);
        self.task = Some(tokio::spawn(run.execute(sink)));
    }

    fn halt(&mut self) {
        // The run notices the token at its next await and flushes what it
        // has; the handle is kept so a later run can wait for it.
        if let Some(token) = self.cancellation_token.take() {
            token.cancel();
        }
    }

    fn take_run(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

impl Drop for HttpTransfer {
    fn drop(&mut self) {
        if let Some(token) = self.cancellation_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

enum RunEnd {
    Finished(PathBuf),
    Interrupted,
}

/// Everything one run of the transport needs, detached from the transfer.
struct Run {
    /// A halted earlier run that may still be flushing the partial file.
    previous: Option<JoinHandle<()>>,
    client: Client,
    request: RequestDescriptor,
    destination: PathBuf,
    expected: Option<u64>,
    token: CancellationToken,
}

impl Run {
    async fn execute(mut self, sink: EventSink) {
        if let Some(previous) = self.previous.take() {
            let _ = previous.await;
        }
        let session_id = sink.session_id();
        match self.fetch(&sink).await {
            Ok(RunEnd::Finished(location)) => {
                info!("Transfer {}: finished to {}.", session_id, location.display());
                sink.finished(location);
            }
            Ok(RunEnd::Interrupted) => {
                debug!("Transfer {}: run interrupted.", session_id);
            }
            Err(e) => {
                error!("Transfer {} failed: {}", session_id, e);
                sink.failed(e);
            }
        }
    }

    async fn fetch(&self, sink: &EventSink) -> Result<RunEnd, TransferError> {
        let partial = partial_path(&self.destination);
        if let Some(parent) = self.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if existing == 0 {
            if let Some(location) = self.already_finished().await {
                sink.progress(self.expected.unwrap_or_default(), self.expected);
                return Ok(RunEnd::Finished(location));
            }
        }

        let method = Method::from_bytes(self.request.method.as_bytes())
            .map_err(|_| TransferError::InvalidRequest(format!("bad method {}", self.request.method)))?;
        let mut builder = self.client.request(method, &self.request.url);
        for (name, value) in &self.request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if existing > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", existing));
        }

        let response = tokio::select! {
            _ = self.token.cancelled() => return Ok(RunEnd::Interrupted),
            response = builder.send() => response?,
        };

        let status = response.status();
        if existing > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            // The partial already holds the whole body.
            sink.progress(existing, Some(existing));
            return self.finalize(&partial).await.map(RunEnd::Finished);
        }
        if !status.is_success() {
            return Err(TransferError::Status(status.as_u16()));
        }

        let resumed = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
        let start = if resumed { existing } else { 0 };
        let total = response
            .content_length()
            .map(|len| len + start)
            .or(self.expected);

        let mut file = open_partial(&partial, resumed).await?;
        let mut downloaded = start;
        let mut last_reported = start;
        sink.progress(downloaded, total);

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = self.token.cancelled() => {
                    file.flush().await?;
                    return Ok(RunEnd::Interrupted);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            downloaded += bytes.len() as u64;

            if downloaded - last_reported >= PROGRESS_STEP {
                sink.progress(downloaded, total);
                last_reported = downloaded;
            }
        }
        file.flush().await?;
        drop(file);

        sink.progress(downloaded, total.or(Some(downloaded)));
        self.finalize(&partial).await.map(RunEnd::Finished)
    }

    /// An earlier run may have renamed the partial into place after its
    /// finish report was superseded. A destination of the expected size is
    /// that run's output.
    async fn already_finished(&self) -> Option<PathBuf> {
        let expected = self.expected?;
        let meta = tokio::fs::metadata(&self.destination).await.ok()?;
        if meta.is_file() && meta.len() == expected {
            debug!("Transfer: {} is already complete.", self.destination.display());
            return Some(self.destination.clone());
        }
        None
    }

    async fn finalize(&self, partial: &Path) -> Result<PathBuf, TransferError> {
        tokio::fs::rename(partial, &self.destination).await?;
        Ok(self.destination.clone())
    }
}

async fn open_partial(partial: &Path, append: bool) -> Result<File, TransferError> {
    let file = if append {
        OpenOptions::new().append(true).open(partial).await?
    } else {
        File::create(partial).await?
    };
    Ok(file)
}
