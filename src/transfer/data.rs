// src/transfer/data.rs

use super::{EventSink, Transfer, TransferCore, TransferError};
use crate::models::{RequestDescriptor, TransferKind};
use crate::paths::partial_path;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_DATA_MIME: &str = "text/plain;charset=US-ASCII";

/// A download whose bytes are already in hand: a `data:` URI or a blob the
/// page handed over. It still goes through the partial file and rename so
/// it looks like any other finished download.
pub struct DataTransfer {
    core: TransferCore,
    payload: Arc<Vec<u8>>,
    cancellation_token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// The decoded parts of a `data:` URI.
#[derive(Debug, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    pub payload: Vec<u8>,
}

impl DataUrl {
    pub fn parse(url: &str) -> Result<Self, TransferError> {
        let invalid = |why: &str| TransferError::InvalidRequest(format!("data url: {why}"));

        let rest = url
            .get(..5)
            .filter(|scheme| scheme.eq_ignore_ascii_case("data:"))
            .map(|_| &url[5..])
            .ok_or_else(|| invalid("missing data: scheme"))?;
        let (header, body) = rest.split_once(',').ok_or_else(|| invalid("missing comma"))?;

        let (media, is_base64) = match header.strip_suffix(";base64") {
            Some(media) => (media, true),
            None => (header, false),
        };
        let mime_type = if media.is_empty() {
            DEFAULT_DATA_MIME.to_string()
        } else {
            media.to_string()
        };

        let payload = if is_base64 {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact)
                .map_err(|e| invalid(&e.to_string()))?
        } else {
            percent_encoding::percent_decode_str(body).collect()
        };

        Ok(Self { mime_type, payload })
    }
}

impl DataTransfer {
    pub fn new(core: TransferCore, payload: Vec<u8>) -> Self {
        let mut core = core;
        core.total_bytes_expected = Some(payload.len() as u64);
        Self {
            core,
            payload: Arc::new(payload),
            cancellation_token: None,
            task: None,
        }
    }

    /// Builds a transfer from a `data:` URL, keeping the caller's mime type
    /// when it has one.
    pub fn from_data_url(
        session_id: u64,
        request: RequestDescriptor,
        filename: String,
        mime_type: String,
        destination: PathBuf,
    ) -> Result<Self, TransferError> {
        let parsed = DataUrl::parse(&request.url)?;
        let mime_type = if mime_type.is_empty() {
            parsed.mime_type
        } else {
            mime_type
        };
        let core = TransferCore::new(session_id, request, filename, mime_type, destination, None);
        Ok(Self::new(core, parsed.payload))
    }
}

impl Transfer for DataTransfer {
    fn kind(&self) -> TransferKind {
        TransferKind::Data
    }

    fn core(&self) -> &TransferCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TransferCore {
        &mut self.core
    }

    fn launch(&mut self, sink: EventSink) {
        self.halt();
        let previous = self.task.take();
        let token = CancellationToken::new();
        let payload = self.payload.clone();
        let destination = self.core.destination.clone();
        let run_token = token.clone();

        self.cancellation_token = Some(token);
        self.task = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let session_id = sink.session_id();
            let total = payload.len() as u64;
            tokio::select! {
                _ = run_token.cancelled() => {}
                result = write_payload(&payload, destination) => match result {
                    Ok(location) => {
                        info!("Transfer {}: wrote {} inline bytes.", session_id, total);
                        sink.progress(total, Some(total));
                        sink.finished(location);
                    }
                    Err(e) => {
                        error!("Transfer {} failed: {}", session_id, e);
                        sink.failed(e);
                    }
                },
            }
        }));
    }

    fn halt(&mut self) {
        if let Some(token) = self.cancellation_token.take() {
            token.cancel();
        }
    }

    fn take_run(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

impl Drop for DataTransfer {
    fn drop(&mut self) {
        if let Some(token) = self.cancellation_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.task.take() {
            handle.abort();
        }
    }
}

async fn write_payload(payload: &[u8], destination: PathBuf) -> Result<PathBuf, TransferError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(&destination);
    let mut file = tokio::fs::File::create(&partial).await?;
    file.write_all(payload).await?;
    file.flush().await?;
    drop(file);
    tokio::fs::rename(&partial, &destination).await?;
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base64_payload() {
        let parsed = DataUrl::parse("data:text/plain;base64,aGVsbG8=").unwrap();
        assert_eq!(parsed.mime_type, "text/plain");
        assert_eq!(parsed.payload, b"hello");
    }

    #[test]
    fn parses_percent_encoded_payload_with_default_mime() {
        let parsed = DataUrl::parse("data:,a%20b").unwrap();
        assert_eq!(parsed.mime_type, DEFAULT_DATA_MIME);
        assert_eq!(parsed.payload, b"a b");
    }

    #[test]
    fn rejects_urls_without_comma_or_scheme() {
        assert!(matches!(
            DataUrl::parse("data:text/plain"),
            Err(TransferError::InvalidRequest(_))
        ));
        assert!(matches!(
            DataUrl::parse("https://example.com"),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(DataUrl::parse("data:;base64,@@@").is_err());
    }
}
