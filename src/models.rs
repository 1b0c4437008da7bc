// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The persisted status of a download session.
///
/// The serialized names match what the host application has always written
/// to its session list, so records survive an upgrade.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "pause")]
    Paused,
    #[serde(rename = "fail")]
    Failed,
    /// Finished (or otherwise idle) session.
    #[serde(rename = "none")]
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Downloading => "downloading",
            SessionStatus::Paused => "pause",
            SessionStatus::Failed => "fail",
            SessionStatus::Completed => "none",
        }
    }

    /// Whether a record in this status still owns its destination path.
    pub fn holds_destination(&self) -> bool {
        !matches!(self, SessionStatus::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The HTTP request a download was started from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestDescriptor {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    /// Extra headers captured from the page (cookies, user agent, referer).
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl RequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_data_url(&self) -> bool {
        self.url
            .get(..5)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("data:"))
    }
}

/// Represents the persistent state of a single download session.
/// This struct is serialized as JSON into the session table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: u64,
    #[serde(flatten)]
    pub request: RequestDescriptor,
    pub filename: String,
    pub mime_type: String,
    pub destination: PathBuf,
    pub total_bytes_expected: Option<u64>,
    pub bytes_downloaded: u64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionRecord {
    pub fn url(&self) -> &str {
        &self.request.url
    }

    /// Calculates download progress as a fraction from 0.0 to 1.0.
    pub fn progress(&self) -> Option<f32> {
        match self.total_bytes_expected {
            Some(0) | None => None,
            Some(total) => Some(self.bytes_downloaded as f32 / total as f32),
        }
    }
}

/// Input accepted by the queue when the caller has not built a transfer itself.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Reuse an existing session id; the store allocates one when absent.
    pub session_id: Option<u64>,
    pub request: RequestDescriptor,
    pub expected_file_size: Option<u64>,
    pub filename: String,
    pub mime_type: String,
}

impl EnqueueRequest {
    pub fn new(request: RequestDescriptor, filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            session_id: None,
            request,
            expected_file_size: None,
            filename: filename.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_file_size = Some(size);
        self
    }

    pub fn with_session_id(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// Lifecycle of a live transfer.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Running,
    Paused,
    Completed,
    Canceled,
    Failed,
}

impl TransferState {
    /// The status a session record should carry for a transfer in this state.
    pub fn session_status(&self) -> SessionStatus {
        match self {
            TransferState::Created | TransferState::Running => SessionStatus::Downloading,
            TransferState::Paused => SessionStatus::Paused,
            TransferState::Completed => SessionStatus::Completed,
            TransferState::Canceled | TransferState::Failed => SessionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum TransferKind {
    Http,
    Data,
}

/// Read-only view of a member transfer handed to observers and callers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DownloadInfo {
    pub session_id: u64,
    pub kind: TransferKind,
    pub url: String,
    pub filename: String,
    pub mime_type: String,
    pub destination: PathBuf,
    pub bytes_downloaded: u64,
    pub total_bytes_expected: Option<u64>,
    pub state: TransferState,
}

/// Consistent view of the member set at one point in the queue's ordering.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub downloads: Vec<DownloadInfo>,
    pub combined_bytes_downloaded: u64,
    pub combined_total_bytes_expected: Option<u64>,
}

impl QueueSnapshot {
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }

    pub fn get(&self, session_id: u64) -> Option<&DownloadInfo> {
        self.downloads.iter().find(|d| d.session_id == session_id)
    }
}

/// Outcome of a batch command; one member's failure never stops the others.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: Vec<u64>,
    pub failed: Vec<(u64, String)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_host_names_on_disk() {
        let json = serde_json::to_string(&SessionStatus::Paused).unwrap();
        assert_eq!(json, "\"pause\"");
        let back: SessionStatus = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(back, SessionStatus::Completed);
    }

    #[test]
    fn record_flattens_request_fields() {
        let record = SessionRecord {
            session_id: 7,
            request: RequestDescriptor::get("https://example.com/a.zip"),
            filename: "a.zip".into(),
            mime_type: "application/zip".into(),
            destination: PathBuf::from("/tmp/a.zip"),
            total_bytes_expected: None,
            bytes_downloaded: 0,
            status: SessionStatus::Downloading,
            error: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["url"], "https://example.com/a.zip");
        assert_eq!(value["method"], "GET");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn data_url_detection_ignores_case() {
        assert!(RequestDescriptor::get("DATA:text/plain,hi").is_data_url());
        assert!(!RequestDescriptor::get("https://data.example").is_data_url());
    }
}
