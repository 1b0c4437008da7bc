// src/pending.rs

use crate::models::{EnqueueRequest, RequestDescriptor};
use log::debug;
use std::collections::{HashMap, VecDeque};

/// A download the browser has intercepted but the user has not yet accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDownload {
    pub request: RequestDescriptor,
    pub suggested_filename: String,
    pub mime_type: String,
    pub expected_file_size: Option<u64>,
}

impl PendingDownload {
    pub fn new(request: RequestDescriptor, suggested_filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            request,
            suggested_filename: suggested_filename.into(),
            mime_type: mime_type.into(),
            expected_file_size: None,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_file_size = Some(size);
        self
    }

    pub fn into_enqueue_request(self) -> EnqueueRequest {
        EnqueueRequest {
            session_id: None,
            request: self.request,
            expected_file_size: self.expected_file_size,
            filename: self.suggested_filename,
            mime_type: self.mime_type,
        }
    }
}

/// Bounded map from a browser-side correlation key to its intercepted
/// request. When full, the oldest entry is evicted.
#[derive(Debug)]
pub struct PendingRequests {
    capacity: usize,
    entries: HashMap<String, PendingDownload>,
    order: VecDeque<String>,
}

impl PendingRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Stores `download` under `key`, replacing any entry with the same key.
    /// Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, key: impl Into<String>, download: PendingDownload) -> Option<(String, PendingDownload)> {
        let key = key.into();
        if self.entries.insert(key.clone(), download).is_some() {
            self.order.retain(|k| k != &key);
            self.order.push_back(key);
            return None;
        }
        self.order.push_back(key);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let oldest = self.order.pop_front()?;
        let evicted = self.entries.remove(&oldest)?;
        debug!("Pending: evicted request {} for {}.", oldest, evicted.request.url);
        Some((oldest, evicted))
    }

    pub fn take(&mut self, key: &str) -> Option<PendingDownload> {
        let download = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(download)
    }

    pub fn get(&self, key: &str) -> Option<&PendingDownload> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(url: &str) -> PendingDownload {
        PendingDownload::new(RequestDescriptor::get(url), "file.bin", "application/octet-stream")
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut map = PendingRequests::new(2);
        assert!(map.insert("a", pending("http://x/a")).is_none());
        assert!(map.insert("b", pending("http://x/b")).is_none());

        let (key, evicted) = map.insert("c", pending("http://x/c")).unwrap();
        assert_eq!(key, "a");
        assert_eq!(evicted.request.url, "http://x/a");
        assert_eq!(map.len(), 2);
        assert!(map.get("a").is_none());
    }

    #[test]
    fn reinsert_refreshes_position() {
        let mut map = PendingRequests::new(2);
        map.insert("a", pending("http://x/a"));
        map.insert("b", pending("http://x/b"));
        map.insert("a", pending("http://x/a2"));

        let (key, _) = map.insert("c", pending("http://x/c")).unwrap();
        assert_eq!(key, "b");
        assert_eq!(map.get("a").unwrap().request.url, "http://x/a2");
    }

    #[test]
    fn take_removes_entry() {
        let mut map = PendingRequests::new(4);
        map.insert("a", pending("http://x/a"));
        assert!(map.take("a").is_some());
        assert!(map.take("a").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn converts_into_enqueue_request() {
        let request = pending("http://x/a").with_expected_size(10).into_enqueue_request();
        assert_eq!(request.expected_file_size, Some(10));
        assert_eq!(request.filename, "file.bin");
        assert!(request.session_id.is_none());
    }
}
