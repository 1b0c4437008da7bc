// src/manager.rs

use crate::config::{ConfigError, QueueConfig};
use crate::pending::{PendingDownload, PendingRequests};
use crate::queue::{DownloadQueue, QueueError, QueueHandle};
use crate::session_store::{SessionStore, StoreError};
use log::info;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("no pending request with key {0}")]
    UnknownRequest(String),
}

/// The outermost composition point: owns the session store, the queue
/// handle and the map of intercepted requests awaiting a decision.
pub struct DownloadManager {
    config: QueueConfig,
    store: SessionStore,
    queue: QueueHandle,
    pending: Mutex<PendingRequests>,
}

impl DownloadManager {
    /// Opens the session database named by `config`, reconciles it and
    /// starts the queue.
    pub async fn open(config: QueueConfig) -> Result<Self, ManagerError> {
        let store = SessionStore::open(&config.database_path).await?;
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: QueueConfig, store: SessionStore) -> Result<Self, ManagerError> {
        let client = config.http_client()?;
        let queue = DownloadQueue::start(store.clone(), &config, client).await?;
        let pending = Mutex::new(PendingRequests::new(config.max_pending_requests));
        info!(
            "Manager: ready, downloads go to {}.",
            config.download_dir.display()
        );
        Ok(Self {
            config,
            store,
            queue,
            pending,
        })
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Parks an intercepted request until the user accepts or declines it.
    /// Returns the key of an older request evicted to make room.
    pub async fn intercept(&self, key: impl Into<String>, download: PendingDownload) -> Option<String> {
        let key = key.into();
        info!("Manager: intercepted {} as {}.", download.request.url, key);
        let evicted = self.pending.lock().await.insert(key, download);
        evicted.map(|(key, _)| key)
    }

    /// Starts the download parked under `key`. The entry leaves the map
    /// whether or not the enqueue succeeds.
    pub async fn accept(&self, key: &str) -> Result<u64, ManagerError> {
        let download = self
            .pending
            .lock()
            .await
            .take(key)
            .ok_or_else(|| ManagerError::UnknownRequest(key.to_string()))?;
        let session_id = self.queue.enqueue_request(download.into_enqueue_request()).await?;
        info!("Manager: accepted {} as session {}.", key, session_id);
        Ok(session_id)
    }

    pub async fn decline(&self, key: &str) -> Result<PendingDownload, ManagerError> {
        let download = self
            .pending
            .lock()
            .await
            .take(key)
            .ok_or_else(|| ManagerError::UnknownRequest(key.to_string()))?;
        info!("Manager: declined {}.", key);
        Ok(download)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Pauses and persists every live download, then stops the queue.
    pub async fn shutdown(self) -> Result<(), ManagerError> {
        self.queue.shutdown().await?;
        Ok(())
    }
}
