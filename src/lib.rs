// src/lib.rs

pub mod config;
pub mod manager;
pub mod models;
pub mod observer;
pub mod paths;
pub mod pending;
pub mod queue;
pub mod session_store;
pub mod transfer;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::config::QueueConfig;
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{
        BatchReport, DownloadInfo, EnqueueRequest, QueueSnapshot, RequestDescriptor, SessionRecord,
        SessionStatus, TransferState,
    };
    pub use crate::observer::{QueueObserver, Subscription};
    pub use crate::pending::PendingDownload;
    pub use crate::queue::{DownloadQueue, QueueError, QueueHandle};
    pub use crate::session_store::{SessionStore, StoreError};
    pub use crate::transfer::{Transfer, TransferError};
}
