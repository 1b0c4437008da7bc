// tests/session_store_test.rs

use dlqueue::models::{RequestDescriptor, SessionRecord, SessionStatus};
use dlqueue::session_store::SessionStore;
use std::path::PathBuf;

fn record(session_id: u64, status: SessionStatus) -> SessionRecord {
    SessionRecord {
        session_id,
        request: RequestDescriptor::get(format!("https://example.com/{}.zip", session_id))
            .with_header("Referer", "https://example.com/"),
        filename: format!("{}.zip", session_id),
        mime_type: "application/zip".into(),
        destination: PathBuf::from(format!("/tmp/{}.zip", session_id)),
        total_bytes_expected: Some(1000),
        bytes_downloaded: 100,
        status,
        error: None,
    }
}

#[tokio::test]
async fn allocates_from_zero_and_never_reissues() {
    let store = SessionStore::in_memory().await.unwrap();
    assert_eq!(store.allocate_session_id().await.unwrap(), 0);
    assert_eq!(store.allocate_session_id().await.unwrap(), 1);

    store.upsert(&record(10, SessionStatus::Paused)).await.unwrap();
    assert_eq!(store.allocate_session_id().await.unwrap(), 11);

    store.remove(10).await.unwrap();
    assert_eq!(store.allocate_session_id().await.unwrap(), 12);
}

#[tokio::test]
async fn counter_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sessions.db");
    {
        let store = SessionStore::open(&path).await.unwrap();
        store.allocate_session_id().await.unwrap();
        store.allocate_session_id().await.unwrap();
        store.upsert(&record(1, SessionStatus::Downloading)).await.unwrap();
    }

    let store = SessionStore::open(&path).await.unwrap();
    assert_eq!(store.allocate_session_id().await.unwrap(), 2);
    assert_eq!(store.get(1).await.unwrap().unwrap(), record(1, SessionStatus::Downloading));
}

#[tokio::test]
async fn upsert_replaces_whole_record() {
    let store = SessionStore::in_memory().await.unwrap();
    store.upsert(&record(1, SessionStatus::Downloading)).await.unwrap();

    let mut updated = record(1, SessionStatus::Failed);
    updated.error = Some("server responded with status 500".into());
    store.upsert(&updated).await.unwrap();

    let all = store.list_all().await.unwrap();
    assert_eq!(all, vec![updated]);
}

#[tokio::test]
async fn remove_of_unknown_id_is_not_an_error() {
    let store = SessionStore::in_memory().await.unwrap();
    store.remove(99).await.unwrap();
    assert!(store.get(99).await.unwrap().is_none());
}

#[tokio::test]
async fn update_progress_touches_only_counter_and_status() {
    let store = SessionStore::in_memory().await.unwrap();
    store.upsert(&record(3, SessionStatus::Downloading)).await.unwrap();

    store.update_progress(3, 750, SessionStatus::Paused).await.unwrap();

    let stored = store.get(3).await.unwrap().unwrap();
    assert_eq!(stored.bytes_downloaded, 750);
    assert_eq!(stored.status, SessionStatus::Paused);
    assert_eq!(stored.request.headers, vec![("Referer".to_string(), "https://example.com/".to_string())]);
}

#[tokio::test]
async fn update_progress_of_unknown_id_is_ignored() {
    let store = SessionStore::in_memory().await.unwrap();
    store.update_progress(5, 10, SessionStatus::Downloading).await.unwrap();
    assert!(store.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconcile_moves_only_downloading_records() {
    let store = SessionStore::in_memory().await.unwrap();
    store.upsert(&record(1, SessionStatus::Downloading)).await.unwrap();
    store.upsert(&record(2, SessionStatus::Failed)).await.unwrap();
    store.upsert(&record(3, SessionStatus::Completed)).await.unwrap();
    store.upsert(&record(4, SessionStatus::Downloading)).await.unwrap();

    let mut reconciled = store.reconcile_stale().await.unwrap();
    reconciled.sort();
    assert_eq!(reconciled, vec![1, 4]);

    let mut all = store.list_all().await.unwrap();
    all.sort_by_key(|r| r.session_id);
    let statuses: Vec<SessionStatus> = all.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            SessionStatus::Paused,
            SessionStatus::Failed,
            SessionStatus::Completed,
            SessionStatus::Paused
        ]
    );
    assert!(store.reconcile_stale().await.unwrap().is_empty());
}
