use super::*;
use std::time::Duration;

use chrono::Utc;
use shared::domain::{ConversationId, CorrelationKey, UserId};
use tempfile::TempDir;

async fn file_storage() -> (TempDir, Storage) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("durability.db").display());
    let storage = Storage::new(&url).await.expect("storage");
    (dir, storage)
}

fn quick_settings() -> DurabilitySettings {
    DurabilitySettings {
        settle_delay: Duration::from_millis(50),
        quiet_period: Duration::from_millis(50),
        wal_threshold_bytes: 1,
        wal_ceiling_bytes: u64::MAX,
        checkpoint_backoff: Duration::from_millis(5),
        ..DurabilitySettings::default()
    }
}

async fn write_some(storage: &Storage, count: usize) {
    for i in 0..count {
        storage
            .insert_local_message(
                ConversationId(1),
                UserId(1),
                &format!("draft {i}"),
                CorrelationKey::generate(),
                Utc::now(),
            )
            .await
            .expect("insert");
    }
}

#[tokio::test]
async fn file_store_runs_in_crash_safe_mode() {
    let (_dir, storage) = file_storage().await;
    let manager = DurabilityManager::new(storage, quick_settings());
    assert!(manager.verify_commit_mode().await.expect("verify"));
}

#[tokio::test]
async fn idle_tick_waits_for_quiet_period() {
    let (_dir, storage) = file_storage().await;
    write_some(&storage, 3).await;
    let manager = DurabilityManager::new(storage, quick_settings());

    manager.note_write();
    assert!(manager.on_idle_tick().await.expect("tick").is_none());
    assert_eq!(manager.checkpoints_completed(), 0);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let result = manager.on_idle_tick().await.expect("tick");
    assert!(result.is_some_and(|r| !r.busy));
    assert_eq!(manager.checkpoints_completed(), 1);
}

#[tokio::test]
async fn idle_tick_skips_small_logs() {
    let (_dir, storage) = file_storage().await;
    write_some(&storage, 1).await;
    let settings = DurabilitySettings {
        wal_threshold_bytes: u64::MAX,
        ..quick_settings()
    };
    let manager = DurabilityManager::new(storage, settings);
    assert!(manager.on_idle_tick().await.expect("tick").is_none());
}

#[tokio::test]
async fn log_past_ceiling_is_truncated() {
    let (_dir, storage) = file_storage().await;
    write_some(&storage, 20).await;
    assert!(storage.wal_size_bytes().expect("wal size") > 0);
    let settings = DurabilitySettings {
        wal_ceiling_bytes: 1,
        ..quick_settings()
    };
    let manager = DurabilityManager::new(storage.clone(), settings);

    manager.on_idle_tick().await.expect("tick");
    assert_eq!(storage.wal_size_bytes().expect("wal size"), 0);
}

#[tokio::test]
async fn foreground_cancels_pending_background_checkpoint() {
    let (_dir, storage) = file_storage().await;
    write_some(&storage, 2).await;
    let manager = DurabilityManager::new(storage, quick_settings());

    manager.on_background();
    manager.on_foreground();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.checkpoints_completed(), 0);
}

#[tokio::test]
async fn repeated_background_signals_checkpoint_once() {
    let (_dir, storage) = file_storage().await;
    write_some(&storage, 2).await;
    let manager = DurabilityManager::new(storage, quick_settings());

    manager.on_background();
    manager.on_background();
    manager.on_background();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(manager.checkpoints_completed(), 1);
}

#[tokio::test]
async fn bulk_completion_checkpoints() {
    let (_dir, storage) = file_storage().await;
    write_some(&storage, 5).await;
    let manager = DurabilityManager::new(storage, quick_settings());

    let result = manager.on_bulk_complete().await.expect("checkpoint");
    assert!(!result.busy);
    assert_eq!(manager.checkpoints_completed(), 1);
}

#[test]
fn lock_errors_are_recognised() {
    assert!(is_lock_error(&anyhow::anyhow!("database is locked")));
    assert!(is_lock_error(
        &anyhow::anyhow!("SQLITE_BUSY").context("wal checkpoint failed")
    ));
    assert!(!is_lock_error(&anyhow::anyhow!("disk I/O error")));
}
