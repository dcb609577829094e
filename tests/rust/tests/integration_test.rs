//! Cross-crate checkpoint behaviour
//!
//! Exercises the manager, store, codec, and local backend together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{
    codec, CheckpointManager, CheckpointManagerConfig, CheckpointStore, ManagerState, SaveOptions,
    SaveOutcome,
};
use ckpt_core::{
    ArrayValue, DType, Error, MismatchReason, Node, RetentionPolicy, RuntimeConfig, SaveMode,
    StateTree,
};
use storage::{is_temp_path, LocalStorage, StorageBackend};
use tempfile::TempDir;

fn model_state(step: u64) -> StateTree {
    let kernel: Vec<f32> = (0..12).map(|i| i as f32 * 0.5 + step as f32).collect();
    StateTree::new()
        .with(
            "params",
            StateTree::new().with(
                "dense",
                StateTree::new()
                    .with("kernel", ArrayValue::from_f32(vec![3, 4], &kernel).unwrap())
                    .with("bias", ArrayValue::zeros(DType::F32, vec![4])),
            ),
        )
        .with(
            "opt_state",
            Node::List(vec![
                Node::from(step as i64),
                Node::from(ArrayValue::from_f64(vec![2], &[0.9, 0.999]).unwrap()),
            ]),
        )
        .with("step", step as i64)
        .with("tag", "baseline")
}

async fn open(dir: &TempDir, policy: RetentionPolicy, mode: SaveMode) -> Result<CheckpointManager> {
    let config = CheckpointManagerConfig::new(dir.path())
        .with_policy(policy)
        .with_save_mode(mode);
    Ok(CheckpointManager::new(config).await?)
}

#[tokio::test]
async fn test_round_trip_with_template() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;

    let state = model_state(100);
    manager.save(&state, 100).await?;

    let restored = manager.restore(Some(100), Some(&state.shape())).await?;
    assert_eq!(restored, state);
    assert_eq!(restored.get_path("opt_state/1").and_then(Node::as_array).map(|a| a.dtype()), Some(DType::F64));
    Ok(())
}

#[tokio::test]
async fn test_restore_without_template_is_generic() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;
    manager.save(&model_state(1), 1).await?;

    let generic = manager.restore(None, None).await?;
    let opt_state = generic.get("opt_state").and_then(Node::as_tree).expect("list comes back keyed");
    assert_eq!(opt_state.keys().collect::<Vec<_>>(), vec!["0", "1"]);
    assert_eq!(generic.get_path("params/dense/kernel"), model_state(1).get_path("params/dense/kernel"));
    Ok(())
}

#[tokio::test]
async fn test_retention_keeps_highest_steps() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::keep_last(3), SaveMode::Sync).await?;

    for step in (10..=70).step_by(10) {
        manager.save(&model_state(step), step).await?;
    }

    assert_eq!(manager.all_steps(), vec![50, 60, 70]);

    // A fresh store view agrees with the manager's index
    let store = CheckpointStore::local(dir.path());
    assert_eq!(store.list_steps().await?, vec![50, 60, 70]);
    Ok(())
}

#[tokio::test]
async fn test_keep_period_preserves_milestones() -> Result<()> {
    let dir = TempDir::new()?;
    let policy = RetentionPolicy::keep_last(2).with_keep_period(100);
    let manager = open(&dir, policy, SaveMode::Sync).await?;

    for step in (50..=300).step_by(50) {
        manager.save(&model_state(step), step).await?;
    }

    // Multiples of 100 are exempt and do not count toward max_keep
    assert_eq!(manager.all_steps(), vec![100, 150, 200, 250, 300]);
    Ok(())
}

#[tokio::test]
async fn test_overwrite_guard() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;

    manager.save(&model_state(5), 5).await?;
    let before = manager.entry(5).expect("step 5 indexed");

    let err = manager.save(&model_state(3), 3).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { step: 3, latest: 5 }));
    let err = manager.save(&model_state(5), 5).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists { step: 5, latest: 5 }));

    assert_eq!(manager.all_steps(), vec![5]);
    assert_eq!(manager.entry(5), Some(before));
    assert_eq!(manager.restore(None, None).await?.get("step"), model_state(5).get("step"));
    Ok(())
}

#[tokio::test]
async fn test_overwrite_allowed_keeps_newer_steps() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::unbounded(), SaveMode::Sync).await?;

    manager.save(&model_state(1), 1).await?;
    manager.save(&model_state(2), 2).await?;

    let policy = RetentionPolicy::unbounded().with_overwrite(true);
    manager.save_with_policy(&model_state(10), 1, &policy).await?;

    assert_eq!(manager.all_steps(), vec![1, 2]);
    let restored = manager.restore(Some(1), None).await?;
    assert_eq!(restored.get("step"), Some(&Node::from(10i64)));
    Ok(())
}

/// Local backend whose writes can be made to die before the rename
struct FlakyBackend {
    inner: LocalStorage,
    crash: AtomicBool,
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn read(&self, path: &str) -> ckpt_core::Result<Bytes> {
        self.inner.read(path).await
    }

    async fn read_prefix(&self, path: &str, len: usize) -> ckpt_core::Result<Bytes> {
        self.inner.read_prefix(path, len).await
    }

    async fn write(&self, path: &str, data: Bytes) -> ckpt_core::Result<u64> {
        if !self.crash.load(Ordering::SeqCst) {
            return self.inner.write(path, data).await;
        }
        let temp = self.inner.base_path().join(format!(".{}.0123abcd.tmp", path));
        tokio::fs::write(&temp, &data[..data.len() / 3]).await?;
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "writer died mid-checkpoint",
        )))
    }

    async fn delete(&self, path: &str) -> ckpt_core::Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> ckpt_core::Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> ckpt_core::Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

#[tokio::test]
async fn test_crash_mid_write_is_invisible() -> Result<()> {
    let dir = TempDir::new()?;
    let backend = Arc::new(FlakyBackend {
        inner: LocalStorage::new(dir.path()),
        crash: AtomicBool::new(false),
    });
    let config = CheckpointManagerConfig::new(dir.path());
    let manager = CheckpointManager::with_backend(config, backend.clone()).await?;

    manager.save(&model_state(1), 1).await?;
    manager.save(&model_state(2), 2).await?;

    backend.crash.store(true, Ordering::SeqCst);
    let err = manager.save(&model_state(3), 3).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));

    assert_eq!(manager.all_steps(), vec![1, 2]);
    assert_eq!(manager.store().list_steps().await?, vec![1, 2]);
    assert_eq!(manager.restore(None, Some(&model_state(2).shape())).await?, model_state(2));

    // The leftover survives inspection and is cleaned up when a manager
    // reopens the directory
    manager.close().await?;
    let viewer = CheckpointStore::local(dir.path());
    assert_eq!(viewer.list_steps().await?, vec![1, 2]);
    assert!(std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .any(|e| is_temp_path(&e.file_name().to_string_lossy())));

    let reopened = CheckpointManager::new(CheckpointManagerConfig::new(dir.path())).await?;
    assert_eq!(reopened.all_steps(), vec![1, 2]);
    let leftovers = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| is_temp_path(&e.file_name().to_string_lossy()))
        .count();
    assert_eq!(leftovers, 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_batch_stats_is_reported() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;
    manager.save(&model_state(1), 1).await?;

    let template = model_state(1)
        .with(
            "batch_stats",
            StateTree::new().with("mean", ArrayValue::zeros(DType::F32, vec![4])),
        )
        .shape();

    match manager.restore(Some(1), Some(&template)).await {
        Err(Error::SchemaMismatch { path, reason }) => {
            assert_eq!(path, "batch_stats");
            assert_eq!(reason, MismatchReason::Missing);
        }
        other => panic!("expected schema mismatch, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_unexpected_field_is_reported() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;
    manager.save(&model_state(1), 1).await?;

    let mut trimmed = model_state(1);
    trimmed.remove("tag");

    let err = manager.restore(None, Some(&trimmed.shape())).await.unwrap_err();
    assert_eq!(err.mismatch_path(), Some("tag"));
    Ok(())
}

#[tokio::test]
async fn test_async_saves_finish_in_order() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::keep_last(5), SaveMode::Async).await?;

    let mut handles = Vec::new();
    for step in 1..=3 {
        match manager.save(&model_state(step), step).await? {
            SaveOutcome::Queued(handle) => handles.push(handle),
            SaveOutcome::Saved(_) => panic!("async mode must queue"),
        }
    }
    manager.wait_until_finished().await?;

    assert_eq!(manager.all_steps(), vec![1, 2, 3]);
    assert_eq!(manager.state(), ManagerState::Idle);
    assert_eq!(manager.pending_saves(), 0);

    let mut created = Vec::new();
    for handle in handles {
        created.push(handle.wait().await?.created_at);
    }
    assert!(created.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[tokio::test]
async fn test_async_saves_pruned_per_policy() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::keep_last(2), SaveMode::Async).await?;

    for step in 1..=3 {
        drop(manager.save(&model_state(step), step).await?);
    }
    manager.wait_until_finished_timeout(Duration::from_secs(30)).await?;

    assert_eq!(manager.all_steps(), vec![2, 3]);
    Ok(())
}

#[tokio::test]
async fn test_restore_sees_queued_saves() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Async).await?;

    drop(manager.save(&model_state(41), 41).await?);
    drop(manager.save(&model_state(42), 42).await?);

    let restored = manager.restore(None, None).await?;
    assert_eq!(restored.get("step"), Some(&Node::from(42i64)));
    Ok(())
}

#[tokio::test]
async fn test_metadata_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;
        let options = SaveOptions::default()
            .with_metadata("loss", "0.125")
            .with_metadata("epoch", "4");
        manager.save_with(&model_state(9), 9, options).await?;
        manager.close().await?;
    }

    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;
    let entry = manager.entry(9).expect("indexed on open");
    let expected: HashMap<String, String> = [("loss", "0.125"), ("epoch", "4")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(entry.metadata, expected);
    Ok(())
}

#[tokio::test]
async fn test_inspect_reports_stored_shape() -> Result<()> {
    let dir = TempDir::new()?;
    let manager = open(&dir, RetentionPolicy::default(), SaveMode::Sync).await?;
    manager.save(&model_state(3), 3).await?;

    let bytes = manager.store().read(3).await?;
    let shape = codec::inspect(&bytes)?;
    assert_eq!(shape.num_leaves(), model_state(3).num_leaves());
    Ok(())
}

#[tokio::test]
async fn test_manager_from_runtime_config() -> Result<()> {
    let dir = TempDir::new()?;
    let json = format!(
        r#"{{
            "checkpoint": {{
                "base_path": {:?},
                "retention": {{ "max_keep": 2 }},
                "save_mode": "async",
                "save_interval_steps": 10,
                "save_timeout": 5000
            }}
        }}"#,
        dir.path().to_string_lossy()
    );
    let config = RuntimeConfig::from_json_str(&json)?;
    let manager = CheckpointManager::new(CheckpointManagerConfig::from(&config.checkpoint)).await?;

    for step in 0..=40 {
        if manager.should_save(step) {
            drop(manager.save(&model_state(step), step).await?);
        }
    }
    manager.wait_until_finished().await?;
    assert_eq!(manager.all_steps(), vec![30, 40]);
    Ok(())
}
