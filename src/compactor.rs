use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};
use crate::observability::WAL_COMPACTIONS_TOTAL;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once `threshold` transactions have
/// been appended since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            warn!("WAL compaction failed: {e}");
        }
    }
}

/// One compactor pass. Returns whether the WAL was rewritten.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        return Ok(false);
    }
    let compacted = engine.compact_wal().await?;
    if compacted {
        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        info!(appended, "WAL compacted");
    }
    Ok(compacted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CommissionTable;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stayflow_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine_at(path: PathBuf) -> Engine {
        Engine::new(
            path,
            Arc::new(NotifyHub::new()),
            CommissionTable::empty(rust_decimal::Decimal::new(15, 2)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = engine_at(path.clone());

        let id = Ulid::new();
        for flag in [false, true, false, true, false] {
            engine
                .upsert_user(UserInfo {
                    id,
                    is_staff: false,
                    is_host: flag,
                })
                .await
                .unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 5);

        assert!(!compact_if_due(&engine, 10).await.unwrap());
        assert_eq!(Wal::replay(&path).unwrap().len(), 5);

        assert!(compact_if_due(&engine, 5).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);

        drop(engine);
        let reopened = engine_at(path);
        assert!(!reopened.user(id).is_host);
    }
}
