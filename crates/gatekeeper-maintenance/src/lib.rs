//! # Gatekeeper Maintenance
//!
//! The hourly cleanup worker: backs up a gate's store to a timestamped
//! file, prunes stale backups, deletes rows for days that have passed,
//! resets the scan-history sequence, and reclaims storage. Everything here
//! is destructive-but-safe: a failed backup still lets deletion proceed
//! (the spec treats backups as best-effort, row expiry as the actual job),
//! and a locked database during reclamation is tolerated by the store layer.

use chrono::{DateTime, Local, NaiveDate, Timelike};
use gatekeeper_core::{Gate, GatewayConfig};
use gatekeeper_store::{StoreError, StoreStats, TicketStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to back up database to {path}: {source}")]
    Backup {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub tickets_deleted: i64,
    pub scans_deleted: i64,
    pub backup_path: Option<PathBuf>,
    pub before: StoreStats,
    pub after: StoreStats,
}

pub struct CleanupWorker {
    store: Arc<TicketStore>,
    gate: Gate,
    backup_dir: PathBuf,
    config: GatewayConfig,
}

impl CleanupWorker {
    pub fn new(
        store: Arc<TicketStore>,
        gate: Gate,
        backup_dir: impl Into<PathBuf>,
        config: GatewayConfig,
    ) -> Self {
        CleanupWorker {
            store,
            gate,
            backup_dir: backup_dir.into(),
            config,
        }
    }

    async fn backup(&self) -> Result<Option<PathBuf>, MaintenanceError> {
        if !self.config.database.backup_enabled {
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|source| MaintenanceError::Backup {
                path: self.backup_dir.display().to_string(),
                source,
            })?;

        let stem = self
            .store
            .db_path()
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("gatekeeper");
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let dest = self.backup_dir.join(format!("{stem}-{stamp}.db"));

        tokio::fs::copy(self.store.db_path(), &dest)
            .await
            .map_err(|source| MaintenanceError::Backup {
                path: dest.display().to_string(),
                source,
            })?;

        self.prune_backups(stem).await?;
        Ok(Some(dest))
    }

    async fn prune_backups(&self, stem: &str) -> Result<(), MaintenanceError> {
        let mut entries = tokio::fs::read_dir(&self.backup_dir)
            .await
            .map_err(|source| MaintenanceError::Backup {
                path: self.backup_dir.display().to_string(),
                source,
            })?;

        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| MaintenanceError::Backup {
            path: self.backup_dir.display().to_string(),
            source,
        })? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(stem) && name.ends_with(".db") {
                backups.push(entry.path());
            }
        }
        // Timestamps are lexicographically sortable in the filename format used above.
        backups.sort();

        let max_backups = self.config.database.max_backups;
        if backups.len() > max_backups {
            for stale in &backups[..backups.len() - max_backups] {
                if let Err(source) = tokio::fs::remove_file(stale).await {
                    tracing::warn!(path = %stale.display(), error = %source, "failed to prune stale backup");
                }
            }
        }

        Ok(())
    }

    /// Runs one cleanup pass for `today`, unconditionally (callers drive
    /// the hourly cadence separately so this stays simple to test).
    pub async fn run_once(&self, today: NaiveDate) -> Result<CleanupReport, MaintenanceError> {
        let yesterday = today.pred_opt().unwrap_or(today);
        let before = self.store.stats(self.gate).await?;

        let backup_path = match self.backup().await {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(error = %err, "backup failed, proceeding with row expiry anyway");
                None
            }
        };

        let (tickets_deleted, scans_deleted) = self.store.purge_before(yesterday).await?;
        let after = self.store.stats(self.gate).await?;

        Ok(CleanupReport {
            tickets_deleted,
            scans_deleted,
            backup_path,
            before,
            after,
        })
    }

    /// Runs until `cancel` fires, triggering `run_once` once per hour
    /// (tolerating up to five minutes of drift) and sleeping long enough
    /// after firing that it cannot double-fire inside one hour window.
    pub async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let now = Local::now();
            if is_top_of_hour(now) {
                match self.run_once(now.date_naive()).await {
                    Ok(report) => tracing::info!(
                        tickets_deleted = report.tickets_deleted,
                        scans_deleted = report.scans_deleted,
                        backup = ?report.backup_path,
                        before_total = report.before.total_tickets,
                        after_total = report.after.total_tickets,
                        "cleanup cycle complete"
                    ),
                    Err(err) => tracing::error!(error = %err, "cleanup cycle failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(300)) => {}
                    _ = cancel.cancelled() => break,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
}

fn is_top_of_hour(now: DateTime<Local>) -> bool {
    let minute = now.minute();
    minute < 5 || minute >= 55
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gatekeeper_core::GatewayConfig;
    use std::collections::BTreeMap;
    use std::path::Path;

    async fn open_store(dir: &Path) -> Arc<TicketStore> {
        Arc::new(TicketStore::open(dir.join("AttractionA.db")).await.unwrap())
    }

    #[test]
    fn top_of_hour_tolerates_five_minute_drift() {
        let at = |minute: u32| {
            Local
                .with_ymd_and_hms(2025, 10, 15, 9, minute, 0)
                .unwrap()
        };
        assert!(is_top_of_hour(at(0)));
        assert!(is_top_of_hour(at(4)));
        assert!(is_top_of_hour(at(56)));
        assert!(!is_top_of_hour(at(30)));
    }

    #[tokio::test]
    async fn run_once_deletes_only_rows_through_yesterday() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let today = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();
        let yesterday = NaiveDate::from_ymd_opt(2025, 10, 14).unwrap();

        let pax = BTreeMap::from([(Gate::A, 1i64)]);
        store
            .create_from_parsed("20251014-000001", yesterday, &pax)
            .await
            .unwrap();
        store
            .create_from_parsed("20251015-000001", today, &pax)
            .await
            .unwrap();

        let mut config = GatewayConfig::default();
        config.database.backup_enabled = false;
        let worker = CleanupWorker::new(store.clone(), Gate::A, dir.path().join("backups"), config);

        let report = worker.run_once(today).await.unwrap();
        assert_eq!(report.tickets_deleted, 1);
        assert!(store.get("20251014-000001").await.unwrap().is_none());
        assert!(store.get("20251015-000001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_once_writes_a_timestamped_backup_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let today = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();

        let config = GatewayConfig::default();
        let backup_dir = dir.path().join("backups");
        let worker = CleanupWorker::new(store, Gate::A, &backup_dir, config);

        let report = worker.run_once(today).await.unwrap();
        let backup_path = report.backup_path.expect("backup enabled by default");
        assert!(backup_path.exists());
    }

    #[tokio::test]
    async fn prune_backups_keeps_only_max_backups_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let today = NaiveDate::from_ymd_opt(2025, 10, 15).unwrap();

        let mut config = GatewayConfig::default();
        config.database.max_backups = 2;
        let backup_dir = dir.path().join("backups");
        let worker = CleanupWorker::new(store, Gate::A, &backup_dir, config);

        for _ in 0..3 {
            worker.run_once(today).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1100)).await;
        }

        let remaining = std::fs::read_dir(&backup_dir).unwrap().count();
        assert!(remaining <= 2, "expected at most 2 backups, found {remaining}");
    }
}
