//! # Gatekeeper Store
//!
//! One embedded SQLite database per physical gate, holding the `tickets`
//! and `scan_history` tables described in the data model. Every public
//! operation here is a single pooled connection running one transaction;
//! the one exception, [`TicketStore::purge_before`]'s `VACUUM` pass, is
//! explicitly run outside any transaction because SQLite refuses to vacuum
//! inside one.
//!
//! `try_admit` is the crate's one concurrency-critical operation: it must
//! be a single conditional `UPDATE ... WHERE used < pax`, never a
//! read-then-write, so two validators racing on the same ticket cannot both
//! observe "below capacity" and both commit.

mod rows;
mod schema;

use chrono::{NaiveDate, Utc};
use gatekeeper_core::{AdmitOutcome, AttractionCounts, Gate, SyncPayload, Ticket};
use rows::TicketRow;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Row counts reported by [`TicketStore::stats`], used for the supervisor's
/// periodic log line and the cleanup worker's before/after report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub total_tickets: i64,
    pub today_scans: i64,
    pub today_entries: i64,
    pub unsynced_count: i64,
}

fn pax_col(gate: Gate) -> &'static str {
    match gate {
        Gate::A => "pax_a",
        Gate::B => "pax_b",
        Gate::C => "pax_c",
    }
}

fn used_col(gate: Gate) -> &'static str {
    match gate {
        Gate::A => "used_a",
        Gate::B => "used_b",
        Gate::C => "used_c",
    }
}

/// A single gate's ticket database. Bound to one file on disk
/// (`AttractionA.db`, `AttractionB.db`, `AttractionC.db`); the `Gate` each
/// operation acts on is still passed explicitly, since the schema carries
/// all three gates' pax/used columns in every file (so a fetched ticket's
/// full capacity is visible locally even before it is ever scanned here).
pub struct TicketStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl TicketStore {
    /// Opens (creating if absent) the SQLite file at `path`, applies the
    /// schema, and configures WAL journaling with `synchronous=NORMAL` —
    /// commit-before-fsync durability, acceptable because a lost write here
    /// is, at worst, a few seconds of scan history.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        schema::migrate(&pool).await?;

        Ok(TicketStore {
            pool,
            db_path: path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Atomically increments `used[gate]` if capacity remains. A zero-row
    /// update (lost race, or the row was already exhausted) is reported as
    /// `Exhausted`, identical to genuinely running out of seats.
    pub async fn try_admit(
        &self,
        reference_no: &str,
        gate: Gate,
    ) -> Result<AdmitOutcome, StoreError> {
        let pax_col = pax_col(gate);
        let used_col = used_col(gate);

        let row = sqlx::query(&format!(
            "SELECT {pax_col} as pax, {used_col} as used FROM tickets WHERE reference_no = ?1"
        ))
        .bind(reference_no)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(AdmitOutcome::NotFound);
        };
        let pax: i64 = row.try_get("pax")?;
        let used: i64 = row.try_get("used")?;

        if pax == 0 {
            return Ok(AdmitOutcome::NotValidHere);
        }
        if used >= pax {
            return Ok(AdmitOutcome::Exhausted { pax, used });
        }

        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(&format!(
            "UPDATE tickets SET {used_col} = {used_col} + 1, is_synced = 0, last_scan = ?1 \
             WHERE reference_no = ?2 AND {used_col} < {pax_col}"
        ))
        .bind(&now)
        .bind(reference_no)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lost the race to a concurrent admission; re-read to report the
            // current counters rather than stale ones from above.
            let row = sqlx::query(&format!(
                "SELECT {pax_col} as pax, {used_col} as used FROM tickets WHERE reference_no = ?1"
            ))
            .bind(reference_no)
            .fetch_one(&self.pool)
            .await?;
            return Ok(AdmitOutcome::Exhausted {
                pax: row.try_get("pax")?,
                used: row.try_get("used")?,
            });
        }

        Ok(AdmitOutcome::Admitted {
            pax,
            used_after: used + 1,
        })
    }

    /// Inserts the row if absent; otherwise applies the monotone merge:
    /// `pax` is replaced (server is authoritative on capacity), `used` is
    /// raised to the max of local and server, and `is_synced` is left
    /// untouched so a pending local admission is never silently cleared.
    pub async fn upsert_from_server(
        &self,
        reference_no: &str,
        booking_date: NaiveDate,
        counts: &BTreeMap<Gate, AttractionCounts>,
    ) -> Result<(), StoreError> {
        let existing = self.fetch_row(reference_no).await?;

        match existing {
            None => {
                self.insert_row(reference_no, booking_date, counts, false)
                    .await
            }
            Some(row) => {
                let merged_used = |gate: Gate, server: i64| -> i64 { row.used(gate).max(server) };
                sqlx::query(
                    "UPDATE tickets SET booking_date = ?1, \
                     pax_a = ?2, used_a = ?3, pax_b = ?4, used_b = ?5, pax_c = ?6, used_c = ?7 \
                     WHERE reference_no = ?8",
                )
                .bind(booking_date.to_string())
                .bind(counts.get(&Gate::A).map(|c| c.pax).unwrap_or(0))
                .bind(merged_used(Gate::A, counts.get(&Gate::A).map(|c| c.used).unwrap_or(0)))
                .bind(counts.get(&Gate::B).map(|c| c.pax).unwrap_or(0))
                .bind(merged_used(Gate::B, counts.get(&Gate::B).map(|c| c.used).unwrap_or(0)))
                .bind(counts.get(&Gate::C).map(|c| c.pax).unwrap_or(0))
                .bind(merged_used(Gate::C, counts.get(&Gate::C).map(|c| c.used).unwrap_or(0)))
                .bind(reference_no)
                .execute(&self.pool)
                .await?;
                Ok(())
            }
        }
    }

    /// Offline birth: inserts a ticket discovered only through a MAC-verified
    /// scan, trusting the encoded passenger counts. `used` starts at zero for
    /// every gate; the caller follows up with `try_admit` for the scanning gate.
    pub async fn create_from_parsed(
        &self,
        reference_no: &str,
        booking_date: NaiveDate,
        pax: &BTreeMap<Gate, i64>,
    ) -> Result<(), StoreError> {
        let counts = pax
            .iter()
            .map(|(gate, pax)| (*gate, AttractionCounts::new(*pax, 0)))
            .collect();
        self.insert_row(reference_no, booking_date, &counts, true)
            .await
    }

    async fn insert_row(
        &self,
        reference_no: &str,
        booking_date: NaiveDate,
        counts: &BTreeMap<Gate, AttractionCounts>,
        ignore_if_exists: bool,
    ) -> Result<(), StoreError> {
        let get = |gate: Gate| counts.get(&gate).copied().unwrap_or_default();
        let (a, b, c) = (get(Gate::A), get(Gate::B), get(Gate::C));

        let sql = if ignore_if_exists {
            "INSERT OR IGNORE INTO tickets \
             (reference_no, booking_date, pax_a, used_a, pax_b, used_b, pax_c, used_c, is_synced) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)"
        } else {
            "INSERT INTO tickets \
             (reference_no, booking_date, pax_a, used_a, pax_b, used_b, pax_c, used_c, is_synced) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)"
        };

        sqlx::query(sql)
            .bind(reference_no)
            .bind(booking_date.to_string())
            .bind(a.pax)
            .bind(a.used)
            .bind(b.pax)
            .bind(b.used)
            .bind(c.pax)
            .bind(c.used)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_row(&self, reference_no: &str) -> Result<Option<TicketRow>, StoreError> {
        let row = sqlx::query_as::<_, TicketRow>(
            "SELECT reference_no, booking_date, pax_a, used_a, pax_b, used_b, pax_c, used_c, \
             is_synced, created_at, last_scan FROM tickets WHERE reference_no = ?1",
        )
        .bind(reference_no)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Looks up a ticket's full row, for the validator's capacity-mismatch
    /// check and for general diagnostics.
    pub async fn get(&self, reference_no: &str) -> Result<Option<Ticket>, StoreError> {
        Ok(self.fetch_row(reference_no).await?.map(TicketRow::into_ticket))
    }

    /// The wire-shaped snapshot of one ticket, for the push worker.
    pub async fn snapshot_for_sync(
        &self,
        reference_no: &str,
    ) -> Result<Option<SyncPayload>, StoreError> {
        Ok(self
            .fetch_row(reference_no)
            .await?
            .map(|row| row.into_sync_payload()))
    }

    /// Unsynced reference numbers, oldest-pending-first.
    pub async fn list_unsynced(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT reference_no FROM tickets WHERE is_synced = 0 \
             ORDER BY last_scan ASC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("reference_no").map_err(StoreError::from))
            .collect()
    }

    /// Marks a ticket synced; returns whether a row actually existed.
    pub async fn mark_synced(&self, reference_no: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE tickets SET is_synced = 1 WHERE reference_no = ?1")
            .bind(reference_no)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Appends one scan-history row. Errors are returned to the caller (the
    /// validator deliberately swallows them, per the propagation policy,
    /// because the admission this logs has already committed).
    pub async fn log_scan(
        &self,
        reference_no: &str,
        success: bool,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scan_history (ticket_ref, result, reason) VALUES (?1, ?2, ?3)",
        )
        .bind(reference_no)
        .bind(if success { "SUCCESS" } else { "FAILED" })
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes tickets and scan-history rows for `booking_date <= cutoff`,
    /// resets the scan-history autoincrement sequence, then vacuums outside
    /// any transaction. A locked database during the vacuum pass is
    /// tolerated: reclamation is skipped and reported, deletion already committed.
    pub async fn purge_before(&self, cutoff: NaiveDate) -> Result<(i64, i64), StoreError> {
        let cutoff = cutoff.to_string();

        let tickets_deleted = sqlx::query("DELETE FROM tickets WHERE booking_date <= ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected() as i64;

        let scans_deleted =
            sqlx::query("DELETE FROM scan_history WHERE date(scan_time) <= ?1")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected() as i64;

        sqlx::query("DELETE FROM sqlite_sequence WHERE name = 'scan_history'")
            .execute(&self.pool)
            .await
            .ok();

        match sqlx::query("VACUUM").execute(&self.pool).await {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("locked") => {
                tracing::warn!(db = %self.db_path.display(), "database locked, skipping vacuum");
            }
            Err(other) => return Err(other.into()),
        }

        Ok((tickets_deleted, scans_deleted))
    }

    pub async fn stats(&self, gate: Gate) -> Result<StoreStats, StoreError> {
        let total_tickets: i64 = sqlx::query("SELECT COUNT(*) as n FROM tickets")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let today_scans: i64 = sqlx::query(
            "SELECT COUNT(*) as n FROM scan_history WHERE date(scan_time) = date('now')",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        let used_col = used_col(gate);
        let today_entries: i64 = sqlx::query(&format!(
            "SELECT COALESCE(SUM({used_col}), 0) as n FROM tickets WHERE date(last_scan) = date('now')"
        ))
        .fetch_one(&self.pool)
        .await?
        .try_get("n")?;

        let unsynced_count: i64 = sqlx::query("SELECT COUNT(*) as n FROM tickets WHERE is_synced = 0")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        Ok(StoreStats {
            total_tickets,
            today_scans,
            today_entries,
            unsynced_count,
        })
    }

    /// Seeds a small set of fixed, non-production reference numbers
    /// (suffixed `-dummy`) for exercising a gate without connectivity.
    /// Only ever called when `services.add_dummy_tickets` is set.
    pub async fn seed_dummy_tickets(&self, yesterday: NaiveDate) -> Result<(), StoreError> {
        let samples: [(&str, [i64; 3]); 4] = [
            ("20251009-000001-dummy", [2, 0, 0]),
            ("20251009-000002-dummy", [1, 0, 0]),
            ("20251009-000003-dummy", [3, 3, 0]),
            ("20251009-000004-dummy", [4, 4, 4]),
        ];
        for (reference_no, pax) in samples {
            let counts = BTreeMap::from([
                (Gate::A, AttractionCounts::new(pax[0], 0)),
                (Gate::B, AttractionCounts::new(pax[1], 0)),
                (Gate::C, AttractionCounts::new(pax[2], 0)),
            ]);
            self.insert_row(reference_no, yesterday, &counts, true)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    async fn open_temp() -> (TicketStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TicketStore::open(dir.path().join("test.db"))
            .await
            .expect("open store");
        (store, dir)
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 15).unwrap()
    }

    #[tokio::test]
    async fn try_admit_on_unknown_ticket_is_not_found() {
        let (store, _dir) = open_temp().await;
        let outcome = store.try_admit("20251015-000001", Gate::A).await.unwrap();
        assert_eq!(outcome, AdmitOutcome::NotFound);
    }

    #[tokio::test]
    async fn try_admit_respects_capacity_cap() {
        let (store, _dir) = open_temp().await;
        let pax = BTreeMap::from([(Gate::A, 2i64)]);
        store
            .create_from_parsed("20251015-000001", today(), &pax)
            .await
            .unwrap();

        assert_eq!(
            store.try_admit("20251015-000001", Gate::A).await.unwrap(),
            AdmitOutcome::Admitted { pax: 2, used_after: 1 }
        );
        assert_eq!(
            store.try_admit("20251015-000001", Gate::A).await.unwrap(),
            AdmitOutcome::Admitted { pax: 2, used_after: 2 }
        );
        assert_eq!(
            store.try_admit("20251015-000001", Gate::A).await.unwrap(),
            AdmitOutcome::Exhausted { pax: 2, used: 2 }
        );
    }

    #[tokio::test]
    async fn try_admit_rejects_zero_pax_gate() {
        let (store, _dir) = open_temp().await;
        let pax = BTreeMap::from([(Gate::A, 3i64), (Gate::B, 0i64)]);
        store
            .create_from_parsed("20251015-000001", today(), &pax)
            .await
            .unwrap();

        assert_eq!(
            store.try_admit("20251015-000001", Gate::B).await.unwrap(),
            AdmitOutcome::NotValidHere
        );
    }

    #[tokio::test]
    async fn upsert_from_server_never_lowers_used() {
        let (store, _dir) = open_temp().await;
        let pax = BTreeMap::from([(Gate::A, 5i64)]);
        store
            .create_from_parsed("20251015-000002", today(), &pax)
            .await
            .unwrap();
        store.try_admit("20251015-000002", Gate::A).await.unwrap();
        store.try_admit("20251015-000002", Gate::A).await.unwrap();

        let server_counts = BTreeMap::from([(Gate::A, AttractionCounts::new(5, 1))]);
        store
            .upsert_from_server("20251015-000002", today(), &server_counts)
            .await
            .unwrap();

        let ticket = store.get("20251015-000002").await.unwrap().unwrap();
        assert_eq!(ticket.counts_for(Gate::A).used, 2);
    }

    #[tokio::test]
    async fn upsert_from_server_is_idempotent() {
        let (store, _dir) = open_temp().await;
        let counts = BTreeMap::from([(Gate::A, AttractionCounts::new(4, 1))]);

        store
            .upsert_from_server("20251015-000003", today(), &counts)
            .await
            .unwrap();
        let first = store.get("20251015-000003").await.unwrap().unwrap();

        store
            .upsert_from_server("20251015-000003", today(), &counts)
            .await
            .unwrap();
        let second = store.get("20251015-000003").await.unwrap().unwrap();

        assert_eq!(first.counts_for(Gate::A), second.counts_for(Gate::A));
    }

    #[tokio::test]
    async fn concurrent_admission_yields_exactly_one_success() {
        let (store, _dir) = open_temp().await;
        let pax = BTreeMap::from([(Gate::A, 1i64)]);
        store
            .create_from_parsed("20251015-000004", today(), &pax)
            .await
            .unwrap();

        let store = std::sync::Arc::new(store);
        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.try_admit("20251015-000004", Gate::A).await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.try_admit("20251015-000004", Gate::A).await.unwrap() })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        let admitted = [a, b]
            .iter()
            .filter(|o| matches!(o, AdmitOutcome::Admitted { .. }))
            .count();
        let exhausted = [a, b]
            .iter()
            .filter(|o| matches!(o, AdmitOutcome::Exhausted { .. }))
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let (store, _dir) = open_temp().await;
        let pax = BTreeMap::from([(Gate::A, 1i64)]);
        store
            .create_from_parsed("20251015-000005", today(), &pax)
            .await
            .unwrap();

        assert!(store.mark_synced("20251015-000005").await.unwrap());
        assert!(store.mark_synced("20251015-000005").await.unwrap());
        assert!(!store.mark_synced("unknown-ref").await.unwrap());
    }

    #[tokio::test]
    async fn purge_before_removes_only_stale_rows() {
        let (store, _dir) = open_temp().await;
        let pax = BTreeMap::from([(Gate::A, 1i64)]);
        let yesterday = NaiveDate::from_ymd_opt(2025, 10, 14).unwrap();

        store
            .create_from_parsed("20251014-000001", yesterday, &pax)
            .await
            .unwrap();
        store
            .create_from_parsed("20251015-000001", today(), &pax)
            .await
            .unwrap();

        store.purge_before(yesterday).await.unwrap();

        assert!(store.get("20251014-000001").await.unwrap().is_none());
        assert!(store.get("20251015-000001").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_unsynced_orders_oldest_first() {
        let (store, _dir) = open_temp().await;
        let pax = BTreeMap::from([(Gate::A, 1i64)]);
        store
            .create_from_parsed("20251015-000006", today(), &pax)
            .await
            .unwrap();
        store
            .create_from_parsed("20251015-000007", today(), &pax)
            .await
            .unwrap();

        let unsynced = store.list_unsynced().await.unwrap();
        assert_eq!(unsynced.len(), 2);
    }
}
