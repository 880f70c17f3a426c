//! # Gatekeeper Sync
//!
//! The two reconciliation workers that keep a gate's local store in step
//! with the central booking service: [`FetchWorker`] pulls today's
//! manifest and upserts it (monotone merge, never clearing progress),
//! [`PushWorker`] reports locally admitted tickets and merges counters
//! across every gate store co-located on this host before sending.
//!
//! Neither worker ever lets a transient network failure poison local
//! state — a failed cycle is logged and skipped, not retried in a busy
//! loop, and not allowed to wipe out rows that haven't been confirmed by
//! the server yet.

use chrono::{Local, NaiveDate};
use gatekeeper_core::{AttractionCounts, Gate, GatewayConfig, ManifestRecord, SyncPayload};
use gatekeeper_store::{StoreError, TicketStore};
use reqwest::{Client, StatusCode};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Grows linearly from `base` by one multiple per consecutive failure, up
/// to `cap` (reached at the fifth consecutive failure with the documented
/// defaults: `5 * 300s = 1500s`). Resets to `base` the moment
/// `consecutive_failures` returns to zero.
fn backoff(base: Duration, cap: Duration, consecutive_failures: u32) -> Duration {
    let multiplier = 1 + consecutive_failures.min(4);
    (base * multiplier).min(cap)
}

/// Merges two gates' views of the same ticket by taking, gate-by-gate, the
/// maximum of `pax` and the maximum of `used`. Every co-located store's
/// snapshot is folded through this before the merged payload is pushed.
fn merge_max(a: SyncPayload, b: SyncPayload) -> SyncPayload {
    let mut attractions = a.attractions;
    for (gate, counts) in b.attractions {
        attractions
            .entry(gate)
            .and_modify(|existing| {
                existing.pax = existing.pax.max(counts.pax);
                existing.used = existing.used.max(counts.used);
            })
            .or_insert(counts);
    }
    SyncPayload {
        booking_date: a.booking_date,
        reference_no: a.reference_no,
        attractions,
    }
}

fn parse_manifest_date(raw: &str, fallback: NaiveDate) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y%m%d"))
        .unwrap_or(fallback)
}

/// Pulls the fetch manifest on a fixed cadence and upserts today's rows.
pub struct FetchWorker {
    client: Client,
    store: Arc<TicketStore>,
    config: GatewayConfig,
}

impl FetchWorker {
    pub fn new(client: Client, store: Arc<TicketStore>, config: GatewayConfig) -> Self {
        FetchWorker {
            client,
            store,
            config,
        }
    }

    async fn fetch_manifest(&self) -> Result<Vec<ManifestRecord>, SyncError> {
        let mut attempt = 0u32;
        loop {
            let request = self
                .client
                .get(self.config.api.fetch_url())
                .timeout(Duration::from_secs(self.config.api.timeout_secs));

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json::<Vec<ManifestRecord>>().await?);
                }
                Ok(resp) if is_retryable_status(resp.status()) && attempt < self.config.api.retry_attempts => {
                    attempt += 1;
                    tracing::warn!(status = %resp.status(), attempt, "fetch manifest retry");
                    tokio::time::sleep(Duration::from_secs(self.config.api.retry_delay_secs)).await;
                }
                Ok(resp) => return Err(resp.error_for_status().unwrap_err().into()),
                Err(err) if (err.is_timeout() || err.is_connect()) && attempt < self.config.api.retry_attempts => {
                    attempt += 1;
                    tracing::warn!(error = %err, attempt, "fetch manifest retry");
                    tokio::time::sleep(Duration::from_secs(self.config.api.retry_delay_secs)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn run_cycle(&self, today: NaiveDate) -> Result<(usize, usize), SyncError> {
        let records = self.fetch_manifest().await?;
        let mut applied = 0;
        let mut skipped = 0;

        for record in records {
            let booking_date = parse_manifest_date(&record.booking_date, today);
            if booking_date != today {
                skipped += 1;
                continue;
            }

            let counts: BTreeMap<Gate, AttractionCounts> = Gate::ALL
                .into_iter()
                .filter_map(|gate| record.attractions.get(gate.as_str()).map(|c| (gate, *c)))
                .collect();

            self.store
                .upsert_from_server(&record.reference_no, booking_date, &counts)
                .await?;
            applied += 1;
        }

        Ok((applied, skipped))
    }

    /// Runs until `cancel` fires. Exits only on cancellation; a failed
    /// cycle is logged and the sleep backs off, it never stops the loop.
    pub async fn run(&self, cancel: CancellationToken) {
        let base = Duration::from_secs(self.config.services.fetch_interval_secs);
        let cap = Duration::from_secs(1500);
        let mut consecutive_failures = 0u32;

        while !cancel.is_cancelled() {
            let today = Local::now().date_naive();
            match self.run_cycle(today).await {
                Ok((applied, skipped)) => {
                    consecutive_failures = 0;
                    tracing::info!(applied, skipped, "fetch cycle complete");
                }
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::error!(error = %err, consecutive_failures, "fetch cycle failed, skipping");
                }
            }

            let sleep_for = backoff(base, cap, consecutive_failures);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
}

/// Reports locally-admitted tickets to the central service on a fast
/// cadence, merging counters across every gate store co-located on this
/// host before each push.
pub struct PushWorker {
    client: Client,
    stores: Vec<Arc<TicketStore>>,
    config: GatewayConfig,
}

impl PushWorker {
    pub fn new(client: Client, stores: Vec<Arc<TicketStore>>, config: GatewayConfig) -> Self {
        PushWorker {
            client,
            stores,
            config,
        }
    }

    async fn unsynced_refs(&self) -> Result<BTreeSet<String>, SyncError> {
        let mut refs = BTreeSet::new();
        for store in &self.stores {
            refs.extend(store.list_unsynced().await?);
        }
        if self.config.services.skip_dummy_sync {
            refs.retain(|r| !r.ends_with("-dummy"));
        }
        Ok(refs)
    }

    async fn merged_snapshot(&self, reference_no: &str) -> Result<Option<SyncPayload>, SyncError> {
        let mut merged: Option<SyncPayload> = None;
        for store in &self.stores {
            if let Some(payload) = store.snapshot_for_sync(reference_no).await? {
                merged = Some(match merged {
                    None => payload,
                    Some(existing) => merge_max(existing, payload),
                });
            }
        }
        Ok(merged)
    }

    async fn run_cycle(&self) -> Result<usize, SyncError> {
        let refs = self.unsynced_refs().await?;
        let mut processed = 0;

        for reference_no in refs {
            let Some(payload) = self.merged_snapshot(&reference_no).await? else {
                continue;
            };

            let response = self
                .client
                .post(self.config.api.sync_url())
                .timeout(Duration::from_secs(self.config.api.timeout_secs))
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    for store in &self.stores {
                        store.mark_synced(&reference_no).await?;
                    }
                    processed += 1;
                }
                Ok(resp) => {
                    tracing::warn!(reference_no = %reference_no, status = %resp.status(), "push rejected, retrying next cycle");
                }
                Err(err) => {
                    tracing::warn!(reference_no = %reference_no, error = %err, "push failed, retrying next cycle");
                }
            }
        }

        Ok(processed)
    }

    /// Runs until `cancel` fires. Sleeps the full `sync_interval` after an
    /// empty cycle; otherwise a short fixed delay, to give the server room
    /// between bursts of admissions.
    pub async fn run(&self, cancel: CancellationToken) {
        let idle_interval = Duration::from_secs(self.config.services.sync_interval_secs);
        let busy_interval = Duration::from_secs(1);

        while !cancel.is_cancelled() {
            let sleep_for = match self.run_cycle().await {
                Ok(0) => idle_interval,
                Ok(processed) => {
                    tracing::info!(processed, "push cycle complete");
                    busy_interval
                }
                Err(err) => {
                    tracing::error!(error = %err, "push cycle failed, skipping");
                    idle_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
}
