//! # Gatekeeper Validator
//!
//! Combines the codec, one gate's store, and the day's date policy into a
//! single admission decision. Every user-facing rejection is a value of
//! [`Decision`], never an `Err` — `Err` here is reserved for genuine store
//! I/O failure, which the caller (the CLI's `scan` command, or a future
//! reader attached to a real barcode scanner) should treat as operational.

use chrono::NaiveDate;
use gatekeeper_core::{AttractionCounts, Decision, Gate, GateMapping, ScanResult, Ticket};
use gatekeeper_store::{StoreError, TicketStore};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates and logs scans for exactly one gate.
pub struct Validator {
    store: TicketStore,
    gate: Gate,
    secret: Vec<u8>,
    gate_mapping: GateMapping,
}

impl Validator {
    pub fn new(
        store: TicketStore,
        gate: Gate,
        secret: impl Into<Vec<u8>>,
        gate_mapping: GateMapping,
    ) -> Self {
        Validator {
            store,
            gate,
            secret: secret.into(),
            gate_mapping,
        }
    }

    pub fn store(&self) -> &TicketStore {
        &self.store
    }

    pub fn gate(&self) -> Gate {
        self.gate
    }

    /// Runs the eight-step decision pipeline against `ticket_string`,
    /// logging exactly one `scan_history` row regardless of outcome.
    /// `today` is passed in rather than read from the wall clock so tests
    /// (and a future replay tool) can drive any date deterministically.
    pub async fn validate(
        &self,
        ticket_string: &str,
        today: NaiveDate,
    ) -> Result<Decision, ValidatorError> {
        let attempted_ref = attempted_reference(ticket_string);
        let today_str = today.format("%Y%m%d").to_string();

        // Step 1: structural date check, before any hashing, so replays of
        // other days' tickets never reach the MAC computation.
        let leading_date = ticket_string.split('-').next().unwrap_or(ticket_string);
        if leading_date != today_str {
            return self.finish(&attempted_ref, Decision::InvalidDate).await;
        }

        // Step 2: parse + MAC verify.
        let parsed = match gatekeeper_codec::parse(&self.secret, ticket_string) {
            Err(err) => {
                let decision = Decision::InvalidQr {
                    detail: err.to_string(),
                };
                return self.finish(&attempted_ref, decision).await;
            }
            Ok(parsed) if !parsed.valid => {
                let decision = Decision::InvalidQr {
                    detail: parsed.error.unwrap_or_else(|| "Invalid verification code".into()),
                };
                return self.finish(&parsed.reference_no, decision).await;
            }
            Ok(parsed) => parsed,
        };
        let reference_no = parsed.reference_no.clone();

        // Step 3 + 4: gate mapping and zero-allowance check.
        let code = self.gate_mapping.code_for(self.gate).to_string();
        let persons_allowed = parsed.gate_info.get(&code).copied().unwrap_or(0);
        if persons_allowed == 0 {
            let decision = Decision::AttractionMismatch {
                gate: self.gate.to_string(),
            };
            return self.finish(&reference_no, decision).await;
        }

        // Step 5: store lookup, with offline birth for an unknown reference.
        let existing = self.store.get(&reference_no).await?;
        let booking_date = match &existing {
            Some(ticket) => ticket.booking_date,
            None => NaiveDate::parse_from_str(&parsed.date, "%Y%m%d").unwrap_or(today),
        };

        if let Some(ticket) = &existing {
            self.warn_on_capacity_mismatch(ticket, persons_allowed);
        } else {
            let pax = parsed
                .gate_info
                .iter()
                .filter_map(|(code, persons)| {
                    self.gate_mapping
                        .gate_for_code(code)
                        .map(|gate| (gate, *persons))
                })
                .collect::<BTreeMap<Gate, i64>>();
            self.store
                .create_from_parsed(&reference_no, booking_date, &pax)
                .await?;
        }

        // Step 6: defense-in-depth date check against the stored booking date.
        if booking_date.format("%Y%m%d").to_string() != today_str {
            return self.finish(&reference_no, Decision::InvalidDate).await;
        }

        // Step 7: the single conditional admission update.
        let decision = match self.store.try_admit(&reference_no, self.gate).await? {
            gatekeeper_core::AdmitOutcome::Admitted { pax, used_after } => {
                Decision::Valid { pax, used_after }
            }
            gatekeeper_core::AdmitOutcome::Exhausted { pax, used } => {
                Decision::AlreadyScanned { pax, used }
            }
            gatekeeper_core::AdmitOutcome::NotValidHere => Decision::AttractionMismatch {
                gate: self.gate.to_string(),
            },
            gatekeeper_core::AdmitOutcome::NotFound => Decision::InvalidQr {
                detail: "ticket record unavailable after creation".to_string(),
            },
        };

        self.finish(&reference_no, decision).await
    }

    fn warn_on_capacity_mismatch(&self, ticket: &Ticket, persons_allowed: i64) {
        let stored: AttractionCounts = ticket.counts_for(self.gate);
        if stored.pax != persons_allowed {
            tracing::warn!(
                reference_no = %ticket.reference_no,
                gate = %self.gate,
                stored_pax = stored.pax,
                scanned_pax = persons_allowed,
                "capacity mismatch between stored ticket and scanned QR; trusting stored value"
            );
        }
    }

    // Step 8: always write exactly one scan_history row, and log (but
    // never propagate) a failure to do so, since the admission itself has
    // already committed by the time this runs.
    async fn finish(
        &self,
        reference_no: &str,
        decision: Decision,
    ) -> Result<Decision, ValidatorError> {
        let scan = ScanResult::from_decision(reference_no, &decision);
        if let Err(err) = self.store.log_scan(&scan.reference_no, scan.success, &scan.reason).await {
            tracing::error!(reference_no = %scan.reference_no, error = %err, "failed to log scan history");
        }
        Ok(decision)
    }
}

fn attempted_reference(ticket_string: &str) -> String {
    let parts: Vec<&str> = ticket_string.splitn(3, '-').collect();
    match parts.as_slice() {
        [date, serial, ..] => format!("{date}-{serial}"),
        _ => ticket_string.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_core::GateMapping;

    const SECRET: &[u8] = b"mayur@123";

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 15).unwrap()
    }

    async fn validator_for(gate: Gate) -> (Validator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::open(dir.path().join("test.db")).await.unwrap();
        (
            Validator::new(store, gate, SECRET, GateMapping::default()),
            dir,
        )
    }

    fn ticket_string(date: &str, serial: &str, gates: &str) -> String {
        let blob = format!("{date}-{serial}-{gates}");
        let tag = gatekeeper_codec::encode(SECRET, &blob);
        format!("{blob}-{tag}")
    }

    #[tokio::test]
    async fn first_scan_is_offline_birth_and_admits() {
        let (validator, _dir) = validator_for(Gate::A).await;
        let ticket = ticket_string("20251015", "000001", "010702080309");

        let decision = validator.validate(&ticket, today()).await.unwrap();
        assert_eq!(decision, Decision::Valid { pax: 7, used_after: 1 });
    }

    #[tokio::test]
    async fn second_scan_at_capacity_is_already_scanned() {
        let (validator, _dir) = validator_for(Gate::B).await;
        // "0201": gate code 02 (B), one passenger.
        let ticket = ticket_string("20251015", "000002", "0201");

        let first = validator.validate(&ticket, today()).await.unwrap();
        assert_eq!(first, Decision::Valid { pax: 1, used_after: 1 });

        let second = validator.validate(&ticket, today()).await.unwrap();
        assert_eq!(second, Decision::AlreadyScanned { pax: 1, used: 1 });
    }

    #[tokio::test]
    async fn wrong_day_ticket_is_rejected_before_mac_check() {
        let (validator, _dir) = validator_for(Gate::A).await;
        let ticket = ticket_string("20250101", "000003", "010702080309");

        let decision = validator.validate(&ticket, today()).await.unwrap();
        assert_eq!(decision, Decision::InvalidDate);
    }

    #[tokio::test]
    async fn zero_allowance_gate_is_attraction_mismatch() {
        let (validator, _dir) = validator_for(Gate::C).await;
        // "0300": gate code 03 (C), zero passengers.
        let ticket = ticket_string("20251015", "000004", "0300");

        let decision = validator.validate(&ticket, today()).await.unwrap();
        assert_eq!(decision, Decision::AttractionMismatch { gate: "C".to_string() });
    }

    #[tokio::test]
    async fn corrupt_tag_is_invalid_qr() {
        let (validator, _dir) = validator_for(Gate::A).await;
        let blob = "20251015-000005-010702080309";
        let mut tag = gatekeeper_codec::encode(SECRET, blob);
        tag.replace_range(11..12, if tag.ends_with('A') { "B" } else { "A" });
        let ticket = format!("{blob}-{tag}");

        let decision = validator.validate(&ticket, today()).await.unwrap();
        assert!(matches!(decision, Decision::InvalidQr { .. }));
    }

    #[tokio::test]
    async fn third_admission_past_capacity_is_already_scanned() {
        let (validator, _dir) = validator_for(Gate::A).await;
        // "0102": gate code 01 (A), two passengers.
        let ticket = ticket_string("20251015", "000006", "0102");

        assert_eq!(
            validator.validate(&ticket, today()).await.unwrap(),
            Decision::Valid { pax: 2, used_after: 1 }
        );
        assert_eq!(
            validator.validate(&ticket, today()).await.unwrap(),
            Decision::Valid { pax: 2, used_after: 2 }
        );
        assert_eq!(
            validator.validate(&ticket, today()).await.unwrap(),
            Decision::AlreadyScanned { pax: 2, used: 2 }
        );
    }
}
