//! The ticket row shape and its wire representation for the sync protocol.

use crate::gate::Gate;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capacity and local admissions for one gate on one ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttractionCounts {
    pub pax: i64,
    pub used: i64,
}

impl AttractionCounts {
    pub fn new(pax: i64, used: i64) -> Self {
        Self { pax, used }
    }

    pub fn is_exhausted(self) -> bool {
        self.used >= self.pax
    }
}

/// A ticket row as held by one gate's local store. `pax`/`used` only cover
/// this gate; the other gates' counters live in their own database files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub reference_no: String,
    pub booking_date: NaiveDate,
    pub counts: BTreeMap<Gate, AttractionCounts>,
    pub is_synced: bool,
}

impl Ticket {
    pub fn counts_for(&self, gate: Gate) -> AttractionCounts {
        self.counts.get(&gate).copied().unwrap_or_default()
    }
}

/// Wire shape exchanged with the central booking service, matching
/// `{ bookingDate, referenceNo, attractions: { A: {pax, used}, ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(rename = "bookingDate")]
    pub booking_date: String,
    #[serde(rename = "referenceNo")]
    pub reference_no: String,
    pub attractions: BTreeMap<String, AttractionCounts>,
}

impl SyncPayload {
    pub fn counts_for(&self, gate: Gate) -> AttractionCounts {
        self.attractions
            .get(gate.as_str())
            .copied()
            .unwrap_or_default()
    }
}

/// A single record as returned by the fetch endpoint's manifest array. The
/// server is inconsistent about casing (`referenceNo` vs `ReferenceNo`), so
/// every field accepts both via `alias`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRecord {
    #[serde(alias = "ReferenceNo", alias = "referenceNo")]
    pub reference_no: String,
    #[serde(alias = "BookingDate", alias = "bookingDate")]
    pub booking_date: String,
    #[serde(alias = "Attractions", alias = "attractions")]
    pub attractions: BTreeMap<String, AttractionCounts>,
}

impl ManifestRecord {
    pub fn counts_for(&self, gate: Gate) -> AttractionCounts {
        self.attractions
            .get(gate.as_str())
            .copied()
            .unwrap_or_default()
    }
}
