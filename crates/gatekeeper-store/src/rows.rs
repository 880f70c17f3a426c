//! The raw row shape returned by `sqlx::query_as`, and its conversions into
//! the public [`gatekeeper_core`] types. Kept separate from `lib.rs` so the
//! column layout is the only thing that needs to change if the schema does.

use chrono::NaiveDate;
use gatekeeper_core::{AttractionCounts, Gate, SyncPayload, Ticket};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TicketRow {
    pub reference_no: String,
    pub booking_date: String,
    pub pax_a: i64,
    pub used_a: i64,
    pub pax_b: i64,
    pub used_b: i64,
    pub pax_c: i64,
    pub used_c: i64,
    pub is_synced: i64,
    #[allow(dead_code)]
    pub created_at: String,
    #[allow(dead_code)]
    pub last_scan: Option<String>,
}

impl TicketRow {
    pub fn used(&self, gate: Gate) -> i64 {
        match gate {
            Gate::A => self.used_a,
            Gate::B => self.used_b,
            Gate::C => self.used_c,
        }
    }

    fn counts(&self, gate: Gate) -> AttractionCounts {
        match gate {
            Gate::A => AttractionCounts::new(self.pax_a, self.used_a),
            Gate::B => AttractionCounts::new(self.pax_b, self.used_b),
            Gate::C => AttractionCounts::new(self.pax_c, self.used_c),
        }
    }

    pub fn into_ticket(self) -> Ticket {
        let booking_date = NaiveDate::from_str(&self.booking_date).unwrap_or_default();
        let counts = Gate::ALL
            .into_iter()
            .map(|gate| (gate, self.counts(gate)))
            .collect::<BTreeMap<_, _>>();

        Ticket {
            reference_no: self.reference_no,
            booking_date,
            counts,
            is_synced: self.is_synced != 0,
        }
    }

    pub fn into_sync_payload(self) -> SyncPayload {
        let attractions = Gate::ALL
            .into_iter()
            .map(|gate| (gate.as_str().to_string(), self.counts(gate)))
            .collect::<BTreeMap<_, _>>();

        SyncPayload {
            booking_date: self.booking_date.clone(),
            reference_no: self.reference_no.clone(),
            attractions,
        }
    }
}
