//! The admission decision taxonomy. Every branch of the validator produces
//! exactly one of these; none of them is an error — a rejected ticket is not
//! a programmer bug, it is the expected output of an untrusted scan.

use std::fmt;

/// Result of a single conditional-update attempt against a ticket's
/// per-gate counter. `NotFound`/`Exhausted` are equivalent from the
/// caller's point of view, but kept distinct for scan-history reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted { pax: i64, used_after: i64 },
    NotFound,
    NotValidHere,
    Exhausted { pax: i64, used: i64 },
}

/// The user-facing outcome of scanning a ticket at a gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Valid { pax: i64, used_after: i64 },
    InvalidQr { detail: String },
    InvalidDate,
    AttractionMismatch { gate: String },
    AlreadyScanned { pax: i64, used: i64 },
}

impl Decision {
    /// Whether a `ScanResult` for this decision should be logged `SUCCESS`.
    pub fn is_success(&self) -> bool {
        matches!(self, Decision::Valid { .. })
    }

    /// The exact human-readable reason string specified for scan history
    /// and for display to the gate operator.
    pub fn reason(&self) -> String {
        match self {
            Decision::Valid { .. } => "Valid Entry".to_string(),
            Decision::InvalidQr { detail } => format!("Invalid QR - {detail}"),
            Decision::InvalidDate => "Invalid date - Ticket not valid for today".to_string(),
            Decision::AttractionMismatch { gate } => {
                format!("Attraction mismatch - Ticket not valid for {gate}")
            }
            Decision::AlreadyScanned { .. } => {
                "QR already scanned - All entries used".to_string()
            }
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

/// What gets appended to `scan_history` for one validation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub reference_no: String,
    pub success: bool,
    pub reason: String,
}

impl ScanResult {
    pub fn from_decision(reference_no: impl Into<String>, decision: &Decision) -> Self {
        ScanResult {
            reference_no: reference_no.into(),
            success: decision.is_success(),
            reason: decision.reason(),
        }
    }
}
