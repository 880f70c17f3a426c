#![allow(clippy::module_name_repetitions)]
//! # Gatekeeper Core - shared types and configuration
//!
//! Everything a gate's validator, store, and reconciliation workers share:
//! the gate identifier, the ticket's in-memory shape, the admission
//! decision taxonomy, and the one configuration value the whole process
//! is built from.

pub mod config;
pub mod decision;
pub mod gate;
pub mod ticket;

pub use config::GatewayConfig;
pub use decision::{AdmitOutcome, Decision, ScanResult};
pub use gate::{Gate, GateMapping};
pub use ticket::{AttractionCounts, ManifestRecord, SyncPayload, Ticket};
