//! # Gatekeeper Codec
//!
//! Parses the compact ticket string scanned from a barcode and verifies it
//! was issued by the central booking authority, using a keyed HMAC-SHA256
//! tag. Parsing is pure and allocation-light; nothing here touches the
//! filesystem, the network, or the clock.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Number of hex characters kept from the HMAC digest (6 bytes / 12 nibbles).
const TAG_HEX_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid QR format - not enough parts")]
    TooFewParts,
    #[error("Invalid date format: {0}")]
    InvalidDate(String),
    #[error("Invalid serial format: {0}")]
    InvalidSerial(String),
    #[error("Invalid gates format: {0} (length must be multiple of 4)")]
    InvalidGatesLength(String),
    #[error("Invalid passenger count in gates: {0}")]
    InvalidPassengerCount(String),
}

/// The outcome of splitting and decoding a ticket string, before or after
/// MAC verification. `valid` is the single field callers should branch on;
/// everything else is available for logging and for the offline-birth path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTicket {
    pub valid: bool,
    pub date: String,
    pub serial: String,
    pub reference_no: String,
    /// Gate code (e.g. "01") to passenger count, as encoded in the ticket.
    pub gate_info: BTreeMap<String, i64>,
    pub tag: String,
    /// `DATE-SERIAL-GATES`, the exact byte string the tag was computed over.
    pub signed_blob: String,
    pub error: Option<String>,
}

/// Computes the ticket verification tag: HMAC-SHA256 of `data` under
/// `secret`, truncated to the first 12 uppercase hex characters.
pub fn encode(secret: &[u8], data: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    let digest = mac.finalize().into_bytes();
    hex::encode_upper(digest)[..TAG_HEX_LEN].to_string()
}

/// Recomputes the tag for `data` and compares it against `provided_tag` in
/// constant time. `provided_tag` is uppercased first; comparison is
/// otherwise exact.
pub fn verify(secret: &[u8], data: &str, provided_tag: &str) -> bool {
    let expected = encode(secret, data);
    let provided = provided_tag.to_uppercase();
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Splits a scanned ticket string into its structural components and
/// verifies its MAC. Structural malformation (wrong part count, non-numeric
/// fields, a `gates` segment whose length isn't a multiple of four) is an
/// `Err`; a structurally sound ticket with a bad tag is `Ok` with
/// `valid = false` so callers can still log the attempted reference number.
pub fn parse(secret: &[u8], ticket_string: &str) -> Result<ParsedTicket, CodecError> {
    let parts: Vec<&str> = ticket_string.split('-').collect();
    if parts.len() < 4 {
        return Err(CodecError::TooFewParts);
    }

    let date = parts[0];
    let serial = parts[1];
    let gates = parts[2];
    let tag = parts[3..].join("-");

    if date.len() != 8 || !date.chars().all(|c| c.is_ascii_digit()) {
        return Err(CodecError::InvalidDate(date.to_string()));
    }
    if serial.is_empty() || !serial.chars().all(|c| c.is_ascii_digit()) {
        return Err(CodecError::InvalidSerial(serial.to_string()));
    }
    if gates.len() % 4 != 0 || !gates.chars().all(|c| c.is_ascii_digit()) {
        return Err(CodecError::InvalidGatesLength(gates.to_string()));
    }

    let mut gate_info = BTreeMap::new();
    for chunk in gates.as_bytes().chunks(4) {
        let chunk = std::str::from_utf8(chunk).expect("ASCII digits are valid UTF-8");
        let gate_code = &chunk[0..2];
        let passengers_str = &chunk[2..4];
        let passengers: i64 = passengers_str
            .parse()
            .map_err(|_| CodecError::InvalidPassengerCount(passengers_str.to_string()))?;
        gate_info.insert(gate_code.to_string(), passengers);
    }

    let reference_no = format!("{date}-{serial}");
    let signed_blob = format!("{date}-{serial}-{gates}");
    let mac_valid = verify(secret, &signed_blob, &tag);

    Ok(ParsedTicket {
        valid: mac_valid,
        date: date.to_string(),
        serial: serial.to_string(),
        reference_no,
        gate_info,
        tag,
        signed_blob,
        error: if mac_valid {
            None
        } else {
            Some("Invalid verification code".to_string())
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"mayur@123";

    #[test]
    fn verify_round_trips_for_any_data() {
        for data in ["20251015-000003-010702080309", "", "weird data with spaces"] {
            let tag = encode(SECRET, data);
            assert!(verify(SECRET, data, &tag));
        }
    }

    #[test]
    fn different_data_yields_different_tags() {
        let a = encode(SECRET, "20251015-000003-010702080309");
        let b = encode(SECRET, "20251015-000003-010702080310");
        assert_ne!(a, b);
    }

    #[test]
    fn parses_valid_ticket_from_spec_scenario_one() {
        let blob = "20251015-000003-010702080309";
        let tag = encode(SECRET, blob);
        let ticket_string = format!("{blob}-{tag}");

        let parsed = parse(SECRET, &ticket_string).expect("structurally sound");
        assert!(parsed.valid);
        assert_eq!(parsed.reference_no, "20251015-000003");
        assert_eq!(parsed.gate_info.get("01"), Some(&7));
        assert_eq!(parsed.gate_info.get("02"), Some(&8));
        assert_eq!(parsed.gate_info.get("03"), Some(&9));
    }

    #[test]
    fn corrupt_tag_is_structurally_ok_but_invalid() {
        let blob = "20251015-000003-010702080309";
        let mut tag = encode(SECRET, blob);
        tag.replace_range(11..12, if tag.ends_with('A') { "B" } else { "A" });
        let ticket_string = format!("{blob}-{tag}");

        let parsed = parse(SECRET, &ticket_string).expect("structurally sound");
        assert!(!parsed.valid);
        assert_eq!(parsed.error.as_deref(), Some("Invalid verification code"));
    }

    #[test]
    fn rejects_too_few_parts() {
        assert_eq!(parse(SECRET, "20251015-000003"), Err(CodecError::TooFewParts));
    }

    #[test]
    fn rejects_gates_not_multiple_of_four() {
        let err = parse(SECRET, "20251015-000003-0107020-TAG").unwrap_err();
        assert!(matches!(err, CodecError::InvalidGatesLength(_)));
    }

    #[test]
    fn rejects_non_numeric_date() {
        let err = parse(SECRET, "2025101X-000003-01070208-TAG").unwrap_err();
        assert!(matches!(err, CodecError::InvalidDate(_)));
    }

    #[test]
    fn tag_with_extra_hyphens_is_rejoined() {
        let blob = "20251015-000003-010702080309";
        let tag = encode(SECRET, blob);
        // Split the tag with a hyphen in the middle, as the original format allows.
        let (head, tail) = tag.split_at(6);
        let ticket_string = format!("{blob}-{head}-{tail}");

        let parsed = parse(SECRET, &ticket_string).expect("structurally sound");
        assert_eq!(parsed.tag, format!("{head}-{tail}"));
        // The rejoined tag no longer matches the 12-char hex tag, so verification fails.
        assert!(!parsed.valid);
    }
}
