//! The three physical attraction gates and their wire-format codes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One physical attraction entrance. A validator process runs against exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Gate {
    A,
    B,
    C,
}

impl Gate {
    pub const ALL: [Gate; 3] = [Gate::A, Gate::B, Gate::C];

    /// Accepts the canonical letter, a lowercase letter, or one of the
    /// venue's human-facing aliases ("SOU Entry", "Jungle Safari", "Cactus Garden").
    pub fn parse(name: &str) -> Option<Gate> {
        match name.trim() {
            "A" | "a" | "SOU Entry" | "AttractionA" => Some(Gate::A),
            "B" | "b" | "Jungle Safari" | "AttractionB" => Some(Gate::B),
            "C" | "c" | "Cactus Garden" | "AttractionC" => Some(Gate::C),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Gate::A => "A",
            Gate::B => "B",
            Gate::C => "C",
        }
    }

    /// File stem used for this gate's embedded database, e.g. `AttractionA`.
    pub fn db_stem(self) -> &'static str {
        match self {
            Gate::A => "AttractionA",
            Gate::B => "AttractionB",
            Gate::C => "AttractionC",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured mapping from gate name to the two-digit code embedded in a
/// scanned ticket string (default 01/02/03). Loaded from `gate_mapping` in
/// configuration; never hardcoded past this single table.
///
/// Keyed by the gate's letter (`"A"`/`"B"`/`"C"`) rather than the `Gate` enum
/// itself, so the table round-trips through TOML as an ordinary
/// string-keyed table an operator can read and edit by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateMapping(BTreeMap<String, String>);

impl GateMapping {
    pub fn code_for(&self, gate: Gate) -> &str {
        self.0
            .get(gate.as_str())
            .map(String::as_str)
            .unwrap_or_else(|| Self::default_code(gate))
    }

    pub fn gate_for_code(&self, code: &str) -> Option<Gate> {
        self.0
            .iter()
            .find(|(_, v)| v.as_str() == code)
            .and_then(|(k, _)| Gate::parse(k))
            .or_else(|| Gate::ALL.into_iter().find(|g| Self::default_code(*g) == code))
    }

    fn default_code(gate: Gate) -> &'static str {
        match gate {
            Gate::A => "01",
            Gate::B => "02",
            Gate::C => "03",
        }
    }
}

impl Default for GateMapping {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for gate in Gate::ALL {
            map.insert(gate.as_str().to_string(), Self::default_code(gate).to_string());
        }
        GateMapping(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!(Gate::parse("Jungle Safari"), Some(Gate::B));
        assert_eq!(Gate::parse("c"), Some(Gate::C));
        assert_eq!(Gate::parse("Q"), None);
    }

    #[test]
    fn default_mapping_matches_spec() {
        let mapping = GateMapping::default();
        assert_eq!(mapping.code_for(Gate::A), "01");
        assert_eq!(mapping.code_for(Gate::B), "02");
        assert_eq!(mapping.code_for(Gate::C), "03");
        assert_eq!(mapping.gate_for_code("03"), Some(Gate::C));
        assert_eq!(mapping.gate_for_code("99"), None);
    }
}
