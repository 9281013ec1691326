//! Gate manifests: which symbols cross which boundary.
//!
//! A manifest is the build-time record of every cross-compartment call site.
//! It drives function binding ([`super::Gated::bind`]) and emits the linker
//! arguments that redirect a compartment's direct calls to its wrappers.
//!
//! ```toml
//! [[gate]]
//! symbol = "parse_header"
//! signature = "extern \"C\" fn(*const u8, usize) -> i32"
//! source = 1
//! target = 2
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::signature::normalize;
use crate::compartment::CompartmentId;
use crate::error::{ManifestError, ManifestResult};

/// One gated symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEntry {
    pub symbol: String,
    pub signature: String,
    /// Compartment of the call sites.
    pub source: CompartmentId,
    /// Compartment the symbol is defined in.
    pub target: CompartmentId,
}

impl GateEntry {
    /// Name of the wrapper that replaces direct calls from `source`.
    pub fn wrapper_name(&self) -> String {
        format!("__wrap_{}", self.symbol)
    }
}

/// Every gate of a program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateManifest {
    #[serde(default, rename = "gate")]
    pub gates: Vec<GateEntry>,
}

impl GateManifest {
    pub fn from_toml_str(text: &str, origin: &str) -> ManifestResult<Self> {
        toml::from_str(text).map_err(|e| ManifestError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> ManifestResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }

    /// Check ids against `compartments` and reject duplicates and self-gates.
    pub fn validate(&self, compartments: u8) -> ManifestResult<()> {
        let mut seen = BTreeSet::new();
        for gate in &self.gates {
            if !seen.insert(gate.symbol.as_str()) {
                return Err(ManifestError::DuplicateSymbol {
                    symbol: gate.symbol.clone(),
                });
            }
            for id in [gate.source, gate.target] {
                if id.get() > compartments {
                    return Err(ManifestError::CompartmentOutOfRange {
                        symbol: gate.symbol.clone(),
                        id: id.get(),
                        max: compartments,
                    });
                }
            }
            if gate.source == gate.target {
                return Err(ManifestError::SelfGate {
                    symbol: gate.symbol.clone(),
                    id: gate.source.get(),
                });
            }
        }
        Ok(())
    }

    pub fn lookup(&self, symbol: &str) -> ManifestResult<&GateEntry> {
        self.gates
            .iter()
            .find(|g| g.symbol == symbol)
            .ok_or_else(|| ManifestError::UnknownSymbol {
                symbol: symbol.to_string(),
            })
    }

    /// Linker flags for building `compartment`: one `--wrap=` per symbol it
    /// calls across a boundary.
    pub fn link_args(&self, compartment: CompartmentId) -> Vec<String> {
        let symbols: BTreeSet<&str> = self
            .gates
            .iter()
            .filter(|g| g.source == compartment)
            .map(|g| g.symbol.as_str())
            .collect();
        symbols
            .into_iter()
            .map(|symbol| format!("-Wl,--wrap={symbol}"))
            .collect()
    }

    /// Symbols grouped by normalized signature. One wrapper shape serves each
    /// group.
    pub fn by_signature(&self) -> BTreeMap<String, Vec<&str>> {
        let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for gate in &self.gates {
            groups
                .entry(normalize(&gate.signature))
                .or_default()
                .push(&gate.symbol);
        }
        groups
    }

    pub fn to_json(&self) -> ManifestResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ManifestError::Parse {
            path: "<json>".into(),
            message: e.to_string(),
        })
    }
}
