//! Knobs for the address manager. They can be built in code or loaded from a TOML
//! document, e.g.:
//!
//! ```toml
//! deterministic = false
//! tried_selection_chance = 0.3
//! asmap = "/var/lib/node/asmap.txt"
//! ```

use std::fs::read_to_string;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::AddrManError;

/// How likely [`select`](crate::AddrMan::select) is to draw from the tried table when both
/// tables have entries
pub const DEFAULT_TRIED_SELECTION_CHANCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AddrManConfig {
    /// Use a fixed secret key and a seeded RNG, so runs are reproducible. Never use this
    /// on a real node, since it lets anyone predict where addresses will land.
    pub deterministic: bool,

    /// Probability of drawing from the tried table in a non-restricted selection
    pub tried_selection_chance: f64,

    /// A file mapping IP prefixes to ASNs. If set, addresses are grouped by ASN.
    pub asmap: Option<PathBuf>,
}

impl Default for AddrManConfig {
    fn default() -> Self {
        AddrManConfig {
            deterministic: false,
            tried_selection_chance: DEFAULT_TRIED_SELECTION_CHANCE,
            asmap: None,
        }
    }
}

impl AddrManConfig {
    /// A config for tests and simulations: fixed key, seeded randomness
    pub fn deterministic() -> Self {
        AddrManConfig {
            deterministic: true,
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, AddrManError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, AddrManError> {
        let text = read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
