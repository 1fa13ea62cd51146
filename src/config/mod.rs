// =============================================================================
// Conflux Matrix Sync Engine - Configuration
// =============================================================================
//
// Project: Conflux - Matrix Sync Read Path Engine
// License: Apache 2.0 / MIT
//
// Description:
//   Configuration for the sync storage layer, deserialized from the server
//   config file. Every field has a default so a partial section is valid.
//
// =============================================================================

use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Storage engine backend. Only `"memory"` ships with this crate; SQL
    /// dialects register their own engines behind the same traits.
    #[serde(default = "default_database_backend")]
    pub database_backend: String,

    #[serde(default)]
    pub database_path: String,

    /// Scales every internal cache capacity.
    #[serde(default = "default_cache_capacity_modifier")]
    pub conflux_cache_capacity_modifier: f64,

    /// Upper bound on typing notification lifetimes, in milliseconds.
    #[serde(default = "default_typing_timeout_max_ms")]
    pub typing_timeout_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_backend: default_database_backend(),
            database_path: String::new(),
            conflux_cache_capacity_modifier: default_cache_capacity_modifier(),
            typing_timeout_max_ms: default_typing_timeout_max_ms(),
        }
    }
}

impl Config {
    pub fn pdu_cache_capacity(&self) -> usize {
        (100_000.0 * self.conflux_cache_capacity_modifier) as usize
    }
}

fn default_database_backend() -> String {
    "memory".to_owned()
}

fn default_cache_capacity_modifier() -> f64 {
    1.0
}

fn default_typing_timeout_max_ms() -> u64 {
    30_000
}
