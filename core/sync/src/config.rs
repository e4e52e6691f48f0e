//! Reconciliation settings.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use twinsync_common::{Error, Result};

use crate::platform::{Platform, DEFAULT_SUFFIX_RANDOM_LEN, MAX_SUFFIX_RANDOM_LEN};
use crate::sorter::DEFAULT_MAX_SORT_ROUNDS;

/// Configuration for a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Platform whose naming rules apply.
    pub platform: Platform,
    /// Absolute path of the local synchronized folder.
    pub sync_root: PathBuf,
    /// Bound on operation sorter rounds.
    pub max_sort_rounds: usize,
    /// Seed for generated name suffixes; `None` uses OS entropy.
    pub name_seed: Option<u64>,
    /// Length of the random part of generated suffixes.
    pub suffix_random_len: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            sync_root: PathBuf::new(),
            max_sort_rounds: DEFAULT_MAX_SORT_ROUNDS,
            name_seed: None,
            suffix_random_len: DEFAULT_SUFFIX_RANDOM_LEN,
        }
    }
}

impl ReconcileConfig {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON; missing fields take their defaults.
    ///
    /// # Postconditions
    /// - The returned config passes [`ReconcileConfig::validate`]
    ///
    /// # Errors
    /// - `Serialization` if the JSON is malformed or has wrong field types
    /// - `InvalidInput` if a value is out of range
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    /// - `InvalidInput` if `max_sort_rounds` is zero or `suffix_random_len`
    ///   is outside `1..=MAX_SUFFIX_RANDOM_LEN`
    pub fn validate(&self) -> Result<()> {
        if self.max_sort_rounds == 0 {
            return Err(Error::InvalidInput(
                "max_sort_rounds must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_SUFFIX_RANDOM_LEN).contains(&self.suffix_random_len) {
            return Err(Error::InvalidInput(format!(
                "suffix_random_len must be between 1 and {}",
                MAX_SUFFIX_RANDOM_LEN
            )));
        }
        Ok(())
    }
}
