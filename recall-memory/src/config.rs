//! Engine configuration
//!
//! Every section has working defaults; a JSON file only needs the keys it
//! changes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consensus::GateConfig;
use crate::error::{MemoryError, Result};
use crate::linker::LinkerConfig;
use crate::search::RetrievalConfig;
use crate::temporal::SupersessionConfig;

/// Directory under the home directory holding the database
const APP_DIR: &str = ".recall";
const DB_NAME: &str = "memory.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Database directory, `~/.recall/memory.db` when unset
    pub data_dir: Option<PathBuf>,
    pub gate: GateConfig,
    pub supersession: SupersessionConfig,
    pub retrieval: RetrievalConfig,
    pub linker: LinkerConfig,
}

impl MemoryConfig {
    /// Configuration rooted at a specific database directory
    pub fn with_data_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(path.into()),
            ..Self::default()
        }
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved database directory
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(path) => Ok(path.clone()),
            None => default_database_path(),
        }
    }

    /// Reject values outside their meaningful range
    pub fn validate(&self) -> Result<()> {
        let gate = &self.gate;
        if !(0.0..=10.0).contains(&gate.threshold) {
            return Err(MemoryError::config(format!(
                "gate.threshold {} outside [0, 10]",
                gate.threshold
            )));
        }
        if gate.min_reviewers == 0 || gate.max_reviewers < gate.min_reviewers {
            return Err(MemoryError::config(
                "gate reviewers: need 0 < min_reviewers <= max_reviewers",
            ));
        }

        let sup = &self.supersession;
        if !(sup.similarity_floor > 0.0 && sup.similarity_floor <= 1.0) {
            return Err(MemoryError::config("supersession.similarity_floor outside (0, 1]"));
        }
        if !(sup.decay_factor > 0.0 && sup.decay_factor <= 1.0) {
            return Err(MemoryError::config("supersession.decay_factor outside (0, 1]"));
        }

        let ret = &self.retrieval;
        if !(ret.similarity_threshold > 0.0 && ret.similarity_threshold <= 1.0) {
            return Err(MemoryError::config("retrieval.similarity_threshold outside (0, 1]"));
        }
        if ret.window_min > ret.window_max {
            return Err(MemoryError::config("retrieval.window_min exceeds window_max"));
        }
        if ret.window_ratio < 0.0 || ret.recency_half_life_days <= 0.0 {
            return Err(MemoryError::config(
                "retrieval.window_ratio and recency_half_life_days must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&ret.expansion_discount)
            || !(0.0..=1.0).contains(&ret.similarity_link_floor)
        {
            return Err(MemoryError::config(
                "retrieval.expansion_discount and similarity_link_floor must be in [0, 1]",
            ));
        }

        let linker = &self.linker;
        if linker.min_function_name_len == 0 {
            return Err(MemoryError::config("linker.min_function_name_len must be positive"));
        }
        for relevance in [linker.file_relevance, linker.function_relevance] {
            if !(0.0..=1.0).contains(&relevance) {
                return Err(MemoryError::config("linker relevance outside [0, 1]"));
            }
        }
        Ok(())
    }
}

/// `~/.recall/memory.db`
pub fn default_database_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(APP_DIR).join(DB_NAME))
        .ok_or_else(|| MemoryError::config("Cannot resolve home directory"))
}
