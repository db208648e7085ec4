//! TOML run configuration for the command-line driver.
//!
//! A run configuration names the synthetic problem to generate and the
//! selection settings of the weighted oracle. Sparsity budgets are optional and
//! default to "keep everything" once the problem size is known.

use crate::generate::GenerationConfig;
use crate::problem::LinearLmeProblem;
use crate::weighted::SelectionSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Selection settings as written by a user, before the problem size is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub lb: f64,
    pub lg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nnz_tbeta: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nnz_tgamma: Option<usize>,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            lb: 0.0,
            lg: 0.0,
            nnz_tbeta: None,
            nnz_tgamma: None,
        }
    }
}

impl SelectionConfig {
    /// Fills in missing budgets from the problem dimensions.
    pub fn resolve(&self, problem: &LinearLmeProblem) -> SelectionSettings {
        SelectionSettings {
            lb: self.lb,
            lg: self.lg,
            nnz_tbeta: self.nnz_tbeta.unwrap_or(problem.num_fixed_effects()),
            nnz_tgamma: self.nnz_tgamma.unwrap_or(problem.num_random_effects()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub problem: GenerationConfig,
    pub selection: SelectionConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
