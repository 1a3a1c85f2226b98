//! Medical reasoning dataset: loading, splitting, formatting and tokenization

pub mod format;
pub mod split;
pub mod tokenize;

pub use format::format_instruction;
pub use split::{train_test_split, DatasetSplit};
pub use tokenize::{tokenize_fixed_length, TokenizedExample};

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised while preparing training data
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed dataset record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("Unknown dataset subset: {0}")]
    UnknownSubset(String),

    #[error("Cannot split {total} examples into {train} train and {test} test examples")]
    Split { total: usize, train: usize, test: usize },

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// One question / reasoning trace / answer triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicalRecord {
    #[serde(rename = "Question")]
    pub question: String,
    #[serde(rename = "Complex_CoT")]
    pub complex_cot: String,
    #[serde(rename = "Response")]
    pub response: String,
}

/// Dataset source and preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Hub dataset repository
    pub repo: String,
    /// Language subset (`en`, `zh` or `mix`)
    pub subset: String,
    /// Share of examples used for training
    pub train_fraction: f64,
    /// Share of examples held out
    pub test_fraction: f64,
    /// Shuffle seed for the split
    pub seed: u64,
    /// Fixed token length after truncation/padding
    pub max_seq_len: usize,
}

impl DatasetConfig {
    /// File inside the dataset repository holding the chosen subset
    pub fn data_file(&self) -> DatasetResult<&'static str> {
        match self.subset.as_str() {
            "en" => Ok("medical_o1_sft.json"),
            "zh" => Ok("medical_o1_sft_Chinese.json"),
            "mix" => Ok("medical_o1_sft_mix.json"),
            other => Err(DatasetError::UnknownSubset(other.to_string())),
        }
    }
}

/// Load records from a JSON array (or JSON lines) file
pub fn load_records(path: &Path) -> DatasetResult<Vec<MedicalRecord>> {
    let content = std::fs::read_to_string(path)?;
    let trimmed = content.trim_start();

    let records = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<Vec<MedicalRecord>, _>>()?
    };

    tracing::debug!("Loaded {} records from {:?}", records.len(), path);
    Ok(records)
}
