//! Experiment tracking
//!
//! A run records its configuration, a history of step-indexed scalar metrics,
//! named tables and a final status. [`LocalRunTracker`] writes runs to plain
//! files; [`NoopTracker`] discards everything when tracking is disabled.

pub mod local;

pub use local::{LocalRunTracker, RunRecord, RunStatus};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Scalar metrics keyed by name (e.g. `train/loss`)
pub type Metrics = BTreeMap<String, f64>;

#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Run already finished")]
    Finished,
}

pub type TrackingResult<T> = Result<T, TrackingError>;

/// Rows of text under named columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub data: Vec<Vec<String>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            data: Vec::new(),
        }
    }

    pub fn add_row<S: Into<String>>(&mut self, row: impl IntoIterator<Item = S>) {
        self.data.push(row.into_iter().map(Into::into).collect());
    }
}

/// Sink for run metadata shared across pipeline stages
pub trait ExperimentTracker: Send + Sync {
    fn log(&self, step: u64, metrics: &Metrics) -> TrackingResult<()>;

    fn log_table(&self, key: &str, table: &Table) -> TrackingResult<()>;

    /// Close the run; `exit_code` 0 marks success
    fn finish(&self, exit_code: i32) -> TrackingResult<()>;
}

/// Tracker that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl ExperimentTracker for NoopTracker {
    fn log(&self, _step: u64, _metrics: &Metrics) -> TrackingResult<()> {
        Ok(())
    }

    fn log_table(&self, _key: &str, _table: &Table) -> TrackingResult<()> {
        Ok(())
    }

    fn finish(&self, _exit_code: i32) -> TrackingResult<()> {
        Ok(())
    }
}

/// Tracking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub enabled: bool,
    /// Project grouping related runs
    pub project: String,
    /// Root directory for run files
    pub dir: PathBuf,
}

/// Start a run, or a no-op tracker when tracking is disabled
pub fn init(
    config: &TrackingConfig,
    run_name: &str,
    run_config: &serde_json::Value,
) -> TrackingResult<Arc<dyn ExperimentTracker>> {
    if !config.enabled {
        tracing::info!("Experiment tracking disabled");
        return Ok(Arc::new(NoopTracker));
    }

    let tracker = LocalRunTracker::create(&config.dir, &config.project, run_name, run_config)?;
    tracing::info!("Tracking run {} in {:?}", tracker.run_id(), tracker.run_dir());
    Ok(Arc::new(tracker))
}
