//! File-backed run tracker
//!
//! Layout of one run directory, `{dir}/{project}/{run_name}-{timestamp}-{id}`:
//!
//! ```text
//! run.json           identity, timestamps, status
//! config.json        run configuration
//! history.jsonl      one object per `log` call, with `_step` and `_timestamp`
//! tables/{key}.table.json
//! summary.json       last value of every metric, written on finish
//! ```

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{ExperimentTracker, Metrics, Table, TrackingError, TrackingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

/// Contents of `run.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub project: String,
    pub name: String,
    pub status: RunStatus,
    /// RFC 3339
    pub started_at: String,
    pub finished_at: Option<String>,
    pub exit_code: Option<i32>,
}

struct RunState {
    record: RunRecord,
    history: BufWriter<File>,
    summary: Metrics,
}

/// Writes a run to files under a project directory
pub struct LocalRunTracker {
    run_dir: PathBuf,
    state: Mutex<RunState>,
}

impl LocalRunTracker {
    pub fn create(
        root: &Path,
        project: &str,
        run_name: &str,
        run_config: &serde_json::Value,
    ) -> TrackingResult<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let dir_name = format!("{}-{}-{}", run_name, now.format("%Y%m%d_%H%M%S"), &id[..8]);
        let run_dir = root.join(project).join(dir_name);
        fs::create_dir_all(run_dir.join("tables"))?;

        fs::write(run_dir.join("config.json"), serde_json::to_string_pretty(run_config)?)?;

        let record = RunRecord {
            id,
            project: project.to_string(),
            name: run_name.to_string(),
            status: RunStatus::Running,
            started_at: now.to_rfc3339(),
            finished_at: None,
            exit_code: None,
        };
        write_json(&run_dir.join("run.json"), &record)?;

        let history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("history.jsonl"))?;

        Ok(Self {
            run_dir,
            state: Mutex::new(RunState {
                record,
                history: BufWriter::new(history),
                summary: Metrics::new(),
            }),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn run_id(&self) -> String {
        self.state.lock().record.id.clone()
    }
}

impl ExperimentTracker for LocalRunTracker {
    fn log(&self, step: u64, metrics: &Metrics) -> TrackingResult<()> {
        let mut state = self.state.lock();
        if state.record.status != RunStatus::Running {
            return Err(TrackingError::Finished);
        }

        let mut row = serde_json::Map::new();
        row.insert("_step".into(), step.into());
        row.insert("_timestamp".into(), Utc::now().to_rfc3339().into());
        for (key, value) in metrics {
            row.insert(key.clone(), serde_json::json!(value));
        }
        serde_json::to_writer(&mut state.history, &row)?;
        state.history.write_all(b"\n")?;
        state.history.flush()?;

        state
            .summary
            .extend(metrics.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    fn log_table(&self, key: &str, table: &Table) -> TrackingResult<()> {
        let state = self.state.lock();
        if state.record.status != RunStatus::Running {
            return Err(TrackingError::Finished);
        }
        let file_name = format!("{}.table.json", key.replace(['/', '\\'], "_"));
        write_json(&self.run_dir.join("tables").join(file_name), table)
    }

    fn finish(&self, exit_code: i32) -> TrackingResult<()> {
        let mut state = self.state.lock();
        if state.record.status != RunStatus::Running {
            return Err(TrackingError::Finished);
        }
        state.history.flush()?;

        state.record.status = if exit_code == 0 { RunStatus::Finished } else { RunStatus::Failed };
        state.record.finished_at = Some(Utc::now().to_rfc3339());
        state.record.exit_code = Some(exit_code);

        write_json(&self.run_dir.join("summary.json"), &state.summary)?;
        write_json(&self.run_dir.join("run.json"), &state.record)?;
        tracing::debug!("Run {} finished with exit code {}", state.record.id, exit_code);
        Ok(())
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> TrackingResult<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}
