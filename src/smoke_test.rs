//! Post-training generation check
//!
//! Reloads the saved adapter on top of the base model, generates a response
//! for a fixed prompt and records it. Nothing here aborts the run: every
//! failure is logged and reported as [`SmokeTestOutcome::Failed`], and the
//! scratch directory used for merged weights is gone afterwards either way.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

use crate::tracking::{ExperimentTracker, Table};

/// Key of the logged result table
pub const RESULT_TABLE_KEY: &str = "test_example";

/// Anything that turns a prompt into text
pub trait TextGenerator {
    fn generate(&mut self, prompt: &str) -> Result<String>;
}

/// Smoke test settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmokeTestConfig {
    pub enabled: bool,
    /// Scratch directory for merged weights
    pub offload_dir: PathBuf,
    pub prompt: String,
}

/// Result of [`run_smoke_test`]
#[derive(Debug, Clone, PartialEq)]
pub enum SmokeTestOutcome {
    Passed { response: String },
    Failed { error: String },
}

impl SmokeTestOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, SmokeTestOutcome::Passed { .. })
    }
}

/// Scratch directory removed when dropped
#[derive(Debug)]
pub struct OffloadDir {
    path: PathBuf,
}

impl OffloadDir {
    /// Create `path` empty, deleting leftovers from an earlier run
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        remove_dir_if_exists(&path)?;
        std::fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OffloadDir {
    fn drop(&mut self) {
        if let Err(e) = remove_dir_if_exists(&self.path) {
            tracing::warn!("Failed to remove offload directory {:?}: {}", self.path, e);
        }
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Load a generator with `load`, run `prompt` through it and log the result
/// as a two-column table. The offload directory exists only for the
/// duration of the call.
pub fn run_smoke_test<F>(
    offload_dir: &Path,
    prompt: &str,
    tracker: &dyn ExperimentTracker,
    load: F,
) -> SmokeTestOutcome
where
    F: FnOnce(&Path) -> Result<Box<dyn TextGenerator>>,
{
    let outcome = generate_in_scratch(offload_dir, prompt, load).and_then(|response| {
        println!("\nTest Problem: {prompt}");
        println!("\nModel Response: {response}");

        let mut table = Table::new(["Test Case", "Model Response"]);
        table.add_row([prompt, response.as_str()]);
        tracker
            .log_table(RESULT_TABLE_KEY, &table)
            .map_err(|e| anyhow::anyhow!("Failed to log response {response:?}: {e}"))?;
        Ok(response)
    });

    match outcome {
        Ok(response) => SmokeTestOutcome::Passed { response },
        Err(e) => {
            tracing::error!("Error during testing: {:#}", e);
            println!(
                "Model was saved successfully but testing failed. \
                 You can load the model separately for testing."
            );
            SmokeTestOutcome::Failed { error: format!("{e:#}") }
        }
    }
}

fn generate_in_scratch<F>(offload_dir: &Path, prompt: &str, load: F) -> Result<String>
where
    F: FnOnce(&Path) -> Result<Box<dyn TextGenerator>>,
{
    let scratch = OffloadDir::create(offload_dir)?;
    let mut generator = load(scratch.path())?;
    let response = generator.generate(prompt)?;
    // Release mapped weights before the directory goes away.
    drop(generator);
    drop(scratch);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offload_dir_replaces_stale_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offload");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("stale.safetensors"), b"old").unwrap();

        let scratch = OffloadDir::create(&path).unwrap();
        assert!(scratch.path().exists());
        assert!(!path.join("stale.safetensors").exists());

        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_tolerates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offload");
        let scratch = OffloadDir::create(&path).unwrap();
        std::fs::remove_dir_all(&path).unwrap();
        drop(scratch);
        assert!(!path.exists());
    }
}
