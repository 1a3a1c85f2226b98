//! Adapter persistence and checkpoint rotation
//!
//! An adapter directory holds `adapter_model.safetensors` (only the low-rank
//! matrices) next to `adapter_config.json`. Training checkpoints are adapter
//! directories named `checkpoint-{step}` that also carry `trainer_state.json`.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::layer::ADAPTER_PREFIX;
use super::{LoraConfig, LoraError, LoraResult};

pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Write adapter weights and config into `dir`, creating it if needed
pub fn save_pretrained(dir: &Path, varmap: &VarMap, config: &LoraConfig) -> LoraResult<()> {
    if varmap.all_vars().is_empty() {
        return Err(LoraError::checkpoint("no adapter weights to save"));
    }
    fs::create_dir_all(dir)?;

    varmap.save(dir.join(ADAPTER_WEIGHTS_FILE))?;

    let mut config = config.clone();
    config.inference_mode = true;
    fs::write(dir.join(ADAPTER_CONFIG_FILE), serde_json::to_string_pretty(&config)?)?;

    tracing::debug!("Saved adapter to {:?}", dir);
    Ok(())
}

/// Adapter read back from disk
#[derive(Debug)]
pub struct LoadedAdapter {
    pub config: LoraConfig,
    tensors: HashMap<String, Tensor>,
}

impl LoadedAdapter {
    /// `(A, B)` for the projection at `module_path`
    pub fn pair(&self, module_path: &str) -> Option<(&Tensor, &Tensor)> {
        let a = self.tensors.get(&super::adapter_key(module_path, "lora_A"))?;
        let b = self.tensors.get(&super::adapter_key(module_path, "lora_B"))?;
        Some((a, b))
    }

    /// Module paths that carry an adapter, sorted
    pub fn modules(&self) -> Vec<String> {
        let prefix = format!("{ADAPTER_PREFIX}.");
        self.tensors
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                rest.strip_suffix(".lora_A.weight")
                    .or_else(|| rest.strip_suffix(".lora_B.weight"))
            })
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn scaling(&self) -> f64 {
        self.config.scaling()
    }
}

/// Load an adapter directory written by [`save_pretrained`]
pub fn load_adapter(dir: &Path, device: &Device) -> LoraResult<LoadedAdapter> {
    let config_path = dir.join(ADAPTER_CONFIG_FILE);
    if !config_path.exists() {
        return Err(LoraError::checkpoint(format!(
            "adapter config not found: {:?}",
            config_path
        )));
    }
    let config: LoraConfig = serde_json::from_str(&fs::read_to_string(&config_path)?)?;
    config.validate()?;

    let tensors = candle_core::safetensors::load(dir.join(ADAPTER_WEIGHTS_FILE), device)?;
    let adapter = LoadedAdapter { config, tensors };

    for module in adapter.modules() {
        if adapter.pair(&module).is_none() {
            return Err(LoraError::MissingWeights(module));
        }
    }

    Ok(adapter)
}

/// Saves `checkpoint-{step}` directories under an output directory and keeps
/// at most `save_total_limit` of them.
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: Option<usize>,
}

impl CheckpointManager {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            save_total_limit: None,
        }
    }

    /// Keep at most `limit` checkpoints; `None` keeps all
    pub fn with_save_total_limit(mut self, limit: Option<usize>) -> Self {
        self.save_total_limit = limit;
        self
    }

    /// Save adapter and trainer state for `step`, then rotate old checkpoints
    pub fn save<S: Serialize>(
        &self,
        step: usize,
        varmap: &VarMap,
        config: &LoraConfig,
        trainer_state: &S,
    ) -> LoraResult<PathBuf> {
        let dir = self.output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"));
        save_pretrained(&dir, varmap, config)?;
        fs::write(
            dir.join(TRAINER_STATE_FILE),
            serde_json::to_string_pretty(trainer_state)?,
        )?;

        tracing::info!("Saved checkpoint {:?}", dir);
        self.rotate()?;
        Ok(dir)
    }

    /// Checkpoint directories sorted by step
    pub fn list_checkpoints(&self) -> LoraResult<Vec<(PathBuf, usize)>> {
        if !self.output_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.output_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let step = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|step| step.parse::<usize>().ok());
            if let Some(step) = step {
                checkpoints.push((path, step));
            }
        }

        checkpoints.sort_by_key(|c| c.1);
        Ok(checkpoints)
    }

    pub fn latest(&self) -> LoraResult<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop().map(|(path, _)| path))
    }

    fn rotate(&self) -> LoraResult<()> {
        let Some(limit) = self.save_total_limit else {
            return Ok(());
        };

        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= limit {
            return Ok(());
        }

        let to_remove = checkpoints.len() - limit;
        for (path, _) in checkpoints.iter().take(to_remove) {
            fs::remove_dir_all(path)?;
            tracing::info!("Deleted older checkpoint {:?} due to save_total_limit", path);
        }
        Ok(())
    }
}
