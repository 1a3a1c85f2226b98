//! Fold a trained adapter into base model weights
//!
//! Shards are processed one at a time on the CPU and written to a scratch
//! directory, so peak memory stays around one shard.

use candle_core::Device;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::checkpoint::LoadedAdapter;
use super::layer::merge_delta;
use super::{LoraError, LoraResult};

/// Write merged copies of `shards` into `out_dir` under the same file names.
///
/// Every adapter module must find its base weight in one of the shards.
pub fn merge_into_dir(
    shards: &[PathBuf],
    adapter: &LoadedAdapter,
    out_dir: &Path,
) -> LoraResult<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;

    let mut pending: BTreeSet<String> = adapter.modules().into_iter().collect();
    let scale = adapter.scaling();
    let mut written = Vec::with_capacity(shards.len());

    for shard in shards {
        let file_name = shard
            .file_name()
            .ok_or_else(|| LoraError::checkpoint(format!("invalid shard path {:?}", shard)))?;
        let mut tensors = candle_core::safetensors::load(shard, &Device::Cpu)?;

        let mut merged = 0usize;
        for (name, weight) in tensors.iter_mut() {
            let Some(module) = name.strip_suffix(".weight") else {
                continue;
            };
            let Some((a, b)) = adapter.pair(module) else {
                continue;
            };
            *weight = merge_delta(weight, a, b, scale)?;
            pending.remove(module);
            merged += 1;
        }

        let out_path = out_dir.join(file_name);
        candle_core::safetensors::save(&tensors, &out_path)?;
        tracing::debug!("Merged {} projections into {:?}", merged, out_path);
        written.push(out_path);
    }

    if let Some(module) = pending.into_iter().next() {
        return Err(LoraError::MissingWeights(module));
    }

    Ok(written)
}
