//! Model runtime: tokenizer handling, the trainable Qwen2 model, sampling
//! and text generation

pub mod generation;
pub mod qwen2;
pub mod sampling;

pub use generation::TextGenerationPipeline;
pub use qwen2::Qwen2ForTraining;
pub use sampling::{GenerationConfig, TokenSampler};

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use crate::dataset::tokenize::configure_fixed_length;

/// Tokenizer plus the special tokens the pipeline depends on.
///
/// The padding token is the end-of-sequence token and padding goes on the
/// right.
#[derive(Clone)]
pub struct TokenizerBundle {
    /// Unpadded tokenizer, used for generation
    pub tokenizer: Tokenizer,
    pub eos_token: String,
    pub eos_id: u32,
}

impl TokenizerBundle {
    pub fn pad_token(&self) -> &str {
        &self.eos_token
    }

    pub fn pad_id(&self) -> u32 {
        self.eos_id
    }

    /// Copy configured to truncate and right-pad to exactly `max_len` tokens
    pub fn fixed_length(&self, max_len: usize) -> Result<Tokenizer> {
        let mut tokenizer = self.tokenizer.clone();
        configure_fixed_length(&mut tokenizer, max_len, self.pad_id(), self.pad_token())?;
        Ok(tokenizer)
    }
}

/// Load `tokenizer.json` and read the end-of-sequence token from
/// `tokenizer_config.json`
pub fn load_tokenizer(tokenizer_path: &Path, tokenizer_config_path: &Path) -> Result<TokenizerBundle> {
    let tokenizer = Tokenizer::from_file(tokenizer_path)
        .map_err(|e| anyhow!("Failed to load tokenizer {:?}: {}", tokenizer_path, e))?;

    let config: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(tokenizer_config_path)
            .with_context(|| format!("Failed to read {:?}", tokenizer_config_path))?,
    )?;
    let eos_token = eos_token_from_config(&config)
        .ok_or_else(|| anyhow!("No eos_token in {:?}", tokenizer_config_path))?;
    let eos_id = tokenizer
        .token_to_id(&eos_token)
        .ok_or_else(|| anyhow!("eos token {:?} is not in the vocabulary", eos_token))?;

    tracing::debug!("Tokenizer eos token {:?} (id {})", eos_token, eos_id);
    Ok(TokenizerBundle { tokenizer, eos_token, eos_id })
}

/// `eos_token` is either a plain string or an added-token object
fn eos_token_from_config(config: &serde_json::Value) -> Option<String> {
    let eos = config.get("eos_token")?;
    eos.as_str()
        .or_else(|| eos.get("content").and_then(|c| c.as_str()))
        .map(str::to_string)
}

/// Trainable versus total parameter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterSummary {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterSummary {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.trainable as f64 / self.total as f64
    }
}

impl fmt::Display for ParameterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

/// Number of scalar parameters stored in safetensors files, read from their headers
pub fn count_parameters(weights: &[PathBuf]) -> Result<usize> {
    // SAFETY: the files are only read while the mapping is alive.
    let safetensors = unsafe { candle_core::safetensors::MmapedSafetensors::multi(weights)? };
    Ok(safetensors
        .tensors()
        .iter()
        .map(|(_, view)| view.shape().iter().product::<usize>())
        .sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;

    #[test]
    fn test_eos_token_forms() {
        let plain = serde_json::json!({"eos_token": "</s>"});
        assert_eq!(eos_token_from_config(&plain).as_deref(), Some("</s>"));

        let object = serde_json::json!({
            "eos_token": {"__type": "AddedToken", "content": "<|end|>", "lstrip": false}
        });
        assert_eq!(eos_token_from_config(&object).as_deref(), Some("<|end|>"));

        assert_eq!(eos_token_from_config(&serde_json::json!({})), None);
    }

    #[test]
    fn test_parameter_summary_display() {
        let summary = ParameterSummary { trainable: 1, total: 400 };
        assert_eq!(
            summary.to_string(),
            "trainable params: 1 || all params: 400 || trainable%: 0.2500"
        );
    }

    #[test]
    fn test_count_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("a".to_string(), Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap());
        tensors.insert("b".to_string(), Tensor::zeros(5, DType::F16, &Device::Cpu).unwrap());
        candle_core::safetensors::save(&tensors, &path).unwrap();

        assert_eq!(count_parameters(&[path]).unwrap(), 17);
    }
}
