//! Autoregressive text generation over merged model weights

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2::{Config, ModelForCausalLM};
use std::path::{Path, PathBuf};

use super::sampling::{GenerationConfig, TokenSampler};
use super::TokenizerBundle;
use crate::smoke_test::TextGenerator;

/// Text generation with a KV-cached Qwen2 model
pub struct TextGenerationPipeline {
    model: ModelForCausalLM,
    tokenizer: TokenizerBundle,
    config: GenerationConfig,
    max_position_embeddings: usize,
    device: Device,
}

impl TextGenerationPipeline {
    /// Memory-map `weights` and build the model described by `config_path`
    pub fn load(
        config_path: &Path,
        weights: &[PathBuf],
        tokenizer: TokenizerBundle,
        config: GenerationConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let model_config: Config = serde_json::from_str(
            &std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read {:?}", config_path))?,
        )?;

        // SAFETY: weight files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights, dtype, device)? };
        let model = ModelForCausalLM::new(&model_config, vb)?;

        Ok(Self {
            model,
            tokenizer,
            config,
            max_position_embeddings: model_config.max_position_embeddings,
            device: device.clone(),
        })
    }

    /// Prompt text followed by the sampled continuation
    pub fn generate_text(&mut self, prompt: &str) -> Result<String> {
        let encoding = self
            .tokenizer
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Failed to encode prompt: {}", e))?;
        let mut tokens = encoding.get_ids().to_vec();
        if tokens.is_empty() {
            return Err(anyhow!("Prompt encodes to zero tokens"));
        }

        self.model.clear_kv_cache();
        let mut sampler = TokenSampler::new(&self.config);
        let prompt_len = tokens.len();

        for index in 0..self.config.max_new_tokens {
            if tokens.len() >= self.max_position_embeddings {
                tracing::warn!("Reached the model context length, stopping generation");
                break;
            }

            let (context, offset) = if index == 0 {
                (&tokens[..], 0)
            } else {
                (&tokens[tokens.len() - 1..], tokens.len() - 1)
            };
            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, offset)?.squeeze(0)?.squeeze(0)?;

            let next = sampler.sample(&logits, &tokens)?;
            if next == self.tokenizer.eos_id {
                break;
            }
            tokens.push(next);
        }

        let generated = tokens.len() - prompt_len;
        tracing::debug!("Generated {} tokens", generated);

        let completion = self
            .tokenizer
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("Failed to decode output: {}", e))?;
        Ok(format!("{prompt}{completion}"))
    }
}

impl TextGenerator for TextGenerationPipeline {
    fn generate(&mut self, prompt: &str) -> Result<String> {
        self.generate_text(prompt)
    }
}
