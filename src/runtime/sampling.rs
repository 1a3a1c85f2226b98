//! Token sampling for text generation
//!
//! Temperature plus nucleus (top-p) sampling with a repetition penalty over
//! every token seen so far, prompt included.

use candle_core::{DType, Result, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::{Deserialize, Serialize};

/// Sampling configuration for text generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens
    pub max_new_tokens: usize,

    /// Temperature for sampling (higher = more random)
    pub temperature: f64,

    /// Nucleus sampling: sample from tokens with cumulative probability <= p
    pub top_p: f64,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Seed for reproducible sampling
    pub seed: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            temperature: 0.6,
            top_p: 0.95,
            repetition_penalty: 1.15,
            seed: 299_792_458,
        }
    }
}

/// Stateful sampler built from a [`GenerationConfig`]
pub struct TokenSampler {
    processor: LogitsProcessor,
    repetition_penalty: f32,
}

impl TokenSampler {
    pub fn new(config: &GenerationConfig) -> Self {
        let sampling = if config.top_p >= 1.0 {
            Sampling::All { temperature: config.temperature }
        } else {
            Sampling::TopP { p: config.top_p, temperature: config.temperature }
        };
        Self {
            processor: LogitsProcessor::from_sampling(config.seed, sampling),
            repetition_penalty: config.repetition_penalty,
        }
    }

    /// Pick the next token from last-position `logits` (shape `[vocab]`)
    pub fn sample(&mut self, logits: &Tensor, context: &[u32]) -> Result<u32> {
        let logits = self.penalize(logits, context)?;
        self.processor.sample(&logits)
    }

    fn penalize(&self, logits: &Tensor, context: &[u32]) -> Result<Tensor> {
        let logits = logits.to_dtype(DType::F32)?;
        if self.repetition_penalty == 1.0 || context.is_empty() {
            return Ok(logits);
        }
        candle_transformers::utils::apply_repeat_penalty(&logits, self.repetition_penalty, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_defaults() {
        let config = GenerationConfig::default();
        assert_eq!(config.temperature, 0.6);
        assert_eq!(config.top_p, 0.95);
        assert_eq!(config.repetition_penalty, 1.15);
    }

    #[test]
    fn test_repetition_penalty_scales_seen_tokens() {
        let sampler = TokenSampler::new(&GenerationConfig {
            repetition_penalty: 2.0,
            ..Default::default()
        });
        let logits = Tensor::new(&[4.0f32, -4.0, 4.0], &Device::Cpu).unwrap();
        let penalized = sampler.penalize(&logits, &[0, 1]).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(penalized, vec![2.0, -8.0, 4.0]);
    }

    #[test]
    fn test_peaked_distribution_is_deterministic() {
        let mut sampler = TokenSampler::new(&GenerationConfig::default());
        let logits = Tensor::new(&[0.0f32, 100.0, 0.0, 0.0], &Device::Cpu).unwrap();
        for _ in 0..5 {
            assert_eq!(sampler.sample(&logits, &[]).unwrap(), 1);
        }
    }
}
