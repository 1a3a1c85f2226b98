//! LoRA adapter configuration, serialized as `adapter_config.json`

use serde::{Deserialize, Serialize};

use super::{LoraError, LoraResult};

/// Which bias terms are trained alongside the adapters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    #[default]
    None,
    All,
    LoraOnly,
}

/// Low-rank adaptation settings.
///
/// Field names follow the adapter config files other tooling reads, so the
/// saved adapter can be loaded elsewhere without translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Low-rank dimension
    pub r: usize,

    /// Scaling numerator; the update is scaled by `lora_alpha / r`
    pub lora_alpha: f64,

    /// Dropout applied to the adapter input during training
    pub lora_dropout: f32,

    /// Projection names that receive an adapter
    pub target_modules: Vec<String>,

    #[serde(default)]
    pub bias: BiasMode,

    #[serde(default = "default_task_type")]
    pub task_type: String,

    #[serde(default = "default_peft_type")]
    pub peft_type: String,

    /// Hub id of the model the adapter was trained on
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,

    #[serde(default)]
    pub inference_mode: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 4,
            lora_alpha: 16.0,
            lora_dropout: 0.1,
            target_modules: vec!["q_proj".to_string(), "v_proj".to_string()],
            bias: BiasMode::None,
            task_type: default_task_type(),
            peft_type: default_peft_type(),
            base_model_name_or_path: None,
            inference_mode: false,
        }
    }
}

impl LoraConfig {
    /// Multiplier applied to `B·A`
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    /// Whether the projection called `name` gets an adapter
    pub fn targets(&self, name: &str) -> bool {
        self.target_modules.iter().any(|t| t == name)
    }

    pub fn validate(&self) -> LoraResult<()> {
        if self.r == 0 {
            return Err(LoraError::InvalidRank { rank: self.r });
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(LoraError::config(format!(
                "lora_dropout must be in [0, 1), got {}",
                self.lora_dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(LoraError::config("target_modules must not be empty"));
        }
        if self.bias != BiasMode::None {
            return Err(LoraError::config("only bias = \"none\" is supported"));
        }
        Ok(())
    }
}

fn default_task_type() -> String {
    "CAUSAL_LM".to_string()
}

fn default_peft_type() -> String {
    "LORA".to_string()
}
