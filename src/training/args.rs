//! Supervised fine-tuning hyperparameters

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// When intermediate checkpoints are written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStrategy {
    No,
    #[default]
    Epoch,
    Steps,
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArguments {
    /// Directory receiving `checkpoint-{step}` folders
    pub output_dir: PathBuf,
    /// Where the final adapter is saved
    pub final_adapter_dir: PathBuf,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Share of optimizer steps spent warming up the learning rate
    pub warmup_ratio: f64,
    /// Optimizer steps between loss reports
    pub logging_steps: usize,
    pub save_strategy: SaveStrategy,
    /// Optimizer steps between checkpoints with `SaveStrategy::Steps`
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,
    /// Maximum number of checkpoints kept on disk
    #[serde(default)]
    pub save_total_limit: Option<usize>,
    /// Gradient clipping threshold (global L2 norm)
    pub max_grad_norm: f64,
    /// Batch examples of similar length together
    #[serde(default)]
    pub group_by_length: bool,
    /// Seed for batch ordering and dropout
    #[serde(default)]
    pub seed: u64,
    pub run_name: String,
    /// Evaluate on the held-out split after each epoch
    #[serde(default)]
    pub eval_holdout: bool,
    /// Cap on held-out examples per evaluation
    #[serde(default = "default_eval_max_samples")]
    pub eval_max_samples: usize,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("deepseek-r1-medical-finetuning"),
            final_adapter_dir: PathBuf::from("fine_tuned_model"),
            num_train_epochs: 1,
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 4,
            learning_rate: 1e-4,
            weight_decay: 0.01,
            warmup_ratio: 0.03,
            logging_steps: 10,
            save_strategy: SaveStrategy::Epoch,
            save_steps: default_save_steps(),
            save_total_limit: Some(1),
            max_grad_norm: 0.3,
            group_by_length: true,
            seed: 42,
            run_name: "deepseek-medical-tutorial".to_string(),
            eval_holdout: false,
            eval_max_samples: default_eval_max_samples(),
        }
    }
}

impl TrainingArguments {
    /// Examples consumed per optimizer step
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }

    /// Optimizer steps in one epoch over `num_examples`.
    ///
    /// A trailing group of fewer than `gradient_accumulation_steps`
    /// micro-batches still makes one step.
    pub fn steps_per_epoch(&self, num_examples: usize) -> usize {
        let batches = num_examples.div_ceil(self.per_device_train_batch_size);
        batches.div_ceil(self.gradient_accumulation_steps)
    }

    pub fn total_steps(&self, num_examples: usize) -> usize {
        self.steps_per_epoch(num_examples) * self.num_train_epochs
    }
}

fn default_save_steps() -> usize {
    500
}

fn default_eval_max_samples() -> usize {
    200
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_counts() {
        let args = TrainingArguments::default();
        assert_eq!(args.effective_batch_size(), 8);

        // 17 examples -> 9 micro-batches -> 3 optimizer steps
        assert_eq!(args.steps_per_epoch(17), 3);
        assert_eq!(args.steps_per_epoch(16), 2);
        assert_eq!(args.steps_per_epoch(1), 1);

        let args = TrainingArguments { num_train_epochs: 3, ..Default::default() };
        assert_eq!(args.total_steps(16), 6);
    }

    #[test]
    fn test_save_strategy_names() {
        let strategy: SaveStrategy = serde_json::from_str("\"steps\"").unwrap();
        assert_eq!(strategy, SaveStrategy::Steps);
        assert_eq!(serde_json::to_string(&SaveStrategy::No).unwrap(), "\"no\"");
    }
}
