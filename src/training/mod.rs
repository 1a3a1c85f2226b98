//! Supervised fine-tuning
//!
//! This module provides:
//! - `args`: training hyperparameters
//! - `collator`: batching with next-token targets and padding masks
//! - `loss`: masked token-level cross-entropy
//! - `sampler`: shuffled and length-grouped batch orders
//! - `scheduler`: linear warmup/decay learning rate
//! - `trainer`: the optimization loop with checkpointing

pub mod args;
pub mod collator;
pub mod loss;
pub mod sampler;
pub mod scheduler;
pub mod trainer;

pub use args::{SaveStrategy, TrainingArguments};
pub use collator::{causal_lm_labels, Batch, DataCollator, IGNORE_INDEX};
pub use loss::causal_lm_loss;
pub use sampler::{length_grouped_order, random_order};
pub use scheduler::LinearSchedule;
pub use trainer::{clip_grad_norm, SftTrainer, TrainOutput, TrainerState};
