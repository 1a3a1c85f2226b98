//! Low-rank adaptation of attention projections
//!
//! This module provides:
//! - [`LoraConfig`], the adapter hyperparameters stored as `adapter_config.json`
//! - [`LoraLinear`], a frozen projection with a trainable low-rank branch
//! - Adapter save/load and rotating training checkpoints
//! - Merging an adapter back into base weight shards

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod layer;
pub mod merge;

pub use checkpoint::{
    load_adapter, save_pretrained, CheckpointManager, LoadedAdapter, ADAPTER_CONFIG_FILE,
    ADAPTER_WEIGHTS_FILE, TRAINER_STATE_FILE,
};
pub use config::{BiasMode, LoraConfig};
pub use error::{LoraError, LoraResult};
pub use layer::{adapter_key, merge_delta, LoraLinear, ADAPTER_PREFIX};
pub use merge::merge_into_dir;
