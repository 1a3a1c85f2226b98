pub mod config;
pub mod dataset;
pub mod device;
pub mod hub;
pub mod lora;
pub mod pipeline;
pub mod runtime;
pub mod smoke_test;
pub mod tracking;
pub mod training;

// Re-export commonly used types
pub use config::{Args, Settings};
pub use lora::{LoraConfig, LoraError};
pub use training::{SftTrainer, TrainingArguments};
