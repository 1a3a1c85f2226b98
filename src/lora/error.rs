//! Error types for the LoRA module

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoraError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid rank {rank}: must be at least 1")]
    InvalidRank { rank: usize },

    #[error("Tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Adapter weights missing for module: {0}")]
    MissingWeights(String),
}

impl LoraError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        LoraError::Config(msg.into())
    }

    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        LoraError::Checkpoint(msg.into())
    }
}

pub type LoraResult<T> = Result<T, LoraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = LoraError::config("bad target");
        assert_eq!(err.to_string(), "Configuration error: bad target");

        let err = LoraError::MissingWeights("model.layers.0.self_attn.q_proj".into());
        assert!(err.to_string().contains("q_proj"));
    }
}
