//! Causal language modeling collation
//!
//! Labels are the input ids with padding replaced by [`IGNORE_INDEX`]; the
//! model predicts token `t + 1` from position `t`. Because the padding token
//! is the end-of-sequence token, a trailing end-of-sequence token is ignored
//! as well.

use candle_core::{Device, Result, Tensor};

use crate::dataset::TokenizedExample;

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Labels for one example: ids with every `pad_id` replaced by [`IGNORE_INDEX`]
pub fn causal_lm_labels(input_ids: &[u32], pad_id: u32) -> Vec<i64> {
    input_ids
        .iter()
        .map(|&id| if id == pad_id { IGNORE_INDEX } else { id as i64 })
        .collect()
}

/// One micro-batch on the training device
#[derive(Debug)]
pub struct Batch {
    /// `[batch, seq]` u32
    pub input_ids: Tensor,
    /// Next-token targets, `[batch, seq - 1]` u32 (0 where ignored)
    pub targets: Tensor,
    /// 1.0 where the target counts toward the loss, `[batch, seq - 1]` f32
    pub loss_mask: Tensor,
    /// Number of counted targets
    pub n_tokens: usize,
    /// Number of examples
    pub size: usize,
}

/// Stacks fixed-length examples into tensors.
///
/// Columns past the longest real sequence in the batch are dropped: they hold
/// padding only, and under causal attention they cannot affect earlier
/// positions.
#[derive(Debug, Clone, Copy)]
pub struct DataCollator {
    pad_id: u32,
}

impl DataCollator {
    pub fn new(pad_id: u32) -> Self {
        Self { pad_id }
    }

    pub fn collate(&self, examples: &[&TokenizedExample], device: &Device) -> Result<Batch> {
        if examples.is_empty() {
            candle_core::bail!("cannot collate an empty batch");
        }

        let full_len = examples[0].len();
        if examples.iter().any(|e| e.len() != full_len) {
            candle_core::bail!("examples in a batch must share one length");
        }
        let seq_len = examples
            .iter()
            .map(|e| e.real_length())
            .max()
            .unwrap_or(0)
            .clamp(2.min(full_len), full_len);
        if seq_len < 2 {
            candle_core::bail!("sequences need at least two tokens");
        }

        let mut ids = Vec::with_capacity(examples.len() * seq_len);
        let mut targets = Vec::with_capacity(examples.len() * (seq_len - 1));
        let mut mask = Vec::with_capacity(examples.len() * (seq_len - 1));

        for example in examples {
            let input = &example.input_ids[..seq_len];
            ids.extend_from_slice(input);

            for &label in &causal_lm_labels(input, self.pad_id)[1..] {
                if label == IGNORE_INDEX {
                    targets.push(0u32);
                    mask.push(0f32);
                } else {
                    targets.push(label as u32);
                    mask.push(1f32);
                }
            }
        }

        let n_tokens = mask.iter().filter(|&&m| m > 0.0).count();
        let b = examples.len();
        Ok(Batch {
            input_ids: Tensor::from_vec(ids, (b, seq_len), device)?,
            targets: Tensor::from_vec(targets, (b, seq_len - 1), device)?,
            loss_mask: Tensor::from_vec(mask, (b, seq_len - 1), device)?,
            n_tokens,
            size: b,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(ids: &[u32], real: usize) -> TokenizedExample {
        TokenizedExample {
            input_ids: ids.to_vec(),
            attention_mask: (0..ids.len()).map(|i| u32::from(i < real)).collect(),
        }
    }

    #[test]
    fn test_labels_mask_padding() {
        assert_eq!(causal_lm_labels(&[5, 6, 0, 0], 0), vec![5, 6, -100, -100]);
    }

    #[test]
    fn test_end_of_sequence_equal_to_padding_is_ignored() {
        // eos (id 9) doubles as the padding token
        assert_eq!(causal_lm_labels(&[3, 4, 9, 9], 9), vec![3, 4, -100, -100]);
    }

    #[test]
    fn test_collate_shifts_and_trims() {
        let pad = 9;
        let a = example(&[1, 2, 3, 9, 9, 9], 4);
        let b = example(&[4, 5, 9, 9, 9, 9], 3);
        let batch = DataCollator::new(pad).collate(&[&a, &b], &Device::Cpu).unwrap();

        assert_eq!(batch.input_ids.dims(), &[2, 4]);
        assert_eq!(
            batch.targets.to_vec2::<u32>().unwrap(),
            vec![vec![2, 3, 0], vec![5, 0, 0]]
        );
        assert_eq!(
            batch.loss_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 0.0], vec![1.0, 0.0, 0.0]]
        );
        assert_eq!(batch.n_tokens, 3);
        assert_eq!(batch.size, 2);
    }

    #[test]
    fn test_collate_rejects_mixed_lengths() {
        let a = example(&[1, 2, 3], 3);
        let b = example(&[1, 2], 2);
        assert!(DataCollator::new(0).collate(&[&a, &b], &Device::Cpu).is_err());
    }
}
