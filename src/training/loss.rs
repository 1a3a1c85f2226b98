//! Token-level cross-entropy for causal language modeling

use candle_core::{Result, Tensor, D};

use super::collator::Batch;

/// Mean negative log-likelihood of the batch targets.
///
/// `logits` is `[batch, seq, vocab]`; the last position has no target and
/// is dropped. Ignored targets contribute nothing, and a batch without any
/// counted target yields zero.
pub fn causal_lm_loss(logits: &Tensor, batch: &Batch) -> Result<Tensor> {
    let (_b, seq_len, _vocab) = logits.dims3()?;
    let logits = logits.narrow(1, 0, seq_len - 1)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&batch.targets.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?;

    let total = (picked * &batch.loss_mask)?.sum_all()?;
    total.neg()? / batch.n_tokens.max(1) as f64
}
