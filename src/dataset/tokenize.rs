//! Fixed-length tokenization

use tokenizers::{
    EncodeInput, PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams,
};

use super::{DatasetError, DatasetResult};

/// Token ids and attention mask of one training text, both `max_len` long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of non-padding tokens
    pub fn real_length(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }
}

/// Truncate and right-pad every encoding to exactly `max_len` tokens
pub fn configure_fixed_length(
    tokenizer: &mut Tokenizer,
    max_len: usize,
    pad_id: u32,
    pad_token: &str,
) -> DatasetResult<()> {
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_len,
            ..Default::default()
        }))
        .map_err(|e| DatasetError::Tokenizer(e.to_string()))?;

    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(max_len),
        direction: PaddingDirection::Right,
        pad_to_multiple_of: None,
        pad_id,
        pad_type_id: 0,
        pad_token: pad_token.to_string(),
    }));

    Ok(())
}

/// Tokenize texts with a tokenizer prepared by [`configure_fixed_length`].
///
/// Encoding runs on the tokenizer's own worker pool.
pub fn tokenize_fixed_length(
    tokenizer: &Tokenizer,
    texts: Vec<String>,
    max_len: usize,
) -> DatasetResult<Vec<TokenizedExample>> {
    let inputs: Vec<EncodeInput> = texts.into_iter().map(EncodeInput::from).collect();
    let encodings = tokenizer
        .encode_batch(inputs, true)
        .map_err(|e| DatasetError::Tokenizer(e.to_string()))?;

    encodings
        .into_iter()
        .map(|encoding| {
            let example = TokenizedExample {
                input_ids: encoding.get_ids().to_vec(),
                attention_mask: encoding.get_attention_mask().to_vec(),
            };
            if example.len() != max_len {
                return Err(DatasetError::Tokenizer(format!(
                    "encoding has {} tokens, expected {}; tokenizer is not configured for fixed length",
                    example.len(),
                    max_len
                )));
            }
            Ok(example)
        })
        .collect()
}
