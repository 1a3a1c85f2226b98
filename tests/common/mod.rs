//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use medtune_core::dataset::MedicalRecord;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{AddedToken, Tokenizer};

pub const EOS: &str = "<eos>";
pub const EOS_ID: u32 = 1;

/// Word-level tokenizer over `words`; anything else maps to `<unk>` (id 0)
pub fn word_level_tokenizer(words: &[&str]) -> Tokenizer {
    let mut vocab: HashMap<String, u32> = HashMap::new();
    vocab.insert("<unk>".to_string(), 0);
    vocab.insert(EOS.to_string(), EOS_ID);
    for word in words {
        let next = vocab.len() as u32;
        vocab.entry(word.to_string()).or_insert(next);
    }

    let model = WordLevel::builder()
        .vocab(vocab.into_iter().collect())
        .unk_token("<unk>".to_string())
        .build()
        .unwrap();
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
    tokenizer.add_special_tokens(&[AddedToken::from(EOS, true)]);
    tokenizer
}

/// Write `tokenizer.json` and a `tokenizer_config.json` naming the eos token
pub fn write_tokenizer_files(dir: &Path, tokenizer: &Tokenizer) -> (PathBuf, PathBuf) {
    let tokenizer_path = dir.join("tokenizer.json");
    tokenizer.save(&tokenizer_path, false).unwrap();

    let config_path = dir.join("tokenizer_config.json");
    std::fs::write(
        &config_path,
        serde_json::json!({"eos_token": {"content": EOS, "special": true}}).to_string(),
    )
    .unwrap();
    (tokenizer_path, config_path)
}

pub fn record(i: usize) -> MedicalRecord {
    MedicalRecord {
        question: format!("question {i}"),
        complex_cot: format!("reasoning {i}"),
        response: format!("answer {i}"),
    }
}
