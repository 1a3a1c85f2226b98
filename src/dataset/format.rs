//! Prompt template for supervised fine-tuning

use super::MedicalRecord;

/// Instruction prefixed to every prompt
pub const INSTRUCTION: &str = "Please reason step by step:";

/// Render one record into the training text.
///
/// The reasoning trace is wrapped in `<think>` tags and the text ends with the
/// tokenizer's end-of-sequence marker. Fields are inserted verbatim.
// TODO: the opening `<think>` tag still does not show up in generated responses after training.
pub fn format_instruction(record: &MedicalRecord, eos_token: &str) -> String {
    format!(
        "### Instruction:\n{INSTRUCTION}\n\n### Question:\n{}\n\n### Response:\n<think>\n\n{}\n</think>\n\n{}\n{}",
        record.question, record.complex_cot, record.response, eos_token
    )
}
