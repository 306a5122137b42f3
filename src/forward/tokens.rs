//! Tokenizer adapter.
//!
//! Estimates the input size of a structured request with a BPE encoder,
//! falling back to a byte heuristic when the encoder cannot be built.
//! The heuristic is also what the streaming instrumentation uses for
//! per-delta accounting, where exact counts are not worth an encode.

use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Fixed cost charged per image content block.
const IMAGE_TOKENS: u64 = 85;
/// Role and framing overhead charged per message.
const MESSAGE_OVERHEAD: u64 = 4;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| tiktoken_rs::o200k_base().ok()).as_ref()
}

/// `max(1, chars / 4)` byte heuristic.
pub fn approx_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 1;
    }
    ((text.chars().count() as u64) / 4).max(1)
}

fn text_tokens(text: &str) -> u64 {
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => approx_tokens(text),
    }
}

fn system_tokens(system: &Value) -> u64 {
    match system {
        Value::String(text) => text_tokens(text),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .map(text_tokens)
            .sum(),
        _ => 0,
    }
}

fn content_tokens(content: &Value) -> u64 {
    match content {
        Value::String(text) => text_tokens(text),
        Value::Array(blocks) => blocks
            .iter()
            .map(|block| {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "image" | "image_url" => IMAGE_TOKENS,
                    _ => block
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(text_tokens)
                        .unwrap_or(0),
                }
            })
            .sum(),
        _ => 0,
    }
}

/// Estimate the input tokens of a request: every text block and the
/// system prompt through the encoder, 85 per image block, plus 4 per
/// message of framing overhead. Works for both wire dialects since the
/// walker only touches `system`, `messages[].content` and block shapes
/// common to the two.
pub fn estimate_request(payload: &Value) -> u64 {
    let mut total = 0u64;
    if let Some(system) = payload.get("system") {
        total += system_tokens(system);
    }
    if let Some(messages) = payload.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            total += MESSAGE_OVERHEAD;
            if let Some(content) = message.get("content") {
                total += content_tokens(content);
            }
        }
    }
    total
}
