//! Capability-aware backend selection over the ordered catalog.
//!
//! Selection is a pure linear scan: the first descriptor that clears the
//! exclusion set, the token budget, the capability flags, and the
//! `model_match` patterns wins.

use regex::Regex;
use serde_json::Value;

use crate::config::BackendCfg;

/// True when any user message carries an image content block, in either
/// dialect's block vocabulary.
pub fn needs_vision(payload: &Value) -> bool {
    let Some(messages) = payload.get("messages").and_then(|m| m.as_array()) else {
        return false;
    };
    messages.iter().any(|message| {
        if message.get("role").and_then(|r| r.as_str()) != Some("user") {
            return false;
        }
        message
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks.iter().any(|block| {
                    matches!(
                        block.get("type").and_then(|t| t.as_str()),
                        Some("image") | Some("image_url")
                    )
                })
            })
            .unwrap_or(false)
    })
}

/// True when the request asks for extended reasoning: an enabled
/// `thinking` block, a reasoning-family model id, or an explicit flag.
pub fn needs_thinking(payload: &Value) -> bool {
    if payload
        .get("thinking")
        .and_then(|t| t.get("type"))
        .and_then(|t| t.as_str())
        == Some("enabled")
    {
        return true;
    }
    if let Some(model) = payload.get("model").and_then(|m| m.as_str()) {
        if model.contains("o1") || model.contains("o3") {
            return true;
        }
    }
    payload.get("reasoning_mode").and_then(|v| v.as_bool()) == Some(true)
}

/// Compile a glob pattern (`*`, `?`) into an anchored case-insensitive
/// regex. Every other character is matched literally.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push_str("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

/// Empty pattern lists match any model.
pub fn model_matches(patterns: &[String], model: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns
        .iter()
        .filter_map(|p| glob_to_regex(p))
        .any(|re| re.is_match(model))
}

/// Why a request could not be routed; used to phrase the 400 body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMiss {
    Vision,
    Thinking,
    NoBackend,
}

impl SelectionMiss {
    pub fn message(&self) -> &'static str {
        match self {
            SelectionMiss::Vision => "no model supports vision",
            SelectionMiss::Thinking => "no model supports thinking",
            SelectionMiss::NoBackend => "no suitable backend available",
        }
    }
}

/// First-match selection. Mutates nothing; repeated calls with the same
/// arguments return the same descriptor.
pub fn select<'a>(
    catalog: &'a [BackendCfg],
    payload: &Value,
    estimated_tokens: u64,
    excluded: &[String],
) -> Result<&'a BackendCfg, SelectionMiss> {
    let vision = needs_vision(payload);
    let thinking = needs_thinking(payload);
    let requested_model = payload.get("model").and_then(|m| m.as_str()).unwrap_or("");

    let found = catalog.iter().find(|backend| {
        if excluded.iter().any(|m| m == &backend.model) {
            return false;
        }
        if estimated_tokens > backend.context() {
            return false;
        }
        if vision && !backend.vision {
            return false;
        }
        if thinking && !backend.thinking {
            return false;
        }
        model_matches(&backend.model_match, requested_model)
    });

    found.ok_or(if vision && !catalog.iter().any(|b| b.vision) {
        SelectionMiss::Vision
    } else if thinking && !catalog.iter().any(|b| b.thinking) {
        SelectionMiss::Thinking
    } else {
        SelectionMiss::NoBackend
    })
}
