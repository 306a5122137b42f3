//! Dialect translation between the Anthropic messages shape, the internal
//! OpenAI chat-completions shape, and the Responses-API upstream encoding.

use serde_json::{json, Map, Value};

use crate::config::{MaxTokensLimit, MinTokensLimit, Settings};
use crate::logger;

/// Effective model ids with this prefix speak the Responses API.
const RESPONSES_MODEL_PREFIX: &str = "gpt-5";

pub fn uses_responses_api(model_id: &str) -> bool {
    model_id.starts_with(RESPONSES_MODEL_PREFIX)
}

// ---------------------------------------------------------------------------
// Anthropic -> internal (OpenAI chat completions)
// ---------------------------------------------------------------------------

/// Join a top-level `system` value into a single prompt string. Accepts
/// the plain-string form and the block-array form.
fn join_system(system: &Value) -> String {
    match system {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => String::new(),
    }
}

fn anthropic_image_to_openai_part(block: &Value) -> Value {
    let source = block.get("source");
    let source_type = source
        .and_then(|s| s.get("type"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    if source_type.eq_ignore_ascii_case("base64") {
        let media_type = source
            .and_then(|s| s.get("media_type"))
            .and_then(|m| m.as_str())
            .unwrap_or("application/octet-stream");
        let data = source
            .and_then(|s| s.get("data"))
            .and_then(|d| d.as_str())
            .unwrap_or("");
        if !data.is_empty() {
            let url = format!("data:{};base64,{}", media_type, data);
            return json!({ "type": "image_url", "image_url": { "url": url } });
        }
    }
    json!({ "type": "text", "text": "[Image]" })
}

/// A single text part collapses back to a plain string.
fn content_from_parts(parts: Vec<Value>) -> Value {
    if parts.len() == 1 {
        if let Some(obj) = parts[0].as_object() {
            if obj.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                    return Value::String(text.to_string());
                }
            }
        }
    }
    Value::Array(parts)
}

fn convert_user_message(msg: &Value, role: &str) -> Value {
    let content = match msg.get("content") {
        Some(Value::String(text)) => Value::String(text.clone()),
        Some(Value::Array(blocks)) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            parts.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    "image" => parts.push(anthropic_image_to_openai_part(block)),
                    _ => {}
                }
            }
            content_from_parts(parts)
        }
        _ => Value::String(String::new()),
    };
    json!({ "role": role, "content": content })
}

fn convert_assistant_message(msg: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    match msg.get("content") {
        Some(Value::String(raw)) => text.push_str(raw),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "text" => {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                    "tool_use" => {
                        let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("tool_call");
                        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("tool");
                        let input = block.get("input").cloned().unwrap_or(Value::Null);
                        let arguments =
                            serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string());
                        tool_calls.push(json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": arguments }
                        }));
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let mut out = Map::new();
    out.insert("role".to_string(), Value::String("assistant".to_string()));
    out.insert(
        "content".to_string(),
        if text.is_empty() { Value::Null } else { Value::String(text) },
    );
    if !tool_calls.is_empty() {
        out.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Value::Object(out)
}

/// Flatten a `tool_result` block's content to the string form the
/// chat-completions `tool` role expects.
fn stringify_tool_result(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string(),
        Some(obj) if obj.get("type").and_then(|t| t.as_str()) == Some("text") => obj
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn tool_result_blocks(msg: &Value) -> Vec<&Value> {
    msg.get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
                .collect()
        })
        .unwrap_or_default()
}

fn map_anthropic_tools(tools: &Value) -> Option<Value> {
    let tools = tools.as_array()?;
    let mapped: Vec<Value> = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(|n| n.as_str())?;
            if name.is_empty() {
                return None;
            }
            let mut function = Map::new();
            function.insert("name".to_string(), Value::String(name.to_string()));
            if let Some(desc) = tool.get("description") {
                function.insert("description".to_string(), desc.clone());
            }
            if let Some(schema) = tool.get("input_schema") {
                function.insert("parameters".to_string(), schema.clone());
            }
            Some(json!({ "type": "function", "function": function }))
        })
        .collect();
    if mapped.is_empty() {
        None
    } else {
        Some(Value::Array(mapped))
    }
}

fn map_anthropic_tool_choice(choice: &Value) -> Value {
    if let Some(obj) = choice.as_object() {
        match obj.get("type").and_then(|t| t.as_str()) {
            Some("auto") | Some("any") => return Value::String("auto".to_string()),
            Some("tool") => {
                if let Some(name) = obj.get("name").and_then(|n| n.as_str()) {
                    return json!({ "type": "function", "function": { "name": name } });
                }
            }
            _ => {}
        }
    }
    Value::String("auto".to_string())
}

/// Rewrite an Anthropic messages request into the internal OpenAI shape.
/// `model` and `max_tokens` are intentionally left out; the dispatcher
/// sets the model per attempt and the max-tokens policy owns the limit.
pub fn anthropic_to_openai(payload: &Value) -> Value {
    let mut out = Map::new();
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = payload.get("system") {
        let joined = join_system(system);
        if !joined.trim().is_empty() {
            messages.push(json!({ "role": "system", "content": joined }));
        }
    }

    let source = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();
    let mut i = 0;
    while i < source.len() {
        let msg = &source[i];
        let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        if role == "assistant" {
            messages.push(convert_assistant_message(msg));
            // A user turn made of tool_result blocks belongs to the
            // assistant's tool calls; emit it as tool-role messages.
            if let Some(next) = source.get(i + 1) {
                let next_role = next.get("role").and_then(|r| r.as_str()).unwrap_or("");
                let results = tool_result_blocks(next);
                if next_role == "user" && !results.is_empty() {
                    for block in results {
                        let tool_call_id = block
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("tool_call");
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "content": stringify_tool_result(block.get("content"))
                        }));
                    }
                    i += 1;
                }
            }
        } else {
            messages.push(convert_user_message(msg, role));
        }
        i += 1;
    }

    out.insert("messages".to_string(), Value::Array(messages));
    out.insert(
        "temperature".to_string(),
        payload.get("temperature").cloned().unwrap_or(json!(1.0)),
    );
    if let Some(top_p) = payload.get("top_p") {
        out.insert("top_p".to_string(), top_p.clone());
    }
    if let Some(stop) = payload.get("stop_sequences") {
        out.insert("stop".to_string(), stop.clone());
    }
    if let Some(stream) = payload.get("stream") {
        out.insert("stream".to_string(), stream.clone());
    }
    if let Some(tools) = payload.get("tools") {
        if let Some(mapped) = map_anthropic_tools(tools) {
            out.insert("tools".to_string(), mapped);
        }
    }
    if let Some(choice) = payload.get("tool_choice") {
        out.insert("tool_choice".to_string(), map_anthropic_tool_choice(choice));
    }

    Value::Object(out)
}

// ---------------------------------------------------------------------------
// max_tokens policy
// ---------------------------------------------------------------------------

fn clamp(value: u64, floor: u64, cap: u64) -> u64 {
    value.max(floor).min(cap)
}

/// Resolve the configured limits against the caller's `max_tokens` and
/// write the result (or nothing) into `body`.
pub fn apply_max_tokens_policy(body: &mut Value, requested: Option<u64>, settings: &Settings) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    let floor = match &settings.min_tokens_limit {
        Some(MinTokensLimit::Mode(mode)) if mode == "ignore" => 0,
        Some(MinTokensLimit::Floor(n)) => *n,
        _ => 100,
    };

    let resolved = match &settings.max_tokens_limit {
        Some(MaxTokensLimit::Mode(mode)) if mode == "ignore" => None,
        Some(MaxTokensLimit::Mode(mode)) if mode == "request" => requested,
        Some(MaxTokensLimit::Cap(cap)) => Some(clamp(requested.unwrap_or(floor), floor, *cap)),
        _ => Some(clamp(requested.unwrap_or(100), 100, 4096)),
    };

    if let Some(value) = resolved {
        obj.insert("max_tokens".to_string(), json!(value));
    }
}

// ---------------------------------------------------------------------------
// Internal -> Responses API
// ---------------------------------------------------------------------------

/// Sampling and shaping fields the Responses API rejects.
const RESPONSES_UNSUPPORTED: &[&str] = &[
    "temperature",
    "top_p",
    "n",
    "presence_penalty",
    "frequency_penalty",
    "logit_bias",
    "user",
    "response_format",
];

fn message_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Re-encode a chat-completions request for the Responses API: flat tool
/// entries, `input` string instead of `messages`, unsupported sampling
/// fields removed.
pub fn to_responses_request(body: &Value) -> Value {
    let mut out = body.as_object().cloned().unwrap_or_default();

    out.remove("max_tokens");
    for field in RESPONSES_UNSUPPORTED {
        out.remove(*field);
    }

    if let Some(Value::Array(messages)) = out.remove("messages") {
        let mut input = String::new();
        for message in &messages {
            let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let text = message
                .get("content")
                .map(message_text)
                .unwrap_or_default();
            input.push_str(&format!("{}: {}\n\n", role, text));
        }
        out.insert(
            "input".to_string(),
            Value::String(input.trim_end().to_string()),
        );
    }

    if let Some(Value::Array(tools)) = out.remove("tools") {
        let flattened: Vec<Value> = tools
            .iter()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                let mut entry = Map::new();
                entry.insert("type".to_string(), Value::String("function".to_string()));
                entry.insert("name".to_string(), function.get("name")?.clone());
                if let Some(desc) = function.get("description") {
                    entry.insert("description".to_string(), desc.clone());
                }
                if let Some(params) = function.get("parameters") {
                    entry.insert("parameters".to_string(), params.clone());
                }
                Some(Value::Object(entry))
            })
            .collect();
        if !flattened.is_empty() {
            out.insert("tools".to_string(), Value::Array(flattened));
        }
    }

    if let Some(choice) = out.remove("tool_choice") {
        let converted = match choice
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
        {
            Some(name) => json!({ "type": "function", "name": name }),
            None => choice,
        };
        out.insert("tool_choice".to_string(), converted);
    }

    Value::Object(out)
}

// ---------------------------------------------------------------------------
// Upstream response -> Anthropic
// ---------------------------------------------------------------------------

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("tool_calls") | Some("function_call") => "tool_use",
        _ => "end_turn",
    }
}

fn anthropic_message_id(raw: Option<&str>) -> String {
    match raw {
        Some(id) if id.starts_with("msg_") => id.to_string(),
        Some(id) => format!("msg_{}", id),
        None => "msg_unknown".to_string(),
    }
}

fn usage_to_anthropic(usage: Option<&Value>) -> Value {
    let read = |keys: [&str; 2]| -> u64 {
        usage
            .and_then(|u| keys.iter().find_map(|k| u.get(*k)))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    json!({
        "input_tokens": read(["prompt_tokens", "input_tokens"]),
        "output_tokens": read(["completion_tokens", "output_tokens"]),
    })
}

fn tool_use_from_call(id: Option<&str>, name: &str, arguments: &Value) -> Value {
    let input = match arguments {
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .unwrap_or_else(|_| json!({ "raw_arguments": raw })),
        Value::Object(_) => arguments.clone(),
        _ => json!({}),
    };
    json!({
        "type": "tool_use",
        "id": id.unwrap_or("tool_call"),
        "name": name,
        "input": input
    })
}

fn chat_completion_to_anthropic(response: &Value) -> Value {
    let choice = response
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());
    let message = choice.and_then(|c| c.get("message"));

    let mut blocks = Vec::new();
    if let Some(text) = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        blocks.push(json!({ "type": "text", "text": text }));
    }
    if let Some(tool_calls) = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|t| t.as_array())
    {
        for call in tool_calls {
            let Some(function) = call.get("function") else {
                continue;
            };
            let Some(name) = function.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            blocks.push(tool_use_from_call(
                call.get("id").and_then(|i| i.as_str()),
                name,
                function.get("arguments").unwrap_or(&Value::Null),
            ));
        }
    }
    if blocks.is_empty() {
        blocks.push(json!({ "type": "text", "text": "" }));
    }

    let finish = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|r| r.as_str());

    json!({
        "id": anthropic_message_id(response.get("id").and_then(|i| i.as_str())),
        "type": "message",
        "role": "assistant",
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "content": blocks,
        "stop_reason": map_finish_reason(finish),
        "stop_sequence": null,
        "usage": usage_to_anthropic(response.get("usage")),
    })
}

fn responses_to_anthropic(response: &Value, request_tool_names: &[String]) -> Value {
    let mut blocks = Vec::new();

    if let Some(output) = response.get("output").and_then(|o| o.as_array()) {
        for item in output {
            if item.get("type").and_then(|t| t.as_str()) != Some("message") {
                continue;
            }
            let Some(content) = item.get("content").and_then(|c| c.as_array()) else {
                continue;
            };
            for part in content {
                match part.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                    "output_text" => {
                        let text = part.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    "tool_call" => {
                        let name = part.get("name").and_then(|n| n.as_str()).unwrap_or("");
                        if !request_tool_names.iter().any(|t| t == name) {
                            logger::warn(
                                "translate",
                                &format!("dropping tool_call for undeclared tool '{}'", name),
                            );
                            continue;
                        }
                        blocks.push(tool_use_from_call(
                            part.get("id").and_then(|i| i.as_str()),
                            name,
                            part.get("arguments").unwrap_or(&Value::Null),
                        ));
                    }
                    _ => {}
                }
            }
        }
    }

    let has_tool_use = blocks
        .iter()
        .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"));
    if blocks.is_empty() {
        blocks.push(json!({ "type": "text", "text": "" }));
    }

    json!({
        "id": anthropic_message_id(response.get("id").and_then(|i| i.as_str())),
        "type": "message",
        "role": "assistant",
        "model": response.get("model").cloned().unwrap_or(Value::Null),
        "content": blocks,
        "stop_reason": if has_tool_use { "tool_use" } else { "end_turn" },
        "stop_sequence": null,
        "usage": usage_to_anthropic(response.get("usage")),
    })
}

/// Convert an upstream response (either wire shape) to the Anthropic
/// message shape. `request_tool_names` gates Responses-API tool calls:
/// a call to a tool the caller never declared is dropped.
pub fn response_to_anthropic(response: &Value, request_tool_names: &[String]) -> Value {
    if response.get("object").and_then(|o| o.as_str()) == Some("response") {
        responses_to_anthropic(response, request_tool_names)
    } else {
        chat_completion_to_anthropic(response)
    }
}

/// Names of the tools declared in an Anthropic request, for the
/// Responses-API tool filter.
pub fn declared_tool_names(payload: &Value) -> Vec<String> {
    payload
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.get("name").and_then(|n| n.as_str()))
                .filter(|n| !n.is_empty())
                .map(|n| n.to_string())
                .collect()
        })
        .unwrap_or_default()
}
