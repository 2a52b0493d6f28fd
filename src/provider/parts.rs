//! Helpers for message `content` fields that are either a plain string or a
//! list of typed blocks (`[{"type":"text","text":"..."}, ...]`). OpenAI chat
//! and Anthropic messages both use this shape.

use serde_json::Value;

use crate::observability::token_counter::count_text_tokens;

fn is_text_block(block: &Value) -> bool {
    match block.get("type").and_then(Value::as_str) {
        Some(kind) => kind == "text" && block.get("text").is_some_and(Value::is_string),
        None => block.get("text").is_some_and(Value::is_string),
    }
}

/// Concatenated text of a content field. Non-text blocks contribute nothing.
#[must_use]
pub(crate) fn text_of(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| is_text_block(b))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// Run `f` over every text segment, writing back changed results.
pub(crate) fn rewrite_texts<E, F>(content: &mut Value, role: &str, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    match content {
        Value::String(s) => {
            let updated = f(role, s)?;
            if updated != *s {
                *s = updated;
            }
        }
        Value::Array(blocks) => {
            for block in blocks.iter_mut().filter(|b| is_text_block(b)) {
                if let Some(Value::String(s)) = block.get_mut("text") {
                    let updated = f(role, s)?;
                    if updated != *s {
                        *s = updated;
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace the whole text of a content field with `text`.
///
/// For block lists the first text block receives `text` and the remaining
/// text blocks are emptied, so block count and non-text blocks survive.
pub(crate) fn replace_text(content: &mut Value, text: &str) {
    match content {
        Value::Array(blocks) => {
            let mut written = false;
            for block in blocks.iter_mut().filter(|b| is_text_block(b)) {
                let slot = if written { "" } else { text };
                block["text"] = Value::String(slot.to_string());
                written = true;
            }
            if !written && !text.is_empty() {
                blocks.push(serde_json::json!({"type": "text", "text": text}));
            }
        }
        other => *other = Value::String(text.to_string()),
    }
}

/// Token count of a content field for input-token estimation.
#[must_use]
pub(crate) fn content_tokens(content: &Value) -> u64 {
    match content {
        Value::String(s) => count_text_tokens(s),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| is_text_block(b))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .map(count_text_tokens)
            .sum(),
        _ => 0,
    }
}
