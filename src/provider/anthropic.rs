//! Anthropic Messages API (`/v1/messages`).
//!
//! Request-side message handling reuses the OpenAI helpers; the streaming
//! event model (`message_start`, `content_block_*`, `message_delta`,
//! `message_stop`) is handled here.

use serde_json::{json, Value};
use smallvec::{smallvec, SmallVec};
use tracing::warn;

use super::openai::{message_tokens, push_role_block, write_message_content};
use super::parts;
use super::{u64_at, warn_role_change, ProviderError};
use super::{PromptMessage, PromptMessages, ResponseChoice, ResponseChoices};
use super::{TokenDetails, Tokens};
use crate::observability::token_counter::{
    count_text_tokens, REPLY_PRIMING_TOKENS, TOKENS_PER_MESSAGE,
};
use crate::stream::ChunkKind;

const MESSAGE_START: &str = "message_start";
const MESSAGE_DELTA: &str = "message_delta";
const MESSAGE_STOP: &str = "message_stop";
const BLOCK_START: &str = "content_block_start";
const BLOCK_DELTA: &str = "content_block_delta";

fn event_type(jsn: &Value) -> Option<&str> {
    jsn.get("type").and_then(Value::as_str)
}

fn usage_tokens(usage: &Value, with_prompt: bool, with_completion: bool) -> Tokens {
    let cache_read = usage.get("cache_read_input_tokens").and_then(Value::as_u64);
    let cache_write = usage.get("cache_creation_input_tokens").and_then(Value::as_u64);
    let prompt_details = (with_prompt && (cache_read.is_some() || cache_write.is_some())).then(|| {
        TokenDetails {
            cached: cache_read.unwrap_or(0),
            ..TokenDetails::default()
        }
    });
    Tokens {
        prompt: if with_prompt { u64_at(usage, "input_tokens") } else { 0 },
        completion: if with_completion { u64_at(usage, "output_tokens") } else { 0 },
        prompt_details,
        completion_details: None,
    }
}

/// `message_start` carries the input count and a placeholder output count;
/// `message_delta` carries the final output count. Taking one side from
/// each keeps the per-frame sum equal to the final usage.
pub(crate) fn tokens(jsn: &Value) -> Tokens {
    match event_type(jsn) {
        Some(MESSAGE_START) => jsn
            .pointer("/message/usage")
            .map_or_else(Tokens::default, |u| usage_tokens(u, true, false)),
        Some(MESSAGE_DELTA) => jsn
            .get("usage")
            .map_or_else(Tokens::default, |u| usage_tokens(u, false, true)),
        Some("message") | None => jsn
            .get("usage")
            .filter(|u| u.is_object())
            .map_or_else(Tokens::default, |u| usage_tokens(u, true, true)),
        Some(_) => Tokens::default(),
    }
}

pub(crate) fn create_usage_json(tokens: &Tokens) -> Value {
    let mut usage = json!({
        "input_tokens": tokens.prompt,
        "output_tokens": tokens.completion,
    });
    if let Some(d) = tokens.prompt_details {
        usage["cache_read_input_tokens"] = json!(d.cached);
    }
    usage
}

pub(crate) fn get_model_resp(body: &Value) -> Option<String> {
    let model = match event_type(body) {
        Some(MESSAGE_START) => body.pointer("/message/model"),
        _ => body.get("model"),
    };
    model.and_then(Value::as_str).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Streaming frames
// ---------------------------------------------------------------------------

fn text_slot(jsn: &Value) -> Option<&str> {
    match event_type(jsn)? {
        BLOCK_DELTA => jsn.pointer("/delta/text").and_then(Value::as_str),
        BLOCK_START => jsn.pointer("/content_block/text").and_then(Value::as_str),
        _ => None,
    }
}

pub(crate) fn extract_contents(jsn: &Value) -> Vec<String> {
    text_slot(jsn).map_or_else(Vec::new, |text| vec![text.to_string()])
}

pub(crate) fn has_choice_index(jsn: &Value, k: usize) -> bool {
    k == 0 && text_slot(jsn).is_some()
}

pub(crate) fn update_stream_resp_contents(jsn: &mut Value, k: usize, text: &str) {
    if k != 0 {
        return;
    }
    let pointer = match event_type(jsn) {
        Some(BLOCK_DELTA) => "/delta/text",
        Some(BLOCK_START) => "/content_block/text",
        _ => return,
    };
    if let Some(slot) = jsn.pointer_mut(pointer) {
        *slot = Value::String(text.to_string());
    }
}

pub(crate) fn content_only_chunk(template: &Value) -> Value {
    let index = template.get("index").cloned().unwrap_or_else(|| json!(0));
    json!({
        "type": BLOCK_DELTA,
        "index": index,
        "delta": {"type": "text_delta", "text": ""}
    })
}

pub(crate) fn chunk_kind(jsn: &Value) -> ChunkKind {
    match event_type(jsn) {
        Some(BLOCK_DELTA | BLOCK_START) if text_slot(jsn).is_some() => ChunkKind::NormalText,
        Some(MESSAGE_DELTA)
            if jsn
                .pointer("/delta/stop_reason")
                .is_some_and(|r| !r.is_null()) =>
        {
            ChunkKind::FinishNoContent
        }
        _ => ChunkKind::Unknown,
    }
}

fn has_tool_use_block(content: Option<&Value>) -> bool {
    content
        .and_then(Value::as_array)
        .is_some_and(|blocks| {
            blocks
                .iter()
                .any(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
        })
}

pub(crate) fn has_function_call(jsn: &Value) -> bool {
    match event_type(jsn) {
        Some(BLOCK_START) => {
            jsn.pointer("/content_block/type").and_then(Value::as_str) == Some("tool_use")
        }
        Some(MESSAGE_DELTA) => {
            jsn.pointer("/delta/stop_reason").and_then(Value::as_str) == Some("tool_use")
        }
        Some(MESSAGE_START) => has_tool_use_block(jsn.pointer("/message/content")),
        _ => has_tool_use_block(jsn.get("content")),
    }
}

pub(crate) fn is_completed(jsn: &Value) -> bool {
    event_type(jsn) == Some(MESSAGE_STOP)
}

pub(crate) fn roles(jsn: &Value) -> Vec<(usize, String)> {
    if event_type(jsn) != Some(MESSAGE_START) {
        return Vec::new();
    }
    jsn.pointer("/message/role")
        .and_then(Value::as_str)
        .map(|role| vec![(0, role.to_string())])
        .unwrap_or_default()
}

pub(crate) fn finished_choices(jsn: &Value) -> SmallVec<[usize; 4]> {
    if chunk_kind(jsn) == ChunkKind::FinishNoContent {
        smallvec![0]
    } else {
        SmallVec::new()
    }
}

/// SSE `event:` line matching the frame's `type`.
pub(crate) fn sse_head(jsn: &Value) -> String {
    match event_type(jsn) {
        Some(kind) => format!("event: {kind}\ndata: "),
        None => "data: ".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Whole bodies
// ---------------------------------------------------------------------------

fn messages(body: &Value) -> &[Value] {
    body.get("messages")
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn system_text(body: &Value) -> Option<String> {
    body.get("system").map(parts::text_of)
}

fn role_of(message: &Value) -> String {
    message
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("user")
        .to_string()
}

pub(crate) fn iterate_str_req_messages<E, F>(body: &mut Value, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    if let Some(system) = body.get_mut("system") {
        parts::rewrite_texts(system, "system", f)?;
    }
    if let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) {
        for message in messages {
            let role = role_of(message);
            if let Some(content) = message.get_mut("content") {
                parts::rewrite_texts(content, &role, f)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn iterate_str_resp_messages<E, F>(body: &mut Value, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    let role = body
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("assistant")
        .to_string();
    if let Some(content) = body.get_mut("content") {
        parts::rewrite_texts(content, &role, f)?;
    }
    Ok(())
}

pub(crate) fn get_num_tokens_from_body(body: &Value) -> u64 {
    let system = system_text(body)
        .map_or(0, |text| TOKENS_PER_MESSAGE + count_text_tokens("system") + count_text_tokens(&text));
    let messages = messages(body);
    if messages.is_empty() && system == 0 {
        return 0;
    }
    system + messages.iter().map(message_tokens).sum::<u64>() + REPLY_PRIMING_TOKENS
}

pub(crate) fn all_req_content(body: &Value) -> String {
    let mut out = String::new();
    if let Some(system) = system_text(body) {
        push_role_block(&mut out, "system", &system);
    }
    for message in messages(body) {
        let text = message.get("content").map(parts::text_of).unwrap_or_default();
        push_role_block(&mut out, &role_of(message), &text);
    }
    out
}

pub(crate) fn construct_request_webhook_request_body(body: &Value) -> PromptMessages {
    let mut out = Vec::with_capacity(messages(body).len() + 1);
    if let Some(system) = system_text(body) {
        out.push(PromptMessage::new("system", system));
    }
    out.extend(messages(body).iter().map(|m| {
        let text = m.get("content").map(parts::text_of).unwrap_or_default();
        PromptMessage::new(role_of(m), text)
    }));
    PromptMessages { messages: out }
}

pub(crate) fn update_request_body_from_webhook(
    body: &mut Value,
    modified: &PromptMessages,
) -> Result<(), ProviderError> {
    let has_system = body.get("system").is_some();
    let expected = messages(body).len() + usize::from(has_system);
    if expected != modified.messages.len() {
        return Err(ProviderError::LengthMismatch {
            expected,
            got: modified.messages.len(),
        });
    }
    let mut incoming = modified.messages.iter();
    if has_system {
        if let (Some(system), Some(new)) = (body.get_mut("system"), incoming.next()) {
            warn_role_change("system", &new.role);
            if parts::text_of(system) != new.content {
                parts::replace_text(system, &new.content);
            }
        }
    }
    let messages = body
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .ok_or(ProviderError::MissingField("messages"))?;
    for (message, new) in messages.iter_mut().zip(incoming) {
        warn_role_change(&role_of(message), &new.role);
        write_message_content(message, &new.content);
    }
    Ok(())
}

pub(crate) fn construct_response_webhook_request_body(body: &Value) -> ResponseChoices {
    let role = body.get("role").and_then(Value::as_str).unwrap_or("assistant");
    let choices = body
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .map(|b| {
                    let text = b.get("text").and_then(Value::as_str).unwrap_or_default();
                    ResponseChoice::new(role, text)
                })
                .collect()
        })
        .unwrap_or_default();
    ResponseChoices { choices }
}

pub(crate) fn update_response_body_from_webhook(
    body: &mut Value,
    modified: &ResponseChoices,
) -> Result<(), ProviderError> {
    let blocks = body
        .get_mut("content")
        .and_then(Value::as_array_mut)
        .ok_or(ProviderError::MissingField("content"))?;
    if blocks.len() != modified.choices.len() {
        return Err(ProviderError::LengthMismatch {
            expected: blocks.len(),
            got: modified.choices.len(),
        });
    }
    for (block, new) in blocks.iter_mut().zip(&modified.choices) {
        warn_role_change("assistant", &new.message.role);
        match block.get_mut("text") {
            Some(slot) if slot.is_string() => {
                *slot = Value::String(new.message.content.clone());
            }
            _ if !new.message.content.is_empty() => {
                warn!("webhook supplied text for a non-text content block; ignored");
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn test_stream_usage_split_across_events() {
        let start = frame(
            r#"{"type":"message_start","message":{"id":"msg_1","role":"assistant","model":"claude-3-5-sonnet-20241022","content":[],"usage":{"input_tokens":25,"output_tokens":1}}}"#,
        );
        let delta = frame(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"output_tokens":15}}"#,
        );
        assert_eq!(tokens(&start) + tokens(&delta), Tokens::new(25, 15));
        assert_eq!(get_model_resp(&start).as_deref(), Some("claude-3-5-sonnet-20241022"));
        assert_eq!(roles(&start), vec![(0, "assistant".to_string())]);
        assert_eq!(chunk_kind(&delta), ChunkKind::FinishNoContent);
        assert_eq!(finished_choices(&delta).as_slice(), &[0]);
    }

    #[test]
    fn test_text_delta_round_trip() {
        let mut jsn = frame(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        );
        assert_eq!(extract_contents(&jsn), vec!["Hello"]);
        assert_eq!(chunk_kind(&jsn), ChunkKind::NormalText);
        update_stream_resp_contents(&mut jsn, 0, "Howdy");
        assert_eq!(extract_contents(&jsn), vec!["Howdy"]);
        assert_eq!(sse_head(&jsn), "event: content_block_delta\ndata: ");
    }

    #[test]
    fn test_non_text_events_have_no_slot() {
        for raw in [
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a\""}}"#,
        ] {
            let jsn = frame(raw);
            assert!(extract_contents(&jsn).is_empty(), "{raw}");
            assert!(!has_choice_index(&jsn, 0));
            assert_eq!(chunk_kind(&jsn), ChunkKind::Unknown);
        }
    }

    #[test]
    fn test_tool_use_detection() {
        assert!(has_function_call(&frame(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather","input":{}}}"#
        )));
        assert!(has_function_call(&frame(
            r#"{"id":"msg_1","type":"message","role":"assistant","content":[{"type":"text","text":"ok"},{"type":"tool_use","id":"t","name":"f","input":{}}]}"#
        )));
        assert!(!has_function_call(&frame(r#"{"type":"message_stop"}"#)));
    }

    #[test]
    fn test_system_prompt_is_a_webhook_message() {
        let mut body = json!({
            "model": "claude-3-5-sonnet-20241022",
            "system": "you are terse",
            "messages": [{"role": "user", "content": "call me at 555-0100"}]
        });
        let mut prompt = construct_request_webhook_request_body(&body);
        assert_eq!(prompt.messages.len(), 2);
        assert_eq!(prompt.messages[0], PromptMessage::new("system", "you are terse"));
        prompt.messages[1].content = "call me at <PHONE>".to_string();
        update_request_body_from_webhook(&mut body, &prompt).unwrap();
        assert_eq!(body["messages"][0]["content"], "call me at <PHONE>");
        assert_eq!(body["system"], "you are terse");
        assert!(all_req_content(&body).starts_with("role: system:\nyou are terse\n"));
    }

    #[test]
    fn test_system_counts_as_message() {
        let with_system = json!({"system": "hello world", "messages": [{"role": "user", "content": "hello world"}]});
        let without = json!({"messages": [{"role": "user", "content": "hello world"}]});
        assert_eq!(
            get_num_tokens_from_body(&with_system),
            get_num_tokens_from_body(&without) + TOKENS_PER_MESSAGE + count_text_tokens("system") + count_text_tokens("hello world")
        );
    }
}
