//! OpenAI-compatible chat completions (`/v1/chat/completions`).

use serde_json::{json, Map, Value};
use smallvec::SmallVec;
use tracing::debug;

use super::parts;
use super::{choice_index, u64_at, warn_role_change, ProviderError, MAX_CHOICES};
use super::{PromptMessage, PromptMessages, ResponseChoice, ResponseChoices};
use super::{TokenDetails, Tokens};
use crate::observability::token_counter::{
    count_text_tokens, REPLY_PRIMING_TOKENS, TOKENS_PER_MESSAGE, TOKENS_PER_NAME,
};
use crate::stream::ChunkKind;

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

pub(crate) fn usage_tokens(usage: &Value) -> Tokens {
    let prompt_details = usage
        .get("prompt_tokens_details")
        .filter(|d| d.is_object())
        .map(|d| TokenDetails {
            text: u64_at(d, "text_tokens"),
            audio: u64_at(d, "audio_tokens"),
            image: u64_at(d, "image_tokens"),
            cached: u64_at(d, "cached_tokens"),
            ..TokenDetails::default()
        });
    let completion_details = usage
        .get("completion_tokens_details")
        .filter(|d| d.is_object())
        .map(|d| TokenDetails {
            text: u64_at(d, "text_tokens"),
            audio: u64_at(d, "audio_tokens"),
            reasoning: u64_at(d, "reasoning_tokens"),
            accepted_prediction: u64_at(d, "accepted_prediction_tokens"),
            rejected_prediction: u64_at(d, "rejected_prediction_tokens"),
            ..TokenDetails::default()
        });
    Tokens {
        prompt: u64_at(usage, "prompt_tokens"),
        completion: u64_at(usage, "completion_tokens"),
        prompt_details,
        completion_details,
    }
}

pub(crate) fn tokens(jsn: &Value) -> Tokens {
    match jsn.get("usage") {
        Some(usage) if usage.is_object() => usage_tokens(usage),
        _ => Tokens::default(),
    }
}

pub(crate) fn create_usage_json(tokens: &Tokens) -> Value {
    let mut usage = json!({
        "prompt_tokens": tokens.prompt,
        "completion_tokens": tokens.completion,
        "total_tokens": tokens.total(),
    });
    if let Some(d) = tokens.prompt_details {
        usage["prompt_tokens_details"] = json!({
            "cached_tokens": d.cached,
            "audio_tokens": d.audio,
        });
    }
    if let Some(d) = tokens.completion_details {
        usage["completion_tokens_details"] = json!({
            "reasoning_tokens": d.reasoning,
            "audio_tokens": d.audio,
            "accepted_prediction_tokens": d.accepted_prediction,
            "rejected_prediction_tokens": d.rejected_prediction,
        });
    }
    usage
}

pub(crate) fn update_stream_resp_usage_token(jsn: &mut Value, tokens: &Tokens) {
    if let Some(obj) = jsn.as_object_mut() {
        obj.insert("usage".to_string(), create_usage_json(tokens));
    }
}

// ---------------------------------------------------------------------------
// Streaming frames
// ---------------------------------------------------------------------------

fn choices(jsn: &Value) -> &[Value] {
    jsn.get("choices")
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn choice_mut(jsn: &mut Value, k: usize) -> Option<&mut Value> {
    jsn.get_mut("choices")
        .and_then(Value::as_array_mut)?
        .iter_mut()
        .enumerate()
        .find(|(pos, c)| choice_index(c, *pos) == k)
        .map(|(_, c)| c)
}

fn has_finish_reason(choice: &Value) -> bool {
    choice.get("finish_reason").is_some_and(|f| !f.is_null())
}

pub(crate) fn extract_contents(jsn: &Value) -> Vec<String> {
    let mut contents: Vec<String> = Vec::new();
    for (pos, choice) in choices(jsn).iter().enumerate() {
        let idx = choice_index(choice, pos);
        if idx >= MAX_CHOICES {
            debug!(index = idx, "ignoring out-of-range choice index");
            continue;
        }
        if contents.len() <= idx {
            contents.resize(idx + 1, String::new());
        }
        if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
            contents[idx].push_str(text);
        }
    }
    contents
}

pub(crate) fn has_choice_index(jsn: &Value, k: usize) -> bool {
    choices(jsn)
        .iter()
        .enumerate()
        .any(|(pos, c)| choice_index(c, pos) == k && c.get("delta").is_some_and(Value::is_object))
}

pub(crate) fn update_stream_resp_contents(jsn: &mut Value, k: usize, text: &str) {
    let Some(choice) = choice_mut(jsn, k) else {
        debug!(choice = k, "frame has no such choice; content not written");
        return;
    };
    let Some(obj) = choice.as_object_mut() else {
        return;
    };
    let delta = obj
        .entry("delta")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(delta) = delta.as_object_mut() {
        delta.insert("content".to_string(), Value::String(text.to_string()));
    }
}

/// A copy of `template` reduced to an empty text delta for choice `k`.
pub(crate) fn content_only_chunk(template: &Value, k: usize) -> Value {
    let mut out = template.clone();
    let mut choice = choices(template)
        .iter()
        .enumerate()
        .find(|(pos, c)| choice_index(c, *pos) == k)
        .map_or_else(|| json!({ "index": k }), |(_, c)| c.clone());
    if let Some(obj) = choice.as_object_mut() {
        obj.insert("delta".to_string(), json!({ "content": "" }));
        if obj.contains_key("finish_reason") {
            obj.insert("finish_reason".to_string(), Value::Null);
        }
        if obj.contains_key("logprobs") {
            obj.insert("logprobs".to_string(), Value::Null);
        }
    }
    if let Some(obj) = out.as_object_mut() {
        obj.remove("usage");
        obj.insert("choices".to_string(), Value::Array(vec![choice]));
    }
    out
}

pub(crate) fn chunk_kind(jsn: &Value) -> ChunkKind {
    let Some(choice) = choices(jsn).first() else {
        return if jsn.get("usage").is_some_and(Value::is_object) {
            ChunkKind::LastUsage
        } else {
            ChunkKind::Unknown
        };
    };
    let delta = choice.get("delta");
    let content = delta
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str);
    if has_finish_reason(choice) {
        return if content.is_some_and(|c| !c.is_empty()) {
            ChunkKind::Finish
        } else {
            ChunkKind::FinishNoContent
        };
    }
    if content.is_some() {
        ChunkKind::NormalText
    } else if delta
        .and_then(|d| d.get("audio"))
        .is_some_and(|a| !a.is_null())
    {
        ChunkKind::NormalBinary
    } else {
        ChunkKind::Unknown
    }
}

pub(crate) fn has_function_call(jsn: &Value) -> bool {
    choices(jsn).iter().any(|choice| {
        let finish = choice.get("finish_reason").and_then(Value::as_str);
        if matches!(finish, Some("tool_calls" | "function_call")) {
            return true;
        }
        let signal = |v: Option<&Value>| v.is_some_and(|v| !v.is_null());
        let delta = choice.get("delta");
        let message = choice.get("message");
        signal(delta.and_then(|d| d.get("tool_calls")))
            || signal(delta.and_then(|d| d.get("function_call")))
            || message
                .and_then(|m| m.get("tool_calls"))
                .and_then(Value::as_array)
                .is_some_and(|calls| !calls.is_empty())
    })
}

pub(crate) fn roles(jsn: &Value) -> Vec<(usize, String)> {
    choices(jsn)
        .iter()
        .enumerate()
        .filter_map(|(pos, c)| {
            c.pointer("/delta/role")
                .and_then(Value::as_str)
                .map(|role| (choice_index(c, pos), role.to_string()))
        })
        .collect()
}

pub(crate) fn finished_choices(jsn: &Value) -> SmallVec<[usize; 4]> {
    choices(jsn)
        .iter()
        .enumerate()
        .filter(|(_, c)| has_finish_reason(c))
        .map(|(pos, c)| choice_index(c, pos))
        .collect()
}

// ---------------------------------------------------------------------------
// Whole bodies
// ---------------------------------------------------------------------------

fn role_of(message: &Value, default: &str) -> String {
    message
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

pub(crate) fn iterate_str_req_messages<E, F>(body: &mut Value, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for message in messages {
        let role = role_of(message, "user");
        if let Some(content) = message.get_mut("content") {
            parts::rewrite_texts(content, &role, f)?;
        }
    }
    Ok(())
}

pub(crate) fn iterate_str_resp_messages<E, F>(body: &mut Value, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    let Some(choices) = body.get_mut("choices").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for choice in choices {
        let Some(message) = choice.get_mut("message") else {
            continue;
        };
        let role = role_of(message, "assistant");
        if let Some(content) = message.get_mut("content") {
            parts::rewrite_texts(content, &role, f)?;
        }
    }
    Ok(())
}

/// Token estimate for one chat message object (name overhead included).
pub(crate) fn message_tokens(message: &Value) -> u64 {
    let Some(obj) = message.as_object() else {
        return 0;
    };
    let mut total = TOKENS_PER_MESSAGE;
    for (key, value) in obj {
        match value {
            Value::String(s) => total += count_text_tokens(s),
            Value::Array(_) if key == "content" => total += parts::content_tokens(value),
            _ => {}
        }
        if key == "name" {
            total += TOKENS_PER_NAME;
        }
    }
    total
}

pub(crate) fn get_num_tokens_from_body(body: &Value) -> u64 {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return 0;
    };
    messages.iter().map(message_tokens).sum::<u64>() + REPLY_PRIMING_TOKENS
}

pub(crate) fn push_role_block(out: &mut String, role: &str, text: &str) {
    out.push_str("role: ");
    out.push_str(role);
    out.push_str(":\n");
    out.push_str(text);
    out.push('\n');
}

pub(crate) fn all_req_content(body: &Value) -> String {
    let mut out = String::new();
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            let text = message.get("content").map(parts::text_of).unwrap_or_default();
            push_role_block(&mut out, &role_of(message, "user"), &text);
        }
    }
    out
}

pub(crate) fn construct_request_webhook_request_body(body: &Value) -> PromptMessages {
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .map(|m| {
                    let text = m.get("content").map(parts::text_of).unwrap_or_default();
                    PromptMessage::new(role_of(m, "user"), text)
                })
                .collect()
        })
        .unwrap_or_default();
    PromptMessages { messages }
}

/// Write `text` into a message's `content`, leaving it untouched when equal.
pub(crate) fn write_message_content(message: &mut Value, text: &str) {
    match message.get_mut("content") {
        Some(content) => {
            if parts::text_of(content) != text {
                parts::replace_text(content, text);
            }
        }
        None if !text.is_empty() => {
            if let Some(obj) = message.as_object_mut() {
                obj.insert("content".to_string(), Value::String(text.to_string()));
            }
        }
        None => {}
    }
}

pub(crate) fn update_request_body_from_webhook(
    body: &mut Value,
    modified: &PromptMessages,
) -> Result<(), ProviderError> {
    let messages = body
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .ok_or(ProviderError::MissingField("messages"))?;
    if messages.len() != modified.messages.len() {
        return Err(ProviderError::LengthMismatch {
            expected: messages.len(),
            got: modified.messages.len(),
        });
    }
    for (message, new) in messages.iter_mut().zip(&modified.messages) {
        warn_role_change(&role_of(message, "user"), &new.role);
        write_message_content(message, &new.content);
    }
    Ok(())
}

pub(crate) fn construct_response_webhook_request_body(body: &Value) -> ResponseChoices {
    let choices = choices(body)
        .iter()
        .map(|c| {
            let message = c.get("message").unwrap_or(&Value::Null);
            let text = message.get("content").map(parts::text_of).unwrap_or_default();
            ResponseChoice::new(role_of(message, "assistant"), text)
        })
        .collect();
    ResponseChoices { choices }
}

pub(crate) fn update_response_body_from_webhook(
    body: &mut Value,
    modified: &ResponseChoices,
) -> Result<(), ProviderError> {
    let choices = body
        .get_mut("choices")
        .and_then(Value::as_array_mut)
        .ok_or(ProviderError::MissingField("choices"))?;
    if choices.len() != modified.choices.len() {
        return Err(ProviderError::LengthMismatch {
            expected: choices.len(),
            got: modified.choices.len(),
        });
    }
    for (choice, new) in choices.iter_mut().zip(&modified.choices) {
        let Some(message) = choice.get_mut("message") else {
            continue;
        };
        warn_role_change(&role_of(message, "assistant"), &new.message.role);
        write_message_content(message, &new.message.content);
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
    fn test_extract_contents_by_choice_index() {
        let jsn = frame(r#"{"choices":[{"index":2,"delta":{"content":"hi"}}]}"#);
        assert_eq!(extract_contents(&jsn), vec!["", "", "hi"]);
        assert!(has_choice_index(&jsn, 2));
        assert!(!has_choice_index(&jsn, 0));
    }

    #[test]
    fn test_chunk_kinds() {
        let cases = [
            (r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#, ChunkKind::NormalText),
            (r#"{"choices":[{"index":0,"delta":{"audio":{"data":"AAA"}}}]}"#, ChunkKind::NormalBinary),
            (r#"{"choices":[{"index":0,"delta":{"content":"x"},"finish_reason":"stop"}]}"#, ChunkKind::Finish),
            (r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#, ChunkKind::FinishNoContent),
            (r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":2}}"#, ChunkKind::LastUsage),
            (r#"{"choices":[{"index":0,"delta":{"tool_calls":[]}}]}"#, ChunkKind::Unknown),
            (r#"{"object":"something.else"}"#, ChunkKind::Unknown),
        ];
        for (raw, kind) in cases {
            assert_eq!(chunk_kind(&frame(raw)), kind, "{raw}");
        }
    }

    #[test]
    fn test_update_contents_preserves_other_fields() {
        let mut jsn = frame(
            r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"a"},"logprobs":null,"finish_reason":null}],"created":7}"#,
        );
        update_stream_resp_contents(&mut jsn, 0, "b");
        assert_eq!(
            serde_json::to_string(&jsn).unwrap(),
            r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"b"},"logprobs":null,"finish_reason":null}],"created":7}"#
        );
    }

    #[test]
    fn test_content_only_chunk_drops_finish_and_usage() {
        let template = frame(
            r#"{"id":"c1","choices":[{"index":1,"delta":{"content":"x"},"finish_reason":"stop"}],"usage":{"prompt_tokens":1}}"#,
        );
        let out = content_only_chunk(&template, 1);
        assert_eq!(
            out,
            json!({"id":"c1","choices":[{"index":1,"delta":{"content":""},"finish_reason":null}]})
        );
    }

    #[test]
    fn test_function_call_detection() {
        assert!(has_function_call(&frame(
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1"}]}}]}"#
        )));
        assert!(has_function_call(&frame(
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#
        )));
        assert!(!has_function_call(&frame(
            r#"{"choices":[{"index":0,"delta":{"content":"hi","tool_calls":null}}]}"#
        )));
    }

    #[test]
    fn test_usage_with_details() {
        let jsn = frame(
            r#"{"usage":{"prompt_tokens":23,"completion_tokens":408,"prompt_tokens_details":{"cached_tokens":4},"completion_tokens_details":{"reasoning_tokens":10}}}"#,
        );
        let t = tokens(&jsn);
        assert_eq!((t.prompt, t.completion), (23, 408));
        assert_eq!(t.prompt_details.map(|d| d.cached), Some(4));
        assert_eq!(t.completion_details.map(|d| d.reasoning), Some(10));
        let usage = create_usage_json(&t);
        assert_eq!(usage["total_tokens"], 431);
        assert_eq!(tokens(&json!({ "usage": usage })), t);
    }

    #[test]
    fn test_webhook_round_trip_and_length_mismatch() {
        let mut body = json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "my ssn is 123"}]}
            ]
        });
        let mut prompt = construct_request_webhook_request_body(&body);
        assert_eq!(prompt.messages[1], PromptMessage::new("user", "my ssn is 123"));

        prompt.messages[1].content = "my ssn is <SSN>".to_string();
        update_request_body_from_webhook(&mut body, &prompt).unwrap();
        assert_eq!(body["messages"][1]["content"][0]["text"], "my ssn is <SSN>");
        assert_eq!(body["messages"][0]["content"], "be brief");

        prompt.messages.pop();
        let err = update_request_body_from_webhook(&mut body, &prompt).unwrap_err();
        assert!(matches!(err, ProviderError::LengthMismatch { expected: 2, got: 1 }));
        assert_eq!(body["messages"][1]["content"][0]["text"], "my ssn is <SSN>");
    }

    #[test]
    fn test_all_req_content() {
        let body = json!({"messages": [
            {"role": "system", "content": "s"},
            {"role": "user", "content": "u"}
        ]});
        assert_eq!(all_req_content(&body), "role: system:\ns\nrole: user:\nu\n");
    }
}
