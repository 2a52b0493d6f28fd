//! Gemini `generateContent` / `streamGenerateContent`, shared by the Google
//! AI and Vertex AI endpoints.

use serde_json::{json, Value};
use smallvec::SmallVec;
use tracing::debug;

use super::openai::push_role_block;
use super::{choice_index, u64_at, warn_role_change, ProviderError, MAX_CHOICES};
use super::{PromptMessage, PromptMessages, ResponseChoice, ResponseChoices};
use super::{TokenDetails, Tokens};
use crate::headers::HeaderSnapshot;
use crate::observability::token_counter::{
    count_text_tokens, REPLY_PRIMING_TOKENS, TOKENS_PER_MESSAGE,
};
use crate::stream::ChunkKind;

pub(crate) const MODEL_HEADER: &str = "x-llm-model";
pub(crate) const STREAMING_HEADER: &str = "x-chat-streaming";

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

fn add_modalities(details: &mut TokenDetails, list: Option<&Value>) {
    let Some(list) = list.and_then(Value::as_array) else {
        return;
    };
    for entry in list {
        let count = u64_at(entry, "tokenCount");
        match entry.get("modality").and_then(Value::as_str) {
            Some("TEXT") => details.text += count,
            Some("AUDIO") => details.audio += count,
            Some("IMAGE") => details.image += count,
            Some("VIDEO") => details.video += count,
            Some("DOCUMENT") => details.document += count,
            _ => {}
        }
    }
}

pub(crate) fn tokens(jsn: &Value) -> Tokens {
    let Some(usage) = jsn.get("usageMetadata").filter(|u| u.is_object()) else {
        return Tokens::default();
    };
    let prompt_details = {
        let mut d = TokenDetails {
            cached: u64_at(usage, "cachedContentTokenCount"),
            tool_used: u64_at(usage, "toolUsePromptTokenCount"),
            ..TokenDetails::default()
        };
        add_modalities(&mut d, usage.get("promptTokensDetails"));
        (!d.is_zero()).then_some(d)
    };
    let completion_details = {
        let mut d = TokenDetails {
            reasoning: u64_at(usage, "thoughtsTokenCount"),
            ..TokenDetails::default()
        };
        add_modalities(&mut d, usage.get("candidatesTokensDetails"));
        (!d.is_zero()).then_some(d)
    };
    Tokens {
        prompt: u64_at(usage, "promptTokenCount"),
        completion: u64_at(usage, "candidatesTokenCount"),
        prompt_details,
        completion_details,
    }
}

pub(crate) fn create_usage_json(tokens: &Tokens) -> Value {
    let mut usage = json!({
        "promptTokenCount": tokens.prompt,
        "candidatesTokenCount": tokens.completion,
        "totalTokenCount": tokens.total(),
    });
    if let Some(d) = tokens.prompt_details {
        usage["cachedContentTokenCount"] = json!(d.cached);
    }
    if let Some(d) = tokens.completion_details {
        usage["thoughtsTokenCount"] = json!(d.reasoning);
    }
    usage
}

pub(crate) fn update_stream_resp_usage_token(jsn: &mut Value, tokens: &Tokens) {
    if let Some(obj) = jsn.as_object_mut() {
        obj.insert("usageMetadata".to_string(), create_usage_json(tokens));
    }
}

// ---------------------------------------------------------------------------
// Request metadata
// ---------------------------------------------------------------------------

/// `x-llm-model`, else the `models/<name>:` segment of the request path.
pub(crate) fn get_model_req(headers: &HeaderSnapshot) -> Option<String> {
    if let Some(model) = headers.get(MODEL_HEADER) {
        return Some(model.to_string());
    }
    let path = headers.path()?;
    let rest = &path[path.find("models/")? + "models/".len()..];
    let end = rest.find([':', '?', '/']).unwrap_or(rest.len());
    (end > 0).then(|| rest[..end].to_string())
}

pub(crate) fn is_streaming_req(headers: &HeaderSnapshot) -> bool {
    headers.contains(STREAMING_HEADER)
        || headers
            .path()
            .is_some_and(|p| p.contains(":streamGenerateContent"))
}

// ---------------------------------------------------------------------------
// Streaming frames
// ---------------------------------------------------------------------------

fn candidates(jsn: &Value) -> &[Value] {
    jsn.get("candidates")
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn text_parts(candidate: &Value) -> impl Iterator<Item = &str> {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map_or(&[][..], Vec::as_slice)
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
}

fn candidate_text(candidate: &Value) -> String {
    text_parts(candidate).collect()
}

pub(crate) fn extract_contents(jsn: &Value) -> Vec<String> {
    let mut contents: Vec<String> = Vec::new();
    for (pos, candidate) in candidates(jsn).iter().enumerate() {
        let idx = choice_index(candidate, pos);
        if idx >= MAX_CHOICES {
            debug!(index = idx, "ignoring out-of-range candidate index");
            continue;
        }
        if contents.len() <= idx {
            contents.resize(idx + 1, String::new());
        }
        contents[idx].push_str(&candidate_text(candidate));
    }
    contents
}

pub(crate) fn has_choice_index(jsn: &Value, k: usize) -> bool {
    candidates(jsn)
        .iter()
        .enumerate()
        .any(|(pos, c)| choice_index(c, pos) == k && text_parts(c).next().is_some())
}

/// Overwrite candidate `k`'s text: the first text part receives `text`, the
/// remaining text parts are emptied.
pub(crate) fn update_stream_resp_contents(jsn: &mut Value, k: usize, text: &str) {
    let Some(candidates) = jsn.get_mut("candidates").and_then(Value::as_array_mut) else {
        return;
    };
    let Some(candidate) = candidates
        .iter_mut()
        .enumerate()
        .find(|(pos, c)| choice_index(c, *pos) == k)
        .map(|(_, c)| c)
    else {
        debug!(candidate = k, "frame has no such candidate; content not written");
        return;
    };
    write_candidate_text(candidate, text);
}

fn write_candidate_text(candidate: &mut Value, text: &str) {
    let Some(parts) = candidate
        .pointer_mut("/content/parts")
        .and_then(Value::as_array_mut)
    else {
        if let Some(obj) = candidate.as_object_mut() {
            obj.insert(
                "content".to_string(),
                json!({"parts": [{"text": text}], "role": "model"}),
            );
        }
        return;
    };
    let mut written = false;
    for part in parts.iter_mut().filter(|p| p.get("text").is_some_and(Value::is_string)) {
        part["text"] = Value::String(if written { String::new() } else { text.to_string() });
        written = true;
    }
    if !written {
        parts.push(json!({ "text": text }));
    }
}

pub(crate) fn content_only_chunk(template: &Value, k: usize) -> Value {
    let mut out = template.clone();
    let mut candidate = candidates(template)
        .iter()
        .enumerate()
        .find(|(pos, c)| choice_index(c, *pos) == k)
        .map_or_else(|| json!({ "index": k }), |(_, c)| c.clone());
    if let Some(obj) = candidate.as_object_mut() {
        obj.remove("finishReason");
        obj.remove("safetyRatings");
        let role = obj
            .get("content")
            .and_then(|c| c.get("role"))
            .cloned()
            .unwrap_or_else(|| json!("model"));
        obj.insert(
            "content".to_string(),
            json!({"parts": [{"text": ""}], "role": role}),
        );
    }
    if let Some(obj) = out.as_object_mut() {
        obj.remove("usageMetadata");
        obj.insert("candidates".to_string(), Value::Array(vec![candidate]));
    }
    out
}

fn has_finish_reason(candidate: &Value) -> bool {
    candidate.get("finishReason").is_some_and(|f| !f.is_null())
}

pub(crate) fn chunk_kind(jsn: &Value) -> ChunkKind {
    let Some(candidate) = candidates(jsn).first() else {
        return if jsn.get("usageMetadata").is_some_and(Value::is_object) {
            ChunkKind::LastUsage
        } else {
            ChunkKind::Unknown
        };
    };
    let first_part = candidate.pointer("/content/parts/0");
    let text = first_part
        .and_then(|p| p.get("text"))
        .and_then(Value::as_str);
    if has_finish_reason(candidate) {
        return if text.is_some_and(|t| !t.is_empty()) {
            ChunkKind::Finish
        } else {
            ChunkKind::FinishNoContent
        };
    }
    let binary = first_part.is_some_and(|p| p.get("inline_data").is_some() || p.get("inlineData").is_some());
    if binary {
        ChunkKind::NormalBinary
    } else if text.is_some() {
        ChunkKind::NormalText
    } else {
        ChunkKind::Unknown
    }
}

pub(crate) fn has_function_call(jsn: &Value) -> bool {
    candidates(jsn).iter().any(|c| {
        c.pointer("/content/parts")
            .and_then(Value::as_array)
            .is_some_and(|parts| {
                parts
                    .iter()
                    .any(|p| p.get("functionCall").is_some() || p.get("function_call").is_some())
            })
    })
}

pub(crate) fn is_completed(jsn: &Value) -> bool {
    candidates(jsn)
        .iter()
        .any(|c| c.get("finishReason").and_then(Value::as_str) == Some("STOP"))
}

pub(crate) fn roles(jsn: &Value) -> Vec<(usize, String)> {
    candidates(jsn)
        .iter()
        .enumerate()
        .filter_map(|(pos, c)| {
            c.pointer("/content/role")
                .and_then(Value::as_str)
                .map(|role| (choice_index(c, pos), role.to_string()))
        })
        .collect()
}

pub(crate) fn finished_choices(jsn: &Value) -> SmallVec<[usize; 4]> {
    candidates(jsn)
        .iter()
        .enumerate()
        .filter(|(_, c)| has_finish_reason(c))
        .map(|(pos, c)| choice_index(c, pos))
        .collect()
}

// ---------------------------------------------------------------------------
// Whole bodies
// ---------------------------------------------------------------------------

fn contents(body: &Value) -> &[Value] {
    body.get("contents")
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn system_instruction(body: &Value) -> Option<&Value> {
    body.get("systemInstruction")
        .or_else(|| body.get("system_instruction"))
}

fn system_instruction_mut(body: &mut Value) -> Option<&mut Value> {
    let key = if body.get("systemInstruction").is_some() {
        "systemInstruction"
    } else {
        "system_instruction"
    };
    body.get_mut(key)
}

fn role_of(content: &Value, default: &str) -> String {
    content
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn rewrite_parts<E, F>(content: &mut Value, role: &str, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for part in parts {
        if let Some(Value::String(text)) = part.get_mut("text") {
            let updated = f(role, text)?;
            if updated != *text {
                *text = updated;
            }
        }
    }
    Ok(())
}

pub(crate) fn iterate_str_req_messages<E, F>(body: &mut Value, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    if let Some(system) = system_instruction_mut(body) {
        rewrite_parts(system, "system", f)?;
    }
    if let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) {
        for content in contents {
            let role = role_of(content, "user");
            rewrite_parts(content, &role, f)?;
        }
    }
    Ok(())
}

pub(crate) fn iterate_str_resp_messages<E, F>(body: &mut Value, f: &mut F) -> Result<(), E>
where
    F: FnMut(&str, &str) -> Result<String, E>,
{
    let Some(candidates) = body.get_mut("candidates").and_then(Value::as_array_mut) else {
        return Ok(());
    };
    for candidate in candidates {
        if let Some(content) = candidate.get_mut("content") {
            let role = role_of(content, "model");
            rewrite_parts(content, &role, f)?;
        }
    }
    Ok(())
}

fn parts_text(content: &Value) -> String {
    content
        .get("parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn get_num_tokens_from_body(body: &Value) -> u64 {
    let system = system_instruction(body).map_or(0, |s| {
        TOKENS_PER_MESSAGE + count_text_tokens(&parts_text(s))
    });
    let contents = contents(body);
    if contents.is_empty() && system == 0 {
        return 0;
    }
    let messages: u64 = contents
        .iter()
        .map(|c| {
            let role = c.get("role").and_then(Value::as_str).unwrap_or_default();
            TOKENS_PER_MESSAGE + count_text_tokens(role) + count_text_tokens(&parts_text(c))
        })
        .sum();
    system + messages + REPLY_PRIMING_TOKENS
}

pub(crate) fn all_req_content(body: &Value) -> String {
    let mut out = String::new();
    if let Some(system) = system_instruction(body) {
        push_role_block(&mut out, "system", &parts_text(system));
    }
    for content in contents(body) {
        push_role_block(&mut out, &role_of(content, "user"), &parts_text(content));
    }
    out
}

pub(crate) fn construct_request_webhook_request_body(body: &Value) -> PromptMessages {
    let mut messages = Vec::with_capacity(contents(body).len() + 1);
    if let Some(system) = system_instruction(body) {
        messages.push(PromptMessage::new("system", parts_text(system)));
    }
    messages.extend(
        contents(body)
            .iter()
            .map(|c| PromptMessage::new(role_of(c, "user"), parts_text(c))),
    );
    PromptMessages { messages }
}

fn write_parts_text(content: &mut Value, text: &str) {
    if parts_text(content) == text {
        return;
    }
    match content.get_mut("parts").and_then(Value::as_array_mut) {
        Some(parts) => {
            let mut written = false;
            for part in parts.iter_mut().filter(|p| p.get("text").is_some_and(Value::is_string)) {
                part["text"] = Value::String(if written { String::new() } else { text.to_string() });
                written = true;
            }
            if !written {
                parts.push(json!({ "text": text }));
            }
        }
        None => {
            if let Some(obj) = content.as_object_mut() {
                obj.insert("parts".to_string(), json!([{ "text": text }]));
            }
        }
    }
}

pub(crate) fn update_request_body_from_webhook(
    body: &mut Value,
    modified: &PromptMessages,
) -> Result<(), ProviderError> {
    let has_system = system_instruction(body).is_some();
    let expected = contents(body).len() + usize::from(has_system);
    if expected != modified.messages.len() {
        return Err(ProviderError::LengthMismatch {
            expected,
            got: modified.messages.len(),
        });
    }
    let mut incoming = modified.messages.iter();
    if has_system {
        if let (Some(system), Some(new)) = (system_instruction_mut(body), incoming.next()) {
            warn_role_change("system", &new.role);
            write_parts_text(system, &new.content);
        }
    }
    let contents = body
        .get_mut("contents")
        .and_then(Value::as_array_mut)
        .ok_or(ProviderError::MissingField("contents"))?;
    for (content, new) in contents.iter_mut().zip(incoming) {
        warn_role_change(&role_of(content, "user"), &new.role);
        write_parts_text(content, &new.content);
    }
    Ok(())
}

pub(crate) fn construct_response_webhook_request_body(body: &Value) -> ResponseChoices {
    let choices = candidates(body)
        .iter()
        .map(|c| {
            let content = c.get("content").unwrap_or(&Value::Null);
            ResponseChoice::new(role_of(content, "model"), candidate_text(c))
        })
        .collect();
    ResponseChoices { choices }
}

pub(crate) fn update_response_body_from_webhook(
    body: &mut Value,
    modified: &ResponseChoices,
) -> Result<(), ProviderError> {
    let candidates = body
        .get_mut("candidates")
        .and_then(Value::as_array_mut)
        .ok_or(ProviderError::MissingField("candidates"))?;
    if candidates.len() != modified.choices.len() {
        return Err(ProviderError::LengthMismatch {
            expected: candidates.len(),
            got: modified.choices.len(),
        });
    }
    for (candidate, new) in candidates.iter_mut().zip(&modified.choices) {
        let role = candidate
            .get("content")
            .map_or_else(|| "model".to_string(), |c| role_of(c, "model"));
        warn_role_change(&role, &new.message.role);
        if candidate_text(candidate) != new.message.content {
            write_candidate_text(candidate, &new.message.content);
        }
    }
    Ok(())
}
