//! Fallback tool-call extraction.
//!
//! Models sometimes emit tool calls as literal text instead of structured
//! function calls. Before concluding "no tools", the orchestrator runs these
//! extraction strategies in order:
//!
//! 1. textual invoke markup (`<invoke name="...">` with `<parameter>` tags)
//! 2. bare JSON objects describing a call (`{"name": ..., "arguments": ...}`)
//!    or carrying a `patch` field
//! 3. heredoc-wrapped patches (`<<'EOF' ... EOF`)
//! 4. fenced ```diff blocks and `*** Begin Patch` blocks
//! 5. raw unified-diff text in the response body
//!
//! There is also a best-effort repair for the "claimed file creation" case:
//! the model says it wrote a file and shows the content, but produced no
//! patch. A minimal creation patch is synthesized from the inferred filename
//! and the fenced code block. This is deliberate best-effort repair, not a
//! correctness guarantee.

use patchpilot_core::{LlmToolCall, ToolName};
use regex::Regex;
use std::sync::OnceLock;

fn invoke_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<invoke\s+name="([A-Za-z0-9_]+)"\s*>(.*?)</invoke>"#)
            .expect("valid regex")
    })
}

fn parameter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<parameter\s+name="([A-Za-z0-9_]+)"\s*>(.*?)</parameter>"#)
            .expect("valid regex")
    })
}

fn fenced_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```([A-Za-z0-9_-]*)\n(.*?)```").expect("valid regex"))
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\w./-]*\w\.[A-Za-z0-9]{1,6}\b").expect("valid regex"))
}

/// Extract tool calls from literal response text. Strategies run in order;
/// the first one that yields calls wins.
pub fn extract_tool_calls(text: &str) -> Vec<LlmToolCall> {
    let from_markup = extract_invoke_markup(text);
    if !from_markup.is_empty() {
        return from_markup;
    }
    if let Some(call) = extract_json_call(text) {
        return vec![call];
    }
    if let Some(patch) = extract_heredoc_patch(text)
        .or_else(|| extract_fenced_patch(text))
        .or_else(|| extract_begin_patch_block(text))
        .or_else(|| extract_raw_diff(text))
    {
        return vec![apply_patch_call(&patch, 1)];
    }
    Vec::new()
}

fn extract_invoke_markup(text: &str) -> Vec<LlmToolCall> {
    let mut calls = Vec::new();
    for (idx, captures) in invoke_block_re().captures_iter(text).enumerate() {
        let name = captures[1].to_string();
        if ToolName::from_api_name(&name).is_none() {
            continue;
        }
        let body = &captures[2];
        let mut args = serde_json::Map::new();
        for param in parameter_re().captures_iter(body) {
            let key = param[1].to_string();
            let raw = param[2].trim().to_string();
            // Keep scalars typed when they parse; everything else stays text.
            let value = match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => v,
                _ => serde_json::Value::String(raw),
            };
            args.insert(key, value);
        }
        calls.push(LlmToolCall {
            id: format!("extracted_{}", idx + 1),
            name,
            arguments: serde_json::Value::Object(args).to_string(),
        });
    }
    calls
}

/// A bare JSON object (whole response or fenced) describing a call, or a
/// `{"patch": ...}` payload.
fn extract_json_call(text: &str) -> Option<LlmToolCall> {
    let mut candidates: Vec<String> = Vec::new();
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        candidates.push(trimmed.to_string());
    }
    for captures in fenced_block_re().captures_iter(text) {
        let body = captures[2].trim();
        if body.starts_with('{') {
            candidates.push(body.to_string());
        }
    }

    for candidate in candidates {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate) else {
            continue;
        };
        let name = value
            .get("name")
            .or_else(|| value.get("tool"))
            .and_then(|v| v.as_str());
        if let Some(name) = name
            && ToolName::from_api_name(name).is_some()
        {
            let args = value
                .get("arguments")
                .or_else(|| value.get("input"))
                .or_else(|| value.get("args"))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({}));
            return Some(LlmToolCall {
                id: "extracted_1".to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            });
        }
        if let Some(patch) = value.get("patch").and_then(|v| v.as_str()) {
            return Some(apply_patch_call(patch, 1));
        }
    }
    None
}

fn extract_heredoc_patch(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let Some(pos) = line.find("<<") else { continue };
        let tag = line[pos + 2..]
            .trim()
            .trim_start_matches('-')
            .trim()
            .trim_matches('\'')
            .trim_matches('"');
        let is_marker = !tag.is_empty()
            && tag
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !is_marker {
            continue;
        }
        if let Some(end) = lines[i + 1..].iter().position(|l| l.trim() == tag) {
            let body = lines[i + 1..i + 1 + end].join("\n");
            if looks_like_diff(&body) {
                return Some(body);
            }
        }
    }
    None
}

fn extract_fenced_patch(text: &str) -> Option<String> {
    for captures in fenced_block_re().captures_iter(text) {
        let tag = captures[1].to_lowercase();
        let body = &captures[2];
        if tag == "diff" || tag == "patch" || (tag.is_empty() && looks_like_diff(body)) {
            if looks_like_diff(body) || body.contains("*** Begin Patch") {
                return Some(body.to_string());
            }
        }
    }
    None
}

fn extract_begin_patch_block(text: &str) -> Option<String> {
    let start = text.find("*** Begin Patch")?;
    let rest = &text[start..];
    let end = rest
        .find("*** End Patch")
        .map(|i| i + "*** End Patch".len())
        .unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// Raw unified-diff text embedded in prose: slice from the first `--- `
/// header (with a matching `+++ ` right after) to the end of the diff body.
fn extract_raw_diff(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.iter().enumerate().find_map(|(i, line)| {
        if line.starts_with("--- ") && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ ")) {
            Some(i)
        } else {
            None
        }
    })?;

    let mut end = lines.len();
    for (offset, line) in lines[start..].iter().enumerate() {
        let is_diff_line = line.starts_with("--- ")
            || line.starts_with("+++ ")
            || line.starts_with("@@")
            || line.starts_with('+')
            || line.starts_with('-')
            || line.starts_with(' ')
            || line.starts_with('\\')
            || line.is_empty();
        if !is_diff_line {
            end = start + offset;
            break;
        }
    }
    if end <= start + 2 {
        return None;
    }
    Some(lines[start..end].join("\n") + "\n")
}

fn looks_like_diff(text: &str) -> bool {
    text.contains("--- ") && text.contains("+++ ") && text.contains("@@")
}

fn apply_patch_call(patch: &str, index: usize) -> LlmToolCall {
    LlmToolCall {
        id: format!("extracted_{index}"),
        name: "apply_patch".to_string(),
        arguments: serde_json::json!({ "patch": patch }).to_string(),
    }
}

const CREATION_CLAIM_MARKERS: &[&str] = &[
    "i've created",
    "i have created",
    "created the file",
    "i've written",
    "i have written",
    "written to",
    "saved to",
    "i've added the file",
    "the file now contains",
];

const CREATION_REQUEST_MARKERS: &[&str] = &["create", "write", "make", "add", "generate", "new"];

/// Best-effort repair: when the model claims it created/wrote a file (and
/// the user asked for one) but produced no patch, synthesize a minimal
/// `/dev/null` creation patch from the inferred filename and the fenced
/// code block.
pub fn synthesize_creation_patch(text: &str, last_user_message: &str) -> Option<LlmToolCall> {
    let lower = text.to_lowercase();
    let user_lower = last_user_message.to_lowercase();

    if looks_like_diff(text) || text.contains("*** Begin Patch") {
        return None;
    }
    if !CREATION_CLAIM_MARKERS.iter().any(|m| lower.contains(m)) {
        return None;
    }
    let user_wants_file = user_lower.contains("file")
        && CREATION_REQUEST_MARKERS.iter().any(|m| user_lower.contains(m));
    if !user_wants_file {
        return None;
    }

    let content = fenced_block_re()
        .captures_iter(text)
        .map(|c| c[2].to_string())
        .next()?;
    let filename = filename_re()
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|f| !f.starts_with('.'))
        .or_else(|| {
            filename_re()
                .find_iter(last_user_message)
                .map(|m| m.as_str())
                .find(|f| !f.starts_with('.'))
        })?
        .to_string();

    let body: Vec<&str> = content.lines().collect();
    if body.is_empty() {
        return None;
    }
    let mut patch = format!("--- /dev/null\n+++ b/{filename}\n@@ -0,0 +1,{} @@\n", body.len());
    for line in &body {
        patch.push('+');
        patch.push_str(line);
        patch.push('\n');
    }
    Some(apply_patch_call(&patch, 1))
}

/// Literal tool markup the model should have sent as a structured call.
pub fn looks_like_literal_tool_markup(text: &str) -> bool {
    text.contains("<invoke") || text.contains("<tool_call") || text.contains("<function_call")
}

/// The model is talking about a patch without actually providing one.
pub fn mentions_patch_without_content(text: &str) -> bool {
    let lower = text.to_lowercase();
    let mentions = lower.contains("patch") || lower.contains("unified diff");
    mentions && !looks_like_diff(text) && !text.contains("```") && !text.contains("*** Begin Patch")
}
