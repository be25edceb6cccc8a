//! Pre-parse input normalization.
//!
//! Models emit three non-standard patch encodings often enough to tolerate:
//! a bespoke `*** Begin Patch / *** Add File:` block format, `/dev/null`
//! new-file diffs whose hunk count does not match the body, and structured
//! JSON payloads wrapping the diff text. Everything is converted to standard
//! unified-diff text; anything unrecognized fails closed with
//! [`PatchError::UnsupportedPatchFormat`] — content is never silently
//! dropped.

use crate::{PatchError, parse_hunk_header};

/// Convert tolerated dialects to standard unified-diff text.
pub fn normalize(input: &str) -> Result<String, PatchError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(PatchError::UnsupportedPatchFormat(
            "empty patch input".to_string(),
        ));
    }
    if trimmed.starts_with('{') {
        return unwrap_structured(trimmed);
    }
    if trimmed.lines().any(|l| l.trim() == "*** Begin Patch") {
        return convert_add_file_blocks(trimmed);
    }
    if trimmed.contains("--- ") && trimmed.contains("+++ ") {
        return Ok(repair_new_file_counts(trimmed));
    }
    Err(PatchError::UnsupportedPatchFormat(
        "input is neither a unified diff nor a known dialect".to_string(),
    ))
}

/// Unwrap `{"patch": "..."}` and `{"cmd": [..., "apply_patch", ...]}`
/// payloads to the raw diff text they carry.
fn unwrap_structured(raw: &str) -> Result<String, PatchError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        PatchError::UnsupportedPatchFormat(format!("structured payload is not valid JSON: {e}"))
    })?;

    if let Some(patch) = value.get("patch").and_then(|v| v.as_str()) {
        return normalize(patch);
    }

    if let Some(cmd) = value.get("cmd").and_then(|v| v.as_array()) {
        let mut saw_apply = false;
        let mut fallback: Option<&str> = None;
        for item in cmd {
            let Some(text) = item.as_str() else { continue };
            if saw_apply {
                if looks_like_patch_body(text) {
                    return normalize(text);
                }
                if fallback.is_none() {
                    fallback = Some(text);
                }
            }
            if text == "apply_patch" {
                saw_apply = true;
            }
        }
        if let Some(text) = fallback {
            return normalize(text);
        }
    }

    Err(PatchError::UnsupportedPatchFormat(
        "structured payload carries no patch content".to_string(),
    ))
}

fn looks_like_patch_body(text: &str) -> bool {
    text.contains("*** Begin Patch")
        || (text.contains("--- ") && text.contains("+++ "))
        || text.contains("@@")
}

/// Convert `*** Begin Patch / *** Add File: path` blocks into synthetic
/// `/dev/null → path` unified diffs. Only file additions are expressible in
/// this dialect here; update/delete sections fail closed.
fn convert_add_file_blocks(input: &str) -> Result<String, PatchError> {
    let mut out = String::new();
    let mut lines = input.lines().peekable();

    // Skip anything before the begin marker (models sometimes preface it).
    for line in lines.by_ref() {
        if line.trim() == "*** Begin Patch" {
            break;
        }
    }

    let mut file_count = 0usize;
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed == "*** End Patch" {
            break;
        }
        if trimmed.is_empty() {
            continue;
        }
        let Some(path) = trimmed.strip_prefix("*** Add File: ") else {
            return Err(PatchError::UnsupportedPatchFormat(format!(
                "unsupported patch block section: {trimmed:?}"
            )));
        };
        let path = path.trim();
        if path.is_empty() {
            return Err(PatchError::UnsupportedPatchFormat(
                "Add File section with empty path".to_string(),
            ));
        }

        let mut added: Vec<String> = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim_start().starts_with("*** ") {
                break;
            }
            let body = lines.next().unwrap_or_default();
            if let Some(text) = body.strip_prefix('+') {
                added.push(text.to_string());
            } else if body.trim().is_empty() {
                added.push(String::new());
            } else {
                return Err(PatchError::UnsupportedPatchFormat(format!(
                    "Add File body line without `+` prefix: {body:?}"
                )));
            }
        }

        out.push_str(&format!("--- /dev/null\n+++ b/{path}\n"));
        if added.is_empty() {
            out.push_str("@@ -0,0 +0,0 @@\n");
        } else {
            out.push_str(&format!("@@ -0,0 +1,{} @@\n", added.len()));
            for text in &added {
                out.push_str(&format!("+{text}\n"));
            }
        }
        file_count += 1;
    }

    if file_count == 0 {
        return Err(PatchError::UnsupportedPatchFormat(
            "patch block contains no Add File sections".to_string(),
        ));
    }
    Ok(out)
}

/// Recompute the hunk header of `/dev/null` new-file sections from the
/// addition-line count, inserting a header when it is missing entirely.
fn repair_new_file_counts(diff: &str) -> String {
    let lines: Vec<&str> = diff.lines().collect();
    let mut out: Vec<String> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let is_new_file_header = line.starts_with("--- /dev/null")
            && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ "));
        if !is_new_file_header {
            out.push(line.to_string());
            i += 1;
            continue;
        }

        out.push(line.to_string());
        out.push(lines[i + 1].to_string());
        i += 2;

        let (existing_header, body_start) = match lines.get(i) {
            Some(l) if l.starts_with("@@") => (Some(*l), i + 1),
            _ => (None, i),
        };

        let mut end = body_start;
        while end < lines.len() && lines[end].starts_with('+') && !lines[end].starts_with("+++ ") {
            end += 1;
        }
        let adds = end - body_start;

        let recomputed = if adds == 0 {
            "@@ -0,0 +0,0 @@".to_string()
        } else {
            format!("@@ -0,0 +1,{adds} @@")
        };
        match existing_header {
            Some(header) => {
                let counts_ok = parse_hunk_header(header)
                    .is_some_and(|(os, oc, _ns, nc)| os == 0 && oc == 0 && nc == adds);
                out.push(if counts_ok {
                    header.to_string()
                } else {
                    recomputed
                });
            }
            None => out.push(recomputed),
        }
        for body_line in &lines[body_start..end] {
            out.push((*body_line).to_string());
        }
        i = end;
    }

    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}
