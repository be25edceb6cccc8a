//! Pre-execution validation for tool call arguments.
//!
//! Catches malformed arguments before executing the tool, so the model gets
//! a clear error message to self-correct without wasting an execution cycle.

use serde_json::Value;

/// Validate tool arguments before execution.
///
/// Returns `Err(message)` with a model-readable error for malformed inputs.
pub fn validate_tool_args(tool_name: &str, args: &Value) -> Result<(), String> {
    match tool_name {
        "read_file" => {
            require_path(args)?;
            validate_line_range(args)
        }
        "list_files" => Ok(()),
        "read_terminal" => Ok(()),
        "write_to_terminal" => {
            require_string(args, "command", "command string is required")?;
            if let Some(timeout) = args.get("timeout_seconds").and_then(|v| v.as_i64()) {
                if timeout <= 0 {
                    return Err("timeout_seconds must be a positive number".to_string());
                }
                if timeout > 600 {
                    return Err(
                        "timeout_seconds cannot exceed 600 — break the task into smaller steps"
                            .to_string(),
                    );
                }
            }
            Ok(())
        }
        "workspace_search" => require_string(args, "pattern", "regex pattern is required"),
        "apply_patch" => {
            if args
                .get("patch")
                .and_then(|v| v.as_str())
                .is_none_or(str::is_empty)
            {
                return Err(
                    "'patch' field is required and must contain the full unified diff".to_string(),
                );
            }
            Ok(())
        }
        "lsp_query" => require_string(args, "query", "query kind is required"),
        "editor_context" | "task_complete" => Ok(()),
        _ => Ok(()), // Unknown tools pass through; the host reports them.
    }
}

fn require_string(args: &Value, field: &str, msg: &str) -> Result<(), String> {
    match args.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(()),
        Some(Value::String(_)) => Err(format!("{field}: {msg} (got empty string)")),
        Some(v) => Err(format!(
            "{field}: expected string, got {}",
            v.to_string().chars().take(50).collect::<String>()
        )),
        None => Err(format!("{field}: {msg}")),
    }
}

/// Models may use either `path` or `file_path` depending on schema version.
fn require_path(args: &Value) -> Result<(), String> {
    for field in &["path", "file_path"] {
        if let Some(Value::String(s)) = args.get(*field)
            && !s.is_empty()
        {
            return Ok(());
        }
    }
    Err("'path' (or 'file_path') is required".to_string())
}

fn validate_line_range(args: &Value) -> Result<(), String> {
    let start = args.get("start_line").and_then(|v| v.as_u64());
    let end = args.get("end_line").and_then(|v| v.as_u64());
    if let (Some(start), Some(end)) = (start, end)
        && end < start
    {
        return Err(format!("end_line ({end}) must be >= start_line ({start})"));
    }
    Ok(())
}
