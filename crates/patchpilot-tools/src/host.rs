//! Local tool host: executes the fixed tool catalog against the workspace
//! filesystem, the platform shell, and the patch engine.

use crate::shell::{PlatformShellRunner, ShellRunner};
use anyhow::{Result, anyhow};
use ignore::WalkBuilder;
use patchpilot_core::{FunctionDefinition, ToolCall, ToolDefinition, ToolName};
use patchpilot_diff::PatchEngine;
use patchpilot_policy::PolicyEngine;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 60;
const READ_MAX_BYTES_DEFAULT: usize = 1_000_000;
const SEARCH_LIMIT_DEFAULT: usize = 50;
const TERMINAL_TAIL_MAX_BYTES: usize = 16_384;

/// Raw outcome of one tool execution, before it becomes a `ToolResult`.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutcome {
    #[must_use]
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Execution surface the orchestrator requires from a tool host.
pub trait ToolHost: Send + Sync {
    fn execute(&self, call: &ToolCall) -> ToolOutcome;
}

/// Optional editor collaborator backing `editor_context` and `lsp_query`.
pub trait EditorBridge: Send + Sync {
    fn context(&self) -> Result<String>;
    fn lsp_query(&self, query: &str, args: &serde_json::Value) -> Result<String>;
}

pub struct WorkspaceToolHost {
    workspace: PathBuf,
    policy: PolicyEngine,
    runner: Arc<dyn ShellRunner>,
    patches: PatchEngine,
    editor: Option<Arc<dyn EditorBridge>>,
    /// Tail of the last shell command output, served by `read_terminal`.
    terminal_tail: Mutex<String>,
}

impl WorkspaceToolHost {
    pub fn new(workspace: &Path, policy: PolicyEngine) -> Self {
        Self::with_runner(workspace, policy, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        policy: PolicyEngine,
        runner: Arc<dyn ShellRunner>,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            patches: PatchEngine::new(workspace),
            policy,
            runner,
            editor: None,
            terminal_tail: Mutex::new(String::new()),
        }
    }

    pub fn with_editor(mut self, editor: Arc<dyn EditorBridge>) -> Self {
        self.editor = Some(editor);
        self
    }

    fn run_tool(&self, call: &ToolCall) -> Result<String> {
        let Some(tool) = call.tool_name() else {
            return Err(anyhow!("unknown tool '{}'", call.name));
        };
        match tool {
            ToolName::ReadTerminal => {
                let tail = self.terminal_tail.lock().expect("terminal tail lock");
                if tail.is_empty() {
                    Ok("(terminal is empty — no command has run yet)".to_string())
                } else {
                    Ok(tail.clone())
                }
            }
            ToolName::WriteToTerminal => {
                let cmd = call
                    .args
                    .get("command")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("command missing"))?;
                let timeout = call
                    .args
                    .get("timeout_seconds")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECONDS);
                let out =
                    self.runner
                        .run(cmd, &self.workspace, Duration::from_secs(timeout))?;

                let combined = self.policy.redact(&out.combined());
                {
                    let mut tail = self.terminal_tail.lock().expect("terminal tail lock");
                    tail.push_str(&combined);
                    if tail.len() > TERMINAL_TAIL_MAX_BYTES {
                        let cut = tail.len() - TERMINAL_TAIL_MAX_BYTES;
                        let boundary = tail
                            .char_indices()
                            .map(|(i, _)| i)
                            .find(|&i| i >= cut)
                            .unwrap_or(0);
                        *tail = tail.split_off(boundary);
                    }
                }

                if out.timed_out {
                    return Err(anyhow!("command timed out after {timeout}s\n{combined}"));
                }
                let status = out.status.unwrap_or(-1);
                if status != 0 {
                    return Err(anyhow!("command exited with status {status}\n{combined}"));
                }
                Ok(if combined.is_empty() {
                    format!("command succeeded (status {status}, no output)")
                } else {
                    combined
                })
            }
            ToolName::ReadFile => {
                let path = call
                    .args
                    .get("path")
                    .or_else(|| call.args.get("file_path"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("path missing"))?;
                self.policy.check_path(path)?;
                let full = self.workspace.join(path);
                let bytes = fs::read(&full)?;
                if is_binary(&bytes) {
                    return Ok(format!("{path}: binary file, {} bytes", bytes.len()));
                }
                let truncated = bytes.len() > READ_MAX_BYTES_DEFAULT;
                let content =
                    String::from_utf8_lossy(&bytes[..bytes.len().min(READ_MAX_BYTES_DEFAULT)])
                        .to_string();
                let start = call.args.get("start_line").and_then(|v| v.as_u64());
                let end = call.args.get("end_line").and_then(|v| v.as_u64());
                let sliced = slice_lines(&content, start, end);
                if truncated {
                    Ok(format!("{sliced}\n[truncated at {READ_MAX_BYTES_DEFAULT} bytes]"))
                } else {
                    Ok(sliced)
                }
            }
            ToolName::ListFiles => {
                let dir = call.args.get("dir").and_then(|v| v.as_str()).unwrap_or(".");
                self.policy.check_path(dir)?;
                let path = self.workspace.join(dir);
                let mut entries = Vec::new();
                for entry in fs::read_dir(&path)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    if entry.path().is_dir() {
                        entries.push(format!("{name}/"));
                    } else {
                        entries.push(name);
                    }
                }
                entries.sort();
                Ok(if entries.is_empty() {
                    format!("{dir}: empty directory")
                } else {
                    entries.join("\n")
                })
            }
            ToolName::WorkspaceSearch => {
                let pattern = call
                    .args
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("pattern missing"))?;
                let limit = call
                    .args
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(SEARCH_LIMIT_DEFAULT as u64) as usize;
                let glob_filter = call
                    .args
                    .get("glob")
                    .and_then(|v| v.as_str())
                    .map(|g| glob::Pattern::new(g))
                    .transpose()
                    .map_err(|err| anyhow!("invalid glob filter: {err}"))?;
                let regex = regex::Regex::new(pattern)
                    .map_err(|err| anyhow!("invalid search pattern: {err}"))?;

                let mut matches = Vec::new();
                'files: for entry in WalkBuilder::new(&self.workspace).build().flatten() {
                    let path = entry.path();
                    if !path.is_file() {
                        continue;
                    }
                    let Ok(rel) = path.strip_prefix(&self.workspace) else {
                        continue;
                    };
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    if let Some(ref filter) = glob_filter
                        && !filter.matches(&rel)
                    {
                        continue;
                    }
                    let Ok(content) = fs::read_to_string(path) else {
                        continue;
                    };
                    for (idx, line) in content.lines().enumerate() {
                        if regex.is_match(line) {
                            matches.push(format!("{rel}:{}:{line}", idx + 1));
                            if matches.len() >= limit {
                                break 'files;
                            }
                        }
                    }
                }
                Ok(if matches.is_empty() {
                    format!("no matches for /{pattern}/")
                } else {
                    matches.join("\n")
                })
            }
            ToolName::EditorContext => match &self.editor {
                Some(editor) => editor.context(),
                None => Err(anyhow!("no editor attached to this session")),
            },
            ToolName::LspQuery => match &self.editor {
                Some(editor) => {
                    let query = call
                        .args
                        .get("query")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow!("query missing"))?;
                    editor.lsp_query(query, &call.args)
                }
                None => Err(anyhow!("no language server attached to this session")),
            },
            ToolName::ApplyPatch => {
                let patch = call
                    .args
                    .get("patch")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("patch missing"))?;
                let report = self.patches.apply(patch)?;
                Ok(report.summary())
            }
            // task_complete never reaches the host; the executor intercepts it.
            ToolName::TaskComplete => Err(anyhow!("task_complete is handled by the executor")),
        }
    }
}

impl ToolHost for WorkspaceToolHost {
    fn execute(&self, call: &ToolCall) -> ToolOutcome {
        match self.run_tool(call) {
            Ok(content) => ToolOutcome::ok(content),
            Err(err) => ToolOutcome::error(err.to_string()),
        }
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|&b| b == 0)
}

fn slice_lines(content: &str, start: Option<u64>, end: Option<u64>) -> String {
    match (start, end) {
        (None, None) => content.to_string(),
        _ => {
            let start = start.unwrap_or(1).max(1) as usize;
            let end = end.unwrap_or(u64::MAX) as usize;
            content
                .lines()
                .enumerate()
                .filter(|(i, _)| {
                    let line_no = i + 1;
                    line_no >= start && line_no <= end
                })
                .map(|(_, line)| line)
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

/// Function-calling definitions for the full catalog, sent to the model.
#[must_use]
pub fn tool_definitions() -> Vec<ToolDefinition> {
    fn def(name: &str, description: &str, parameters: serde_json::Value) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }

    vec![
        def(
            "read_terminal",
            "Read the tail of the most recent terminal output.",
            json!({"type": "object", "properties": {}}),
        ),
        def(
            "write_to_terminal",
            "Run a shell command in the workspace and return its output.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run"},
                    "timeout_seconds": {"type": "integer", "description": "Max runtime, default 60"}
                },
                "required": ["command"]
            }),
        ),
        def(
            "read_file",
            "Read a text file from the workspace, optionally by line range.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "start_line": {"type": "integer"},
                    "end_line": {"type": "integer"}
                },
                "required": ["path"]
            }),
        ),
        def(
            "list_files",
            "List the entries of a workspace directory.",
            json!({
                "type": "object",
                "properties": {"dir": {"type": "string", "description": "Directory, default ."}}
            }),
        ),
        def(
            "editor_context",
            "Fetch the active file and selection from the attached editor.",
            json!({"type": "object", "properties": {}}),
        ),
        def(
            "workspace_search",
            "Search workspace files line-by-line with a regex (gitignore-aware).",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "glob": {"type": "string", "description": "Optional path filter, e.g. **/*.rs"},
                    "limit": {"type": "integer"}
                },
                "required": ["pattern"]
            }),
        ),
        def(
            "lsp_query",
            "Query the attached language server (definitions, references, symbols).",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Query kind"},
                    "symbol": {"type": "string"}
                },
                "required": ["query"]
            }),
        ),
        def(
            "apply_patch",
            "Apply a unified diff to workspace files. Include 3 lines of context per hunk; use --- /dev/null headers to create files.",
            json!({
                "type": "object",
                "properties": {
                    "patch": {"type": "string", "description": "Full unified diff text"}
                },
                "required": ["patch"]
            }),
        ),
        def(
            "task_complete",
            "Declare the user's task finished. Call once the goal is verifiably done.",
            json!({
                "type": "object",
                "properties": {"summary": {"type": "string", "description": "What was accomplished"}}
            }),
        ),
    ]
}
