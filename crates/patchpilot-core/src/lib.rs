use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".patchpilot")
}

/// Type-safe tool name enum covering the fixed built-in catalog.
///
/// The catalog is closed: the orchestrator never executes a tool the host
/// does not know. `from_api_name` returns `None` for unknown names so the
/// executor can report them back to the model instead of crashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ReadTerminal,
    WriteToTerminal,
    ReadFile,
    ListFiles,
    EditorContext,
    WorkspaceSearch,
    LspQuery,
    ApplyPatch,
    TaskComplete,
}

impl ToolName {
    #[must_use]
    pub fn from_api_name(s: &str) -> Option<Self> {
        Some(match s {
            "read_terminal" => Self::ReadTerminal,
            "write_to_terminal" => Self::WriteToTerminal,
            "read_file" => Self::ReadFile,
            "list_files" => Self::ListFiles,
            "editor_context" => Self::EditorContext,
            "workspace_search" => Self::WorkspaceSearch,
            "lsp_query" => Self::LspQuery,
            "apply_patch" => Self::ApplyPatch,
            "task_complete" => Self::TaskComplete,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_api_name(&self) -> &'static str {
        match self {
            Self::ReadTerminal => "read_terminal",
            Self::WriteToTerminal => "write_to_terminal",
            Self::ReadFile => "read_file",
            Self::ListFiles => "list_files",
            Self::EditorContext => "editor_context",
            Self::WorkspaceSearch => "workspace_search",
            Self::LspQuery => "lsp_query",
            Self::ApplyPatch => "apply_patch",
            Self::TaskComplete => "task_complete",
        }
    }

    /// Whether this tool only observes state.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        !matches!(self, Self::WriteToTerminal | Self::ApplyPatch)
    }

    /// Whether this tool mutates external state and is therefore subject to
    /// the approval gate. `write_to_terminal` may still skip the gate when
    /// the concrete command is allowlisted by policy.
    #[must_use]
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Self::WriteToTerminal | Self::ApplyPatch)
    }

    pub const ALL: &'static [ToolName] = &[
        Self::ReadTerminal,
        Self::WriteToTerminal,
        Self::ReadFile,
        Self::ListFiles,
        Self::EditorContext,
        Self::WorkspaceSearch,
        Self::LspQuery,
        Self::ApplyPatch,
        Self::TaskComplete,
    ];
}

/// A tool call extracted from a model response, ready for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique per call within a session.
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

impl ToolCall {
    #[must_use]
    pub fn tool_name(&self) -> Option<ToolName> {
        ToolName::from_api_name(&self.name)
    }
}

/// Outcome of one tool call, fed back to the model as conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    /// Set by the `task_complete` tool; terminates the loop unconditionally.
    pub is_task_complete: bool,
}

impl ToolResult {
    #[must_use]
    pub fn ok(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: content.into(),
            is_error: false,
            is_task_complete: false,
        }
    }

    #[must_use]
    pub fn error(tool_call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.to_string(),
            content: content.into(),
            is_error: true,
            is_task_complete: false,
        }
    }
}

/// History entry for repeat/failure-rate detection. Append-only, insertion
/// order significant: the detector looks at recency windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub args_summary: String,
    /// Stable content hash of the input; identical `(name, input_hash)`
    /// pairs within a sliding window signal a repeated call.
    pub input_hash: String,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// Stable content hash of tool-call arguments.
///
/// `serde_json::Value` objects serialize with sorted keys, so two inputs
/// that differ only in key order hash identically.
#[must_use]
pub fn input_hash(args: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Produce a short summary of tool arguments for display and history.
#[must_use]
pub fn summarize_args(args: &serde_json::Value) -> String {
    let mut parts = Vec::new();
    if let Some(obj) = args.as_object() {
        for (key, val) in obj {
            let short = match val {
                serde_json::Value::String(s) => {
                    if s.chars().count() > 60 {
                        let head: String = s.chars().take(57).collect();
                        format!("{key}=\"{head}...\"")
                    } else {
                        format!("{key}=\"{s}\"")
                    }
                }
                serde_json::Value::Number(n) => format!("{key}={n}"),
                serde_json::Value::Bool(b) => format!("{key}={b}"),
                _ => format!("{key}=..."),
            };
            parts.push(short);
        }
    }
    if parts.is_empty() {
        return "()".to_string();
    }
    parts.join(", ")
}

// ── Chat protocol types ─────────────────────────────────────────────────

/// A raw tool call as the model emits it (arguments still a JSON string).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
}

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

/// A tool (function) definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Controls how the model picks tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// "none", "auto", or "required"
    Mode(String),
}

impl ToolChoice {
    pub fn auto() -> Self {
        Self::Mode("auto".to_string())
    }
    pub fn none() -> Self {
        Self::Mode("none".to_string())
    }
}

/// Request for the chat-with-tools API.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

/// A single chunk emitted while a model response streams in.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A content text delta.
    ContentDelta(String),
    /// A tool-call fragment started arriving (name known, args partial).
    ToolCallStart { name: String },
    /// Streaming is done; the assembled response follows.
    Done,
}

/// Callback type for receiving streaming chunks.
pub type StreamCallback = std::sync::Arc<dyn Fn(StreamChunk) + Send + Sync>;

// ── Agent event stream ──────────────────────────────────────────────────

/// Events emitted by the orchestrator, consumed by a UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    RoundStart {
        round: u64,
    },
    RoundEnd {
        round: u64,
    },
    TextDelta {
        text: String,
    },
    ToolUseStart {
        call: ToolCall,
    },
    ToolUseEnd {
        call: ToolCall,
    },
    ToolExecuting {
        call: ToolCall,
    },
    ToolExecuted {
        call: ToolCall,
        result: ToolResult,
        duration_ms: u64,
    },
    ToolError {
        call: ToolCall,
        message: String,
    },
    AgentComplete {
        reason: TerminationReason,
        total_rounds: u64,
        message: String,
    },
    Error {
        message: String,
    },
}

pub type EventCallback = std::sync::Arc<dyn Fn(AgentEvent) + Send + Sync>;

// ── Termination types ───────────────────────────────────────────────────

/// Enumerated cause for halting the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TaskComplete,
    NoTools,
    ToolSuccess,
    RepeatedTool,
    HighFailureRate,
    NoProgress,
    Timeout,
    MaxRounds,
    Summarizing,
    UserCancel,
    MentionedTool,
}

impl TerminationReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskComplete => "task_complete",
            Self::NoTools => "no_tools",
            Self::ToolSuccess => "tool_success",
            Self::RepeatedTool => "repeated_tool",
            Self::HighFailureRate => "high_failure_rate",
            Self::NoProgress => "no_progress",
            Self::Timeout => "timeout",
            Self::MaxRounds => "max_rounds",
            Self::Summarizing => "summarizing",
            Self::UserCancel => "user_cancel",
            Self::MentionedTool => "mentioned_tool",
        }
    }
}

/// Immutable verdict produced fresh on every detector check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationResult {
    pub should_terminate: bool,
    /// Present even for some non-terminating verdicts (e.g. the model
    /// mentioned a tool without invoking it).
    pub reason: Option<TerminationReason>,
    pub message: String,
}

impl TerminationResult {
    #[must_use]
    pub fn stop(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self {
            should_terminate: true,
            reason: Some(reason),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn go() -> Self {
        Self {
            should_terminate: false,
            reason: None,
            message: String::new(),
        }
    }

    #[must_use]
    pub fn go_with(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self {
            should_terminate: false,
            reason: Some(reason),
            message: message.into(),
        }
    }
}

/// Which checkpoint within a round the detector is evaluating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPhase {
    AfterModelResponse,
    AfterToolExecution,
}

// ── Errors fatal to a session ───────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("no active model configured")]
    NoActiveModel,
    #[error("model call failed: {0}")]
    ModelCallFailed(String),
}

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentLoopConfig,
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            api_key_env: "PATCHPILOT_API_KEY".to_string(),
            timeout_seconds: 120,
            max_retries: 2,
            retry_base_ms: 500,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLoopConfig {
    pub max_rounds: u64,
    pub timeout_ms: u64,
    /// A call repeated this many times (same name + input hash) terminates
    /// the loop.
    pub repeat_threshold: usize,
    pub failure_threshold: usize,
    pub planner_enabled: bool,
    pub reviewer_enabled: bool,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: 6,
            timeout_ms: 120_000,
            repeat_threshold: 5,
            failure_threshold: 3,
            planner_enabled: false,
            reviewer_enabled: false,
            max_tokens: 8192,
            temperature: Some(0.2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// "always" or "never" — whether command execution needs approval.
    pub approve_commands: String,
    /// "always" or "never" — whether patch application needs approval.
    pub approve_patches: String,
    /// Command prefixes that skip the approval gate.
    pub allowlist: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            approve_commands: "always".to_string(),
            approve_patches: "always".to_string(),
            allowlist: vec![
                "ls".to_string(),
                "cat".to_string(),
                "rg".to_string(),
                "git status".to_string(),
                "git diff".to_string(),
                "git show".to_string(),
                "cargo test".to_string(),
                "cargo check".to_string(),
            ],
        }
    }
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".patchpilot/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let mut paths = Vec::new();
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
