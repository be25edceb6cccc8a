//! Sequential tool execution with approval gating.
//!
//! Order is meaningful for file-system side effects, so tool calls within a
//! round never run in parallel. Sensitive calls block on the approval gate;
//! a denial becomes a failed history record and an error result, and the
//! round continues with the next call.

use crate::approval::{ApprovalGate, ApprovalKind, ApprovalRequest};
use crate::host::ToolHost;
use crate::validation::validate_tool_args;
use chrono::Utc;
use patchpilot_core::{
    AgentEvent, ToolCall, ToolCallRecord, ToolName, ToolResult, input_hash, summarize_args,
};
use patchpilot_policy::PolicyEngine;
use std::sync::Arc;
use std::time::Instant;

pub struct SequentialExecutor {
    host: Arc<dyn ToolHost>,
    gate: Arc<ApprovalGate>,
    policy: PolicyEngine,
}

impl SequentialExecutor {
    pub fn new(host: Arc<dyn ToolHost>, gate: Arc<ApprovalGate>, policy: PolicyEngine) -> Self {
        Self { host, gate, policy }
    }

    #[must_use]
    pub fn gate(&self) -> Arc<ApprovalGate> {
        Arc::clone(&self.gate)
    }

    /// Execute an ordered list of tool calls, appending one history record
    /// per call and emitting executing/executed/error events.
    pub fn execute_sequentially(
        &self,
        calls: &[ToolCall],
        history: &mut Vec<ToolCallRecord>,
        emit: &dyn Fn(AgentEvent),
    ) -> Vec<ToolResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            results.push(self.execute_one(call, history, emit));
        }
        results
    }

    fn execute_one(
        &self,
        call: &ToolCall,
        history: &mut Vec<ToolCallRecord>,
        emit: &dyn Fn(AgentEvent),
    ) -> ToolResult {
        emit(AgentEvent::ToolExecuting { call: call.clone() });
        let started = Instant::now();
        let args_summary = summarize_args(&call.args);
        let hash = input_hash(&call.args);

        let mut record = ToolCallRecord {
            name: call.name.clone(),
            args_summary,
            input_hash: hash,
            success: false,
            at: Utc::now(),
        };

        if let Err(message) = validate_tool_args(&call.name, &call.args) {
            history.push(record);
            emit(AgentEvent::ToolError {
                call: call.clone(),
                message: message.clone(),
            });
            return ToolResult::error(&call.id, format!("invalid arguments: {message}"));
        }

        // task_complete is an executor-level signal, not a host tool.
        if call.tool_name() == Some(ToolName::TaskComplete) {
            record.success = true;
            history.push(record);
            let summary = call
                .args
                .get("summary")
                .and_then(|v| v.as_str())
                .unwrap_or("task complete");
            let mut result = ToolResult::ok(&call.id, summary);
            result.is_task_complete = true;
            emit(AgentEvent::ToolExecuted {
                call: call.clone(),
                result: result.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
            return result;
        }

        if self.policy.requires_approval(call) {
            let approved = self.gate.request(approval_request_for(call));
            if !approved {
                history.push(record);
                let message = "denied by user — try a different approach or ask for guidance";
                emit(AgentEvent::ToolError {
                    call: call.clone(),
                    message: message.to_string(),
                });
                return ToolResult::error(&call.id, message);
            }
        }

        let outcome = self.host.execute(call);
        let duration_ms = started.elapsed().as_millis() as u64;
        record.success = !outcome.is_error;
        history.push(record);

        let result = if outcome.is_error {
            ToolResult::error(&call.id, outcome.content)
        } else {
            ToolResult::ok(&call.id, outcome.content)
        };
        if result.is_error {
            emit(AgentEvent::ToolError {
                call: call.clone(),
                message: result.content.clone(),
            });
        } else {
            emit(AgentEvent::ToolExecuted {
                call: call.clone(),
                result: result.clone(),
                duration_ms,
            });
        }
        result
    }
}

fn approval_request_for(call: &ToolCall) -> ApprovalRequest {
    match call.tool_name() {
        Some(ToolName::ApplyPatch) => {
            let patch = call
                .args
                .get("patch")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let detail = patchpilot_diff::normalize(patch)
                .and_then(|diff| patchpilot_diff::parse(&diff))
                .map(|files| patchpilot_diff::target_files(&files).join(", "))
                .unwrap_or_else(|_| format!("{} bytes of patch text", patch.len()));
            ApprovalRequest::new(
                ApprovalKind::ApplyPatch,
                "Apply patch",
                detail,
                call.args.clone(),
            )
        }
        _ => {
            let command = call
                .args
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            ApprovalRequest::new(
                ApprovalKind::RunCommand,
                "Run command",
                command,
                call.args.clone(),
            )
        }
    }
}
