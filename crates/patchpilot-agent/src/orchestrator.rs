//! The round-based agent state machine.
//!
//! `planner → assistant → tools → reviewer → {assistant | end}`, with a
//! bounded `assistant → assistant` self-edge for forced retries. One round =
//! one assistant visit (model call) plus any resulting tool execution. The
//! termination detector is consulted after the model response and again
//! after tool execution; the planner and reviewer states are config-gated.

use crate::session::{AgentState, CancelHandle};
use crate::{extract, prompts, termination};
use anyhow::Result;
use patchpilot_core::{
    AgentError, AgentEvent, AgentLoopConfig, ChatMessage, ChatRequest, EventCallback, LlmResponse,
    LlmToolCall, StreamCallback, StreamChunk, TerminationPhase, TerminationReason, ToolCall,
    ToolChoice, ToolResult, summarize_args,
};
use patchpilot_llm::LlmClient;
use patchpilot_observe::Observer;
use patchpilot_tools::{SequentialExecutor, tool_definitions};
use std::sync::Arc;

/// Final result of one agent session.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub reason: TerminationReason,
    pub total_rounds: u64,
    pub message: String,
    /// Full conversation, for continuing or inspecting the session.
    pub messages: Vec<ChatMessage>,
    pub patch_applied: bool,
    pub any_tool_ran: bool,
}

enum Step {
    Planner,
    Assistant,
    Tools(Vec<ToolCall>),
    Reviewer,
}

pub struct AgentOrchestrator<'a> {
    llm: &'a (dyn LlmClient + Send + Sync),
    executor: SequentialExecutor,
    config: AgentLoopConfig,
    model: String,
    event_cb: Option<EventCallback>,
    observer: Option<Arc<Observer>>,
    cancel: CancelHandle,
}

impl<'a> AgentOrchestrator<'a> {
    pub fn new(
        llm: &'a (dyn LlmClient + Send + Sync),
        executor: SequentialExecutor,
        config: AgentLoopConfig,
        model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            executor,
            config,
            model: model.into(),
            event_cb: None,
            observer: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Set the event callback for real-time UI updates.
    pub fn set_event_callback(&mut self, cb: EventCallback) {
        self.event_cb = Some(cb);
    }

    pub fn set_observer(&mut self, observer: Arc<Observer>) {
        self.observer = Some(observer);
    }

    /// Handle for cancelling this session from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Run the loop over the given conversation until a termination rule
    /// fires. Events stream through the callback; the outcome carries the
    /// final reason and conversation.
    pub fn run(&self, initial_messages: Vec<ChatMessage>) -> Result<AgentOutcome> {
        let mut messages: Vec<ChatMessage> = Vec::new();
        let has_system = initial_messages
            .iter()
            .any(|m| matches!(m, ChatMessage::System { .. }));
        if !has_system {
            messages.push(ChatMessage::System {
                content: prompts::SYSTEM_PROMPT.to_string(),
            });
        }
        messages.extend(initial_messages);

        let last_user_message = messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ChatMessage::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let mut state = AgentState::new(self.cancel.flag());
        let mut invoke_retry_used = false;
        let mut content_retry_used = false;
        let mut any_tool_ran = false;
        let mut patch_applied = false;

        let mut step = if self.config.planner_enabled {
            Step::Planner
        } else {
            Step::Assistant
        };

        loop {
            // Cooperative cancellation: checked at every state transition.
            if !state.is_active() {
                return Ok(self.complete(
                    &state,
                    messages,
                    TerminationReason::UserCancel,
                    "cancelled by user",
                    patch_applied,
                    any_tool_ran,
                ));
            }

            let current = std::mem::replace(&mut step, Step::Assistant);
            match current {
                Step::Planner => {
                    // One non-tool call producing a short plan; runs at most
                    // once per loop.
                    let mut planner_messages = messages.clone();
                    planner_messages.push(ChatMessage::User {
                        content: prompts::PLANNER_PROMPT.to_string(),
                    });
                    let response = self.plain_model_call(planner_messages)?;
                    messages.push(ChatMessage::Assistant {
                        content: Some(format!("Plan:\n{}", response.text.trim())),
                        tool_calls: vec![],
                    });
                    step = Step::Assistant;
                }

                Step::Assistant => {
                    state.current_round += 1;
                    self.emit(AgentEvent::RoundStart {
                        round: state.current_round,
                    });

                    let response = self.tool_model_call(&messages)?;
                    state.last_model_response = response.text.clone();

                    // Structured calls first; fall back to extraction from
                    // literal text, then to creation-patch synthesis.
                    let mut llm_calls = response.tool_calls.clone();
                    if llm_calls.is_empty() {
                        llm_calls = extract::extract_tool_calls(&response.text);
                    }
                    if llm_calls.is_empty()
                        && let Some(call) = extract::synthesize_creation_patch(
                            &response.text,
                            &last_user_message,
                        )
                    {
                        llm_calls.push(call);
                    }
                    let calls: Vec<ToolCall> = llm_calls.iter().map(to_tool_call).collect();

                    messages.push(ChatMessage::Assistant {
                        content: if response.text.is_empty() {
                            None
                        } else {
                            Some(response.text.clone())
                        },
                        tool_calls: llm_calls,
                    });

                    for call in &calls {
                        self.emit(AgentEvent::ToolUseStart { call: call.clone() });
                        self.emit(AgentEvent::ToolUseEnd { call: call.clone() });
                    }

                    // Bounded repair edges: each fires at most once per loop.
                    let mut force_retry = false;
                    if calls.is_empty() {
                        if !invoke_retry_used
                            && extract::looks_like_literal_tool_markup(&response.text)
                        {
                            invoke_retry_used = true;
                            force_retry = true;
                            messages.push(ChatMessage::System {
                                content: prompts::INVOKE_MARKUP_CORRECTION.to_string(),
                            });
                        } else if !content_retry_used
                            && !patch_applied
                            && extract::mentions_patch_without_content(&response.text)
                        {
                            content_retry_used = true;
                            force_retry = true;
                            messages.push(ChatMessage::User {
                                content: prompts::PATCH_CONTENT_RETRY.to_string(),
                            });
                        }
                    }

                    let verdict = termination::check(
                        &state,
                        &calls,
                        &[],
                        &self.config,
                        TerminationPhase::AfterModelResponse,
                        &last_user_message,
                    );
                    if verdict.should_terminate {
                        self.emit(AgentEvent::RoundEnd {
                            round: state.current_round,
                        });
                        return Ok(self.complete(
                            &state,
                            messages,
                            verdict.reason.unwrap_or(TerminationReason::NoTools),
                            &verdict.message,
                            patch_applied,
                            any_tool_ran,
                        ));
                    }
                    if force_retry {
                        self.emit(AgentEvent::RoundEnd {
                            round: state.current_round,
                        });
                        step = Step::Assistant;
                    } else if !calls.is_empty() {
                        step = Step::Tools(calls);
                    } else {
                        // Advisory continue (stated intent / tool mention):
                        // take another round; the hard ceilings bound this.
                        self.emit(AgentEvent::RoundEnd {
                            round: state.current_round,
                        });
                        step = Step::Assistant;
                    }
                }

                Step::Tools(calls) => {
                    let results = self.executor.execute_sequentially(
                        &calls,
                        &mut state.history,
                        &|event| self.emit(event),
                    );
                    any_tool_ran = true;
                    for (call, result) in calls.iter().zip(&results) {
                        if call.name == "apply_patch" && !result.is_error {
                            patch_applied = true;
                        }
                    }

                    // One synthetic tool-result message for the whole round.
                    messages.push(ChatMessage::Tool {
                        tool_call_id: calls[0].id.clone(),
                        content: summarize_tool_round(&calls, &results),
                    });

                    self.emit(AgentEvent::RoundEnd {
                        round: state.current_round,
                    });

                    let verdict = termination::check(
                        &state,
                        &calls,
                        &results,
                        &self.config,
                        TerminationPhase::AfterToolExecution,
                        &last_user_message,
                    );
                    if verdict.should_terminate {
                        return Ok(self.complete(
                            &state,
                            messages,
                            verdict.reason.unwrap_or(TerminationReason::ToolSuccess),
                            &verdict.message,
                            patch_applied,
                            any_tool_ran,
                        ));
                    }
                    step = if self.config.reviewer_enabled {
                        Step::Reviewer
                    } else {
                        Step::Assistant
                    };
                }

                Step::Reviewer => {
                    let mut review_messages = messages.clone();
                    review_messages.push(ChatMessage::User {
                        content: prompts::REVIEWER_PROMPT.to_string(),
                    });
                    let response = self.plain_model_call(review_messages)?;
                    let text = response.text.trim().to_string();

                    if text.starts_with("APPROVED") {
                        return Ok(self.complete(
                            &state,
                            messages,
                            TerminationReason::Summarizing,
                            "reviewer approved the work",
                            patch_applied,
                            any_tool_ran,
                        ));
                    }
                    if let Some(idx) = text.find("REVISE:") {
                        let notes = text[idx + "REVISE:".len()..].trim();
                        messages.push(ChatMessage::User {
                            content: format!("Reviewer feedback: {notes}"),
                        });
                    }
                    // Anything else is ignored — continue.
                    step = Step::Assistant;
                }
            }
        }
    }

    fn tool_model_call(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: messages.to_vec(),
            tools: tool_definitions(),
            tool_choice: ToolChoice::auto(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let result = if let Some(cb) = &self.event_cb {
            let cb = Arc::clone(cb);
            let stream_cb: StreamCallback = Arc::new(move |chunk| {
                if let StreamChunk::ContentDelta(text) = chunk {
                    cb(AgentEvent::TextDelta { text });
                }
            });
            self.llm.complete_chat_streaming(&request, stream_cb)
        } else {
            self.llm.complete_chat(&request)
        };
        result.map_err(|err| self.model_failure(err))
    }

    fn plain_model_call(&self, messages: Vec<ChatMessage>) -> Result<LlmResponse> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            tools: vec![],
            tool_choice: ToolChoice::none(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        self.llm
            .complete_chat(&request)
            .map_err(|err| self.model_failure(err))
    }

    /// Model failures are fatal to the session: surfaced as an `error` event
    /// and propagated.
    fn model_failure(&self, err: anyhow::Error) -> anyhow::Error {
        let message = err.to_string();
        self.emit(AgentEvent::Error {
            message: message.clone(),
        });
        AgentError::ModelCallFailed(message).into()
    }

    fn complete(
        &self,
        state: &AgentState,
        messages: Vec<ChatMessage>,
        reason: TerminationReason,
        message: &str,
        patch_applied: bool,
        any_tool_ran: bool,
    ) -> AgentOutcome {
        self.emit(AgentEvent::AgentComplete {
            reason,
            total_rounds: state.current_round,
            message: message.to_string(),
        });
        AgentOutcome {
            reason,
            total_rounds: state.current_round,
            message: message.to_string(),
            messages,
            patch_applied,
            any_tool_ran,
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.record_event(&event);
        }
        if let Some(cb) = &self.event_cb {
            cb(event);
        }
    }
}

fn to_tool_call(call: &LlmToolCall) -> ToolCall {
    let args =
        serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));
    ToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        args,
    }
}

fn summarize_tool_round(calls: &[ToolCall], results: &[ToolResult]) -> String {
    let mut out = String::new();
    for (call, result) in calls.iter().zip(results) {
        let status = if result.is_error { "error" } else { "ok" };
        out.push_str(&format!(
            "[{status}] {} ({})\n{}\n",
            call.name,
            summarize_args(&call.args),
            result.content
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use patchpilot_core::ToolName;
    use patchpilot_policy::{PolicyConfig, PolicyEngine};
    use patchpilot_tools::{ApprovalGate, ToolHost, ToolOutcome};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // ── Scripted LLM mock ──

    struct ScriptedLlm {
        responses: Mutex<VecDeque<LlmResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: Mutex::new(VecDeque::from(responses)),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn recorded_requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl LlmClient for ScriptedLlm {
        fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
            self.requests.lock().unwrap().push(req.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no more scripted responses"))
        }

        fn complete_chat_streaming(
            &self,
            req: &ChatRequest,
            _cb: StreamCallback,
        ) -> Result<LlmResponse> {
            self.complete_chat(req)
        }
    }

    fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            text: text.to_string(),
            finish_reason: "stop".to_string(),
            tool_calls: vec![],
        }
    }

    fn tool_response(calls: Vec<LlmToolCall>) -> LlmResponse {
        LlmResponse {
            text: String::new(),
            finish_reason: "tool_calls".to_string(),
            tool_calls: calls,
        }
    }

    fn llm_call(id: &str, name: &str, arguments: &str) -> LlmToolCall {
        LlmToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    // ── Scripted tool host mock ──

    struct ScriptedHost {
        outcomes: Mutex<VecDeque<ToolOutcome>>,
        executed: Mutex<Vec<String>>,
    }

    impl ScriptedHost {
        fn new(outcomes: Vec<ToolOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::from(outcomes)),
                executed: Mutex::new(Vec::new()),
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl ToolHost for ScriptedHost {
        fn execute(&self, call: &ToolCall) -> ToolOutcome {
            self.executed.lock().unwrap().push(call.name.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ToolOutcome::ok("ok"))
        }
    }

    /// Policy with approvals off so tests never block on the gate.
    fn open_policy() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig {
            approve_commands: false,
            approve_patches: false,
            allowlist: vec![],
            denied_secret_paths: vec![],
        })
    }

    fn orchestrator<'a>(
        llm: &'a ScriptedLlm,
        host: Arc<ScriptedHost>,
        config: AgentLoopConfig,
    ) -> AgentOrchestrator<'a> {
        let executor = SequentialExecutor::new(
            host as Arc<dyn ToolHost>,
            Arc::new(ApprovalGate::new()),
            open_policy(),
        );
        AgentOrchestrator::new(llm, executor, config, "test-model")
    }

    fn user(content: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::User {
            content: content.to_string(),
        }]
    }

    #[test]
    fn greeting_terminates_in_round_one() {
        let llm = ScriptedLlm::new(vec![text_response("Hello! How can I help?")]);
        let host = Arc::new(ScriptedHost::new(vec![]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let outcome = agent.run(user("hi")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::NoTools);
        assert_eq!(outcome.total_rounds, 1);
        assert!(!outcome.any_tool_ran);
        assert!(host.executed().is_empty());
    }

    #[test]
    fn clean_tool_round_terminates_as_tool_success() {
        let llm = ScriptedLlm::new(vec![tool_response(vec![llm_call(
            "c1",
            "read_file",
            r#"{"path":"a.txt"}"#,
        )])]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::ok("contents of a")]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let outcome = agent.run(user("what's in a.txt?")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::ToolSuccess);
        assert_eq!(outcome.total_rounds, 1);
        assert!(outcome.any_tool_ran);
        assert_eq!(host.executed(), vec!["read_file"]);
        // The synthetic tool message carries the outcome back to the model.
        let has_tool_msg = outcome.messages.iter().any(|m| {
            matches!(m, ChatMessage::Tool { content, .. } if content.contains("contents of a"))
        });
        assert!(has_tool_msg);
    }

    #[test]
    fn task_complete_tool_is_absolute() {
        let llm = ScriptedLlm::new(vec![tool_response(vec![llm_call(
            "c1",
            "task_complete",
            r#"{"summary":"renamed the function"}"#,
        )])]);
        let host = Arc::new(ScriptedHost::new(vec![]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let outcome = agent.run(user("rename the function")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::TaskComplete);
        assert!(host.executed().is_empty(), "task_complete never hits the host");
    }

    #[test]
    fn max_rounds_ceiling_holds_when_every_round_continues() {
        // Three rounds of distinct failing calls: no other rule fires, the
        // ceiling must.
        let responses: Vec<LlmResponse> = (0..3)
            .map(|i| {
                tool_response(vec![llm_call(
                    &format!("c{i}"),
                    "read_file",
                    &format!(r#"{{"path":"missing-{i}.txt"}}"#),
                )])
            })
            .collect();
        let llm = ScriptedLlm::new(responses);
        let host = Arc::new(ScriptedHost::new(
            (0..3).map(|_| ToolOutcome::error("no such file")).collect(),
        ));
        let config = AgentLoopConfig {
            max_rounds: 3,
            repeat_threshold: 100,
            failure_threshold: 100,
            ..AgentLoopConfig::default()
        };
        let agent = orchestrator(&llm, Arc::clone(&host), config);

        let rounds_seen = Arc::new(Mutex::new(Vec::new()));
        let mut agent = agent;
        let cb: EventCallback = {
            let rounds_seen = Arc::clone(&rounds_seen);
            Arc::new(move |event| {
                if let AgentEvent::RoundStart { round } = event {
                    rounds_seen.lock().unwrap().push(round);
                }
            })
        };
        agent.set_event_callback(cb);

        let outcome = agent.run(user("read the missing files")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::MaxRounds);
        assert_eq!(outcome.total_rounds, 3);
        // Round monotonicity: strictly +1 per assistant visit.
        assert_eq!(rounds_seen.lock().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn repeated_identical_call_terminates() {
        let responses: Vec<LlmResponse> = (0..5)
            .map(|i| {
                tool_response(vec![llm_call(
                    &format!("c{i}"),
                    "read_file",
                    r#"{"path":"a.txt"}"#,
                )])
            })
            .collect();
        let llm = ScriptedLlm::new(responses);
        let host = Arc::new(ScriptedHost::new(
            (0..5).map(|_| ToolOutcome::error("still failing")).collect(),
        ));
        let config = AgentLoopConfig {
            repeat_threshold: 3,
            failure_threshold: 100,
            max_rounds: 10,
            ..AgentLoopConfig::default()
        };
        let agent = orchestrator(&llm, Arc::clone(&host), config);

        let outcome = agent.run(user("read a.txt")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::RepeatedTool);
        // Terminated well before the scripted responses ran out.
        assert!(outcome.total_rounds < 5);
    }

    #[test]
    fn raw_diff_in_text_is_extracted_and_applied() {
        let diff_text = "Applying the fix:\n\n--- a/src/main.rs\n+++ b/src/main.rs\n@@ -1 +1 @@\n-fn main() {}\n+fn main() { run(); }\n";
        let llm = ScriptedLlm::new(vec![text_response(diff_text)]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::ok("applied 1 file(s)")]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let outcome = agent.run(user("wire run() into main")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::ToolSuccess);
        assert!(outcome.patch_applied);
        assert_eq!(host.executed(), vec!["apply_patch"]);
    }

    #[test]
    fn literal_invoke_markup_gets_one_corrective_retry() {
        let markup = "I'll read it now.\n<invoke name=\"read_file\">\n<parameter name=\"path\">a.txt";
        let llm = ScriptedLlm::new(vec![
            text_response(markup),
            tool_response(vec![llm_call("c1", "read_file", r#"{"path":"a.txt"}"#)]),
        ]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::ok("got it")]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let outcome = agent.run(user("read a.txt")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::ToolSuccess);
        assert_eq!(outcome.total_rounds, 2);
        let has_correction = outcome.messages.iter().any(|m| {
            matches!(m, ChatMessage::System { content } if content.contains("tool-call markup"))
        });
        assert!(has_correction);
    }

    #[test]
    fn patch_mention_without_content_gets_one_retry() {
        let llm = ScriptedLlm::new(vec![
            text_response("I will apply a patch to fix the import."),
            text_response(
                "Here it is:\n```diff\n--- a/lib.rs\n+++ b/lib.rs\n@@ -1 +1 @@\n-use a;\n+use b;\n```",
            ),
        ]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::ok("applied 1 file(s)")]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let outcome = agent.run(user("fix the import")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::ToolSuccess);
        assert!(outcome.patch_applied);
        let has_retry = outcome.messages.iter().any(|m| {
            matches!(m, ChatMessage::User { content } if content.contains("full unified diff"))
        });
        assert!(has_retry);
    }

    #[test]
    fn claimed_file_creation_synthesizes_a_patch() {
        let text = "I've created `hello.py` as requested:\n```python\nprint(\"hello\")\n```";
        let llm = ScriptedLlm::new(vec![text_response(text)]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::ok("applied 1 file(s)")]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let outcome = agent
            .run(user("create a file hello.py that prints hello"))
            .expect("run");
        assert_eq!(outcome.reason, TerminationReason::ToolSuccess);
        assert!(outcome.patch_applied);
        assert_eq!(host.executed(), vec!["apply_patch"]);
    }

    #[test]
    fn cancellation_before_first_round() {
        let llm = ScriptedLlm::new(vec![]);
        let host = Arc::new(ScriptedHost::new(vec![]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());
        agent.cancel_handle().cancel();

        let outcome = agent.run(user("do anything")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::UserCancel);
        assert_eq!(outcome.total_rounds, 0);
    }

    #[test]
    fn planner_runs_once_without_tools() {
        let llm = ScriptedLlm::new(vec![
            text_response("1. read the file\n2. patch it\n3. task_complete"),
            tool_response(vec![llm_call("c1", "read_file", r#"{"path":"a.txt"}"#)]),
        ]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::ok("fine")]));
        let config = AgentLoopConfig {
            planner_enabled: true,
            ..AgentLoopConfig::default()
        };
        let agent = orchestrator(&llm, Arc::clone(&host), config);

        let outcome = agent.run(user("fix a.txt")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::ToolSuccess);
        assert_eq!(outcome.total_rounds, 1);

        let requests = llm.recorded_requests();
        assert!(requests[0].tools.is_empty(), "planner call is non-tool");
        assert!(!requests[1].tools.is_empty(), "assistant call carries tools");
        let has_plan = outcome.messages.iter().any(|m| {
            matches!(m, ChatMessage::Assistant { content: Some(c), .. } if c.starts_with("Plan:"))
        });
        assert!(has_plan);
    }

    #[test]
    fn reviewer_approval_terminates_as_summarizing() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![llm_call("c1", "read_file", r#"{"path":"a.txt"}"#)]),
            text_response("APPROVED"),
        ]);
        // The tool fails so the round does not terminate as tool_success.
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::error("no such file")]));
        let config = AgentLoopConfig {
            reviewer_enabled: true,
            failure_threshold: 100,
            ..AgentLoopConfig::default()
        };
        let agent = orchestrator(&llm, Arc::clone(&host), config);

        let outcome = agent.run(user("check a.txt")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::Summarizing);
        assert_eq!(outcome.total_rounds, 1);
    }

    #[test]
    fn reviewer_revision_feeds_back_and_continues() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![llm_call("c1", "read_file", r#"{"path":"a.txt"}"#)]),
            text_response("REVISE: also check b.txt"),
            tool_response(vec![llm_call(
                "c2",
                "task_complete",
                r#"{"summary":"checked both"}"#,
            )]),
        ]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::error("no such file")]));
        let config = AgentLoopConfig {
            reviewer_enabled: true,
            failure_threshold: 100,
            ..AgentLoopConfig::default()
        };
        let agent = orchestrator(&llm, Arc::clone(&host), config);

        let outcome = agent.run(user("check a.txt")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::TaskComplete);
        assert_eq!(outcome.total_rounds, 2);
        let has_feedback = outcome.messages.iter().any(|m| {
            matches!(m, ChatMessage::User { content } if content.contains("also check b.txt"))
        });
        assert!(has_feedback);
    }

    #[test]
    fn model_failure_is_fatal_and_surfaced() {
        let llm = ScriptedLlm::new(vec![]); // first call already fails
        let host = Arc::new(ScriptedHost::new(vec![]));
        let mut agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let errors = Arc::new(Mutex::new(Vec::new()));
        let cb: EventCallback = {
            let errors = Arc::clone(&errors);
            Arc::new(move |event| {
                if let AgentEvent::Error { message } = event {
                    errors.lock().unwrap().push(message);
                }
            })
        };
        agent.set_event_callback(cb);

        let err = agent.run(user("hello")).expect_err("must fail");
        assert!(err.to_string().contains("model call failed"));
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn events_cover_the_round_lifecycle() {
        let llm = ScriptedLlm::new(vec![tool_response(vec![llm_call(
            "c1",
            "read_file",
            r#"{"path":"a.txt"}"#,
        )])]);
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::ok("fine")]));
        let mut agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());

        let events = Arc::new(Mutex::new(Vec::new()));
        let cb: EventCallback = {
            let events = Arc::clone(&events);
            Arc::new(move |event| events.lock().unwrap().push(event))
        };
        agent.set_event_callback(cb);

        agent.run(user("read a.txt")).expect("run");
        let events = events.lock().unwrap();
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                AgentEvent::RoundStart { .. } => "round_start",
                AgentEvent::RoundEnd { .. } => "round_end",
                AgentEvent::ToolUseStart { .. } => "tool_use_start",
                AgentEvent::ToolUseEnd { .. } => "tool_use_end",
                AgentEvent::ToolExecuting { .. } => "tool_executing",
                AgentEvent::ToolExecuted { .. } => "tool_executed",
                AgentEvent::AgentComplete { .. } => "agent_complete",
                _ => "other",
            })
            .collect();
        for expected in [
            "round_start",
            "tool_use_start",
            "tool_use_end",
            "tool_executing",
            "tool_executed",
            "round_end",
            "agent_complete",
        ] {
            assert!(kinds.contains(&expected), "missing {expected} in {kinds:?}");
        }
        // agent_complete is last.
        assert_eq!(*kinds.last().unwrap(), "agent_complete");
    }

    #[test]
    fn unknown_tool_from_model_is_reported_not_fatal() {
        let llm = ScriptedLlm::new(vec![
            tool_response(vec![llm_call("c1", "made_up_tool", "{}")]),
            text_response("I have completed the investigation."),
        ]);
        // Unknown tool reaches the host, which reports it as an error
        // outcome; the loop continues instead of crashing.
        let host = Arc::new(ScriptedHost::new(vec![ToolOutcome::error(
            "unknown tool 'made_up_tool'",
        )]));
        let config = AgentLoopConfig {
            failure_threshold: 100,
            ..AgentLoopConfig::default()
        };
        let agent = orchestrator(&llm, Arc::clone(&host), config);

        let outcome = agent.run(user("use your special tool")).expect("run");
        assert_eq!(outcome.reason, TerminationReason::Summarizing);
        assert_eq!(outcome.total_rounds, 2);
    }

    #[test]
    fn tool_catalog_is_attached_to_assistant_calls() {
        let llm = ScriptedLlm::new(vec![text_response("Hello! How can I help?")]);
        let host = Arc::new(ScriptedHost::new(vec![]));
        let agent = orchestrator(&llm, Arc::clone(&host), AgentLoopConfig::default());
        agent.run(user("hi")).expect("run");

        let requests = llm.recorded_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].tools.len(), ToolName::ALL.len());
    }
}
