//! Pure termination classifier for the agent loop.
//!
//! Called twice per round (after the model response and after tool
//! execution) and evaluates an ordered rule list, first match wins:
//!
//! 1. any `is_task_complete` result          → task_complete
//! 2. zero-call linguistic classification    → no_tools / summarizing /
//!    continue (incomplete, mentioned_tool)
//! 3. clean tool round                       → tool_success
//! 4. repeated call within recency window    → repeated_tool
//! 5. failures within recency window         → high_failure_rate
//! 6. ≥10 rounds, trailing attempts failed   → no_progress
//! 7. wall-clock budget exceeded             → timeout
//! 8. round ceiling                          → max_rounds
//! 9. ≥10 rounds with no calls this round    → no_tools
//! 10. otherwise                             → continue
//!
//! Rules 1 and 8 are absolute. The linguistic classification in rule 2 is
//! advisory, best-effort policy: its "continue" outcomes fall through so the
//! hard ceilings below still apply. The pattern lists are ordered data, not
//! control flow — tune them there.

use crate::session::AgentState;
use patchpilot_core::{
    AgentLoopConfig, TerminationPhase, TerminationReason, TerminationResult, ToolCall, ToolName,
    ToolResult, input_hash,
};

/// Ordered linguistic rules: the first class with a matching pattern wins.
/// Matching is lowercase substring.
const CLASSIFIER_RULES: &[(ResponseClass, &[&str])] = &[
    (
        ResponseClass::CannotComplete,
        &[
            "i cannot",
            "i can't",
            "i am unable",
            "i'm unable",
            "not able to do",
            "not possible for me",
            "beyond my capabilities",
            "won't be able to",
        ],
    ),
    (
        ResponseClass::Incomplete,
        &[
            "i will ",
            "i'll ",
            "let me ",
            "i'm going to",
            "i am going to",
            "now i will",
            "next, i",
            "first, i",
            "about to ",
            "i need to check",
            "i need to look",
            "going to start",
        ],
    ),
    (
        ResponseClass::Summarizing,
        &[
            "in summary",
            "to summarize",
            "i have completed",
            "i've completed",
            "i have finished",
            "i've finished",
            "the task is complete",
            "task is now complete",
            "everything is done",
            "all changes have been",
            "successfully completed",
            "here's what i did",
            "here is what i did",
        ],
    ),
];

const GREETING_PATTERNS: &[&str] = &[
    "hello",
    "hi!",
    "hi there",
    "hey",
    "good morning",
    "good afternoon",
    "good evening",
    "how can i help",
    "how can i assist",
    "what can i do for you",
    "you're welcome",
    "glad to help",
    "my pleasure",
];

/// User inputs short enough to be read as chit-chat rather than a task.
const CHITCHAT_USER_MAX_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Chitchat,
    CannotComplete,
    Incomplete,
    MentionedTool,
    Summarizing,
    Plain,
}

/// Classify a zero-tool-call model response.
pub fn classify_response(text: &str, last_user_message: &str) -> ResponseClass {
    let lower = text.to_lowercase();

    if is_chitchat(&lower, last_user_message) {
        return ResponseClass::Chitchat;
    }

    for (class, patterns) in CLASSIFIER_RULES {
        // Tool mentions take precedence over summary language but not over
        // the intent/incapability classes above them.
        if *class == ResponseClass::Summarizing && mentions_tool_name(&lower) {
            return ResponseClass::MentionedTool;
        }
        if patterns.iter().any(|p| lower.contains(p)) {
            return *class;
        }
    }
    if mentions_tool_name(&lower) {
        return ResponseClass::MentionedTool;
    }
    ResponseClass::Plain
}

fn is_chitchat(lower_response: &str, last_user_message: &str) -> bool {
    let user = last_user_message.trim().to_lowercase();
    let user_is_smalltalk = user.len() <= CHITCHAT_USER_MAX_LEN
        && (matches!(user.as_str(), "hi" | "yo" | "thanks" | "thank you")
            || GREETING_PATTERNS.iter().any(|p| user.contains(p)));
    let response_is_greeting = lower_response.chars().count() < 200
        && GREETING_PATTERNS.iter().any(|p| lower_response.contains(p));
    user_is_smalltalk || response_is_greeting
}

fn mentions_tool_name(lower: &str) -> bool {
    ToolName::ALL.iter().any(|t| lower.contains(t.as_api_name()))
}

/// Evaluate the termination rules. Pure: same inputs, same verdict; the
/// result is produced fresh on every call and never cached.
pub fn check(
    state: &AgentState,
    current_calls: &[ToolCall],
    results: &[ToolResult],
    cfg: &AgentLoopConfig,
    phase: TerminationPhase,
    last_user_message: &str,
) -> TerminationResult {
    // 1. Explicit completion is absolute.
    if results.iter().any(|r| r.is_task_complete) {
        return TerminationResult::stop(
            TerminationReason::TaskComplete,
            "the model declared the task complete",
        );
    }

    // 2. Zero-call responses get a linguistic read. Terminating classes
    // return here; "continue" classes fall through to the safety rules.
    let mut advisory: Option<TerminationResult> = None;
    if phase == TerminationPhase::AfterModelResponse && current_calls.is_empty() {
        match classify_response(&state.last_model_response, last_user_message) {
            ResponseClass::Chitchat => {
                return TerminationResult::stop(
                    TerminationReason::NoTools,
                    "conversational reply — no tools needed",
                );
            }
            ResponseClass::CannotComplete => {
                return TerminationResult::stop(
                    TerminationReason::NoTools,
                    "the model stated it cannot complete the task",
                );
            }
            ResponseClass::Summarizing => {
                return TerminationResult::stop(
                    TerminationReason::Summarizing,
                    "the model is summarizing its work",
                );
            }
            ResponseClass::Incomplete => {
                advisory = Some(TerminationResult::go());
            }
            ResponseClass::MentionedTool => {
                advisory = Some(TerminationResult::go_with(
                    TerminationReason::MentionedTool,
                    "the model mentioned a tool without invoking it",
                ));
            }
            ResponseClass::Plain => {
                return TerminationResult::stop(
                    TerminationReason::NoTools,
                    "no tool calls in the response",
                );
            }
        }
    }

    // 3. A tool round with zero errors is a natural stopping point.
    if phase == TerminationPhase::AfterToolExecution
        && !results.is_empty()
        && results.iter().all(|r| !r.is_error)
    {
        return TerminationResult::stop(
            TerminationReason::ToolSuccess,
            "all tools in this round succeeded",
        );
    }

    // 4. Repeated identical calls within the recency window.
    let repeat_window = 2 * cfg.repeat_threshold;
    for call in current_calls {
        let hash = input_hash(&call.args);
        let repeats = state
            .history
            .iter()
            .rev()
            .take(repeat_window)
            .filter(|r| r.name == call.name && r.input_hash == hash)
            .count();
        if cfg.repeat_threshold > 0 && repeats >= cfg.repeat_threshold - 1 {
            return TerminationResult::stop(
                TerminationReason::RepeatedTool,
                format!(
                    "`{}` was repeated {repeats} time(s) with identical input",
                    call.name
                ),
            );
        }
    }

    // 5. Too many failures in the recent window.
    let failure_window = 2 * cfg.failure_threshold;
    let recent_failures = state
        .history
        .iter()
        .rev()
        .take(failure_window)
        .filter(|r| !r.success)
        .count();
    if recent_failures >= cfg.failure_threshold {
        return TerminationResult::stop(
            TerminationReason::HighFailureRate,
            format!("{recent_failures} of the last {failure_window} tool calls failed"),
        );
    }

    // 6. Long session whose trailing attempts are all failures.
    if state.current_round >= 10 {
        let len = state.history.len();
        let window = len.min(5);
        if window >= 3 && state.history[len - window..].iter().all(|r| !r.success) {
            return TerminationResult::stop(
                TerminationReason::NoProgress,
                format!("the last {window} tool attempts all failed"),
            );
        }
    }

    // 7. Wall-clock budget, measured from session start.
    if state.elapsed_ms() > cfg.timeout_ms {
        return TerminationResult::stop(
            TerminationReason::Timeout,
            format!("session exceeded {} ms", cfg.timeout_ms),
        );
    }

    // 8. Hard round ceiling, enforced regardless of other signals.
    if state.current_round >= cfg.max_rounds {
        return TerminationResult::stop(
            TerminationReason::MaxRounds,
            format!("reached the {}-round ceiling", cfg.max_rounds),
        );
    }

    // 9. Safety floor: many rounds with nothing to execute.
    if state.current_round >= 10 && current_calls.is_empty() {
        return TerminationResult::stop(
            TerminationReason::NoTools,
            "ten or more rounds without tool calls",
        );
    }

    advisory.unwrap_or_else(TerminationResult::go)
}
