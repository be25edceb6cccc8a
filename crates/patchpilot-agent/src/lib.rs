//! Round-based agent orchestration: the assistant/tools/reviewer state
//! machine, the pure termination detector, and fallback tool-call
//! extraction for models that emit calls as literal text.

pub mod extract;
pub mod orchestrator;
pub mod prompts;
pub mod session;
pub mod termination;

pub use orchestrator::{AgentOrchestrator, AgentOutcome};
pub use session::{AgentState, CancelHandle};
pub use termination::{ResponseClass, check, classify_response};
