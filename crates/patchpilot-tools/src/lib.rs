//! Tool catalog, local tool host, approval gate, and sequential executor.

mod approval;
mod executor;
mod host;
mod shell;
mod validation;

pub use approval::{ApprovalGate, ApprovalKind, ApprovalRequest};
pub use executor::SequentialExecutor;
pub use host::{EditorBridge, ToolHost, ToolOutcome, WorkspaceToolHost, tool_definitions};
pub use shell::{CommandOutput, PlatformShellRunner, ShellRunner};
pub use validation::validate_tool_args;
