use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patchpilot_agent::AgentOrchestrator;
use patchpilot_core::{AgentEvent, AppConfig, ChatMessage, EventCallback};
use patchpilot_diff::PatchEngine;
use patchpilot_llm::HttpLlmClient;
use patchpilot_observe::Observer;
use patchpilot_policy::{PolicyConfig, PolicyEngine};
use patchpilot_tools::{
    ApprovalGate, SequentialExecutor, ToolHost, WorkspaceToolHost, tool_definitions,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "patchpilot",
    about = "Agentic coding assistant that edits files through reviewed unified-diff patches"
)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Mirror diagnostics to stderr.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one agent session over a prompt.
    Chat {
        prompt: String,

        /// Run a planning call before the first assistant round.
        #[arg(long)]
        planner: bool,

        /// Review each tool round before continuing.
        #[arg(long)]
        reviewer: bool,

        /// Override the round ceiling.
        #[arg(long)]
        max_rounds: Option<u64>,

        /// Approve all sensitive tool calls without prompting.
        #[arg(long)]
        yes: bool,
    },
    /// Apply a patch file to the workspace through the patch engine.
    Apply { patch_file: PathBuf },
    /// Print the tool catalog.
    Tools,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match &cli.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };

    match cli.command {
        Commands::Chat {
            prompt,
            planner,
            reviewer,
            max_rounds,
            yes,
        } => run_chat(&workspace, &prompt, planner, reviewer, max_rounds, yes, cli.verbose),
        Commands::Apply { patch_file } => run_apply(&workspace, &patch_file),
        Commands::Tools => {
            for def in tool_definitions() {
                println!("{:<18} {}", def.function.name, def.function.description);
            }
            Ok(())
        }
    }
}

fn run_chat(
    workspace: &PathBuf,
    prompt: &str,
    planner: bool,
    reviewer: bool,
    max_rounds: Option<u64>,
    yes: bool,
    verbose: bool,
) -> Result<()> {
    let cfg = AppConfig::load(workspace)?;

    let mut agent_cfg = cfg.agent.clone();
    agent_cfg.planner_enabled = planner || agent_cfg.planner_enabled;
    agent_cfg.reviewer_enabled = reviewer || agent_cfg.reviewer_enabled;
    if let Some(rounds) = max_rounds {
        agent_cfg.max_rounds = rounds;
    }

    let policy = if yes {
        PolicyEngine::new(PolicyConfig {
            approve_commands: false,
            approve_patches: false,
            ..PolicyConfig::default()
        })
    } else {
        PolicyEngine::from_app_config(&cfg.policy)
    };

    let host: Arc<dyn ToolHost> = Arc::new(WorkspaceToolHost::new(workspace, policy.clone()));
    let gate = Arc::new(ApprovalGate::new());
    let executor = SequentialExecutor::new(host, Arc::clone(&gate), policy);

    let llm = HttpLlmClient::new(cfg.llm.clone())?;
    let mut observer = Observer::new(workspace)?;
    observer.set_verbose(verbose);

    let mut agent = AgentOrchestrator::new(&llm, executor, agent_cfg, cfg.llm.model.clone());
    agent.set_observer(Arc::new(observer));
    agent.set_event_callback(event_printer());

    // Approval prompts are served from a side thread so the agent loop can
    // block on the gate.
    let stop = Arc::new(AtomicBool::new(false));
    let approver = spawn_approval_prompt(Arc::clone(&gate), Arc::clone(&stop));

    let outcome = agent.run(vec![ChatMessage::User {
        content: prompt.to_string(),
    }]);

    stop.store(true, Ordering::SeqCst);
    let _ = approver.join();

    let outcome = outcome?;
    println!(
        "\n[{}] {} round(s) — {}",
        outcome.reason.as_str(),
        outcome.total_rounds,
        outcome.message
    );
    Ok(())
}

fn run_apply(workspace: &PathBuf, patch_file: &PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(patch_file)
        .with_context(|| format!("reading {}", patch_file.display()))?;
    let engine = PatchEngine::new(workspace);
    let report = engine.apply(&text)?;
    println!("{}", report.summary());
    Ok(())
}

fn event_printer() -> EventCallback {
    Arc::new(|event| match event {
        AgentEvent::TextDelta { text } => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        AgentEvent::RoundStart { round } => eprintln!("── round {round} ──"),
        AgentEvent::ToolExecuting { call } => eprintln!("→ {}", call.name),
        AgentEvent::ToolExecuted {
            call, duration_ms, ..
        } => eprintln!("✓ {} ({duration_ms} ms)", call.name),
        AgentEvent::ToolError { call, message } => eprintln!("✗ {}: {message}", call.name),
        AgentEvent::Error { message } => eprintln!("error: {message}"),
        _ => {}
    })
}

fn spawn_approval_prompt(
    gate: Arc<ApprovalGate>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            let Some(request) = gate.wait_current(Duration::from_millis(200)) else {
                continue;
            };
            eprintln!("\napproval required: {} — {}", request.title, request.detail);
            eprint!("approve? [y/N]: ");
            let _ = std::io::stderr().flush();
            let mut input = String::new();
            if std::io::stdin().read_line(&mut input).is_err() {
                gate.resolve(false);
                continue;
            }
            gate.resolve(parse_approval_answer(&input));
        }
    })
}

fn parse_approval_answer(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_answers_default_to_deny() {
        assert!(parse_approval_answer("y"));
        assert!(parse_approval_answer("YES"));
        assert!(!parse_approval_answer(""));
        assert!(!parse_approval_answer("n"));
        assert!(!parse_approval_answer("maybe"));
    }

    #[test]
    fn cli_parses_chat_flags() {
        let cli = Cli::try_parse_from([
            "patchpilot",
            "chat",
            "fix the tests",
            "--reviewer",
            "--max-rounds",
            "4",
        ])
        .expect("parse");
        match cli.command {
            Commands::Chat {
                prompt,
                reviewer,
                max_rounds,
                planner,
                yes,
            } => {
                assert_eq!(prompt, "fix the tests");
                assert!(reviewer);
                assert!(!planner);
                assert!(!yes);
                assert_eq!(max_rounds, Some(4));
            }
            _ => panic!("expected chat command"),
        }
    }
}
