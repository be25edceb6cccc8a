use patchpilot_core::{ToolCall, ToolName};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub approve_commands: bool,
    pub approve_patches: bool,
    /// Command prefixes (token-wise) that skip the approval gate.
    pub allowlist: Vec<String>,
    pub denied_secret_paths: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            approve_commands: true,
            approve_patches: true,
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
            denied_secret_paths: vec![".ssh".to_string(), ".aws".to_string(), ".gnupg".to_string()],
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("path traversal denied")]
    PathTraversal,
    #[error("secret path denied")]
    SecretPath,
    #[error("command is not allowlisted")]
    CommandNotAllowed,
}

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    cfg: PolicyConfig,
    secret_regex: Regex,
}

impl PolicyEngine {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self {
            cfg,
            secret_regex: Regex::new(r"(?i)(api[_-]?key|secret|token|password)\s*[:=]\s*[^\s]+")
                .expect("valid regex"),
        }
    }

    pub fn from_app_config(cfg: &patchpilot_core::PolicyConfig) -> Self {
        let mapped = PolicyConfig {
            approve_commands: parse_approval_mode(&cfg.approve_commands),
            approve_patches: parse_approval_mode(&cfg.approve_patches),
            allowlist: cfg.allowlist.clone(),
            denied_secret_paths: PolicyConfig::default().denied_secret_paths,
        };
        Self::new(mapped)
    }

    pub fn check_path(&self, path: &str) -> Result<(), PolicyError> {
        if path.contains("..") {
            return Err(PolicyError::PathTraversal);
        }
        if self
            .cfg
            .denied_secret_paths
            .iter()
            .any(|needle| path.contains(needle))
        {
            return Err(PolicyError::SecretPath);
        }
        Ok(())
    }

    /// Token-prefix allowlist check: `cargo test --workspace` passes when
    /// `cargo test` is allowlisted.
    pub fn check_command(&self, cmd: &str) -> Result<(), PolicyError> {
        let cmd_tokens: Vec<&str> = cmd.split_whitespace().collect();
        if cmd_tokens.is_empty() {
            return Err(PolicyError::CommandNotAllowed);
        }
        for allowed in &self.cfg.allowlist {
            let allowed_tokens: Vec<&str> = allowed.split_whitespace().collect();
            if allowed_tokens.is_empty() {
                continue;
            }
            if cmd_tokens.len() >= allowed_tokens.len()
                && cmd_tokens[..allowed_tokens.len()] == allowed_tokens[..]
            {
                return Ok(());
            }
        }
        Err(PolicyError::CommandNotAllowed)
    }

    pub fn redact(&self, text: &str) -> String {
        self.secret_regex
            .replace_all(text, "$1=REDACTED")
            .to_string()
    }

    /// Whether a tool call must pass the approval gate before execution.
    ///
    /// Patch application is always gated (when enabled); command execution
    /// is gated unless the concrete command matches the allowlist.
    pub fn requires_approval(&self, call: &ToolCall) -> bool {
        match call.tool_name() {
            Some(ToolName::ApplyPatch) => self.cfg.approve_patches,
            Some(ToolName::WriteToTerminal) => {
                if !self.cfg.approve_commands {
                    return false;
                }
                let cmd = call
                    .args
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.check_command(cmd).is_err()
            }
            _ => false,
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

fn parse_approval_mode(mode: &str) -> bool {
    !matches!(mode, "never" | "false" | "off")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn denies_path_traversal_and_secret_dirs() {
        let policy = PolicyEngine::default();
        assert!(matches!(
            policy.check_path("../outside"),
            Err(PolicyError::PathTraversal)
        ));
        assert!(matches!(
            policy.check_path(".ssh/id_rsa"),
            Err(PolicyError::SecretPath)
        ));
        assert!(policy.check_path("src/lib.rs").is_ok());
    }

    #[test]
    fn allowlist_checks_command_prefix_tokens() {
        let policy = PolicyEngine::default();
        assert!(policy.check_command("cargo test --workspace").is_ok());
        assert!(policy.check_command("ls -la src").is_ok());
        assert!(matches!(
            policy.check_command("rm -rf /"),
            Err(PolicyError::CommandNotAllowed)
        ));
        assert!(matches!(
            policy.check_command(""),
            Err(PolicyError::CommandNotAllowed)
        ));
    }

    #[test]
    fn redacts_common_secret_patterns() {
        let policy = PolicyEngine::default();
        let out = policy.redact("api_key=abcd1234 token: xyz password = secret");
        assert!(out.contains("api_key=REDACTED"));
        assert!(out.contains("token=REDACTED"));
        assert!(out.contains("password=REDACTED"));
    }

    #[test]
    fn apply_patch_always_requires_approval() {
        let policy = PolicyEngine::default();
        assert!(policy.requires_approval(&call("apply_patch", json!({"patch": "..."}))));
    }

    #[test]
    fn allowlisted_command_skips_the_gate() {
        let policy = PolicyEngine::default();
        assert!(!policy.requires_approval(&call("write_to_terminal", json!({"command": "ls"}))));
        assert!(policy.requires_approval(&call(
            "write_to_terminal",
            json!({"command": "rm -rf build"})
        )));
    }

    #[test]
    fn read_only_tools_never_gated() {
        let policy = PolicyEngine::default();
        assert!(!policy.requires_approval(&call("read_file", json!({"path": "a.txt"}))));
        assert!(!policy.requires_approval(&call("task_complete", json!({}))));
    }

    #[test]
    fn approval_modes_parse_from_app_config() {
        let mut core_cfg = patchpilot_core::PolicyConfig::default();
        core_cfg.approve_patches = "never".to_string();
        let policy = PolicyEngine::from_app_config(&core_cfg);
        assert!(!policy.requires_approval(&call("apply_patch", json!({"patch": "..."}))));
    }
}
