use crate::classifier::{Classification, CommandClassifier};
use crate::paths;
use crate::settings::{self, Settings};
use crate::tier::{PermissionMode, PermissionTier};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ToolRequest
// ---------------------------------------------------------------------------

/// A tool invocation the host wants to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolRequest {
    Bash { command: String },
    Write { path: String },
    Edit { path: String },
    Other { name: String },
    /// A shell call whose command could not be read from its input.
    Unreadable { name: String },
}

impl ToolRequest {
    /// Map a host tool call (name plus JSON arguments) onto a request.
    pub fn from_tool_call(tool_name: &str, input: &Value) -> Self {
        let lookup = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| input.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };
        let field = |keys: &[&str]| lookup(keys).unwrap_or_default();
        match tool_name.to_ascii_lowercase().as_str() {
            "bash" | "shell" => match lookup(&["command", "cmd"]) {
                Some(command) => ToolRequest::Bash { command },
                None => ToolRequest::Unreadable {
                    name: tool_name.to_string(),
                },
            },
            "write" => ToolRequest::Write {
                path: field(&["path", "file_path"]),
            },
            "edit" => ToolRequest::Edit {
                path: field(&["path", "file_path"]),
            },
            _ => ToolRequest::Other {
                name: tool_name.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict / Prompt / Choice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "tier", rename_all = "snake_case")]
pub enum Choice {
    AllowOnce,
    /// Block now and every later identical command this session.
    AlwaysBlock,
    Block,
    /// Allow and raise the session tier (persisted) to the given level.
    Escalate(PermissionTier),
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Choice::AllowOnce => f.write_str("Allow once"),
            Choice::AlwaysBlock => f.write_str("Always block"),
            Choice::Block => f.write_str("Block"),
            Choice::Escalate(tier) => write!(f, "Allow all '{tier}' commands ({})", tier.description()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub title: String,
    pub message: String,
    pub choices: Vec<Choice>,
    /// Normalized command, the key used by "always block".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Verdict {
    Allow { reason: String },
    Block { reason: String },
    Ask(Prompt),
}

/// Asks the user to pick one of a prompt's choices.
pub trait Confirm {
    /// False when nobody can answer (headless, piped input).
    fn is_interactive(&self) -> bool;
    /// `None` when the prompt was dismissed.
    fn choose(&self, prompt: &Prompt) -> Option<Choice>;
}

/// Confirmer for headless runs; every prompt ends blocked.
pub struct NonInteractive;

impl Confirm for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn choose(&self, _prompt: &Prompt) -> Option<Choice> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateOutcome {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalated_to: Option<PermissionTier>,
}

impl GateOutcome {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            escalated_to: None,
        }
    }

    fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            escalated_to: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PermissionGate
// ---------------------------------------------------------------------------

/// Session-scoped decision point in front of every tool call.
#[derive(Debug)]
pub struct PermissionGate {
    classifier: CommandClassifier,
    tier: PermissionTier,
    mode: PermissionMode,
    blocked: HashSet<String>,
    /// Where escalations are written; `None` keeps them in memory.
    persist_path: Option<PathBuf>,
}

impl PermissionGate {
    pub fn new(classifier: CommandClassifier, tier: PermissionTier, mode: PermissionMode) -> Self {
        Self {
            classifier,
            tier,
            mode,
            blocked: HashSet::new(),
            persist_path: None,
        }
    }

    /// Gate configured from merged settings; escalations go to the global
    /// settings file.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut gate = Self::new(
            CommandClassifier::new(&settings.permission_config),
            settings.effective_level(),
            settings.effective_mode(),
        );
        gate.persist_path = paths::global_settings_path().ok();
        gate
    }

    pub fn with_persist_path(mut self, path: Option<PathBuf>) -> Self {
        self.persist_path = path;
        self
    }

    pub fn tier(&self) -> PermissionTier {
        self.tier
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    pub fn classifier(&self) -> &CommandClassifier {
        &self.classifier
    }

    pub fn classify(&self, command: &str) -> Classification {
        self.classifier.classify(command)
    }

    pub fn is_blocked(&self, command: &str) -> bool {
        self.blocked.contains(&self.classifier.normalize(command))
    }

    pub fn evaluate(&self, request: &ToolRequest) -> Verdict {
        let verdict = match request {
            ToolRequest::Bash { command } => self.evaluate_command(command),
            ToolRequest::Write { path } | ToolRequest::Edit { path } => {
                if self.tier.permits(PermissionTier::Low) {
                    Verdict::Allow {
                        reason: format!("file changes allowed at '{}'", self.tier),
                    }
                } else {
                    Verdict::Ask(Prompt {
                        title: "File change needs 'low'".to_string(),
                        message: format!("Modify {path}? Session level is '{}'.", self.tier),
                        choices: vec![
                            Choice::AllowOnce,
                            Choice::Escalate(PermissionTier::Low),
                            Choice::Block,
                        ],
                        command: None,
                    })
                }
            }
            ToolRequest::Other { name } => Verdict::Allow {
                reason: format!("'{name}' does not modify anything"),
            },
            ToolRequest::Unreadable { name } => Verdict::Block {
                reason: format!("'{name}' call has no readable command"),
            },
        };
        match (verdict, self.mode) {
            (Verdict::Ask(prompt), PermissionMode::Block) => Verdict::Block {
                reason: format!("{} (permission mode is block)", prompt.title),
            },
            (v, _) => v,
        }
    }

    fn evaluate_command(&self, command: &str) -> Verdict {
        let c = self.classifier.classify(command);
        if c.is_allowlisted() {
            return Verdict::Allow { reason: c.reason };
        }
        // Ahead of the dangerous prompt so "always block" sticks.
        if self.blocked.contains(&c.normalized) {
            return Verdict::Block {
                reason: "blocked earlier in this session".to_string(),
            };
        }
        if c.dangerous {
            return Verdict::Ask(Prompt {
                title: "Dangerous command".to_string(),
                message: format!("{}: {}", c.reason, c.command.trim()),
                choices: vec![Choice::AllowOnce, Choice::AlwaysBlock, Choice::Block],
                command: Some(c.normalized),
            });
        }
        if self.tier.permits(c.tier) {
            return Verdict::Allow {
                reason: format!("'{}' is within '{}'", c.tier, self.tier),
            };
        }
        Verdict::Ask(Prompt {
            title: format!("Command needs '{}' ({})", c.tier, c.tier.description()),
            message: format!(
                "{}: {}. Session level is '{}'.",
                c.reason,
                c.command.trim(),
                self.tier
            ),
            choices: vec![Choice::AllowOnce, Choice::Escalate(c.tier), Choice::Block],
            command: Some(c.normalized),
        })
    }

    /// Evaluate and, when needed, ask. Blocks when nobody can answer.
    pub fn resolve(&mut self, request: &ToolRequest, confirm: &dyn Confirm) -> GateOutcome {
        let prompt = match self.evaluate(request) {
            Verdict::Allow { reason } => return GateOutcome::allow(reason),
            Verdict::Block { reason } => return GateOutcome::block(reason),
            Verdict::Ask(prompt) => prompt,
        };
        if !confirm.is_interactive() {
            return GateOutcome::block(format!("{}; no one to confirm", prompt.title));
        }
        match confirm.choose(&prompt) {
            Some(Choice::AllowOnce) => GateOutcome::allow("allowed once"),
            Some(Choice::AlwaysBlock) => {
                if let Some(key) = prompt.command {
                    self.blocked.insert(key);
                }
                GateOutcome::block("blocked for this session")
            }
            Some(Choice::Escalate(tier)) => {
                self.escalate(tier);
                GateOutcome {
                    escalated_to: Some(self.tier),
                    ..GateOutcome::allow(format!("level raised to '{}'", self.tier))
                }
            }
            Some(Choice::Block) | None => GateOutcome::block("blocked by user"),
        }
    }

    /// Raise the session tier and persist it. A failed write is logged; the
    /// session keeps the new tier.
    pub fn escalate(&mut self, tier: PermissionTier) {
        if tier <= self.tier {
            return;
        }
        info!(from = %self.tier, to = %tier, "permission level raised");
        self.tier = tier;
        let Some(path) = &self.persist_path else {
            return;
        };
        if let Err(e) = settings::persist_permission_level_at(path, tier) {
            warn!(path = %path.display(), error = %e, "could not persist permission level");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Answers every prompt with the same choice and records the prompts.
    struct Scripted {
        answer: Option<Choice>,
        seen: RefCell<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(answer: Option<Choice>) -> Self {
            Self {
                answer,
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Confirm for Scripted {
        fn is_interactive(&self) -> bool {
            true
        }

        fn choose(&self, prompt: &Prompt) -> Option<Choice> {
            self.seen.borrow_mut().push(prompt.clone());
            self.answer
        }
    }

    fn gate(tier: PermissionTier) -> PermissionGate {
        PermissionGate::new(CommandClassifier::default(), tier, PermissionMode::Ask)
    }

    fn bash(cmd: &str) -> ToolRequest {
        ToolRequest::Bash {
            command: cmd.to_string(),
        }
    }

    #[test]
    fn request_from_tool_call() {
        let req = ToolRequest::from_tool_call("Bash", &serde_json::json!({"command": "ls"}));
        assert_eq!(req, bash("ls"));
        let req = ToolRequest::from_tool_call("edit", &serde_json::json!({"file_path": "a.rs"}));
        assert_eq!(req, ToolRequest::Edit { path: "a.rs".to_string() });
        let req = ToolRequest::from_tool_call("Grep", &serde_json::json!({}));
        assert!(matches!(req, ToolRequest::Other { .. }));
    }

    #[test]
    fn shell_call_without_command_is_blocked() {
        let g = gate(PermissionTier::High);
        for input in [
            serde_json::json!({"script": "rm -rf build && curl x"}),
            serde_json::json!({"command": ["rm", "-rf", "/"]}),
            serde_json::json!(null),
        ] {
            let req = ToolRequest::from_tool_call("bash", &input);
            assert!(matches!(req, ToolRequest::Unreadable { .. }), "{input}");
            assert!(matches!(g.evaluate(&req), Verdict::Block { .. }), "{input}");
        }
    }

    #[test]
    fn allowlisted_runs_at_off() {
        assert!(matches!(gate(PermissionTier::Off).evaluate(&bash("ls")), Verdict::Allow { .. }));
    }

    #[test]
    fn within_tier_is_allowed() {
        let g = gate(PermissionTier::Medium);
        assert!(matches!(g.evaluate(&bash("cargo test")), Verdict::Allow { .. }));
        assert!(matches!(g.evaluate(&bash("mkdir x")), Verdict::Allow { .. }));
    }

    #[test]
    fn above_tier_asks_with_escalation() {
        let g = gate(PermissionTier::Low);
        let Verdict::Ask(prompt) = g.evaluate(&bash("npm install")) else {
            panic!("expected prompt");
        };
        assert_eq!(
            prompt.choices,
            vec![
                Choice::AllowOnce,
                Choice::Escalate(PermissionTier::Medium),
                Choice::Block
            ]
        );
    }

    #[test]
    fn dangerous_prompts_even_at_high() {
        let g = gate(PermissionTier::High);
        let Verdict::Ask(prompt) = g.evaluate(&bash("sudo rm -rf /")) else {
            panic!("expected prompt");
        };
        assert_eq!(
            prompt.choices,
            vec![Choice::AllowOnce, Choice::AlwaysBlock, Choice::Block]
        );
        assert!(matches!(g.evaluate(&bash("git push origin main")), Verdict::Allow { .. }));
        for cmd in [
            "git -C . push --force origin main",
            "git -c core.x=y reset --hard HEAD~3",
            "rm -r --force build",
        ] {
            assert!(matches!(g.evaluate(&bash(cmd)), Verdict::Ask(_)), "{cmd}");
        }
    }

    #[test]
    fn block_mode_never_asks() {
        let g = PermissionGate::new(
            CommandClassifier::default(),
            PermissionTier::High,
            PermissionMode::Block,
        );
        assert!(matches!(g.evaluate(&bash("git reset --hard")), Verdict::Block { .. }));
        assert!(matches!(g.evaluate(&bash("make")), Verdict::Allow { .. }));
    }

    #[test]
    fn file_changes_need_low() {
        let write = ToolRequest::Write { path: "src/lib.rs".to_string() };
        assert!(matches!(gate(PermissionTier::Off).evaluate(&write), Verdict::Ask(_)));
        assert!(matches!(gate(PermissionTier::Low).evaluate(&write), Verdict::Allow { .. }));
        let read = ToolRequest::Other { name: "read".to_string() };
        assert!(matches!(gate(PermissionTier::Off).evaluate(&read), Verdict::Allow { .. }));
    }

    #[test]
    fn non_interactive_fails_closed() {
        let mut g = gate(PermissionTier::Off);
        let out = g.resolve(&bash("npm install"), &NonInteractive);
        assert!(!out.allowed);
        let out = g.resolve(&bash("cat README.md"), &NonInteractive);
        assert!(out.allowed);
    }

    #[test]
    fn dismissed_prompt_blocks() {
        let mut g = gate(PermissionTier::Off);
        assert!(!g.resolve(&bash("touch x"), &Scripted::new(None)).allowed);
    }

    #[test]
    fn allow_once_does_not_change_tier() {
        let mut g = gate(PermissionTier::Off);
        let confirm = Scripted::new(Some(Choice::AllowOnce));
        assert!(g.resolve(&bash("npm test"), &confirm).allowed);
        assert_eq!(g.tier(), PermissionTier::Off);
        assert!(g.resolve(&bash("npm test"), &confirm).allowed);
        assert_eq!(confirm.seen.borrow().len(), 2);
    }

    #[test]
    fn always_block_sticks_for_dangerous() {
        let mut g = gate(PermissionTier::High);
        let confirm = Scripted::new(Some(Choice::AlwaysBlock));
        assert!(!g.resolve(&bash("git push --force"), &confirm).allowed);
        assert!(g.is_blocked("git push --force"));
        // Second attempt is blocked without asking.
        let out = g.resolve(&bash("git  push   --force"), &confirm);
        assert!(!out.allowed);
        assert_eq!(confirm.seen.borrow().len(), 1);
    }

    #[test]
    fn escalation_persists_and_raises_tier() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"theme":"dark"}"#).unwrap();
        let mut g = gate(PermissionTier::Off).with_persist_path(Some(path.clone()));

        let out = g.resolve(
            &bash("cargo build"),
            &Scripted::new(Some(Choice::Escalate(PermissionTier::Medium))),
        );
        assert!(out.allowed);
        assert_eq!(out.escalated_to, Some(PermissionTier::Medium));
        assert_eq!(g.tier(), PermissionTier::Medium);
        // Now allowed without a prompt.
        assert!(matches!(g.evaluate(&bash("cargo test")), Verdict::Allow { .. }));

        let saved = Settings::load_file(&path).unwrap();
        assert_eq!(saved.permission_level, Some(PermissionTier::Medium));
        assert_eq!(saved.extra["theme"], "dark");
    }

    #[test]
    fn escalation_survives_write_failure() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the write fail.
        let path = dir.path().join("settings.json");
        std::fs::create_dir(&path).unwrap();
        let mut g = gate(PermissionTier::Off).with_persist_path(Some(path));
        g.escalate(PermissionTier::High);
        assert_eq!(g.tier(), PermissionTier::High);
    }

    #[test]
    fn escalate_never_lowers() {
        let mut g = gate(PermissionTier::Medium);
        g.escalate(PermissionTier::Low);
        assert_eq!(g.tier(), PermissionTier::Medium);
    }
}
