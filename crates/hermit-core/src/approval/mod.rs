//! Command approval gate
//!
//! Decides whether a proposed command may run before the execution
//! runtime ever sees it: static allowlist first, then session approvals,
//! then the global auto-approve flag, and finally a human decision
//! delivered asynchronously through the prompt channel.

mod rules;

pub use rules::{is_command_string_safe, validate_command_specific_args};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::plan::CommandDescriptor;

/// One allowlisted executable, optionally restricted to subcommands.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AllowlistEntry {
    pub name: String,
    #[serde(default)]
    pub subcommands: Vec<String>,
}

/// File-backed allowlist configuration.
#[derive(Debug, Clone, Default)]
pub struct AllowlistConfig {
    pub allowlist: Vec<AllowlistEntry>,
}

impl AllowlistConfig {
    /// Load from a well-known path. Malformed entries are skipped with a
    /// warning; a missing or unreadable file yields an empty allowlist —
    /// never a fatal error.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "Failed to read allowlist config");
                }
                return Self::default();
            }
        };

        let parsed: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to parse allowlist config");
                return Self::default();
            }
        };

        let entries = parsed
            .get("allowlist")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();

        let allowlist = entries
            .into_iter()
            .filter_map(|entry| {
                match serde_json::from_value::<AllowlistEntry>(entry.clone()) {
                    Ok(parsed) if !parsed.name.trim().is_empty() => Some(parsed),
                    Ok(_) => {
                        tracing::warn!("Skipping allowlist entry with empty name");
                        None
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Skipping malformed allowlist entry");
                        None
                    }
                }
            })
            .collect();

        Self { allowlist }
    }

    fn entry_for(&self, base: &str) -> Option<&AllowlistEntry> {
        self.allowlist.iter().find(|entry| entry.name == base)
    }
}

/// Interpreter-style bases where an allowlisted subcommand must not carry
/// trailing arguments (`python --version` yes, `python -c '…'` no).
const BARE_SUBCOMMAND_BASES: [&str; 5] = ["python", "python3", "pip", "node", "npm"];

fn shell_option_is_valid(command: &CommandDescriptor) -> bool {
    match command.shell.as_deref() {
        Some(shell) => matches!(shell.trim().to_ascii_lowercase().as_str(), "bash" | "sh"),
        None => true,
    }
}

fn extract_subcommand(tokens: &[String]) -> Option<&str> {
    tokens
        .iter()
        .skip(1)
        .find(|token| !token.starts_with('-'))
        .map(String::as_str)
}

fn subcommand_allowed(base: &str, entry: &AllowlistEntry, tokens: &[String]) -> bool {
    if entry.subcommands.is_empty() {
        return true;
    }

    let Some(sub) = extract_subcommand(tokens) else {
        return false;
    };
    if !entry.subcommands.iter().any(|allowed| allowed == sub) {
        return false;
    }

    if BARE_SUBCOMMAND_BASES.contains(&base) {
        let position = tokens.iter().position(|token| token == sub);
        return position.map_or(true, |index| tokens.len() <= index + 1);
    }

    true
}

/// Static allowlist evaluation.
pub fn is_preapproved_command(command: &CommandDescriptor, config: &AllowlistConfig) -> bool {
    let run = command.run.trim();
    if run.is_empty() {
        return false;
    }

    if !is_command_string_safe(run) || !shell_option_is_valid(command) {
        return false;
    }

    let Ok(tokens) = shell_words::split(run) else {
        return false;
    };
    let Some(first) = tokens.first() else {
        return false;
    };

    let base = Path::new(first)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| first.clone());

    let Some(entry) = config.entry_for(&base) else {
        return false;
    };

    subcommand_allowed(&base, entry, &tokens) && validate_command_specific_args(&base, &tokens)
}

/// Stable signature used to remember session approvals for identical
/// commands.
pub fn command_signature(command: &CommandDescriptor) -> String {
    let shell = command
        .shell
        .as_deref()
        .map(str::trim)
        .filter(|shell| !shell.is_empty())
        .unwrap_or("bash");
    let cwd = command
        .cwd
        .as_deref()
        .map(str::trim)
        .filter(|cwd| !cwd.is_empty())
        .unwrap_or(".");

    serde_json::json!({
        "shell": shell,
        "run": command.run,
        "cwd": cwd,
    })
    .to_string()
}

/// Session-scoped set of approved command signatures.
#[derive(Debug, Clone, Default)]
pub struct SessionApprovals {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SessionApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_approved(&self, command: &CommandDescriptor) -> bool {
        self.inner.lock().contains(&command_signature(command))
    }

    pub fn approve(&self, command: &CommandDescriptor) {
        self.inner.lock().insert(command_signature(command));
    }

    pub fn reset(&self) {
        self.inner.lock().clear();
    }
}

/// Where an automatic approval came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalSource {
    Allowlist,
    Session,
    Flag,
    HumanOnce,
    HumanSession,
}

/// Final gate decision for one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Approved(ApprovalSource),
    Rejected,
    /// Cancellation arrived while waiting on the human.
    Canceled,
}

/// Channel through which the gate asks a human for a decision. `None`
/// means the wait was canceled or the channel closed.
#[async_trait]
pub trait DecisionPrompt: Send + Sync {
    async fn ask(&self, prompt: &str, metadata: serde_json::Value) -> Option<String>;
}

/// The approval coordinator.
pub struct ApprovalManager {
    config: AllowlistConfig,
    session: SessionApprovals,
    auto_approve: bool,
    prompt: Option<Arc<dyn DecisionPrompt>>,
}

impl ApprovalManager {
    pub fn new(
        config: AllowlistConfig,
        session: SessionApprovals,
        auto_approve: bool,
        prompt: Option<Arc<dyn DecisionPrompt>>,
    ) -> Self {
        Self {
            config,
            session,
            auto_approve,
            prompt,
        }
    }

    pub fn session(&self) -> &SessionApprovals {
        &self.session
    }

    /// Check the automatic approval paths in order: allowlist, session,
    /// global flag.
    pub fn auto_approval(&self, command: &CommandDescriptor) -> Option<ApprovalSource> {
        if is_preapproved_command(command, &self.config) {
            return Some(ApprovalSource::Allowlist);
        }
        if self.session.is_approved(command) {
            return Some(ApprovalSource::Session);
        }
        if self.auto_approve {
            return Some(ApprovalSource::Flag);
        }
        None
    }

    fn build_prompt(command: &CommandDescriptor) -> String {
        format!(
            "Approve running this command?\n  {}\n  1) Yes (run once)\n  2) Yes, for entire session\n  3) No, tell the AI to do something else\nSelect 1, 2, or 3: ",
            command.run
        )
    }

    /// Decide whether the command may run, blocking on a human when no
    /// automatic path approves it.
    pub async fn decide(&self, command: &CommandDescriptor) -> GateDecision {
        if let Some(source) = self.auto_approval(command) {
            return GateDecision::Approved(source);
        }

        let Some(prompt) = self.prompt.as_ref() else {
            // Headless with auto-approve off: nobody can say yes.
            return GateDecision::Rejected;
        };

        let prompt_text = Self::build_prompt(command);
        let metadata = serde_json::json!({
            "scope": "approval",
            "command": command.run,
        });

        loop {
            let Some(answer) = prompt.ask(&prompt_text, metadata.clone()).await else {
                return GateDecision::Canceled;
            };

            match answer.trim().to_ascii_lowercase().as_str() {
                "1" | "y" | "yes" => return GateDecision::Approved(ApprovalSource::HumanOnce),
                "2" => {
                    self.session.approve(command);
                    return GateDecision::Approved(ApprovalSource::HumanSession);
                }
                "3" | "n" | "no" => return GateDecision::Rejected,
                _ => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(run: &str) -> CommandDescriptor {
        CommandDescriptor {
            run: run.to_string(),
            ..Default::default()
        }
    }

    fn config(entries: &[(&str, &[&str])]) -> AllowlistConfig {
        AllowlistConfig {
            allowlist: entries
                .iter()
                .map(|(name, subs)| AllowlistEntry {
                    name: name.to_string(),
                    subcommands: subs.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn allowlisted_base_is_preapproved() {
        let cfg = config(&[("ls", &[])]);
        assert!(is_preapproved_command(&command("ls -la"), &cfg));
        assert!(!is_preapproved_command(&command("rm -rf /"), &cfg));
    }

    #[test]
    fn ping_count_rule_applies_through_the_gate() {
        let cfg = config(&[("ping", &[])]);
        assert!(is_preapproved_command(&command("ping -c 2 host"), &cfg));
        assert!(!is_preapproved_command(&command("ping -c 5 host"), &cfg));
    }

    #[test]
    fn subcommand_restrictions_are_enforced() {
        let cfg = config(&[("git", &["status", "log"])]);
        assert!(is_preapproved_command(&command("git status"), &cfg));
        assert!(is_preapproved_command(&command("git -P log --oneline"), &cfg));
        assert!(!is_preapproved_command(&command("git push origin main"), &cfg));
    }

    #[test]
    fn interpreter_subcommands_reject_trailing_args() {
        let cfg = config(&[("python", &["--version"])]);
        // `--version` is a flag, so there is no non-flag subcommand token.
        assert!(!is_preapproved_command(&command("python --version extra"), &cfg));

        let cfg = config(&[("npm", &["ls"])]);
        assert!(is_preapproved_command(&command("npm ls"), &cfg));
        assert!(!is_preapproved_command(&command("npm ls package"), &cfg));
    }

    #[test]
    fn unsafe_strings_never_preapprove() {
        let cfg = config(&[("ls", &[])]);
        assert!(!is_preapproved_command(&command("ls && rm -rf /"), &cfg));
        assert!(!is_preapproved_command(&command("  "), &cfg));
    }

    #[test]
    fn non_posix_shell_is_rejected() {
        let cfg = config(&[("ls", &[])]);
        let mut cmd = command("ls");
        cmd.shell = Some("fish".to_string());
        assert!(!is_preapproved_command(&cmd, &cfg));

        cmd.shell = Some("bash".to_string());
        assert!(is_preapproved_command(&cmd, &cfg));
    }

    #[test]
    fn signature_defaults_shell_and_cwd() {
        let signature = command_signature(&command("echo hi"));
        let parsed: serde_json::Value = serde_json::from_str(&signature).unwrap();
        assert_eq!(parsed["shell"], "bash");
        assert_eq!(parsed["cwd"], ".");
        assert_eq!(parsed["run"], "echo hi");
    }

    #[test]
    fn session_approval_matches_identical_commands_only() {
        let session = SessionApprovals::new();
        session.approve(&command("echo hi"));

        assert!(session.is_approved(&command("echo hi")));
        assert!(!session.is_approved(&command("echo bye")));

        session.reset();
        assert!(!session.is_approved(&command("echo hi")));
    }

    #[test]
    fn malformed_allowlist_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approved_commands.json");
        std::fs::write(
            &path,
            r#"{"allowlist": [
                {"name": "ls"},
                {"subcommands": ["status"]},
                {"name": ""},
                "not-an-object",
                {"name": "git", "subcommands": ["status"]}
            ]}"#,
        )
        .unwrap();

        let cfg = AllowlistConfig::load(&path);
        assert_eq!(cfg.allowlist.len(), 2);
        assert_eq!(cfg.allowlist[0].name, "ls");
        assert_eq!(cfg.allowlist[1].name, "git");
    }

    #[test]
    fn missing_config_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AllowlistConfig::load(&dir.path().join("absent.json"));
        assert!(cfg.allowlist.is_empty());
    }

    struct ScriptedPrompt {
        answers: Mutex<Vec<Option<String>>>,
        asked: Mutex<usize>,
    }

    #[async_trait]
    impl DecisionPrompt for ScriptedPrompt {
        async fn ask(&self, _prompt: &str, _metadata: serde_json::Value) -> Option<String> {
            *self.asked.lock() += 1;
            self.answers.lock().remove(0)
        }
    }

    fn manager_with_prompt(answers: Vec<Option<&str>>) -> (ApprovalManager, Arc<ScriptedPrompt>) {
        let prompt = Arc::new(ScriptedPrompt {
            answers: Mutex::new(
                answers
                    .into_iter()
                    .map(|a| a.map(ToString::to_string))
                    .collect(),
            ),
            asked: Mutex::new(0),
        });
        let manager = ApprovalManager::new(
            AllowlistConfig::default(),
            SessionApprovals::new(),
            false,
            Some(prompt.clone() as Arc<dyn DecisionPrompt>),
        );
        (manager, prompt)
    }

    #[tokio::test]
    async fn unlisted_command_prompts_before_approval() {
        let (manager, prompt) = manager_with_prompt(vec![Some("1")]);
        let decision = manager.decide(&command("cargo fmt")).await;

        assert_eq!(decision, GateDecision::Approved(ApprovalSource::HumanOnce));
        assert_eq!(*prompt.asked.lock(), 1);
    }

    #[tokio::test]
    async fn session_answer_persists_for_identical_command() {
        let (manager, _prompt) = manager_with_prompt(vec![Some("2")]);
        let decision = manager.decide(&command("cargo fmt")).await;
        assert_eq!(
            decision,
            GateDecision::Approved(ApprovalSource::HumanSession)
        );

        // Second decision needs no prompt at all.
        assert_eq!(
            manager.auto_approval(&command("cargo fmt")),
            Some(ApprovalSource::Session)
        );
    }

    #[tokio::test]
    async fn rejection_and_cancellation_are_distinct() {
        let (manager, _) = manager_with_prompt(vec![Some("3")]);
        assert_eq!(manager.decide(&command("cargo fmt")).await, GateDecision::Rejected);

        let (manager, _) = manager_with_prompt(vec![None]);
        assert_eq!(manager.decide(&command("cargo fmt")).await, GateDecision::Canceled);
    }

    #[tokio::test]
    async fn garbled_answers_reprompt() {
        let (manager, prompt) = manager_with_prompt(vec![Some("maybe"), Some("yes")]);
        let decision = manager.decide(&command("cargo fmt")).await;

        assert_eq!(decision, GateDecision::Approved(ApprovalSource::HumanOnce));
        assert_eq!(*prompt.asked.lock(), 2);
    }

    #[tokio::test]
    async fn auto_approve_flag_skips_the_prompt() {
        let manager = ApprovalManager::new(
            AllowlistConfig::default(),
            SessionApprovals::new(),
            true,
            None,
        );
        assert_eq!(
            manager.decide(&command("cargo fmt")).await,
            GateDecision::Approved(ApprovalSource::Flag)
        );
    }
}
