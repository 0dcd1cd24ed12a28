//! Command execution runtime
//!
//! - `runner` - process-group shell execution with timeout + cancellation
//! - `observation` - filtered/truncated observations and render previews
//! - `stats` - persisted per-command usage counters
//! - `CommandRuntime` - the safe wrapper the pass executor calls: an
//!   execution never propagates an error upward, it degrades into a
//!   synthesized failed result plus a status event.

mod observation;
mod runner;
mod stats;

pub use observation::{
    build_cancellation_observation, build_observation, build_preview, build_rejection_observation,
    Observation,
};
pub use runner::run_command;
pub use stats::{increment_command_count, resolve_command_key};

use std::path::PathBuf;

use serde::Serialize;
use serde_json::json;

use crate::cancel::CancellationRegistry;
use crate::events::{EventKind, RuntimeEmitter, StatusLevel};
use crate::plan::CommandDescriptor;

/// Raw outcome of one process run.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub runtime_ms: u64,
    pub killed: bool,
}

/// Whether the process actually ran or the runtime synthesized a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Executed,
    Exception,
}

/// Everything the pass executor needs after a command finishes.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub result: CommandResult,
    pub observation: Observation,
    pub preview: serde_json::Value,
    pub execution: serde_json::Value,
}

pub struct CommandRuntime {
    registry: CancellationRegistry,
    emitter: RuntimeEmitter,
    stats_path: PathBuf,
}

impl CommandRuntime {
    pub fn new(
        registry: CancellationRegistry,
        emitter: RuntimeEmitter,
        stats_path: PathBuf,
    ) -> Self {
        Self {
            registry,
            emitter,
            stats_path,
        }
    }

    /// Execute one approved command. Spawn and IO failures become a
    /// synthesized failed result with the error in `stderr`; the pass
    /// loop keeps going either way.
    pub async fn execute(&self, command: &CommandDescriptor) -> ExecutionOutcome {
        let run = command.run.trim();
        let timeout_sec = command.timeout_sec();

        let execution = json!({
            "cwd": command.cwd.as_deref().unwrap_or("."),
            "timeout_sec": timeout_sec,
            "shell": command.shell.as_deref().unwrap_or("sh"),
        });

        let (status, result) = match run_command(
            run,
            command.cwd.as_deref(),
            timeout_sec,
            command.shell.as_deref(),
            &self.registry,
        )
        .await
        {
            Ok(result) => (ExecutionStatus::Executed, result),
            Err(err) => {
                self.emitter.emit_status_with_details(
                    StatusLevel::Error,
                    "Command execution failed before completion.",
                    err.to_string(),
                );
                (
                    ExecutionStatus::Exception,
                    CommandResult {
                        stdout: String::new(),
                        stderr: err.to_string(),
                        exit_code: Some(-1),
                        runtime_ms: 0,
                        killed: false,
                    },
                )
            }
        };

        self.record_stats(run);

        let (preview, observation) = build_observation(command, &result);

        self.emitter.emit(EventKind::CommandResult {
            command: serde_json::to_value(command).expect("command serializes"),
            result: serde_json::to_value(&result).expect("result serializes"),
            preview: preview.clone(),
            execution: execution.clone(),
        });

        ExecutionOutcome {
            status,
            result,
            observation,
            preview,
            execution,
        }
    }

    fn record_stats(&self, run: &str) {
        let key = resolve_command_key(run);
        if let Err(err) = increment_command_count(&key, &self.stats_path) {
            self.emitter.emit_status_with_details(
                StatusLevel::Warn,
                "Failed to record command usage statistics.",
                err.to_string(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQueue;

    fn runtime(dir: &std::path::Path) -> (CommandRuntime, EventQueue<crate::events::RuntimeEvent>) {
        let queue = EventQueue::new();
        let emitter = RuntimeEmitter::new(queue.clone());
        let runtime = CommandRuntime::new(
            CancellationRegistry::new(),
            emitter,
            dir.join("command-stats.json"),
        );
        (runtime, queue)
    }

    fn command(run: &str) -> CommandDescriptor {
        CommandDescriptor {
            run: run.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_run_emits_command_result() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, queue) = runtime(dir.path());

        let outcome = runtime.execute(&command("echo hello")).await;

        assert_eq!(outcome.status, ExecutionStatus::Executed);
        assert_eq!(outcome.result.exit_code, Some(0));
        assert_eq!(
            outcome.observation.observation_for_llm["stdout"],
            "hello\n"
        );

        let event = queue.next().await.unwrap();
        assert_eq!(event.kind_tag(), "command-result");
    }

    #[tokio::test]
    async fn execution_records_usage_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _queue) = runtime(dir.path());

        runtime.execute(&command("echo one")).await;
        runtime.execute(&command("echo two")).await;

        let raw = std::fs::read_to_string(dir.path().join("command-stats.json")).unwrap();
        let stats: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(stats["echo"], 2);
    }

    #[tokio::test]
    async fn stats_failure_is_warning_not_error() {
        let dir = tempfile::tempdir().unwrap();
        // A stats path whose parent is a file forces the write to fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let queue = EventQueue::new();
        let emitter = RuntimeEmitter::new(queue.clone());
        let runtime = CommandRuntime::new(
            CancellationRegistry::new(),
            emitter,
            blocker.join("stats.json"),
        );

        let outcome = runtime.execute(&command("echo fine")).await;
        assert_eq!(outcome.status, ExecutionStatus::Executed);

        let warning = queue.next().await.unwrap();
        let EventKind::Status { level, .. } = warning.kind else {
            panic!("expected status event");
        };
        assert_eq!(level, StatusLevel::Warn);
    }
}
