//! Plan data model and dependency engine
//!
//! - `PlanStep` / `StepStatus` / `CommandDescriptor` - the shared data model
//! - `PlanStateMachine` - status transitions, pruning, executable selection
//! - `merge` - reconciling an incoming plan delta with the active plan
//! - `CompletedStepRegistry` - process-wide record of finished step ids
//! - `PlanStore` - flat JSON snapshot persistence between passes

mod merge;
mod registry;
mod state_machine;
mod store;

pub use merge::merge_plan_trees;
pub use registry::CompletedStepRegistry;
pub use state_machine::{CommandTransition, PlanStateMachine, PruneOutcome};
pub use store::{FilePlanStore, PlanStore};

use serde::{Deserialize, Deserializer, Serialize};

/// Bytes of combined stdout/stderr a command may feed back to the model
/// before truncation applies.
pub const DEFAULT_COMMAND_MAX_BYTES: u64 = 65_536;

/// Seconds a command may run when the model does not set `timeout_sec`.
pub const DEFAULT_COMMAND_TIMEOUT_SEC: u64 = 60;

/// Lifecycle of a plan step.
///
/// `pending → running → {completed | failed}`; `abandoned` is terminal and
/// assignable directly by an incoming delta. Unknown strings fold to
/// `pending` so a loosely-typed upstream cannot wedge the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Abandoned,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Abandoned)
    }

    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "abandoned" => Self::Abandoned,
            _ => Self::Pending,
        }
    }
}

impl<'de> Deserialize<'de> for StepStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .map(Self::parse_lenient)
            .unwrap_or_default())
    }
}

/// Canonical shape of a runnable command, normalized from the loose
/// string / array / nested-object forms the model produces.
///
/// Immutable once attached to a step's execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    #[serde(default)]
    pub run: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail_lines: Option<u64>,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_max_bytes() -> u64 {
    DEFAULT_COMMAND_MAX_BYTES
}

impl Default for CommandDescriptor {
    fn default() -> Self {
        Self {
            run: String::new(),
            shell: None,
            cwd: None,
            timeout_sec: None,
            filter_regex: None,
            tail_lines: None,
            max_bytes: DEFAULT_COMMAND_MAX_BYTES,
        }
    }
}

impl CommandDescriptor {
    /// Whether there is anything to execute. A blank `run` is treated as
    /// no command at all.
    pub fn has_payload(&self) -> bool {
        !self.run.trim().is_empty()
            || self
                .shell
                .as_deref()
                .is_some_and(|shell| !shell.trim().is_empty())
    }

    pub fn timeout_sec(&self) -> u64 {
        self.timeout_sec.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SEC)
    }
}

/// One unit of work in the plan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(rename = "waitingForId", default, skip_serializing_if = "Vec::is_empty")]
    pub waiting_for_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
}

impl PlanStep {
    /// Normalized identifier, falling back to the positional form used
    /// when the model omitted an id.
    pub fn identifier(&self, index: usize) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("index:{index}"),
        }
    }

    /// Identifier without the positional fallback.
    pub fn explicit_identifier(&self) -> Option<String> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string)
    }

    pub fn has_command_payload(&self) -> bool {
        self.command
            .as_ref()
            .is_some_and(CommandDescriptor::has_payload)
    }

    /// Effective priority for executable selection; steps without one
    /// sort after every prioritized step.
    pub fn priority_score(&self) -> f64 {
        self.priority.filter(|p| p.is_finite()).unwrap_or(f64::INFINITY)
    }
}

/// Completion ratio over the session's plan, including steps that were
/// already pruned after completing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlanProgress {
    pub completed_steps: usize,
    pub total_steps: usize,
    pub ratio: f64,
}

impl PlanProgress {
    pub fn compute(active: &[PlanStep], registry: &CompletedStepRegistry) -> Self {
        let pruned_completed = registry.len();
        let active_completed = active
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .filter(|step| {
                step.explicit_identifier()
                    .map_or(true, |id| !registry.contains(&id))
            })
            .count();

        let completed_steps = pruned_completed + active_completed;
        let active_open = active
            .iter()
            .filter(|step| step.status != StepStatus::Completed)
            .count();
        let total_steps = completed_steps + active_open;

        let ratio = if total_steps == 0 {
            0.0
        } else {
            completed_steps as f64 / total_steps as f64
        };

        Self {
            completed_steps,
            total_steps,
            ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_folds_to_pending() {
        assert_eq!(StepStatus::parse_lenient("in-progress"), StepStatus::Pending);
        assert_eq!(StepStatus::parse_lenient(" COMPLETED "), StepStatus::Completed);

        let step: PlanStep =
            serde_json::from_value(serde_json::json!({"id": "a", "status": "wat"})).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn blank_run_has_no_payload() {
        let command = CommandDescriptor {
            run: "   ".to_string(),
            ..Default::default()
        };
        assert!(!command.has_payload());

        let command = CommandDescriptor {
            run: "echo hi".to_string(),
            ..Default::default()
        };
        assert!(command.has_payload());
    }

    #[test]
    fn identifier_falls_back_to_position() {
        let step = PlanStep::default();
        assert_eq!(step.identifier(3), "index:3");

        let step = PlanStep {
            id: Some("  build  ".to_string()),
            ..Default::default()
        };
        assert_eq!(step.identifier(0), "build");
    }

    #[test]
    fn progress_counts_pruned_and_active() {
        let registry = CompletedStepRegistry::new();
        registry.mark_completed("a");

        let active = vec![
            PlanStep {
                id: Some("b".to_string()),
                ..Default::default()
            },
            PlanStep {
                id: Some("c".to_string()),
                status: StepStatus::Completed,
                ..Default::default()
            },
        ];

        let progress = PlanProgress::compute(&active, &registry);
        assert_eq!(progress.completed_steps, 2);
        assert_eq!(progress.total_steps, 3);
        assert!((progress.ratio - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
