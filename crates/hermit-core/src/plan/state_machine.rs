//! Plan dependency state machine
//!
//! Owns the active plan between passes. All step mutation funnels through
//! the transition methods here so the mutation flag and the completed-step
//! registry stay consistent with what the plan array actually contains.
//!
//! Invariant: after any completion/prune cycle, no step's `waitingForId`
//! references an id of a step removed by completion-pruning — completion
//! strips the finished id from every other step's dependency list.

use serde_json::Value;

use super::{CompletedStepRegistry, PlanStep, StepStatus};

/// Outcome of applying a command observation to a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTransition {
    Completed,
    Failed,
    ObservationRecorded,
    Noop,
}

/// Result of a prune pass.
#[derive(Debug, Clone, Default)]
pub struct PruneOutcome {
    pub mutated: bool,
    pub removed_step_ids: Vec<String>,
}

pub struct PlanStateMachine {
    active_plan: Vec<PlanStep>,
    initial_incoming_plan: Option<Vec<PlanStep>>,
    mutated: bool,
    registry: CompletedStepRegistry,
}

impl PlanStateMachine {
    pub fn new(registry: CompletedStepRegistry) -> Self {
        Self {
            active_plan: Vec::new(),
            initial_incoming_plan: None,
            mutated: false,
            registry,
        }
    }

    pub fn active_plan(&self) -> &[PlanStep] {
        &self.active_plan
    }

    pub fn step(&self, index: usize) -> Option<&PlanStep> {
        self.active_plan.get(index)
    }

    pub fn registry(&self) -> &CompletedStepRegistry {
        &self.registry
    }

    pub fn is_mutated(&self) -> bool {
        self.mutated
    }

    pub fn reset_mutation_flag(&mut self) {
        self.mutated = false;
    }

    fn mark_mutated(&mut self) {
        self.mutated = true;
    }

    /// Remember the plan delta that opened the current pass; idle handling
    /// distinguishes "model sent nothing" from "model sent an empty plan".
    pub fn set_initial_incoming_plan(&mut self, plan: Option<Vec<PlanStep>>) {
        self.initial_incoming_plan = plan;
    }

    pub fn initial_incoming_plan_is_empty(&self) -> bool {
        self.initial_incoming_plan
            .as_ref()
            .map_or(true, |plan| plan.is_empty())
    }

    /// Adopt a plan wholesale (after merge or persistence reload).
    pub fn replace_active_plan(&mut self, plan: Vec<PlanStep>) {
        self.active_plan = plan;
        self.mark_mutated();
        if self.active_plan.is_empty() {
            self.registry.clear();
        }
    }

    /// Drop the whole plan and reset the completed-step registry.
    pub fn clear_active_plan(&mut self) {
        if !self.active_plan.is_empty() {
            self.active_plan.clear();
            self.mark_mutated();
        }
        self.registry.clear();
    }

    pub fn clone_active_plan(&self) -> Vec<PlanStep> {
        self.active_plan.clone()
    }

    /// Trim, string-coerce and dedupe every step's dependency list, and
    /// drop ids the registry already knows are completed. Duplicates and
    /// self-references arriving from the model are tolerated on input;
    /// this is where they collapse.
    pub fn normalize_dependencies(&mut self) -> bool {
        let registry = self.registry.clone();
        let mut mutated = false;

        for step in &mut self.active_plan {
            let sanitized = sanitize_dependencies(&step.waiting_for_id, &registry);
            if sanitized != step.waiting_for_id {
                step.waiting_for_id = sanitized;
                mutated = true;
            }
        }

        if mutated {
            self.mark_mutated();
        }
        mutated
    }

    /// Strip `step_id` from every step's dependency list.
    pub fn remove_dependency_references(&mut self, step_id: &str) -> bool {
        let target = step_id.trim();
        if target.is_empty() {
            return false;
        }

        let mut mutated = false;
        for step in &mut self.active_plan {
            let before = step.waiting_for_id.len();
            step.waiting_for_id.retain(|id| id.trim() != target);
            if step.waiting_for_id.len() != before {
                mutated = true;
            }
        }

        if mutated {
            self.mark_mutated();
        }
        mutated
    }

    /// `pending → running`. Surfaces that execution has started even when
    /// the model forgot to update the status itself.
    pub fn mark_command_running(&mut self, index: usize) -> bool {
        let Some(step) = self.active_plan.get_mut(index) else {
            return false;
        };
        step.status = StepStatus::Running;
        self.mark_mutated();
        true
    }

    pub fn attach_observation(&mut self, index: usize, observation: Value) -> bool {
        let Some(step) = self.active_plan.get_mut(index) else {
            return false;
        };
        step.observation = Some(observation);
        self.mark_mutated();
        true
    }

    /// Mark a step completed, record its id in the registry, and clean
    /// dependency references across the plan.
    pub fn complete_plan_step(&mut self, index: usize) -> bool {
        let identifier = {
            let Some(step) = self.active_plan.get_mut(index) else {
                return false;
            };
            step.status = StepStatus::Completed;
            step.explicit_identifier()
        };
        self.mark_mutated();

        match identifier {
            Some(id) => {
                self.registry.mark_completed(&id);
                self.remove_dependency_references(&id);
            }
            None => {
                self.normalize_dependencies();
            }
        }
        true
    }

    /// Record a command observation and transition the step according to
    /// the exit code: `running → completed` iff the command exited 0,
    /// `running → failed` on any other exit code. A killed command drops
    /// the step's executable payload so the next pass waits for the model
    /// to acknowledge the interruption instead of retrying in a loop.
    pub fn apply_command_observation(
        &mut self,
        index: usize,
        observation: Value,
        exit_code: Option<i32>,
        killed: bool,
    ) -> CommandTransition {
        let mut recorded = self.attach_observation(index, observation);

        match exit_code {
            Some(0) => {
                self.complete_plan_step(index);
                return CommandTransition::Completed;
            }
            Some(_) => {
                if let Some(step) = self.active_plan.get_mut(index) {
                    step.status = StepStatus::Failed;
                    self.mark_mutated();
                    return CommandTransition::Failed;
                }
            }
            None => {}
        }

        if killed {
            if let Some(step) = self.active_plan.get_mut(index) {
                if step.command.take().is_some() {
                    self.mark_mutated();
                    recorded = true;
                }
            }
        }

        if recorded {
            CommandTransition::ObservationRecorded
        } else {
            CommandTransition::Noop
        }
    }

    /// Remove all completed steps from the active plan, feeding their ids
    /// into the registry and cleaning dependency references.
    pub fn prune_completed_steps(&mut self) -> PruneOutcome {
        if self.active_plan.is_empty() {
            return PruneOutcome::default();
        }

        let mut removed_step_ids = Vec::new();
        let before = self.active_plan.len();

        self.active_plan.retain(|step| {
            if step.status != StepStatus::Completed {
                return true;
            }
            if let Some(id) = step.explicit_identifier() {
                removed_step_ids.push(id);
            }
            false
        });

        let mutated = self.active_plan.len() != before;
        if mutated {
            self.mark_mutated();
        }

        for id in &removed_step_ids {
            self.registry.mark_completed(id);
            self.remove_dependency_references(id);
        }

        PruneOutcome {
            mutated,
            removed_step_ids,
        }
    }

    /// True iff some `pending` step has every dependency satisfied — each
    /// referenced id resolves to a completed step (active or pruned) — or
    /// references nothing.
    pub fn has_pending_executable_work(&self) -> bool {
        self.active_plan
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .filter(|step| step.has_command_payload())
            .any(|step| self.dependencies_satisfied(step))
    }

    /// Deterministic choice of the next runnable step: lowest priority
    /// value first, stable tie-break by original order.
    pub fn select_next_executable(&mut self) -> Option<usize> {
        self.normalize_dependencies();

        let mut best: Option<(f64, usize)> = None;
        for (index, step) in self.active_plan.iter().enumerate() {
            if step.status.is_terminal()
                || !step.has_command_payload()
                || !self.dependencies_satisfied(step)
            {
                continue;
            }

            let score = step.priority_score();
            match best {
                Some((best_score, _)) if best_score <= score => {}
                _ => best = Some((score, index)),
            }
        }

        best.map(|(_, index)| index)
    }

    fn dependencies_satisfied(&self, step: &PlanStep) -> bool {
        step.waiting_for_id.iter().all(|raw| {
            let id = raw.trim();
            if id.is_empty() {
                return true;
            }
            if self.registry.contains(id) {
                return true;
            }
            self.active_plan.iter().enumerate().any(|(index, other)| {
                other.status == StepStatus::Completed && other.identifier(index) == id
            })
        })
    }
}

fn sanitize_dependencies(raw: &[String], registry: &CompletedStepRegistry) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut sanitized = Vec::new();

    for candidate in raw {
        let id = candidate.trim();
        if id.is_empty() || registry.contains(id) {
            continue;
        }
        if seen.insert(id.to_string()) {
            sanitized.push(id.to_string());
        }
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str) -> PlanStep {
        PlanStep {
            id: Some(id.to_string()),
            command: Some(super::super::CommandDescriptor {
                run: format!("echo {id}"),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn machine_with(steps: Vec<PlanStep>) -> PlanStateMachine {
        let mut machine = PlanStateMachine::new(CompletedStepRegistry::new());
        machine.replace_active_plan(steps);
        machine.reset_mutation_flag();
        machine
    }

    #[test]
    fn prune_removes_completed_and_cleans_references() {
        let mut a = step("a");
        a.status = StepStatus::Completed;
        let mut b = step("b");
        b.waiting_for_id = vec!["a".to_string()];

        let mut machine = machine_with(vec![a, b]);
        let outcome = machine.prune_completed_steps();

        assert!(outcome.mutated);
        assert_eq!(outcome.removed_step_ids, vec!["a".to_string()]);
        assert_eq!(machine.active_plan().len(), 1);
        assert_eq!(machine.active_plan()[0].id.as_deref(), Some("b"));
        assert!(machine.active_plan()[0].waiting_for_id.is_empty());
        assert!(machine.registry().contains("a"));
    }

    #[test]
    fn dependency_integrity_after_completion_cycles() {
        let mut blocked = step("c");
        blocked.waiting_for_id = vec!["a".to_string(), "b".to_string()];
        let mut machine = machine_with(vec![step("a"), step("b"), blocked]);

        machine.complete_plan_step(0);
        machine.prune_completed_steps();
        machine.complete_plan_step(0); // "b" shifted to the front
        machine.prune_completed_steps();

        // No dependency may reference an id outside active plan + registry.
        for step in machine.active_plan() {
            for dep in &step.waiting_for_id {
                let in_registry = machine.registry().contains(dep);
                let in_plan = machine
                    .active_plan()
                    .iter()
                    .enumerate()
                    .any(|(i, s)| s.identifier(i) == *dep);
                assert!(in_registry || in_plan, "dangling dependency {dep}");
            }
        }
        assert!(machine.active_plan()[0].waiting_for_id.is_empty());
    }

    #[test]
    fn observation_with_zero_exit_completes_step() {
        let mut machine = machine_with(vec![step("a")]);
        machine.mark_command_running(0);
        assert_eq!(machine.active_plan()[0].status, StepStatus::Running);

        let transition = machine.apply_command_observation(
            0,
            serde_json::json!({"exit_code": 0}),
            Some(0),
            false,
        );
        assert_eq!(transition, CommandTransition::Completed);
        assert_eq!(machine.active_plan()[0].status, StepStatus::Completed);
        assert!(machine.registry().contains("a"));
    }

    #[test]
    fn observation_with_nonzero_exit_fails_step() {
        let mut machine = machine_with(vec![step("a")]);
        machine.mark_command_running(0);

        let transition =
            machine.apply_command_observation(0, serde_json::json!({}), Some(2), false);
        assert_eq!(transition, CommandTransition::Failed);
        assert_eq!(machine.active_plan()[0].status, StepStatus::Failed);
    }

    #[test]
    fn killed_command_drops_executable_payload() {
        let mut machine = machine_with(vec![step("a")]);
        machine.mark_command_running(0);

        let transition = machine.apply_command_observation(0, serde_json::json!({}), None, true);
        assert_eq!(transition, CommandTransition::ObservationRecorded);
        assert!(machine.active_plan()[0].command.is_none());
        assert_eq!(machine.active_plan()[0].status, StepStatus::Running);
    }

    #[test]
    fn selection_prefers_lowest_priority_then_order() {
        let mut first = step("a");
        first.priority = Some(5.0);
        let mut second = step("b");
        second.priority = Some(1.0);
        let mut third = step("c");
        third.priority = Some(1.0);

        let mut machine = machine_with(vec![first, second, third]);
        assert_eq!(machine.select_next_executable(), Some(1));
    }

    #[test]
    fn selection_skips_blocked_and_terminal_steps() {
        let mut blocked = step("a");
        blocked.waiting_for_id = vec!["x".to_string()];
        let mut done = step("b");
        done.status = StepStatus::Failed;
        let runnable = step("c");

        let mut machine = machine_with(vec![blocked, done, runnable]);
        assert_eq!(machine.select_next_executable(), Some(2));
    }

    #[test]
    fn dependencies_on_registry_completed_steps_are_satisfied() {
        let mut blocked = step("b");
        blocked.waiting_for_id = vec!["a".to_string()];
        let mut machine = machine_with(vec![blocked]);
        machine.registry().mark_completed("a");

        assert!(machine.has_pending_executable_work());
        assert_eq!(machine.select_next_executable(), Some(0));
        // Normalization consumed the satisfied reference.
        assert!(machine.active_plan()[0].waiting_for_id.is_empty());
    }

    #[test]
    fn duplicate_and_self_references_are_tolerated() {
        let mut looped = step("a");
        looped.waiting_for_id = vec!["a".to_string(), "a".to_string(), " ".to_string()];
        let mut machine = machine_with(vec![looped]);

        machine.normalize_dependencies();
        assert_eq!(machine.active_plan()[0].waiting_for_id, vec!["a".to_string()]);
        assert!(!machine.has_pending_executable_work());
    }

    #[test]
    fn clearing_plan_resets_registry() {
        let mut machine = machine_with(vec![step("a")]);
        machine.complete_plan_step(0);
        assert!(!machine.registry().is_empty());

        machine.clear_active_plan();
        assert!(machine.registry().is_empty());
        assert!(machine.active_plan().is_empty());
    }
}
