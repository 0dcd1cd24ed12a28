//! Plan delta merging
//!
//! Reconciles the plan a new pass proposes with the plan already in
//! flight. Existing steps keep their identity (status, execution history)
//! while absorbing the incoming step's metadata; brand-new steps join as
//! `pending`; an incoming `abandoned` status retires the matched step.

use super::{PlanStep, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MergeKey {
    Id(String),
    Title(String),
    Index(usize),
}

fn merge_key(step: &PlanStep, index: usize) -> MergeKey {
    if let Some(id) = step.explicit_identifier() {
        return MergeKey::Id(id.to_lowercase());
    }
    if let Some(title) = step
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
    {
        return MergeKey::Title(title.to_lowercase());
    }
    MergeKey::Index(index)
}

/// Merge one matched pair. Returns `None` when the incoming delta
/// abandons the step.
fn merge_step(mut existing: PlanStep, incoming: &PlanStep) -> Option<PlanStep> {
    if incoming.status == StepStatus::Abandoned {
        return None;
    }

    existing.waiting_for_id = incoming.waiting_for_id.clone();

    if incoming.title.is_some() {
        existing.title = incoming.title.clone();
    }
    if incoming.priority.is_some() {
        existing.priority = incoming.priority;
    }
    if incoming.observation.is_some() {
        existing.observation = incoming.observation.clone();
    }

    // The command only moves when it actually changed, and never from a
    // delta that claims the step is already done.
    let allow_command_update = incoming.status != StepStatus::Completed;
    if allow_command_update {
        if let Some(incoming_command) = &incoming.command {
            let changed = existing.command.as_ref() != Some(incoming_command);
            if changed {
                existing.command = Some(incoming_command.clone());
                // A new command on a dead step revives it.
                if matches!(existing.status, StepStatus::Failed | StepStatus::Abandoned) {
                    existing.status = StepStatus::Pending;
                }
            }
        }
    }

    Some(existing)
}

/// Merge an incoming plan delta against the existing plan.
///
/// Matching is by id (case-insensitive), falling back to normalized
/// title, falling back to positional index. Unmatched incoming steps
/// join as `pending` (unless already abandoned); unmatched existing steps
/// are preserved as still-active. An empty incoming plan clears
/// everything — the caller is expected to reset the completed-step
/// registry alongside.
pub fn merge_plan_trees(existing: &[PlanStep], incoming: &[PlanStep]) -> Vec<PlanStep> {
    if incoming.is_empty() {
        return Vec::new();
    }

    let mut existing_by_key = std::collections::HashMap::new();
    for (index, step) in existing.iter().enumerate() {
        existing_by_key.insert(merge_key(step, index), index);
    }

    let mut used = vec![false; existing.len()];
    let mut result = Vec::with_capacity(existing.len().max(incoming.len()));

    for (index, step) in incoming.iter().enumerate() {
        let key = merge_key(step, index);
        if let Some(&existing_index) = existing_by_key.get(&key) {
            used[existing_index] = true;
            if let Some(merged) = merge_step(existing[existing_index].clone(), step) {
                result.push(merged);
            }
        } else if step.status != StepStatus::Abandoned {
            let mut fresh = step.clone();
            fresh.status = StepStatus::Pending;
            result.push(fresh);
        }
    }

    for (index, step) in existing.iter().enumerate() {
        if !used[index] {
            result.push(step.clone());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CommandDescriptor;

    fn step(id: &str, status: StepStatus) -> PlanStep {
        PlanStep {
            id: Some(id.to_string()),
            title: Some(format!("step {id}")),
            status,
            command: Some(CommandDescriptor {
                run: format!("echo {id}"),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn identical_merge_is_stable() {
        let existing = vec![step("a", StepStatus::Running), step("b", StepStatus::Pending)];
        let incoming = existing.clone();

        let merged = merge_plan_trees(&existing, &incoming);
        assert_eq!(merged, existing);
    }

    #[test]
    fn empty_incoming_clears_plan() {
        let existing = vec![step("a", StepStatus::Pending)];
        assert!(merge_plan_trees(&existing, &[]).is_empty());
    }

    #[test]
    fn matched_step_keeps_status_but_absorbs_metadata() {
        let existing = vec![step("a", StepStatus::Running)];
        let mut incoming = step("a", StepStatus::Pending);
        incoming.title = Some("renamed".to_string());
        incoming.priority = Some(2.0);
        incoming.waiting_for_id = vec!["z".to_string()];

        let merged = merge_plan_trees(&existing, &[incoming]);
        assert_eq!(merged[0].status, StepStatus::Running);
        assert_eq!(merged[0].title.as_deref(), Some("renamed"));
        assert_eq!(merged[0].priority, Some(2.0));
        assert_eq!(merged[0].waiting_for_id, vec!["z".to_string()]);
    }

    #[test]
    fn changed_command_revives_failed_step() {
        let existing = vec![step("a", StepStatus::Failed)];
        let mut incoming = step("a", StepStatus::Failed);
        incoming.command = Some(CommandDescriptor {
            run: "echo retry".to_string(),
            ..Default::default()
        });

        let merged = merge_plan_trees(&existing, &[incoming]);
        assert_eq!(merged[0].status, StepStatus::Pending);
        assert_eq!(merged[0].command.as_ref().unwrap().run, "echo retry");
    }

    #[test]
    fn completed_incoming_never_overwrites_command() {
        let existing = vec![step("a", StepStatus::Running)];
        let mut incoming = step("a", StepStatus::Completed);
        incoming.command = Some(CommandDescriptor {
            run: "echo replaced".to_string(),
            ..Default::default()
        });

        let merged = merge_plan_trees(&existing, &[incoming]);
        assert_eq!(merged[0].command.as_ref().unwrap().run, "echo a");
    }

    #[test]
    fn abandoned_incoming_removes_matched_step() {
        let existing = vec![step("a", StepStatus::Pending), step("b", StepStatus::Pending)];
        let incoming = vec![step("a", StepStatus::Abandoned), step("b", StepStatus::Pending)];

        let merged = merge_plan_trees(&existing, &incoming);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id.as_deref(), Some("b"));
    }

    #[test]
    fn unmatched_incoming_becomes_pending() {
        let existing = vec![step("a", StepStatus::Running)];
        let incoming = vec![step("a", StepStatus::Running), step("b", StepStatus::Completed)];

        let merged = merge_plan_trees(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].status, StepStatus::Pending);
    }

    #[test]
    fn unmatched_existing_is_preserved() {
        let existing = vec![step("a", StepStatus::Running), step("b", StepStatus::Pending)];
        let incoming = vec![step("a", StepStatus::Running)];

        let merged = merge_plan_trees(&existing, &incoming);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].id.as_deref(), Some("b"));
    }

    #[test]
    fn title_matching_when_ids_are_missing() {
        let mut existing_step = step("x", StepStatus::Running);
        existing_step.id = None;
        existing_step.title = Some("Build the crate".to_string());

        let mut incoming_step = existing_step.clone();
        incoming_step.status = StepStatus::Pending;
        incoming_step.title = Some("  build the CRATE ".to_string());

        let merged = merge_plan_trees(
            std::slice::from_ref(&existing_step),
            std::slice::from_ref(&incoming_step),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, StepStatus::Running);
    }
}
