//! Pass executor — the single canonical agent loop.
//!
//! One pass: compaction check → context usage → payload guard → model
//! call → response resolution → plan merge → approval-gated execution →
//! observations back into history. The runtime loops passes until the
//! plan is exhausted, a stop condition fires, or cancellation lands.
//!
//! The loop is single-flow: plan and history state are only ever touched
//! from here, so the engine needs no locking around them. Concurrency
//! enters only at the explicit suspension points (model call, approval
//! wait, process wait), each of which threads the cancellation token.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::approval::{AllowlistConfig, ApprovalManager, ApprovalSource, GateDecision};
use crate::cancel::CancellationRegistry;
use crate::events::{EventKind, EventQueue, RuntimeEmitter, RuntimeEvent, StatusLevel, ThinkingState};
use crate::exec::{build_rejection_observation, CommandRuntime, Observation};
use crate::history::{
    build_model_request, summarize_context_usage, HistoryCompactor, HistoryEntry, PayloadGuard,
};
use crate::model::ModelClient;
use crate::parser::{resolve_assistant_response, RecoveryStrategy, ResolutionOutcome};
use crate::plan::{
    merge_plan_trees, CommandDescriptor, CompletedStepRegistry, PlanProgress, PlanStateMachine,
    PlanStore,
};
use crate::{approval, paths};

use super::input::PromptCoordinator;

const DEFAULT_MAX_PASSES: u64 = 50;
const PLAN_REMINDER_AUTO_RESPONSE_LIMIT: u32 = 3;

const PLAN_PENDING_REMINDER: &str = "The plan is not completed: send a command to continue, \
update or reorder the remaining steps, or abandon the plan if there is no way forward.";

const REFUSAL_STATUS_MESSAGE: &str =
    "Assistant declined without a plan or command; nudging it to continue.";

const REFUSAL_AUTO_RESPONSE: &str = "No human is available right now. Continue with the task: \
propose a plan or a command, or say 'done' if everything is finished.";

/// Configuration for an agent run.
pub struct AgentConfig {
    pub model: String,
    pub system_prompt: String,
    pub auto_approve: bool,
    pub debug: bool,
    pub max_passes: u64,
    pub compaction_threshold: f64,
    pub agent_label: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: String::new(),
            auto_approve: false,
            debug: false,
            max_passes: DEFAULT_MAX_PASSES,
            compaction_threshold: 0.5,
            agent_label: None,
        }
    }
}

/// Shared services the runtime needs.
pub struct AgentServices {
    pub client: Arc<dyn ModelClient>,
    pub plan_store: Arc<dyn PlanStore>,
    pub allowlist: AllowlistConfig,
    pub stats_path: PathBuf,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Continue,
    Stop,
    Canceled,
}

pub struct AgentRuntime {
    config: AgentConfig,
    client: Arc<dyn ModelClient>,
    plan_store: Arc<dyn PlanStore>,
    queue: EventQueue<RuntimeEvent>,
    emitter: RuntimeEmitter,
    registry: CancellationRegistry,
    coordinator: PromptCoordinator,
    approvals: ApprovalManager,
    command_runtime: CommandRuntime,
    compactor: HistoryCompactor,
    payload_guard: PayloadGuard,
    state_machine: PlanStateMachine,
    history: Vec<HistoryEntry>,
    plan_reminder_count: u32,
}

impl AgentRuntime {
    pub fn new(services: AgentServices, config: AgentConfig) -> Self {
        let queue = EventQueue::new();
        let mut emitter = RuntimeEmitter::new(queue.clone()).with_debug(config.debug);
        if let Some(label) = &config.agent_label {
            emitter = emitter.with_agent_label(label.clone());
        }

        let registry = CancellationRegistry::new();
        let coordinator = PromptCoordinator::new(emitter.clone(), registry.clone());

        let approvals = ApprovalManager::new(
            services.allowlist,
            approval::SessionApprovals::new(),
            config.auto_approve,
            Some(Arc::new(coordinator.clone()) as Arc<dyn approval::DecisionPrompt>),
        );

        let command_runtime = CommandRuntime::new(
            registry.clone(),
            emitter.clone(),
            services.stats_path.clone(),
        );

        let compactor = HistoryCompactor::new(services.client.clone(), config.model.clone())
            .with_usage_threshold(config.compaction_threshold);

        Self {
            client: services.client,
            plan_store: services.plan_store,
            queue,
            emitter,
            registry,
            coordinator,
            approvals,
            command_runtime,
            compactor,
            payload_guard: PayloadGuard::new(paths::failsafe_dump_dir()),
            state_machine: PlanStateMachine::new(CompletedStepRegistry::new()),
            history: Vec::new(),
            plan_reminder_count: 0,
            config,
        }
    }

    /// Event stream for the front end.
    pub fn events(&self) -> EventQueue<RuntimeEvent> {
        self.queue.clone()
    }

    /// Input channel: the UI feeds prompt responses and cancel requests
    /// through this.
    pub fn prompts(&self) -> PromptCoordinator {
        self.coordinator.clone()
    }

    pub fn cancellation(&self) -> CancellationRegistry {
        self.registry.clone()
    }

    /// Run the agent loop to completion for one user request.
    pub async fn run(mut self, user_request: &str) {
        self.emitter.emit(EventKind::Banner {
            title: "hermit".to_string(),
            subtitle: Some(self.config.model.clone()),
        });

        self.history
            .push(HistoryEntry::chat("system", self.config.system_prompt.clone(), 0));
        self.history.push(HistoryEntry::chat("user", user_request, 0));

        // Pick up a plan the host persisted from an earlier run.
        match self.plan_store.load() {
            Ok(plan) if !plan.is_empty() => {
                self.state_machine.replace_active_plan(plan);
                self.state_machine.reset_mutation_flag();
            }
            Ok(_) => {}
            Err(err) => self.warn("Failed to load persisted plan snapshot.", &err.to_string()),
        }

        for pass_index in 1..=self.config.max_passes {
            match self.run_pass(pass_index).await {
                PassOutcome::Continue => continue,
                PassOutcome::Stop => break,
                PassOutcome::Canceled => {
                    self.emitter
                        .emit_status(StatusLevel::Warn, "Pass canceled by request.");
                    break;
                }
            }
        }

        self.coordinator.close();
        self.emitter.close();
    }

    fn warn(&self, message: &str, details: &str) {
        self.emitter
            .emit_status_with_details(StatusLevel::Warn, message, details.to_string());
    }

    fn emit_plan_events(&self) {
        self.emitter.emit(EventKind::Plan {
            plan: self.state_machine.clone_active_plan(),
        });
        self.emitter.emit(EventKind::PlanProgress {
            progress: PlanProgress::compute(
                self.state_machine.active_plan(),
                self.state_machine.registry(),
            ),
        });
    }

    fn persist_plan(&self) {
        if let Err(err) = self.plan_store.save(self.state_machine.active_plan()) {
            self.warn("Failed to persist plan state.", &err.to_string());
        }
    }

    fn plan_observation(&self) -> Observation {
        Observation {
            observation_for_llm: json!({
                "plan": self.state_machine.clone_active_plan(),
            }),
            observation_metadata: json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        }
    }

    /// Model call with cancellation threaded through; emits thinking
    /// start/stop around the suspension point.
    async fn request_completion(&mut self, pass_index: u64) -> Result<String, PassOutcome> {
        let request = build_model_request(&self.config.model, &self.history);
        let payload_size = PayloadGuard::estimate_payload_size(&request);

        if let Some(size) = payload_size {
            // Fatal by design when the payload ballooned between passes.
            self.payload_guard.enforce(size, &self.history, pass_index);
        }

        let operation = self.registry.register("model request");
        self.emitter.emit(EventKind::Thinking {
            state: ThinkingState::Start,
        });

        let completion = tokio::select! {
            completion = self.client.complete(request) => Some(completion),
            _ = operation.cancelled() => None,
        };

        self.emitter.emit(EventKind::Thinking {
            state: ThinkingState::Stop,
        });
        operation.unregister();

        match completion {
            None => Err(PassOutcome::Canceled),
            Some(Err(err)) => {
                self.emitter
                    .emit_error("Model request failed.", Some(err.to_string()));
                Err(PassOutcome::Stop)
            }
            Some(Ok(response)) => {
                if let Some(size) = payload_size {
                    self.payload_guard.record_transmitted(size);
                }
                Ok(response.content)
            }
        }
    }

    async fn run_pass(&mut self, pass_index: u64) -> PassOutcome {
        self.emitter.emit(EventKind::Pass { index: pass_index });

        self.compactor.compact_if_needed(&mut self.history).await;

        let usage = summarize_context_usage(&self.history, Some(&self.config.model));
        if usage.total.is_some() {
            self.emitter.emit(EventKind::ContextUsage { usage });
        }

        let content = match self.request_completion(pass_index).await {
            Ok(content) => content,
            Err(outcome) => return outcome,
        };

        if content.trim().is_empty() {
            self.emitter
                .emit_error("Model response contained no content.", None);
            return PassOutcome::Stop;
        }

        self.history
            .push(HistoryEntry::chat("assistant", content.clone(), pass_index));

        let payload = match resolve_assistant_response(&content) {
            ResolutionOutcome::Resolved { payload, strategy } => {
                if strategy != RecoveryStrategy::Direct {
                    self.emitter.emit_status(
                        StatusLevel::Info,
                        format!("Assistant JSON parsed after applying {} recovery.", strategy.label()),
                    );
                }
                payload
            }
            ResolutionOutcome::MissingContent => {
                self.emitter
                    .emit_error("Model response contained no content.", None);
                return PassOutcome::Stop;
            }
            ResolutionOutcome::ParseFailed { message, attempts } => {
                self.emitter.emit(EventKind::Error {
                    message: "LLM returned invalid JSON.".to_string(),
                    details: Some(message),
                    attempts: attempts
                        .iter()
                        .map(|attempt| serde_json::to_value(attempt).expect("attempt serializes"))
                        .collect(),
                });
                return PassOutcome::Continue;
            }
            ResolutionOutcome::SchemaFailed { errors } => {
                self.emitter.emit(EventKind::Error {
                    message: "Assistant response failed schema validation.".to_string(),
                    details: Some(errors.join(" ")),
                    attempts: Vec::new(),
                });
                return PassOutcome::Continue;
            }
        };

        self.emitter.emit_debug(|| {
            json!({
                "stage": "assistant-response",
                "message": payload.message,
                "has_plan": payload.plan.is_some(),
                "has_command": payload.command.is_some(),
            })
        });

        self.emitter.emit(EventKind::AssistantMessage {
            message: payload.message.clone(),
            is_final: true,
        });

        // ── Plan merge ─────────────────────────────────────────────────
        self.state_machine
            .set_initial_incoming_plan(payload.plan.clone());

        if let Some(incoming) = &payload.plan {
            let merged = merge_plan_trees(self.state_machine.active_plan(), incoming);
            // An identical delta is a no-op: no mutation, no re-persist.
            if merged.as_slice() != self.state_machine.active_plan() {
                self.state_machine.replace_active_plan(merged);
                self.state_machine.normalize_dependencies();
                self.persist_plan();
            }
        }

        self.emit_plan_events();

        // ── Execution ──────────────────────────────────────────────────
        let mut executed_any = false;

        while let Some(index) = self.state_machine.select_next_executable() {
            let command = self
                .state_machine
                .step(index)
                .and_then(|step| step.command.clone())
                .unwrap_or_default();

            match self.gate_and_execute(index, &command).await {
                StepResult::Executed => {
                    executed_any = true;
                }
                StepResult::Rejected => return PassOutcome::Continue,
                StepResult::Canceled => return PassOutcome::Canceled,
            }
        }

        if executed_any {
            self.state_machine.prune_completed_steps();
            self.emit_plan_events();
            self.persist_plan();

            let observation = self.plan_observation();
            self.history
                .push(HistoryEntry::observation(&observation, pass_index));
            self.plan_reminder_count = 0;
            return PassOutcome::Continue;
        }

        // No executable plan step: a bare top-level command still runs.
        if let Some(command) = payload.command.as_ref().filter(|c| c.has_payload()) {
            return self.execute_bare_command(command, pass_index).await;
        }

        self.handle_idle(&payload.message, pass_index)
    }

    /// Approval gate + execution + observation for one plan step.
    async fn gate_and_execute(&mut self, index: usize, command: &CommandDescriptor) -> StepResult {
        match self.approvals.decide(command).await {
            GateDecision::Rejected => {
                self.handle_command_rejection(Some(index));
                StepResult::Rejected
            }
            GateDecision::Canceled => StepResult::Canceled,
            GateDecision::Approved(source) => {
                match source {
                    ApprovalSource::HumanOnce => self
                        .emitter
                        .emit_status(StatusLevel::Info, "Command approved for single execution."),
                    ApprovalSource::HumanSession => self.emitter.emit_status(
                        StatusLevel::Info,
                        "Command approved for the remainder of the session.",
                    ),
                    _ => {}
                }

                self.state_machine.mark_command_running(index);
                self.emit_plan_events();
                self.persist_plan();

                let outcome = self.command_runtime.execute(command).await;
                self.emitter.emit_debug(|| {
                    json!({
                        "stage": "command-execution",
                        "run": command.run,
                        "exit_code": outcome.result.exit_code,
                        "killed": outcome.result.killed,
                    })
                });
                self.state_machine.apply_command_observation(
                    index,
                    outcome.observation.to_value(),
                    outcome.result.exit_code,
                    outcome.result.killed,
                );

                self.emit_plan_events();
                self.persist_plan();
                StepResult::Executed
            }
        }
    }

    /// One-off execution of the top-level command when the plan offers
    /// no executable step.
    async fn execute_bare_command(
        &mut self,
        command: &CommandDescriptor,
        pass_index: u64,
    ) -> PassOutcome {
        match self.approvals.decide(command).await {
            GateDecision::Rejected => {
                self.handle_command_rejection(None);
                PassOutcome::Continue
            }
            GateDecision::Canceled => PassOutcome::Canceled,
            GateDecision::Approved(_) => {
                let outcome = self.command_runtime.execute(command).await;
                self.history
                    .push(HistoryEntry::observation(&outcome.observation, pass_index));
                self.plan_reminder_count = 0;
                PassOutcome::Continue
            }
        }
    }

    /// A human declined the command: record the observation so the next
    /// pass knows it never ran, and reset the reminder counter.
    fn handle_command_rejection(&mut self, step_index: Option<usize>) {
        self.emitter.emit_status(
            StatusLevel::Warn,
            "Command execution canceled by human request.",
        );

        let rejection = build_rejection_observation();
        let pass = self.history.last().map(|entry| entry.pass).unwrap_or(0);

        match step_index {
            Some(index) => {
                self.state_machine
                    .attach_observation(index, rejection.to_value());
                self.persist_plan();
                let observation = self.plan_observation();
                self.history.push(HistoryEntry::observation(&observation, pass));
            }
            None => {
                self.history.push(HistoryEntry::observation(&rejection, pass));
            }
        }
        self.plan_reminder_count = 0;
    }

    /// No command ran and none is runnable: refusal nudge, plan-pending
    /// reminder, or stop-cleared.
    fn handle_idle(&mut self, message: &str, pass_index: u64) -> PassOutcome {
        let normalized = message.trim().to_lowercase();
        let active_plan_empty = self.state_machine.active_plan().is_empty();
        let incoming_plan_empty = self.state_machine.initial_incoming_plan_is_empty();

        if active_plan_empty && incoming_plan_empty && is_likely_refusal(&normalized) {
            self.emitter
                .emit_status(StatusLevel::Info, REFUSAL_STATUS_MESSAGE);
            self.history
                .push(HistoryEntry::chat("user", REFUSAL_AUTO_RESPONSE, pass_index));
            self.plan_reminder_count = 0;
            return PassOutcome::Continue;
        }

        let has_open_steps = self
            .state_machine
            .active_plan()
            .iter()
            .any(|step| !step.status.is_terminal());

        if has_open_steps {
            self.plan_reminder_count += 1;
            if self.plan_reminder_count <= PLAN_REMINDER_AUTO_RESPONSE_LIMIT {
                self.emitter
                    .emit_status(StatusLevel::Warn, PLAN_PENDING_REMINDER);
                self.history
                    .push(HistoryEntry::chat("user", PLAN_PENDING_REMINDER, pass_index));
                return PassOutcome::Continue;
            }
            // Stalled despite repeated reminders; defer to a human.
            return PassOutcome::Stop;
        }

        if !active_plan_empty {
            // Plan finished: wipe the snapshot so follow-ups start clean.
            self.state_machine.clear_active_plan();
            if let Err(err) = self.plan_store.reset() {
                self.warn(
                    "Failed to clear persistent plan state after completion.",
                    &err.to_string(),
                );
            }
            self.emit_plan_events();
        }

        self.plan_reminder_count = 0;
        PassOutcome::Stop
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepResult {
    Executed,
    Rejected,
    Canceled,
}

/// Natural-language refusal heuristic, applied only when the model sent
/// neither a plan nor a command.
fn is_likely_refusal(normalized_message: &str) -> bool {
    const REFUSAL_MARKERS: [&str; 6] = [
        "i can't",
        "i cannot",
        "i'm unable",
        "i am unable",
        "cannot help",
        "can't help",
    ];

    normalized_message.starts_with("sorry")
        || REFUSAL_MARKERS
            .iter()
            .any(|marker| normalized_message.contains(marker))
}
