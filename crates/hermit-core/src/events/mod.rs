//! Canonical event protocol for the agent runtime.
//!
//! `RuntimeEvent` is the single source of truth for everything the pass
//! executor emits. Transport layers (terminal, web socket) consume these
//! events and map them to their own presentation format.
//!
//! Every payload is an owned, serializable value: consumers can never
//! reach back into engine state through an event, and serialization of an
//! emitted event cannot fail.

mod emitter;
mod queue;

pub use emitter::RuntimeEmitter;
pub use queue::EventQueue;

use serde::Serialize;

use crate::history::ContextUsage;
use crate::plan::{PlanProgress, PlanStep};

/// Severity attached to `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

/// Events emitted by the agent runtime.
///
/// Each variant represents a discrete state change in the pass loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    /// Runtime banner shown once at startup.
    Banner {
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        subtitle: Option<String>,
    },

    /// Informational / warning / error status line.
    Status {
        level: StatusLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// A new pass has started.
    Pass { index: u64 },

    /// Model request started or finished ("start" / "stop").
    Thinking { state: ThinkingState },

    /// Validated assistant message for display.
    AssistantMessage {
        message: String,
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// Snapshot of the active plan.
    Plan { plan: Vec<PlanStep> },

    /// Completion ratio over the active plan plus completed registry.
    PlanProgress { progress: PlanProgress },

    /// Estimated context-window usage for this pass.
    ContextUsage { usage: ContextUsage },

    /// A command finished (or failed) executing.
    CommandResult {
        command: serde_json::Value,
        result: serde_json::Value,
        preview: serde_json::Value,
        execution: serde_json::Value,
    },

    /// Recoverable error surfaced to the user.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        attempts: Vec<serde_json::Value>,
    },

    /// The runtime is blocked on human input.
    RequestInput {
        prompt: String,
        metadata: serde_json::Value,
    },

    /// Diagnostic payload, emitted only when debug mode is enabled.
    Debug { payload: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingState {
    Start,
    Stop,
}

/// Envelope around an [`EventKind`] carrying the internally assigned
/// monotonic id and an optional originating-agent label.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEvent {
    #[serde(rename = "__id")]
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RuntimeEvent {
    /// Convenience accessor for the serde tag of the inner event.
    pub fn kind_tag(&self) -> &'static str {
        match self.kind {
            EventKind::Banner { .. } => "banner",
            EventKind::Status { .. } => "status",
            EventKind::Pass { .. } => "pass",
            EventKind::Thinking { .. } => "thinking",
            EventKind::AssistantMessage { .. } => "assistant-message",
            EventKind::Plan { .. } => "plan",
            EventKind::PlanProgress { .. } => "plan-progress",
            EventKind::ContextUsage { .. } => "context-usage",
            EventKind::CommandResult { .. } => "command-result",
            EventKind::Error { .. } => "error",
            EventKind::RequestInput { .. } => "request-input",
            EventKind::Debug { .. } => "debug",
        }
    }
}
