//! Core library for Hermit - an autonomous coding-agent runtime.
//!
//! The engine drives repeated passes: the model proposes a message, a
//! plan delta, and at most one command; the runtime validates the
//! proposal, reconciles it into the plan state machine, gates execution
//! behind the approval policy, runs the command safely, and feeds the
//! observation back into history — streaming typed events to whatever
//! front end is attached.
//!
//! Out of scope by design: rendering, transport framing, CLI parsing,
//! and the model HTTP client (consumed behind [`model::ModelClient`]).

pub mod agent;
pub mod approval;
pub mod cancel;
pub mod events;
pub mod exec;
pub mod history;
pub mod model;
pub mod parser;
pub mod paths;
pub mod plan;

pub use agent::{AgentConfig, AgentRuntime, AgentServices, PromptCoordinator};
pub use cancel::{CancellationHandle, CancellationRegistry};
pub use events::{EventKind, EventQueue, RuntimeEmitter, RuntimeEvent, StatusLevel};
pub use model::{ModelClient, ModelMessage, ModelRequest, ModelResponse};
pub use plan::{CommandDescriptor, PlanStep, StepStatus};
