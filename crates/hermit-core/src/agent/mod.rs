//! Agent runtime
//!
//! - `AgentRuntime` - the pass loop: model call, response resolution,
//!   plan reconciliation, approval-gated execution, observations
//! - `PromptCoordinator` - human input channel (approvals, cancel)
//!
//! Front ends consume the [`crate::events::EventQueue`] returned by
//! `AgentRuntime::events` and feed decisions back through the
//! coordinator; the engine itself never renders anything.

mod input;
mod pass;

pub use input::PromptCoordinator;
pub use pass::{AgentConfig, AgentRuntime, AgentServices};
