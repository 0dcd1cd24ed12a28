//! Prompt coordination
//!
//! Bridges the runtime's need for human input (command approvals, free
//! text) with whichever UI feeds answers back. Responses arriving before
//! anyone asked are buffered; cancellation requests from the UI are
//! relayed to the cancellation registry.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::approval::DecisionPrompt;
use crate::cancel::CancellationRegistry;
use crate::events::{EventKind, RuntimeEmitter, StatusLevel};

struct CoordinatorState {
    buffered: VecDeque<String>,
    waiters: VecDeque<oneshot::Sender<String>>,
    closed: bool,
}

#[derive(Clone)]
pub struct PromptCoordinator {
    emitter: RuntimeEmitter,
    registry: CancellationRegistry,
    state: Arc<Mutex<CoordinatorState>>,
}

impl PromptCoordinator {
    pub fn new(emitter: RuntimeEmitter, registry: CancellationRegistry) -> Self {
        Self {
            emitter,
            registry,
            state: Arc::new(Mutex::new(CoordinatorState {
                buffered: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            })),
        }
    }

    /// Emit a `request-input` event and wait for the next response line.
    /// Returns `None` when the wait is canceled or the coordinator is
    /// closed.
    pub async fn request(&self, prompt: &str, metadata: serde_json::Value) -> Option<String> {
        self.emitter.emit(EventKind::RequestInput {
            prompt: prompt.to_string(),
            metadata,
        });

        let receiver = {
            let mut state = self.state.lock();
            if let Some(buffered) = state.buffered.pop_front() {
                return Some(buffered);
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        let operation = self.registry.register("await human decision");
        let answer = tokio::select! {
            answer = receiver => answer.ok(),
            _ = operation.cancelled() => None,
        };
        operation.unregister();
        answer
    }

    /// Deliver a response line from the UI, resolving the oldest waiter
    /// or buffering when nobody is waiting yet.
    pub fn handle_prompt(&self, value: impl Into<String>) {
        let mut value = value.into();
        loop {
            let waiter = {
                let mut state = self.state.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.buffered.push_back(value);
                        return;
                    }
                }
            };

            match waiter.send(value) {
                Ok(()) => return,
                // Abandoned waiter (canceled request): try the next one.
                Err(rejected) => value = rejected,
            }
        }
    }

    /// Relay a UI cancellation to the active operation.
    pub fn handle_cancel(&self, reason: Option<&str>) {
        self.registry.cancel(reason.or(Some("ui-cancel")));
        self.emitter
            .emit_status(StatusLevel::Warn, "Cancellation requested by UI.");
    }

    /// Stop accepting requests; pending waiters resolve to `None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.clear();
    }
}

#[async_trait]
impl DecisionPrompt for PromptCoordinator {
    async fn ask(&self, prompt: &str, metadata: serde_json::Value) -> Option<String> {
        self.request(prompt, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQueue;
    use std::time::Duration;

    fn coordinator() -> (PromptCoordinator, EventQueue<crate::events::RuntimeEvent>) {
        let queue = EventQueue::new();
        let emitter = RuntimeEmitter::new(queue.clone());
        (
            PromptCoordinator::new(emitter, CancellationRegistry::new()),
            queue,
        )
    }

    #[tokio::test]
    async fn buffered_response_resolves_immediately() {
        let (coordinator, queue) = coordinator();
        coordinator.handle_prompt("yes");

        let answer = coordinator.request("approve?", serde_json::json!({})).await;
        assert_eq!(answer.as_deref(), Some("yes"));

        let event = queue.next().await.unwrap();
        assert_eq!(event.kind_tag(), "request-input");
    }

    #[tokio::test]
    async fn late_response_resolves_pending_request() {
        let (coordinator, _queue) = coordinator();

        let waiter = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.request("approve?", serde_json::json!({})).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.handle_prompt("2");

        assert_eq!(waiter.await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn cancellation_resolves_request_to_none() {
        let (coordinator, _queue) = coordinator();

        let waiter = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.request("approve?", serde_json::json!({})).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.handle_cancel(None);

        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_coordinator_rejects_requests() {
        let (coordinator, _queue) = coordinator();
        coordinator.close();

        let answer = coordinator.request("approve?", serde_json::json!({})).await;
        assert_eq!(answer, None);
    }
}
