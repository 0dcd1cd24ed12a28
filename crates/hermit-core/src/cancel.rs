//! Cancellation registry
//!
//! A LIFO stack of cancellable operations shared across the runtime.
//! A cancel request (e.g. an interactive escape key) targets only the
//! top-of-stack entry, so nested operations — a shell command launched
//! while a model request is suspended — cancel independently of the
//! entries below them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

type CancelCallback = Box<dyn FnOnce(Option<&str>) + Send + 'static>;

struct EntryState {
    description: String,
    cancel_fn: Option<CancelCallback>,
    canceled: bool,
    reason: Option<String>,
    removed: bool,
}

struct Entry {
    token: u64,
    notify: Notify,
    state: Mutex<EntryState>,
}

impl Entry {
    /// Mark the entry canceled, invoking its callback exactly once.
    /// Returns false if the entry was already canceled.
    fn mark_canceled(self: &Arc<Self>, reason: Option<&str>) -> bool {
        let callback = {
            let mut state = self.state.lock();
            if state.canceled {
                return false;
            }
            state.canceled = true;
            state.reason = reason.map(ToString::to_string);
            state.cancel_fn.take()
        };

        if let Some(callback) = callback {
            callback(reason);
        }

        self.notify.notify_waiters();
        true
    }
}

#[derive(Default)]
struct RegistryState {
    stack: Vec<Arc<Entry>>,
    next_token: u64,
}

/// Process-scoped stack of cancellable operations.
///
/// Cloning is cheap and shares the underlying stack, so the registry can
/// be handed to the UI thread that receives cancel requests while the
/// orchestration flow registers operations.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a new cancellable operation onto the stack.
    ///
    /// The returned handle unregisters the entry on drop; completed
    /// operations therefore clean up without an explicit call.
    pub fn register(&self, description: impl Into<String>) -> CancellationHandle {
        let entry = {
            let mut state = self.inner.lock();
            state.next_token += 1;
            let entry = Arc::new(Entry {
                token: state.next_token,
                notify: Notify::new(),
                state: Mutex::new(EntryState {
                    description: description.into(),
                    cancel_fn: None,
                    canceled: false,
                    reason: None,
                    removed: false,
                }),
            });
            state.stack.push(Arc::clone(&entry));
            entry
        };

        CancellationHandle {
            entry,
            registry: self.clone(),
        }
    }

    /// Cancel the active (top-of-stack) operation.
    ///
    /// Returns false when no operation is registered — a second cancel
    /// request after the stack drained is a no-op.
    pub fn cancel(&self, reason: Option<&str>) -> bool {
        let entry = {
            let mut state = self.inner.lock();
            match state.stack.pop() {
                Some(entry) => {
                    entry.state.lock().removed = true;
                    entry
                }
                None => return false,
            }
        };

        entry.mark_canceled(reason)
    }

    /// Description of the active operation, if any.
    pub fn active_description(&self) -> Option<String> {
        let state = self.inner.lock();
        state
            .stack
            .last()
            .map(|entry| entry.state.lock().description.clone())
    }

    fn remove(&self, token: u64) {
        let mut state = self.inner.lock();
        state.stack.retain(|entry| entry.token != token);
    }
}

/// Handle to a registered operation.
pub struct CancellationHandle {
    entry: Arc<Entry>,
    registry: CancellationRegistry,
}

impl CancellationHandle {
    pub fn is_canceled(&self) -> bool {
        self.entry.state.lock().canceled
    }

    /// Reason passed to the cancel request, if the operation was canceled.
    pub fn cancel_reason(&self) -> Option<String> {
        self.entry.state.lock().reason.clone()
    }

    /// Cancel this specific entry, regardless of stack position.
    pub fn cancel(&self, reason: Option<&str>) -> bool {
        self.entry.state.lock().removed = true;
        self.registry.remove(self.entry.token);
        self.entry.mark_canceled(reason)
    }

    /// Install (or replace) the callback invoked when the entry cancels.
    ///
    /// The callback runs at most once; installing one after cancellation
    /// has no effect.
    pub fn set_cancel_callback(&self, callback: impl FnOnce(Option<&str>) + Send + 'static) {
        let mut state = self.entry.state.lock();
        if !state.canceled {
            state.cancel_fn = Some(Box::new(callback));
        }
    }

    /// Resolve once the entry is canceled. Suspension points `select!`
    /// this against their own pending work.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.entry.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }

    /// Remove the entry from the stack without canceling it.
    pub fn unregister(&self) {
        let already_removed = {
            let mut state = self.entry.state.lock();
            std::mem::replace(&mut state.removed, true)
        };
        if !already_removed {
            self.registry.remove(self.entry.token);
        }
    }
}

impl Drop for CancellationHandle {
    fn drop(&mut self) {
        self.unregister();
    }
}
