//! Runtime event emitter
//!
//! Wraps the event queue with monotonic id assignment and a synchronous
//! multi-observer fan-out for side-channel consumers (stat recorders,
//! loggers) that should not perturb the primary stream. Observer panics
//! are caught and surfaced as warn status events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{EventKind, EventQueue, RuntimeEvent, StatusLevel};

type Observer = Box<dyn Fn(&RuntimeEvent) + Send + Sync>;

#[derive(Clone)]
pub struct RuntimeEmitter {
    queue: EventQueue<RuntimeEvent>,
    observers: Arc<Mutex<Vec<Observer>>>,
    counter: Arc<AtomicU64>,
    id_prefix: String,
    agent: Option<String>,
    debug_enabled: bool,
}

impl RuntimeEmitter {
    pub fn new(queue: EventQueue<RuntimeEvent>) -> Self {
        Self {
            queue,
            observers: Arc::new(Mutex::new(Vec::new())),
            counter: Arc::new(AtomicU64::new(0)),
            id_prefix: "key".to_string(),
            agent: None,
            debug_enabled: false,
        }
    }

    pub fn with_agent_label(mut self, label: impl Into<String>) -> Self {
        self.agent = Some(label.into());
        self
    }

    pub fn with_debug(mut self, enabled: bool) -> Self {
        self.debug_enabled = enabled;
        self
    }

    pub fn queue(&self) -> &EventQueue<RuntimeEvent> {
        &self.queue
    }

    /// Register a synchronous side-channel observer.
    pub fn add_observer(&self, observer: impl Fn(&RuntimeEvent) + Send + Sync + 'static) {
        self.observers.lock().push(Box::new(observer));
    }

    fn next_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.id_prefix, id)
    }

    fn build(&self, kind: EventKind) -> RuntimeEvent {
        RuntimeEvent {
            id: self.next_id(),
            agent: self.agent.clone(),
            kind,
        }
    }

    /// Emit an event to the queue and every observer.
    pub fn emit(&self, kind: EventKind) {
        let event = self.build(kind);
        self.queue.push(event.clone());

        let observers = self.observers.lock();
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(&event))).is_err() {
                // Do not re-enter the fan-out for the failure notice.
                self.queue.push(self.build(EventKind::Status {
                    level: StatusLevel::Warn,
                    message: "Event observer panicked.".to_string(),
                    details: None,
                }));
            }
        }
    }

    pub fn emit_status(&self, level: StatusLevel, message: impl Into<String>) {
        self.emit(EventKind::Status {
            level,
            message: message.into(),
            details: None,
        });
    }

    pub fn emit_status_with_details(
        &self,
        level: StatusLevel,
        message: impl Into<String>,
        details: impl Into<String>,
    ) {
        self.emit(EventKind::Status {
            level,
            message: message.into(),
            details: Some(details.into()),
        });
    }

    pub fn emit_error(&self, message: impl Into<String>, details: Option<String>) {
        self.emit(EventKind::Error {
            message: message.into(),
            details,
            attempts: Vec::new(),
        });
    }

    /// Emit a debug payload; dropped entirely unless debug mode is on.
    pub fn emit_debug(&self, payload: impl FnOnce() -> serde_json::Value) {
        if self.debug_enabled {
            self.emit(EventKind::Debug { payload: payload() });
        }
    }

    pub fn close(&self) {
        self.queue.close();
    }
}
