//! Push-based async queue shuttling events between the pass executor and
//! whichever front end is consuming them.
//!
//! Single producer side, any number of sequential consumers. `push` hands
//! the value to the oldest pending waiter when one exists, otherwise
//! buffers it; `close` flushes a terminal `None` to current and future
//! waiters so late consumers observe completion instead of hanging.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct QueueState<T> {
    values: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<Option<T>>>,
    closed: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            values: VecDeque::new(),
            waiters: VecDeque::new(),
            closed: false,
        }
    }
}

/// FIFO queue with awaitable consumption and a close sentinel.
pub struct EventQueue<T> {
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for EventQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Enqueue a value, resolving the oldest pending waiter immediately
    /// when one exists. Returns whether the value was accepted (a closed
    /// queue rejects pushes).
    pub fn push(&self, value: T) -> bool {
        let mut value = Some(value);
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.closed {
                    return false;
                }
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.values.push_back(value.take().expect("value consumed"));
                        return true;
                    }
                }
            };

            // The waiter may have dropped its receiver; retry with the
            // next one rather than losing the value.
            match waiter.send(Some(value.take().expect("value consumed"))) {
                Ok(()) => return true,
                Err(rejected) => value = rejected,
            }
        }
    }

    /// Retrieve the next value, awaiting the producer when necessary.
    /// Returns `None` once the queue is closed and drained.
    pub async fn next(&self) -> Option<T> {
        let receiver = {
            let mut state = self.state.lock();
            if let Some(value) = state.values.pop_front() {
                return Some(value);
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        receiver.await.unwrap_or(None)
    }

    /// Close the queue and notify all pending waiters.
    pub fn close(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(None);
        }
    }

    /// Number of buffered values not yet consumed.
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().values.is_empty()
    }

    /// Consume the queue as a [`futures::Stream`], ending at close.
    pub fn into_stream(self) -> impl futures::Stream<Item = T> {
        futures::stream::unfold(self, |queue| async move {
            queue.next().await.map(|value| (value, queue))
        })
    }
}
