//! Single ordered inbox per session. Presence, broadcast, change-feed, and
//! timer inputs all funnel through here, so the state machine consumes one
//! message at a time and stays testable without a transport.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::oneshot::{Receiver, Sender};

use super::state::Input;

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("inbox closed")]
    Closed,
}

pub struct SessionInbox {
    state: Mutex<InboxState>,
}

struct InboxState {
    items: VecDeque<Input>,
    waiters: VecDeque<Sender<Input>>,
    closed: bool,
}

impl SessionInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(InboxState {
                items: VecDeque::with_capacity(capacity),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn push(&self, item: Input) -> Result<(), InboxError> {
        let mut pending = Some(item);

        loop {
            let waiter = {
                let mut state = self.state.lock().expect("session inbox poisoned");
                if state.closed {
                    return Err(InboxError::Closed);
                }
                state.waiters.pop_front()
            };

            if let Some(waiter) = waiter {
                let value = pending.take().expect("item must remain available");
                match waiter.send(value) {
                    Ok(()) => return Ok(()),
                    Err(value) => {
                        pending = Some(value);
                        continue;
                    }
                }
            } else {
                let mut state = self.state.lock().expect("session inbox poisoned");
                if state.closed {
                    return Err(InboxError::Closed);
                }
                state
                    .items
                    .push_back(pending.take().expect("item must remain available"));
                return Ok(());
            }
        }
    }

    pub fn pop(&self) -> Receiver<Input> {
        let (tx, rx) = tokio::sync::oneshot::channel();

        let mut state = self.state.lock().expect("session inbox poisoned");
        if state.closed {
            drop(tx);
            return rx;
        }

        if let Some(item) = state.items.pop_front() {
            drop(state);
            if let Err(item) = tx.send(item) {
                let mut state = self.state.lock().expect("session inbox poisoned");
                state.items.push_front(item);
            }
        } else {
            state.waiters.push_back(tx);
        }

        rx
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("session inbox poisoned");
        state.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        let mut state = self.state.lock().expect("session inbox poisoned");
        if state.closed {
            return;
        }
        state.closed = true;
        state.waiters.clear();
        state.items.clear();
    }
}

impl fmt::Debug for SessionInbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.lock() {
            Ok(state) => f
                .debug_struct("SessionInbox")
                .field("pending_items", &state.items.len())
                .field("waiting_receivers", &state.waiters.len())
                .finish(),
            Err(_) => f
                .debug_struct("SessionInbox")
                .field("poisoned", &true)
                .finish(),
        }
    }
}
