//! Human-in-the-loop rendezvous.
//!
//! Scripted test runs occasionally need an operator to plug a cable or press
//! a button. The caller blocks on `/api/human-interaction` until somebody
//! clicks through `/api/human/done` or `/api/human/cancel` in the UI, or the
//! timeout elapses. At most one request may be outstanding.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;

/// Snapshot returned to UI pollers.
#[derive(Debug, Clone, Serialize)]
pub struct HumanStatus {
    pub pending: bool,
    pub message: String,
    pub confirmed: bool,
}

/// How a rendezvous ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub confirmed: bool,
    pub timed_out: bool,
}

#[derive(Debug)]
struct Waiter {
    generation: u64,
    tx: oneshot::Sender<bool>,
}

#[derive(Debug, Default)]
struct State {
    waiter: Option<Waiter>,
    generation: u64,
    message: String,
    confirmed: bool,
}

/// Single-slot blocking rendezvous between a scripted caller and the UI.
#[derive(Debug, Default)]
pub struct HumanGate {
    state: Mutex<State>,
}

/// Returned when a second request arrives while one is pending.
#[derive(Debug, thiserror::Error)]
#[error("a human interaction is already pending")]
pub struct AlreadyPending;

impl HumanGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the operator acts or `timeout` elapses.
    pub async fn request(&self, message: &str, timeout: Duration) -> Result<Outcome, AlreadyPending> {
        let (tx, rx) = oneshot::channel();
        let generation;
        {
            let mut state = self.state.lock().unwrap();
            if state.waiter.is_some() {
                return Err(AlreadyPending);
            }
            state.generation += 1;
            generation = state.generation;
            state.message = message.to_string();
            state.confirmed = false;
            state.waiter = Some(Waiter { generation, tx });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(confirmed)) => Ok(Outcome {
                confirmed,
                timed_out: false,
            }),
            // Sender dropped without an answer; treat like a cancel.
            Ok(Err(_)) => Ok(Outcome {
                confirmed: false,
                timed_out: false,
            }),
            Err(_) => {
                let mut state = self.state.lock().unwrap();
                // Only clear our own request; a fresh one may have replaced
                // it between the timeout firing and us taking the lock.
                if state.waiter.as_ref().is_some_and(|w| w.generation == generation) {
                    state.waiter = None;
                }
                Ok(Outcome {
                    confirmed: false,
                    timed_out: true,
                })
            }
        }
    }

    /// Operator confirmed. Returns false when nothing was pending.
    pub fn done(&self) -> bool {
        self.finish(true)
    }

    /// Operator cancelled. Returns false when nothing was pending.
    pub fn cancel(&self) -> bool {
        self.finish(false)
    }

    fn finish(&self, confirmed: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.waiter.take() {
            Some(waiter) => {
                state.confirmed = confirmed;
                // The requester may have timed out already; that is fine.
                let _ = waiter.tx.send(confirmed);
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> HumanStatus {
        let state = self.state.lock().unwrap();
        HumanStatus {
            pending: state.waiter.is_some(),
            message: state.message.clone(),
            confirmed: state.confirmed,
        }
    }
}
