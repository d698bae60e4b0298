//! Registry of in-process agent runs, keyed by session ID.
//!
//! A run registers on start and receives the unbounded channel its
//! executor reads steer input from. Steering is best-effort: a miss
//! (no active run, or the executor already hung up) reports `false`
//! and the caller falls back to queueing.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use swb_domain::trace::TraceEvent;

/// Tracks active in-process turns and their steer-input channels.
pub struct EmbeddedRunRegistry {
    runs: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl Default for EmbeddedRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedRunRegistry {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Register an active run. The returned receiver is the run's steer
    /// input stream; registering again for the same session ID replaces
    /// the previous channel.
    pub fn begin(&self, session_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.runs.lock().insert(session_id.to_owned(), tx);
        rx
    }

    /// Clear the record when a run completes.
    pub fn finish(&self, session_id: &str) {
        self.runs.lock().remove(session_id);
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.runs.lock().contains_key(session_id)
    }

    /// Inject `text` into the live run's input stream. Returns false when
    /// no run is active or the executor dropped its receiver; a dangling
    /// sender is removed so later checks see the run as inactive.
    pub fn steer(&self, session_id: &str, text: &str) -> bool {
        let mut runs = self.runs.lock();
        let delivered = match runs.get(session_id) {
            Some(tx) => {
                if tx.send(text.to_owned()).is_ok() {
                    true
                } else {
                    runs.remove(session_id);
                    false
                }
            }
            None => false,
        };
        drop(runs);

        TraceEvent::SteerAttempt {
            session_id: session_id.to_owned(),
            delivered,
        }
        .emit();
        delivered
    }

    pub fn active_count(&self) -> usize {
        self.runs.lock().len()
    }
}
