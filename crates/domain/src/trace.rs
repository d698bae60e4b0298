use serde::Serialize;

/// Structured trace events emitted across all Switchboard crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionResolved {
        session_key: String,
        session_id: Option<String>,
        is_new: bool,
    },
    SessionLockAcquired {
        path: String,
        waited_ms: u64,
        reclaimed: bool,
    },
    SessionLockReclaimed {
        path: String,
        holder_pid: u32,
        reason: String,
    },
    AnnounceEnqueued {
        session_key: String,
        mode: String,
        pending: usize,
    },
    AnnounceDrained {
        session_key: String,
        delivered: usize,
        failed: usize,
    },
    SteerAttempt {
        session_id: String,
        delivered: bool,
    },
    DispatchDecision {
        session_key: String,
        outcome: String,
    },
    TranscriptRepair {
        removed_calls: usize,
        synthesized_results: usize,
        dropped_results: usize,
        moved_results: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "swb_event");
    }
}
