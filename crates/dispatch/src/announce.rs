//! Announce queue: messages held back while a session is mid-turn.
//!
//! Enqueue semantics follow the session's queue mode; draining is
//! serialized per key so two drains for one session never interleave,
//! and a failed send never aborts the rest of the backlog.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use swb_domain::config::QueueMode;
use swb_domain::error::Result;
use swb_domain::route::DeliveryRoute;
use swb_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Items and reports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One held-back message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnounceItem {
    pub session_key: String,
    pub prompt: String,
    /// Short one-line context shown ahead of the prompt in collect mode.
    #[serde(default)]
    pub summary_line: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub origin: DeliveryRoute,
}

impl AnnounceItem {
    pub fn new(session_key: &str, prompt: &str, origin: DeliveryRoute) -> Self {
        Self {
            session_key: session_key.to_owned(),
            prompt: prompt.to_owned(),
            summary_line: None,
            enqueued_at: Utc::now(),
            origin,
        }
    }
}

/// What a drain delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session-key backlog of announce items.
///
/// Internal maps grow with the number of distinct session keys seen over
/// the process lifetime and are never evicted; session-key cardinality is
/// small and stable (one per conversation scope), so the footprint is a
/// handful of entries per agent.
pub struct AnnounceQueue {
    pending: Mutex<HashMap<String, VecDeque<AnnounceItem>>>,
    /// Per-key drain gates; created lazily, retained so an in-flight
    /// drain can never race a fresh gate for the same key.
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Default for AnnounceQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AnnounceQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Add an item under the given mode.
    ///
    /// - `Collect` / `SteerBacklog`: append.
    /// - `Followup`: single pending slot, latest wins.
    /// - `Interrupt`: drop the backlog, this item goes first.
    /// - `Steer`: nothing is persisted (steering happens live).
    pub fn enqueue(&self, item: AnnounceItem, mode: QueueMode) {
        if mode == QueueMode::Steer {
            return;
        }

        let session_key = item.session_key.clone();
        let pending = {
            let mut map = self.pending.lock();
            let queue = map.entry(session_key.clone()).or_default();
            match mode {
                QueueMode::Collect | QueueMode::SteerBacklog => queue.push_back(item),
                QueueMode::Followup => {
                    queue.clear();
                    queue.push_back(item);
                }
                QueueMode::Interrupt => {
                    queue.clear();
                    queue.push_front(item);
                }
                QueueMode::Steer => unreachable!(),
            }
            queue.len()
        };

        TraceEvent::AnnounceEnqueued {
            session_key,
            mode: mode.as_str().to_owned(),
            pending,
        }
        .emit();
    }

    /// Drain the backlog for `session_key`, delivering through `send`.
    ///
    /// Collect mode concatenates everything into one send (summary lines
    /// first); other modes send FIFO, each awaited in turn. Failures are
    /// logged and counted but do not stop the drain.
    pub async fn drain<F, Fut>(&self, session_key: &str, mode: QueueMode, send: F) -> DrainReport
    where
        F: Fn(AnnounceItem) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let gate = self.gate_for(session_key);
        let _serialized = gate.lock().await;

        let items: Vec<AnnounceItem> = {
            let mut map = self.pending.lock();
            map.get_mut(session_key)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default()
        };
        if items.is_empty() {
            return DrainReport::default();
        }

        let batches: Vec<AnnounceItem> = if mode == QueueMode::Collect {
            vec![collect_into_one(session_key, items)]
        } else {
            items
        };

        let mut report = DrainReport::default();
        for item in batches {
            match send(item).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        session_key,
                        error = %e,
                        "announce delivery failed, continuing drain"
                    );
                    report.failed += 1;
                }
            }
        }

        TraceEvent::AnnounceDrained {
            session_key: session_key.to_owned(),
            delivered: report.delivered,
            failed: report.failed,
        }
        .emit();
        report
    }

    pub fn pending(&self, session_key: &str) -> Vec<AnnounceItem> {
        self.pending
            .lock()
            .get(session_key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, session_key: &str) -> usize {
        self.pending
            .lock()
            .get(session_key)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, session_key: &str) -> bool {
        self.len(session_key) == 0
    }

    fn gate_for(&self, session_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .entry(session_key.to_owned())
            .or_default()
            .clone()
    }
}

/// Fold a backlog into a single item: summary lines first, then prompts
/// in arrival order. Origin comes from the newest item.
fn collect_into_one(session_key: &str, items: Vec<AnnounceItem>) -> AnnounceItem {
    let summaries: Vec<&str> = items
        .iter()
        .filter_map(|i| i.summary_line.as_deref())
        .collect();
    let prompts: Vec<&str> = items.iter().map(|i| i.prompt.as_str()).collect();

    let mut text = String::new();
    if !summaries.is_empty() {
        text.push_str(&summaries.join("\n"));
        text.push_str("\n\n");
    }
    text.push_str(&prompts.join("\n\n"));

    let origin = items
        .last()
        .map(|i| i.origin.clone())
        .unwrap_or_default();
    AnnounceItem {
        session_key: session_key.to_owned(),
        prompt: text,
        summary_line: None,
        enqueued_at: Utc::now(),
        origin,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use swb_domain::error::Error;

    fn item(key: &str, prompt: &str) -> AnnounceItem {
        AnnounceItem::new(key, prompt, DeliveryRoute::default())
    }

    #[test]
    fn followup_keeps_only_the_latest() {
        let queue = AnnounceQueue::new();
        queue.enqueue(item("k", "first"), QueueMode::Followup);
        queue.enqueue(item("k", "second"), QueueMode::Followup);

        let pending = queue.pending("k");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prompt, "second");
    }

    #[test]
    fn collect_appends() {
        let queue = AnnounceQueue::new();
        queue.enqueue(item("k", "a"), QueueMode::Collect);
        queue.enqueue(item("k", "b"), QueueMode::Collect);
        assert_eq!(queue.len("k"), 2);
    }

    #[test]
    fn interrupt_clears_the_backlog() {
        let queue = AnnounceQueue::new();
        queue.enqueue(item("k", "old1"), QueueMode::Collect);
        queue.enqueue(item("k", "old2"), QueueMode::Collect);
        queue.enqueue(item("k", "urgent"), QueueMode::Interrupt);

        let pending = queue.pending("k");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].prompt, "urgent");
    }

    #[test]
    fn steer_persists_nothing() {
        let queue = AnnounceQueue::new();
        queue.enqueue(item("k", "live"), QueueMode::Steer);
        assert!(queue.is_empty("k"));
    }

    #[test]
    fn keys_are_independent() {
        let queue = AnnounceQueue::new();
        queue.enqueue(item("a", "x"), QueueMode::Collect);
        queue.enqueue(item("b", "y"), QueueMode::Collect);
        assert_eq!(queue.len("a"), 1);
        assert_eq!(queue.len("b"), 1);
    }

    #[tokio::test]
    async fn collect_drain_concatenates_into_one_send() {
        let queue = AnnounceQueue::new();
        let mut first = item("k", "first message");
        first.summary_line = Some("[slack] from alice".into());
        queue.enqueue(first, QueueMode::Collect);
        queue.enqueue(item("k", "second message"), QueueMode::Collect);

        let sent = Arc::new(Mutex::new(Vec::<String>::new()));
        let sent2 = sent.clone();
        let report = queue
            .drain("k", QueueMode::Collect, move |i| {
                let sent = sent2.clone();
                async move {
                    sent.lock().push(i.prompt);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report, DrainReport { delivered: 1, failed: 0 });
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("[slack] from alice\n\n"));
        assert!(sent[0].contains("first message\n\nsecond message"));
        assert!(queue.is_empty("k"));
    }

    #[tokio::test]
    async fn fifo_drain_sends_in_order() {
        let queue = AnnounceQueue::new();
        queue.enqueue(item("k", "one"), QueueMode::SteerBacklog);
        queue.enqueue(item("k", "two"), QueueMode::SteerBacklog);

        let sent = Arc::new(Mutex::new(Vec::<String>::new()));
        let sent2 = sent.clone();
        let report = queue
            .drain("k", QueueMode::SteerBacklog, move |i| {
                let sent = sent2.clone();
                async move {
                    sent.lock().push(i.prompt);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report.delivered, 2);
        assert_eq!(*sent.lock(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn failed_send_does_not_abort_the_drain() {
        let queue = AnnounceQueue::new();
        queue.enqueue(item("k", "bad"), QueueMode::Collect);
        queue.enqueue(item("k", "good"), QueueMode::Collect);

        // FIFO mode so each item is its own send.
        let report = queue
            .drain("k", QueueMode::Followup, |i| async move {
                if i.prompt == "bad" {
                    Err(Error::Gateway("downstream unavailable".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(report, DrainReport { delivered: 1, failed: 1 });
        assert!(queue.is_empty("k"));
    }

    #[tokio::test]
    async fn empty_drain_is_a_no_op() {
        let queue = AnnounceQueue::new();
        let report = queue
            .drain("k", QueueMode::Collect, |_| async { Ok(()) })
            .await;
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn concurrent_drains_never_duplicate_items() {
        let queue = Arc::new(AnnounceQueue::new());
        for i in 0..5 {
            queue.enqueue(item("k", &format!("m{i}")), QueueMode::Collect);
        }

        let sent = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let queue = queue.clone();
            let sent = sent.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .drain("k", QueueMode::Collect, move |i| {
                        let sent = sent.clone();
                        async move {
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            sent.lock().push(i.prompt);
                            Ok(())
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        // One drain got the whole batch, the other found nothing.
        assert_eq!(sent.lock().len(), 1);
        assert!(queue.is_empty("k"));
    }
}
