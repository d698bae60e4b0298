//! Direct agent message dispatcher.
//!
//! Decides, for a session that may already be mid-turn, whether an
//! inbound message steers the live run, queues behind it, or goes
//! straight to the gateway. The decision and the resulting send run
//! under a per-session-key mutex so two racing callers cannot both
//! conclude "not active" and double-send.
//!
//! `dispatch` never returns an error: every failure is folded into
//! [`DispatchOutcome::Error`] so callers (channel adapters) can report
//! it without unwinding.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use swb_domain::config::{QueueMode, QueueSettings};
use swb_domain::error::Result;
use swb_domain::route::DeliveryRoute;
use swb_domain::trace::TraceEvent;
use swb_sessions::store::SessionStore;

use crate::announce::{AnnounceItem, AnnounceQueue};
use crate::embedded::EmbeddedRunRegistry;
use crate::gateway::{AgentTurnParams, GatewayClient};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request and outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One inbound message to deliver to an agent session.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub session_key: String,
    pub message: String,
    /// Explicit delivery route; missing fields fall back to the
    /// session's last-known route.
    pub route: DeliveryRoute,
    /// Short context line carried into collect-mode batches.
    pub summary_line: Option<String>,
    pub timeout: Option<Duration>,
}

/// How the message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Injected into the live turn's input stream.
    Steered,
    /// Held in the announce queue behind the active turn.
    Queued { mode: QueueMode, pending: usize },
    /// Sent directly to the gateway as a new turn.
    Sent,
    /// Something failed; the message was not delivered.
    Error { message: String },
}

impl DispatchOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Steered => "steered",
            Self::Queued { .. } => "queued",
            Self::Sent => "sent",
            Self::Error { .. } => "error",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stateless-per-call dispatcher over injected session state.
///
/// The per-key send gates are retained for the process lifetime (one
/// small entry per distinct session key); eviction would reopen the
/// decide-and-send race for a key with a dispatch still in flight.
pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    registry: Arc<EmbeddedRunRegistry>,
    queue: Arc<AnnounceQueue>,
    gateway: Arc<dyn GatewayClient>,
    queue_settings: QueueSettings,
    /// Per-session-key gates closing the decide-and-send race.
    send_gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<EmbeddedRunRegistry>,
        queue: Arc<AnnounceQueue>,
        gateway: Arc<dyn GatewayClient>,
        queue_settings: QueueSettings,
    ) -> Self {
        Self {
            sessions,
            registry,
            queue,
            gateway,
            queue_settings,
            send_gates: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver one inbound message. Never returns `Err`.
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let session_key = request.session_key.clone();
        let outcome = match self.dispatch_inner(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(session_key, error = %e, "dispatch failed");
                DispatchOutcome::Error {
                    message: e.to_string(),
                }
            }
        };

        TraceEvent::DispatchDecision {
            session_key,
            outcome: outcome.as_str().to_owned(),
        }
        .emit();
        outcome
    }

    async fn dispatch_inner(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let gate = self.gate_for(&request.session_key);
        let _exclusive = gate.lock().await;

        let entry = self.sessions.get(&request.session_key);
        let last_route = entry
            .as_ref()
            .map(|e| e.last_route())
            .unwrap_or_default();
        let route = request.route.merged_over(&last_route);

        let session_id = entry.and_then(|e| e.session_id);
        let Some(session_id) = session_id else {
            // No agent session yet: nothing to steer or queue behind.
            self.send_direct(&request, &route).await?;
            return Ok(DispatchOutcome::Sent);
        };

        let active = self.registry.is_active(&session_id);
        let mode = self.queue_settings.mode_for(route.channel.as_deref());

        if active && mode.wants_steer() && self.registry.steer(&session_id, &request.message) {
            return Ok(DispatchOutcome::Steered);
        }

        if active {
            // Steer has no backlog of its own; a missed steer degrades to
            // the single-slot followup queue.
            let persist_mode = match mode {
                QueueMode::Steer => QueueMode::Followup,
                other => other,
            };
            let mut item =
                AnnounceItem::new(&request.session_key, &request.message, route.clone());
            item.summary_line = request.summary_line.clone();
            self.queue.enqueue(item, persist_mode);
            return Ok(DispatchOutcome::Queued {
                mode,
                pending: self.queue.len(&request.session_key),
            });
        }

        self.send_direct(&request, &route).await?;
        Ok(DispatchOutcome::Sent)
    }

    async fn send_direct(&self, request: &DispatchRequest, route: &DeliveryRoute) -> Result<()> {
        let params = AgentTurnParams {
            session_key: request.session_key.clone(),
            message: request.message.clone(),
            deliver: true,
            channel: route.channel.clone(),
            account_id: route.account_id.clone(),
            to: route.to.clone(),
            thread_id: route.thread_id.clone(),
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            expect_final: true,
            timeout: request.timeout,
        };
        self.gateway.agent_turn(params).await?;
        self.sessions.record_route(&request.session_key, route);
        Ok(())
    }

    fn gate_for(&self, session_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.send_gates
            .lock()
            .entry(session_key.to_owned())
            .or_default()
            .clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use swb_domain::error::Error;

    struct FakeGateway {
        calls: Mutex<Vec<AgentTurnParams>>,
        fail: bool,
    }

    impl FakeGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn calls(&self) -> Vec<AgentTurnParams> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl GatewayClient for FakeGateway {
        async fn agent_turn(&self, params: AgentTurnParams) -> Result<serde_json::Value> {
            self.calls.lock().push(params);
            if self.fail {
                Err(Error::Gateway("connection refused".into()))
            } else {
                Ok(serde_json::json!({"status": "ok"}))
            }
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        sessions: Arc<SessionStore>,
        registry: Arc<EmbeddedRunRegistry>,
        queue: Arc<AnnounceQueue>,
        gateway: Arc<FakeGateway>,
        _dir: tempfile::TempDir,
    }

    fn fixture(gateway: Arc<FakeGateway>, settings: QueueSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sessions =
            Arc::new(SessionStore::load(&dir.path().join("sessions.json")).unwrap());
        let registry = Arc::new(EmbeddedRunRegistry::new());
        let queue = Arc::new(AnnounceQueue::new());
        let dispatcher = Dispatcher::new(
            sessions.clone(),
            registry.clone(),
            queue.clone(),
            gateway.clone(),
            settings,
        );
        Fixture {
            dispatcher,
            sessions,
            registry,
            queue,
            gateway,
            _dir: dir,
        }
    }

    fn request(key: &str, message: &str) -> DispatchRequest {
        DispatchRequest {
            session_key: key.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn no_session_id_sends_directly() {
        let fx = fixture(FakeGateway::new(), QueueSettings::default());

        let outcome = fx.dispatcher.dispatch(request("agent:a:main", "hello")).await;
        assert_eq!(outcome, DispatchOutcome::Sent);

        let calls = fx.gateway.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].expect_final);
        assert!(!calls[0].idempotency_key.is_empty());
    }

    #[tokio::test]
    async fn idempotency_keys_are_fresh_per_send() {
        let fx = fixture(FakeGateway::new(), QueueSettings::default());

        fx.dispatcher.dispatch(request("agent:a:main", "one")).await;
        fx.dispatcher.dispatch(request("agent:a:main", "two")).await;

        let calls = fx.gateway.calls();
        assert_ne!(calls[0].idempotency_key, calls[1].idempotency_key);
    }

    #[tokio::test]
    async fn active_session_with_steer_mode_steers() {
        let settings = QueueSettings {
            default_mode: QueueMode::Steer,
            ..Default::default()
        };
        let fx = fixture(FakeGateway::new(), settings);
        fx.sessions.set_session_id("agent:a:main", "sess-1");
        let mut rx = fx.registry.begin("sess-1");

        let outcome = fx
            .dispatcher
            .dispatch(request("agent:a:main", "new info"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Steered);
        assert_eq!(rx.recv().await.as_deref(), Some("new info"));
        assert!(fx.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn active_session_with_followup_mode_queues() {
        let fx = fixture(FakeGateway::new(), QueueSettings::default());
        fx.sessions.set_session_id("agent:a:main", "sess-1");
        let _rx = fx.registry.begin("sess-1");

        let outcome = fx.dispatcher.dispatch(request("agent:a:main", "later")).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Queued {
                mode: QueueMode::Followup,
                pending: 1
            }
        );
        assert_eq!(fx.queue.pending("agent:a:main")[0].prompt, "later");
        assert!(fx.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn missed_steer_falls_back_to_queueing() {
        let settings = QueueSettings {
            default_mode: QueueMode::SteerBacklog,
            ..Default::default()
        };
        let fx = fixture(FakeGateway::new(), settings);
        fx.sessions.set_session_id("agent:a:main", "sess-1");
        // Register then drop the receiver: active until the first steer
        // attempt discovers the hangup.
        let rx = fx.registry.begin("sess-1");
        drop(rx);

        let outcome = fx.dispatcher.dispatch(request("agent:a:main", "msg")).await;
        match outcome {
            DispatchOutcome::Queued { mode, .. } => assert_eq!(mode, QueueMode::SteerBacklog),
            other => panic!("expected Queued, got {other:?}"),
        }
        assert_eq!(fx.queue.len("agent:a:main"), 1);
    }

    #[tokio::test]
    async fn inactive_session_sends_directly() {
        let fx = fixture(FakeGateway::new(), QueueSettings::default());
        fx.sessions.set_session_id("agent:a:main", "sess-1");
        // No run registered: not active.

        let outcome = fx.dispatcher.dispatch(request("agent:a:main", "go")).await;
        assert_eq!(outcome, DispatchOutcome::Sent);
        assert_eq!(fx.gateway.calls().len(), 1);
    }

    #[tokio::test]
    async fn route_merges_over_last_known() {
        let fx = fixture(FakeGateway::new(), QueueSettings::default());
        fx.sessions.record_route(
            "agent:a:main",
            &DeliveryRoute {
                channel: Some("slack".into()),
                to: Some("U1".into()),
                ..Default::default()
            },
        );

        let mut req = request("agent:a:main", "hi");
        req.route.to = Some("U2".into());
        fx.dispatcher.dispatch(req).await;

        let calls = fx.gateway.calls();
        assert_eq!(calls[0].channel.as_deref(), Some("slack"));
        assert_eq!(calls[0].to.as_deref(), Some("U2"));
    }

    #[tokio::test]
    async fn gateway_failure_becomes_error_outcome() {
        let fx = fixture(FakeGateway::failing(), QueueSettings::default());

        let outcome = fx.dispatcher.dispatch(request("agent:a:main", "hi")).await;
        match outcome {
            DispatchOutcome::Error { message } => {
                assert!(message.contains("connection refused"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn per_channel_override_selects_mode() {
        let mut settings = QueueSettings::default();
        settings
            .per_channel
            .insert("telegram".into(), QueueMode::Collect);
        let fx = fixture(FakeGateway::new(), settings);
        fx.sessions.set_session_id("agent:a:main", "sess-1");
        let _rx = fx.registry.begin("sess-1");

        let mut req = request("agent:a:main", "a");
        req.route.channel = Some("telegram".into());
        fx.dispatcher.dispatch(req.clone()).await;
        req.message = "b".into();
        fx.dispatcher.dispatch(req).await;

        // Collect mode accumulates instead of replacing.
        assert_eq!(fx.queue.len("agent:a:main"), 2);
    }
}
