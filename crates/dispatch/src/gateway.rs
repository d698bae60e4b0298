//! Client seam to the gateway RPC surface.
//!
//! The dispatch layer never speaks the wire protocol itself; it hands a
//! fully-resolved turn request to whatever implements [`GatewayClient`]
//! (in-process runtime, RPC client, or a test fake).

use std::time::Duration;

use async_trait::async_trait;

use swb_domain::error::Result;

/// One agent turn request, fully resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentTurnParams {
    pub session_key: String,
    pub message: String,
    /// Deliver the agent's reply back over the originating channel.
    pub deliver: bool,
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub to: Option<String>,
    pub thread_id: Option<String>,
    /// Fresh per attempt; the gateway dedupes retries on it.
    pub idempotency_key: String,
    /// Wait for the final reply rather than an accepted-ack.
    pub expect_final: bool,
    pub timeout: Option<Duration>,
}

/// External collaborator that executes agent turns.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn agent_turn(&self, params: AgentTurnParams) -> Result<serde_json::Value>;
}
