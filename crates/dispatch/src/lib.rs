//! Busy-agent-safe delivery: decide whether an inbound message steers the
//! live turn, queues behind it, or goes straight to the agent.

pub mod announce;
pub mod dispatch;
pub mod embedded;
pub mod gateway;

pub use announce::{AnnounceItem, AnnounceQueue, DrainReport};
pub use dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use embedded::EmbeddedRunRegistry;
pub use gateway::{AgentTurnParams, GatewayClient};
