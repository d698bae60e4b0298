//! Shared domain types for the Switchboard delivery core: the common
//! error type, structured trace events, the transcript message model,
//! delivery routes, and queue/session configuration.

pub mod config;
pub mod error;
pub mod message;
pub mod route;
pub mod trace;
