//! Transcript repair and policy resolution.
//!
//! Message histories can become malformed through streaming interruptions,
//! provider ID-format limits, and duplicate or orphaned tool results. The
//! sanitizer restores the tool-call/tool-result invariants the next model
//! call depends on; the policy resolver decides which passes apply for a
//! given provider/model pair.
//!
//! Everything here is pure: no I/O, no shared state, total over any
//! well-typed message sequence.

pub mod passes;
pub mod policy;
pub mod sanitize;

pub use policy::{
    resolve_transcript_policy, PolicyInput, SanitizeMode, ThoughtSignaturePolicy, ToolCallIdMode,
    TranscriptPolicy,
};
pub use sanitize::{sanitize_partial_tool_calls, sanitize_tool_pairing, sanitize_transcript};
