//! Tool-call/tool-result pairing repair.
//!
//! Streaming interruptions and provider quirks leave transcripts with
//! incomplete tool calls, results far from their calls, duplicates, and
//! orphans. These passes restore the invariant the next model call checks:
//! every complete tool call is immediately followed by exactly one result
//! with its id, in call order, right after the owning assistant message.
//!
//! Every entry point takes `&[TurnMessage]` and returns
//! `Cow<'_, [TurnMessage]>`; `Cow::Borrowed` signals that nothing changed,
//! so the unmodified common case costs no allocation.

use std::borrow::Cow;
use std::collections::HashSet;

use swb_domain::message::{AssistantBlock, ResultBlock, TurnMessage};
use swb_domain::trace::TraceEvent;

use crate::passes;
use crate::policy::TranscriptPolicy;

/// Body of a synthesized result for a call whose real result was lost.
pub const SYNTHETIC_RESULT_TEXT: &str = "[tool result missing — synthesized after interruption]";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Partial-call cleanup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Remove incomplete tool calls from assistant content.
///
/// A call whose only argument evidence is a streamed `partial_json`
/// fragment never executed and must not be replayed as a decision point.
/// An assistant message left with no blocks is dropped entirely. Exposed
/// standalone for callers that snapshot mid-stream without wanting the
/// full pairing repair.
pub fn sanitize_partial_tool_calls(messages: &[TurnMessage]) -> Cow<'_, [TurnMessage]> {
    let affected = messages.iter().any(|m| match m {
        TurnMessage::Assistant { content } => {
            content.iter().any(AssistantBlock::is_incomplete_tool_call)
        }
        _ => false,
    });
    if !affected {
        return Cow::Borrowed(messages);
    }

    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg {
            TurnMessage::Assistant { content }
                if content.iter().any(AssistantBlock::is_incomplete_tool_call) =>
            {
                let kept: Vec<AssistantBlock> = content
                    .iter()
                    .filter(|b| !b.is_incomplete_tool_call())
                    .cloned()
                    .collect();
                if !kept.is_empty() {
                    out.push(TurnMessage::Assistant { content: kept });
                }
            }
            other => out.push(other.clone()),
        }
    }
    Cow::Owned(out)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pairing repair
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters describing what a repair pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairStats {
    pub removed_calls: usize,
    pub synthesized_results: usize,
    pub dropped_results: usize,
    pub moved_results: usize,
}

impl RepairStats {
    pub fn is_noop(&self) -> bool {
        *self == RepairStats::default()
    }
}

/// Repair tool-call/tool-result pairing across the whole transcript.
///
/// After this pass, every surviving tool call is immediately followed by
/// exactly one result with its id, results appear in call order, duplicates
/// and orphans are gone, and incomplete calls have been removed. When
/// `allow_synthetic` is false, calls without a result are dropped instead
/// of getting an error-flagged placeholder.
///
/// The relative order of all non-tool-result messages is preserved
/// exactly; only result placement and membership change.
pub fn sanitize_tool_pairing(
    messages: &[TurnMessage],
    allow_synthetic: bool,
) -> Cow<'_, [TurnMessage]> {
    repair_pairing(messages, allow_synthetic).0
}

pub(crate) fn repair_pairing(
    messages: &[TurnMessage],
    allow_synthetic: bool,
) -> (Cow<'_, [TurnMessage]>, RepairStats) {
    let mut stats = RepairStats::default();

    // Fast path: nothing tool-related anywhere.
    let has_tool_content = messages.iter().any(|m| {
        m.has_tool_calls() || matches!(m, TurnMessage::ToolResult { .. })
    });
    if !has_tool_content {
        return (Cow::Borrowed(messages), stats);
    }

    let mut out: Vec<TurnMessage> = Vec::with_capacity(messages.len());
    // Source indices of results already spliced next to their call.
    let mut consumed: HashSet<usize> = HashSet::new();
    // Ids that already own exactly one result in the output.
    let mut used_ids: HashSet<String> = HashSet::new();

    for (i, msg) in messages.iter().enumerate() {
        match msg {
            TurnMessage::ToolResult { .. } => {
                // Already spliced when its call was processed, or a
                // duplicate/orphan. Either way it is not emitted here.
                if !consumed.contains(&i) {
                    stats.dropped_results += 1;
                }
            }
            TurnMessage::Assistant { content } => {
                let mut blocks: Vec<AssistantBlock> = Vec::with_capacity(content.len());
                let mut results: Vec<TurnMessage> = Vec::new();

                for block in content {
                    if block.is_incomplete_tool_call() {
                        stats.removed_calls += 1;
                        continue;
                    }
                    let (id, name) = match block {
                        AssistantBlock::ToolCall { id, name, .. } => (id, name),
                        other => {
                            blocks.push(other.clone());
                            continue;
                        }
                    };
                    if used_ids.contains(id) {
                        // A later call reusing an id cannot be paired.
                        stats.removed_calls += 1;
                        continue;
                    }

                    // First unconsumed result with this id, anywhere later.
                    let found = messages
                        .iter()
                        .enumerate()
                        .skip(i + 1)
                        .find(|(j, m)| {
                            !consumed.contains(j)
                                && matches!(
                                    m,
                                    TurnMessage::ToolResult { tool_call_id, .. }
                                        if tool_call_id == id
                                )
                        });

                    match found {
                        Some((j, result)) => {
                            if j != i + 1 + results.len() {
                                stats.moved_results += 1;
                            }
                            consumed.insert(j);
                            used_ids.insert(id.clone());
                            blocks.push(block.clone());
                            results.push(result.clone());
                        }
                        None if allow_synthetic => {
                            used_ids.insert(id.clone());
                            blocks.push(block.clone());
                            results.push(TurnMessage::ToolResult {
                                tool_call_id: id.clone(),
                                tool_name: name.clone(),
                                content: vec![ResultBlock::Text {
                                    text: SYNTHETIC_RESULT_TEXT.into(),
                                }],
                                is_error: true,
                            });
                            stats.synthesized_results += 1;
                        }
                        None => {
                            stats.removed_calls += 1;
                        }
                    }
                }

                if !blocks.is_empty() {
                    out.push(TurnMessage::Assistant { content: blocks });
                    out.append(&mut results);
                }
            }
            other => out.push(other.clone()),
        }
    }

    if out.as_slice() == messages {
        (Cow::Borrowed(messages), RepairStats::default())
    } else {
        (Cow::Owned(out), stats)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy-driven driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Apply `f` to the current state of a pass chain, keeping `Borrowed`
/// only while no pass has changed anything.
fn chain<'a, F>(current: Cow<'a, [TurnMessage]>, f: F) -> Cow<'a, [TurnMessage]>
where
    F: for<'b> Fn(&'b [TurnMessage]) -> Cow<'b, [TurnMessage]>,
{
    match current {
        Cow::Borrowed(slice) => f(slice),
        Cow::Owned(vec) => {
            let replaced = match f(&vec) {
                Cow::Borrowed(_) => None,
                Cow::Owned(v) => Some(v),
            };
            match replaced {
                Some(v) => Cow::Owned(v),
                None => Cow::Owned(vec),
            }
        }
    }
}

/// Run every pass the resolved policy asks for, in order: pairing repair,
/// antigravity thinking normalization, thought-signature scrubbing,
/// tool-call-id sanitization, Google turn ordering, content sanitization.
/// Turn validators are audits: violations are logged, never mutated.
///
/// Provider passes run after the core repair and never break the
/// call/result adjacency it established.
pub fn sanitize_transcript<'a>(
    messages: &'a [TurnMessage],
    policy: &TranscriptPolicy,
) -> Cow<'a, [TurnMessage]> {
    let mut current: Cow<'a, [TurnMessage]> = Cow::Borrowed(messages);
    let mut repair_stats = RepairStats::default();

    if policy.repair_tool_pairing {
        let (repaired, stats) = repair_pairing(messages, policy.allow_synthetic_tool_results);
        repair_stats = stats;
        current = repaired;
    }

    if policy.normalize_antigravity_thinking_blocks {
        let preserve = policy.preserve_signatures;
        current = chain(current, |m| {
            passes::normalize_antigravity_thinking_blocks(m, preserve)
        });
    }

    if let Some(sig_policy) = policy.sanitize_thought_signatures {
        current = chain(current, |m| {
            passes::sanitize_thought_signatures(m, sig_policy)
        });
    }

    if policy.sanitize_tool_call_ids {
        let mode = policy.tool_call_id_mode;
        current = chain(current, |m| passes::sanitize_tool_call_ids(m, mode));
    }

    if policy.apply_google_turn_ordering {
        current = chain(current, passes::apply_google_turn_ordering);
    }

    current = chain(current, |m| {
        passes::apply_sanitize_mode(m, policy.sanitize_mode)
    });

    if policy.validate_anthropic_turns {
        for issue in passes::validate_anthropic_turns(&current) {
            tracing::warn!(issue = %issue, "anthropic turn validation");
        }
    }
    if policy.validate_gemini_turns {
        for issue in passes::validate_gemini_turns(&current) {
            tracing::warn!(issue = %issue, "gemini turn validation");
        }
    }

    if !repair_stats.is_noop() {
        TraceEvent::TranscriptRepair {
            removed_calls: repair_stats.removed_calls,
            synthesized_results: repair_stats.synthesized_results,
            dropped_results: repair_stats.dropped_results,
            moved_results: repair_stats.moved_results,
        }
        .emit();
    }

    current
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
