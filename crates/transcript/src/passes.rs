//! Provider-specific transcript passes.
//!
//! These run after the core pairing repair and never reorder the
//! call/result adjacency it established: id rewrites apply to calls and
//! results consistently, signature and content scrubbing touch block
//! interiors only, and the Google ordering pass only merges adjacent user
//! messages or prepends an opener.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;

use base64::Engine;
use sha2::{Digest, Sha256};

use swb_domain::message::{AssistantBlock, ResultBlock, TurnMessage};

use crate::policy::{SanitizeMode, ThoughtSignaturePolicy, ToolCallIdMode};

/// Inline image payloads above this size are replaced with a placeholder.
const MAX_INLINE_IMAGE_CHARS: usize = 262_144;

const IMAGE_OMITTED_TEXT: &str = "[image omitted]";
const EMPTY_RESULT_TEXT: &str = "(no content)";

/// Neutral opener inserted when a Gemini transcript would otherwise start
/// with an assistant turn.
const GOOGLE_TURN_OPENER: &str = "(continuing from an earlier conversation)";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-call-id sanitization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rewrite tool-call ids that violate the provider's format limits.
///
/// Ids that already conform are kept verbatim. A non-conforming id is
/// replaced by a stable sha256-derived token, and the rewrite is applied
/// to the call and every result referencing it, so pairing survives.
pub fn sanitize_tool_call_ids(
    messages: &[TurnMessage],
    mode: ToolCallIdMode,
) -> Cow<'_, [TurnMessage]> {
    let (max_len, allow_separators) = match mode {
        ToolCallIdMode::None => return Cow::Borrowed(messages),
        ToolCallIdMode::Strict => (40, true),
        ToolCallIdMode::Strict9 => (9, false),
    };

    // First-seen-order mapping over every id in the transcript.
    let mut mapping: HashMap<String, String> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    let mut changed = false;

    let assign = |id: &str,
                  mapping: &mut HashMap<String, String>,
                  taken: &mut HashSet<String>,
                  changed: &mut bool| {
        if mapping.contains_key(id) {
            return;
        }
        let conforming = id_conforms(id, max_len, allow_separators);
        let mut candidate = if conforming {
            id.to_string()
        } else {
            hashed_id(id, max_len)
        };
        while taken.contains(&candidate) {
            candidate = hashed_id(&format!("{candidate}+"), max_len);
        }
        if candidate != id {
            *changed = true;
        }
        taken.insert(candidate.clone());
        mapping.insert(id.to_string(), candidate);
    };

    for msg in messages {
        match msg {
            TurnMessage::Assistant { content } => {
                for block in content {
                    if let AssistantBlock::ToolCall { id, .. } = block {
                        assign(id, &mut mapping, &mut taken, &mut changed);
                    }
                }
            }
            TurnMessage::ToolResult { tool_call_id, .. } => {
                assign(tool_call_id, &mut mapping, &mut taken, &mut changed);
            }
            _ => {}
        }
    }

    if !changed {
        return Cow::Borrowed(messages);
    }

    let out: Vec<TurnMessage> = messages
        .iter()
        .map(|msg| match msg {
            TurnMessage::Assistant { content } => TurnMessage::Assistant {
                content: content
                    .iter()
                    .map(|block| match block {
                        AssistantBlock::ToolCall {
                            id,
                            name,
                            arguments,
                            partial_json,
                        } => AssistantBlock::ToolCall {
                            id: mapping.get(id).cloned().unwrap_or_else(|| id.clone()),
                            name: name.clone(),
                            arguments: arguments.clone(),
                            partial_json: partial_json.clone(),
                        },
                        other => other.clone(),
                    })
                    .collect(),
            },
            TurnMessage::ToolResult {
                tool_call_id,
                tool_name,
                content,
                is_error,
            } => TurnMessage::ToolResult {
                tool_call_id: mapping
                    .get(tool_call_id)
                    .cloned()
                    .unwrap_or_else(|| tool_call_id.clone()),
                tool_name: tool_name.clone(),
                content: content.clone(),
                is_error: *is_error,
            },
            other => other.clone(),
        })
        .collect();

    Cow::Owned(out)
}

fn id_conforms(id: &str, max_len: usize, allow_separators: bool) -> bool {
    !id.is_empty()
        && id.len() <= max_len
        && id.chars().all(|c| {
            c.is_ascii_alphanumeric() || (allow_separators && (c == '_' || c == '-'))
        })
}

fn hashed_id(seed: &str, max_len: usize) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(max_len);
    hex
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thought-signature scrubbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drop thought signatures that would be rejected downstream.
///
/// Third-party routes to Gemini models forward opaque signatures that must
/// be valid base64; anything else is scrubbed from thinking blocks and
/// from `thought_signature` keys embedded in tool-call arguments.
pub fn sanitize_thought_signatures(
    messages: &[TurnMessage],
    policy: ThoughtSignaturePolicy,
) -> Cow<'_, [TurnMessage]> {
    if !policy.allow_base64_only {
        return Cow::Borrowed(messages);
    }

    let mut changed = false;
    let out: Vec<TurnMessage> = messages
        .iter()
        .map(|msg| match msg {
            TurnMessage::Assistant { content } => {
                let blocks: Vec<AssistantBlock> = content
                    .iter()
                    .map(|block| match block {
                        AssistantBlock::Thinking {
                            thinking,
                            signature: Some(sig),
                        } if !is_base64(sig) => {
                            changed = true;
                            AssistantBlock::Thinking {
                                thinking: thinking.clone(),
                                signature: None,
                            }
                        }
                        AssistantBlock::ToolCall {
                            id,
                            name,
                            arguments: Some(serde_json::Value::Object(map)),
                            partial_json,
                        } if has_invalid_embedded_signature(map, policy.include_camel_case) => {
                            changed = true;
                            let mut cleaned = map.clone();
                            scrub_embedded_signatures(&mut cleaned, policy.include_camel_case);
                            AssistantBlock::ToolCall {
                                id: id.clone(),
                                name: name.clone(),
                                arguments: Some(serde_json::Value::Object(cleaned)),
                                partial_json: partial_json.clone(),
                            }
                        }
                        other => other.clone(),
                    })
                    .collect();
                TurnMessage::Assistant { content: blocks }
            }
            other => other.clone(),
        })
        .collect();

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(messages)
    }
}

static SIGNATURE_KEYS: [&str; 2] = ["thought_signature", "thoughtSignature"];

fn signature_keys(include_camel_case: bool) -> &'static [&'static str] {
    if include_camel_case {
        &SIGNATURE_KEYS
    } else {
        &SIGNATURE_KEYS[..1]
    }
}

fn has_invalid_embedded_signature(
    map: &serde_json::Map<String, serde_json::Value>,
    include_camel_case: bool,
) -> bool {
    signature_keys(include_camel_case).iter().any(|key| {
        map.get(*key)
            .is_some_and(|v| !v.as_str().is_some_and(is_base64))
    })
}

fn scrub_embedded_signatures(
    map: &mut serde_json::Map<String, serde_json::Value>,
    include_camel_case: bool,
) {
    for key in signature_keys(include_camel_case) {
        let invalid = map
            .get(*key)
            .is_some_and(|v| !v.as_str().is_some_and(is_base64));
        if invalid {
            map.remove(*key);
        }
    }
}

fn is_base64(value: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(value.as_bytes())
        .is_ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Antigravity thinking normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize assistant thinking blocks for the Antigravity front end:
/// empty thinking blocks are dropped, remaining thinking blocks are moved
/// ahead of text/tool blocks, and signatures are stripped unless the
/// policy preserves them.
pub fn normalize_antigravity_thinking_blocks(
    messages: &[TurnMessage],
    preserve_signatures: bool,
) -> Cow<'_, [TurnMessage]> {
    let mut changed = false;
    let out: Vec<TurnMessage> = messages
        .iter()
        .map(|msg| match msg {
            TurnMessage::Assistant { content } => {
                let mut thinking: Vec<AssistantBlock> = Vec::new();
                let mut rest: Vec<AssistantBlock> = Vec::new();
                for block in content {
                    match block {
                        AssistantBlock::Thinking { thinking: text, signature } => {
                            if text.trim().is_empty() {
                                continue;
                            }
                            let signature = if preserve_signatures {
                                signature.clone()
                            } else {
                                None
                            };
                            thinking.push(AssistantBlock::Thinking {
                                thinking: text.clone(),
                                signature,
                            });
                        }
                        other => rest.push(other.clone()),
                    }
                }
                thinking.extend(rest);
                if thinking != *content {
                    changed = true;
                }
                TurnMessage::Assistant { content: thinking }
            }
            other => other.clone(),
        })
        .collect();

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(messages)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Google turn ordering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enforce Gemini's turn-ordering requirements: adjacent user messages are
/// merged, and a transcript whose first non-system message is an assistant
/// turn gets a neutral user opener.
pub fn apply_google_turn_ordering(messages: &[TurnMessage]) -> Cow<'_, [TurnMessage]> {
    let mut out: Vec<TurnMessage> = Vec::with_capacity(messages.len());
    let mut changed = false;

    for msg in messages {
        if let (Some(TurnMessage::User { content: prev }), TurnMessage::User { content }) =
            (out.last_mut(), msg)
        {
            prev.push_str("\n\n");
            prev.push_str(content);
            changed = true;
            continue;
        }
        out.push(msg.clone());
    }

    let first_non_system = out
        .iter()
        .position(|m| !matches!(m, TurnMessage::System { .. }));
    if let Some(idx) = first_non_system {
        if matches!(out[idx], TurnMessage::Assistant { .. }) {
            out.insert(idx, TurnMessage::user(GOOGLE_TURN_OPENER));
            changed = true;
        }
    }

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(messages)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content sanitization (tool-result blocks)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scrub tool-result content per the provider's tolerance: `ImagesOnly`
/// replaces oversized inline images with a placeholder; `Full` also drops
/// empty text blocks and placeholder-fills results left with no content.
pub fn apply_sanitize_mode(
    messages: &[TurnMessage],
    mode: SanitizeMode,
) -> Cow<'_, [TurnMessage]> {
    if mode == SanitizeMode::None {
        return Cow::Borrowed(messages);
    }
    let full = mode == SanitizeMode::Full;

    let mut changed = false;
    let out: Vec<TurnMessage> = messages
        .iter()
        .map(|msg| match msg {
            TurnMessage::ToolResult {
                tool_call_id,
                tool_name,
                content,
                is_error,
            } => {
                let mut blocks: Vec<ResultBlock> = Vec::with_capacity(content.len());
                for block in content {
                    match block {
                        ResultBlock::Image { data, .. }
                            if data.len() > MAX_INLINE_IMAGE_CHARS =>
                        {
                            changed = true;
                            blocks.push(ResultBlock::Text {
                                text: IMAGE_OMITTED_TEXT.into(),
                            });
                        }
                        ResultBlock::Text { text } if full && text.is_empty() => {
                            changed = true;
                        }
                        other => blocks.push(other.clone()),
                    }
                }
                if full && blocks.is_empty() {
                    changed = true;
                    blocks.push(ResultBlock::Text {
                        text: EMPTY_RESULT_TEXT.into(),
                    });
                }
                TurnMessage::ToolResult {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    content: blocks,
                    is_error: *is_error,
                }
            }
            other => other.clone(),
        })
        .collect();

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(messages)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn validators (non-mutating audits)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A violation found while auditing turn structure. Validators report;
/// the repair passes are the only place that mutates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnIssue {
    UnpairedToolCall { id: String },
    OrphanToolResult { id: String },
    DuplicateToolResult { id: String },
    ConsecutiveAssistantTurns { index: usize },
    LeadingAssistantTurn,
}

impl fmt::Display for TurnIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnpairedToolCall { id } => write!(f, "tool call {id} has no result"),
            Self::OrphanToolResult { id } => write!(f, "tool result {id} has no owning call"),
            Self::DuplicateToolResult { id } => write!(f, "duplicate tool result {id}"),
            Self::ConsecutiveAssistantTurns { index } => {
                write!(f, "consecutive assistant turns at index {index}")
            }
            Self::LeadingAssistantTurn => {
                write!(f, "first non-system message is an assistant turn")
            }
        }
    }
}

fn audit_pairing(messages: &[TurnMessage]) -> Vec<TurnIssue> {
    let mut issues = Vec::new();
    // Ids from the most recent assistant message still awaiting results.
    let mut pending: Vec<String> = Vec::new();
    let mut seen_results: HashSet<String> = HashSet::new();

    for msg in messages {
        match msg {
            TurnMessage::Assistant { .. } => {
                issues.extend(
                    pending
                        .drain(..)
                        .map(|id| TurnIssue::UnpairedToolCall { id }),
                );
                pending = msg.tool_call_ids().iter().map(|s| s.to_string()).collect();
            }
            TurnMessage::ToolResult { tool_call_id, .. } => {
                if !seen_results.insert(tool_call_id.clone()) {
                    issues.push(TurnIssue::DuplicateToolResult {
                        id: tool_call_id.clone(),
                    });
                } else if let Some(pos) = pending.iter().position(|id| id == tool_call_id) {
                    pending.remove(pos);
                } else {
                    issues.push(TurnIssue::OrphanToolResult {
                        id: tool_call_id.clone(),
                    });
                }
            }
            _ => {
                issues.extend(
                    pending
                        .drain(..)
                        .map(|id| TurnIssue::UnpairedToolCall { id }),
                );
            }
        }
    }
    issues.extend(
        pending
            .drain(..)
            .map(|id| TurnIssue::UnpairedToolCall { id }),
    );
    issues
}

/// Audit a transcript against Anthropic's turn rules: strict pairing plus
/// no back-to-back assistant turns.
pub fn validate_anthropic_turns(messages: &[TurnMessage]) -> Vec<TurnIssue> {
    let mut issues = audit_pairing(messages);
    let mut prev_was_assistant = false;
    for (i, msg) in messages.iter().enumerate() {
        match msg {
            TurnMessage::Assistant { .. } => {
                if prev_was_assistant {
                    issues.push(TurnIssue::ConsecutiveAssistantTurns { index: i });
                }
                prev_was_assistant = true;
            }
            // A tool result fills the user slot in the alternation.
            TurnMessage::ToolResult { .. } => prev_was_assistant = false,
            _ => prev_was_assistant = false,
        }
    }
    issues
}

/// Audit a transcript against Gemini's turn rules: strict pairing plus a
/// user-first conversation.
pub fn validate_gemini_turns(messages: &[TurnMessage]) -> Vec<TurnIssue> {
    let mut issues = audit_pairing(messages);
    let first_non_system = messages
        .iter()
        .find(|m| !matches!(m, TurnMessage::System { .. }));
    if matches!(first_non_system, Some(TurnMessage::Assistant { .. })) {
        issues.push(TurnIssue::LeadingAssistantTurn);
    }
    issues
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
