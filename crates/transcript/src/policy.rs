//! Transcript policy resolution.
//!
//! Maps a (provider, modelApi, modelId) triple to the set of sanitizer
//! passes that must run before the transcript is replayed. Pure and total:
//! any combination of missing or empty inputs resolves to the all-off
//! default policy.

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy value
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool-call-id format constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallIdMode {
    #[default]
    None,
    /// `[A-Za-z0-9_-]`, at most 40 characters (OpenAI, Google).
    Strict,
    /// Alphanumeric, at most 9 characters (Mistral).
    Strict9,
}

/// Content scrubbing applied to tool-result blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SanitizeMode {
    #[default]
    None,
    ImagesOnly,
    Full,
}

/// Thought-signature scrubbing rules for Gemini models routed through
/// third-party providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtSignaturePolicy {
    pub allow_base64_only: bool,
    pub include_camel_case: bool,
}

/// Which sanitizer passes apply for one provider/model pair. Recomputed
/// per call from static rules; nothing here is persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TranscriptPolicy {
    pub repair_tool_pairing: bool,
    pub validate_anthropic_turns: bool,
    pub allow_synthetic_tool_results: bool,
    pub sanitize_tool_call_ids: bool,
    pub validate_gemini_turns: bool,
    pub apply_google_turn_ordering: bool,
    pub preserve_signatures: bool,
    pub normalize_antigravity_thinking_blocks: bool,
    pub tool_call_id_mode: ToolCallIdMode,
    pub sanitize_mode: SanitizeMode,
    pub sanitize_thought_signatures: Option<ThoughtSignaturePolicy>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolver input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identifiers for the model a transcript is about to be replayed to.
/// `model` is a fallback spelling for `model_id`.
#[derive(Debug, Clone, Default)]
pub struct PolicyInput {
    pub provider: Option<String>,
    pub model_api: Option<String>,
    pub model_id: Option<String>,
    pub model: Option<String>,
}

fn norm(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve the transcript policy for a provider/model pair.
///
/// Never fails; unknown or missing identifiers resolve to the default
/// (all passes off).
pub fn resolve_transcript_policy(input: &PolicyInput) -> TranscriptPolicy {
    let provider = norm(&input.provider);
    let model_api = norm(&input.model_api);
    let model_id = norm(&input.model_id).or_else(|| norm(&input.model));

    let provider_str = provider.as_deref().unwrap_or("");
    let api_str = model_api.as_deref().unwrap_or("");
    let model_str = model_id.as_deref().unwrap_or("");

    // Provider families. Plain OpenAI endpoints reject Anthropic-style
    // repair even when a Claude-named model is routed through them.
    let openai_family = provider_str.starts_with("openai");
    let openai_short_circuit = matches!(provider_str, "openai" | "openai-codex");
    let anthropic_direct = provider_str == "anthropic" || api_str == "anthropic-messages";
    let antigravity = provider_str == "google-antigravity" || api_str == "google-antigravity";
    let google_family = matches!(provider_str, "google" | "gemini" | "google-gemini-cli")
        || api_str == "google-gemini-cli";

    let claude_model = model_str.contains("claude");
    let gemini_model = model_str.contains("gemini");
    let mistral_like = provider_str == "mistral" || model_str.contains("mistral");

    let mut policy = TranscriptPolicy::default();

    // Anthropic-style repair: direct Anthropic path, or a Claude model on
    // any provider that has not short-circuited it.
    if anthropic_direct || (claude_model && !openai_short_circuit) {
        policy.repair_tool_pairing = true;
        policy.validate_anthropic_turns = true;
        policy.allow_synthetic_tool_results = true;
    }

    // Gemini on a Google-owned path gets Gemini turn rules instead of the
    // Anthropic validator.
    if api_str == "google-gemini-cli" || (google_family && gemini_model) {
        policy.repair_tool_pairing = true;
        policy.allow_synthetic_tool_results = true;
        policy.validate_gemini_turns = true;
        policy.apply_google_turn_ordering = true;
        policy.validate_anthropic_turns = false;
    }

    // Antigravity fronts multiple model families; signatures always
    // survive, and Claude models keep the Anthropic flags from above.
    if antigravity {
        policy.preserve_signatures = true;
        policy.normalize_antigravity_thinking_blocks = true;
    }

    // Gemini routed through a third-party aggregator: scrub thought
    // signatures, no Claude-specific flags.
    if gemini_model && !google_family && !antigravity && provider.is_some() {
        policy.sanitize_thought_signatures = Some(ThoughtSignaturePolicy {
            allow_base64_only: true,
            include_camel_case: true,
        });
    }

    // Tool-call-id constraints are an orthogonal axis.
    if mistral_like {
        policy.sanitize_tool_call_ids = true;
        policy.tool_call_id_mode = ToolCallIdMode::Strict9;
    } else if openai_family || provider_str == "google" {
        policy.sanitize_tool_call_ids = true;
        policy.tool_call_id_mode = ToolCallIdMode::Strict;
    } else if provider_str == "anthropic" {
        // Anthropic has no length constraint.
        policy.sanitize_tool_call_ids = false;
        policy.tool_call_id_mode = ToolCallIdMode::None;
    }

    policy.sanitize_mode = if openai_family {
        SanitizeMode::ImagesOnly
    } else if google_family || antigravity || provider_str == "anthropic" || mistral_like {
        SanitizeMode::Full
    } else {
        SanitizeMode::None
    };

    policy
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
