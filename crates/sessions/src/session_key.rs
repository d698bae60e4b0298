//! Session key computation.
//!
//! Key templates:
//! - `agent:<agentId>:main`                                (DM scope = main)
//! - `agent:<agentId>:dm:<peerId>`                         (DM scope = per-peer)
//! - `agent:<agentId>:<channel>:dm:<peerId>`               (DM scope = per-channel-peer)
//! - `agent:<agentId>:<channel>:<accountId>:dm:<peerId>`   (DM scope = per-account-channel-peer)
//! - `agent:<agentId>:<channel>:group:<groupId>`
//! - `agent:<agentId>:<channel>:channel:<channelId>`
//! - `...:thread:<threadId>`

use serde::{Deserialize, Serialize};

/// How direct-message conversations map onto sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    /// All DMs share the agent's main session.
    Main,
    /// One session per peer, regardless of channel.
    PerPeer,
    /// One session per (channel, peer).
    PerChannelPeer,
    /// One session per (channel, account, peer).
    PerAccountChannelPeer,
}

impl Default for DmScope {
    fn default() -> Self {
        Self::Main
    }
}

/// Metadata about an inbound message, as reported by the channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMetadata {
    pub channel: Option<String>,
    pub account_id: Option<String>,
    pub peer_id: Option<String>,
    pub group_id: Option<String>,
    pub channel_id: Option<String>,
    pub thread_id: Option<String>,
    pub is_direct: bool,
}

/// Compute a stable session key from the agent ID, DM scope, and inbound
/// message metadata. The key deterministically routes messages to sessions.
pub fn compute_session_key(agent_id: &str, dm_scope: DmScope, meta: &InboundMetadata) -> String {
    let base = format!("agent:{agent_id}");

    // Groups and channels always isolate by their own identifier.
    if !meta.is_direct {
        let key = compute_group_key(&base, meta);
        return maybe_append_thread(key, meta);
    }

    let peer = meta.peer_id.as_deref().unwrap_or("unknown");
    let key = match dm_scope {
        DmScope::Main => format!("{base}:main"),
        DmScope::PerPeer => format!("{base}:dm:{peer}"),
        DmScope::PerChannelPeer => {
            let ch = meta.channel.as_deref().unwrap_or("default");
            format!("{base}:{ch}:dm:{peer}")
        }
        DmScope::PerAccountChannelPeer => {
            let ch = meta.channel.as_deref().unwrap_or("default");
            let acct = meta.account_id.as_deref().unwrap_or("default");
            format!("{base}:{ch}:{acct}:dm:{peer}")
        }
    };

    maybe_append_thread(key, meta)
}

fn compute_group_key(base: &str, meta: &InboundMetadata) -> String {
    let ch = meta.channel.as_deref().unwrap_or("default");
    match (meta.group_id.as_deref(), meta.channel_id.as_deref()) {
        (Some(group), Some(channel)) => format!("{base}:{ch}:group:{group}:channel:{channel}"),
        (Some(group), None) => format!("{base}:{ch}:group:{group}"),
        (None, Some(channel)) => format!("{base}:{ch}:channel:{channel}"),
        // Group message without an identifiable group.
        (None, None) => format!("{base}:{ch}:group:unknown"),
    }
}

fn maybe_append_thread(mut key: String, meta: &InboundMetadata) -> String {
    if let Some(tid) = &meta.thread_id {
        key.push_str(":thread:");
        key.push_str(tid);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(channel: &str, peer: &str, is_direct: bool) -> InboundMetadata {
        InboundMetadata {
            channel: Some(channel.into()),
            peer_id: Some(peer.into()),
            is_direct,
            ..Default::default()
        }
    }

    #[test]
    fn dm_main_scope() {
        let key = compute_session_key("bot1", DmScope::Main, &meta("discord", "alice", true));
        assert_eq!(key, "agent:bot1:main");
    }

    #[test]
    fn dm_per_peer() {
        let key = compute_session_key("bot1", DmScope::PerPeer, &meta("discord", "alice", true));
        assert_eq!(key, "agent:bot1:dm:alice");
    }

    #[test]
    fn dm_per_channel_peer() {
        let key =
            compute_session_key("bot1", DmScope::PerChannelPeer, &meta("discord", "alice", true));
        assert_eq!(key, "agent:bot1:discord:dm:alice");
    }

    #[test]
    fn dm_per_account_channel_peer() {
        let m = InboundMetadata {
            channel: Some("discord".into()),
            account_id: Some("acct1".into()),
            peer_id: Some("alice".into()),
            is_direct: true,
            ..Default::default()
        };
        let key = compute_session_key("bot1", DmScope::PerAccountChannelPeer, &m);
        assert_eq!(key, "agent:bot1:discord:acct1:dm:alice");
    }

    #[test]
    fn group_message() {
        let m = InboundMetadata {
            channel: Some("discord".into()),
            group_id: Some("server42".into()),
            channel_id: Some("general".into()),
            is_direct: false,
            ..Default::default()
        };
        let key = compute_session_key("bot1", DmScope::PerChannelPeer, &m);
        assert_eq!(key, "agent:bot1:discord:group:server42:channel:general");
    }

    #[test]
    fn thread_appended() {
        let m = InboundMetadata {
            channel: Some("discord".into()),
            group_id: Some("server42".into()),
            thread_id: Some("thread99".into()),
            is_direct: false,
            ..Default::default()
        };
        let key = compute_session_key("bot1", DmScope::PerChannelPeer, &m);
        assert_eq!(key, "agent:bot1:discord:group:server42:thread:thread99");
    }

    #[test]
    fn key_round_trips_through_agent_id_resolution() {
        let key = compute_session_key("bot1", DmScope::PerPeer, &meta("slack", "bob", true));
        assert_eq!(
            crate::store::resolve_agent_id_from_session_key(&key),
            Some("bot1")
        );
    }
}
