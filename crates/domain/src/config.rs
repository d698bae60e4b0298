//! Queue and session-store configuration types.
//!
//! Loading/validation of the full gateway config lives outside this core;
//! these are only the slices the dispatch and session layers consume.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a message for a busy session is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    /// Accumulate; deliver everything concatenated when the turn ends.
    Collect,
    /// Single pending slot; the latest message wins.
    Followup,
    /// Inject into the live turn's input stream; nothing is persisted.
    Steer,
    /// Try to steer; on failure append to the backlog.
    SteerBacklog,
    /// Drop the pending backlog and deliver this message first.
    Interrupt,
}

impl Default for QueueMode {
    fn default() -> Self {
        Self::Followup
    }
}

impl QueueMode {
    /// Modes that begin with a live-steer attempt.
    pub fn wants_steer(self) -> bool {
        matches!(self, Self::Steer | Self::SteerBacklog)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Followup => "followup",
            Self::Steer => "steer",
            Self::SteerBacklog => "steer-backlog",
            Self::Interrupt => "interrupt",
        }
    }
}

/// Queue-mode settings: one default plus per-channel overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default)]
    pub default_mode: QueueMode,
    #[serde(default)]
    pub per_channel: HashMap<String, QueueMode>,
}

impl QueueSettings {
    pub fn mode_for(&self, channel: Option<&str>) -> QueueMode {
        channel
            .and_then(|ch| self.per_channel.get(ch).copied())
            .unwrap_or(self.default_mode)
    }
}

/// Where a session store file lives. The path may contain an `{agentId}`
/// placeholder so each agent gets its own store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    pub path: String,
}

impl SessionStoreConfig {
    pub fn resolve_store_path(&self, agent_id: &str) -> PathBuf {
        PathBuf::from(self.path.replace("{agentId}", agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_mode_serde_kebab_case() {
        let mode: QueueMode = serde_json::from_str("\"steer-backlog\"").unwrap();
        assert_eq!(mode, QueueMode::SteerBacklog);
        assert_eq!(serde_json::to_string(&QueueMode::Collect).unwrap(), "\"collect\"");
    }

    #[test]
    fn mode_for_prefers_channel_override() {
        let mut settings = QueueSettings {
            default_mode: QueueMode::Followup,
            per_channel: HashMap::new(),
        };
        settings.per_channel.insert("slack".into(), QueueMode::Steer);

        assert_eq!(settings.mode_for(Some("slack")), QueueMode::Steer);
        assert_eq!(settings.mode_for(Some("telegram")), QueueMode::Followup);
        assert_eq!(settings.mode_for(None), QueueMode::Followup);
    }

    #[test]
    fn store_path_template() {
        let cfg = SessionStoreConfig {
            path: "/var/lib/switchboard/{agentId}/sessions.json".into(),
        };
        assert_eq!(
            cfg.resolve_store_path("main"),
            PathBuf::from("/var/lib/switchboard/main/sessions.json")
        );
    }
}
