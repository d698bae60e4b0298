//! Session store backed by a JSON file.
//!
//! Each session key maps to a [`SessionEntry`] tracking the agent session
//! ID and the last-known delivery route. The file is a plain JSON map so
//! other tooling can inspect it; cross-process writers coordinate through
//! the session write lock in [`crate::lock`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use swb_domain::error::Result;
use swb_domain::route::DeliveryRoute;
use swb_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single tracked session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_key: String,
    /// Agent-side session ID, absent until the first turn completes.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub last_channel: Option<String>,
    #[serde(default)]
    pub last_provider: Option<String>,
    #[serde(default)]
    pub last_to: Option<String>,
    #[serde(default)]
    pub last_account_id: Option<String>,
    #[serde(default)]
    pub last_thread_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new(session_key: &str) -> Self {
        Self {
            session_key: session_key.to_owned(),
            session_id: None,
            last_channel: None,
            last_provider: None,
            last_to: None,
            last_account_id: None,
            last_thread_id: None,
            updated_at: Utc::now(),
        }
    }

    /// The last-known delivery route recorded on this entry.
    pub fn last_route(&self) -> DeliveryRoute {
        DeliveryRoute {
            channel: self.last_channel.clone(),
            provider: self.last_provider.clone(),
            to: self.last_to.clone(),
            account_id: self.last_account_id.clone(),
            thread_id: self.last_thread_id.clone(),
        }
    }
}

/// Extract the agent ID from a `agent:<agentId>:...` session key.
pub fn resolve_agent_id_from_session_key(session_key: &str) -> Option<&str> {
    let rest = session_key.strip_prefix("agent:")?;
    let agent_id = rest.split(':').next()?;
    if agent_id.is_empty() {
        None
    } else {
        Some(agent_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory view of one agent's session file.
pub struct SessionStore {
    path: PathBuf,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    /// Load the store at `path`, creating parent directories. A missing or
    /// unreadable file starts empty rather than failing: the store is a
    /// cache of routing state, not a source of truth.
    pub fn load(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let sessions: HashMap<String, SessionEntry> = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %path.display(),
            "session store loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            sessions: RwLock::new(sessions),
        })
    }

    pub fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.sessions.read().get(session_key).cloned()
    }

    /// Fetch the entry for a key, creating a blank one if absent.
    /// Returns `(entry, is_new)`.
    pub fn resolve_or_create(&self, session_key: &str) -> (SessionEntry, bool) {
        {
            let sessions = self.sessions.read();
            if let Some(entry) = sessions.get(session_key) {
                return (entry.clone(), false);
            }
        }

        let entry = SessionEntry::new(session_key);
        self.sessions
            .write()
            .insert(session_key.to_owned(), entry.clone());

        TraceEvent::SessionResolved {
            session_key: session_key.to_owned(),
            session_id: None,
            is_new: true,
        }
        .emit();

        (entry, true)
    }

    /// Record the agent-side session ID once the first turn reports it.
    pub fn set_session_id(&self, session_key: &str, session_id: &str) {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| SessionEntry::new(session_key));
        entry.session_id = Some(session_id.to_owned());
        entry.updated_at = Utc::now();
    }

    /// Update the last-known delivery route. Only fields present on the
    /// route overwrite the stored values.
    pub fn record_route(&self, session_key: &str, route: &DeliveryRoute) {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_key.to_owned())
            .or_insert_with(|| SessionEntry::new(session_key));

        if route.channel.is_some() {
            entry.last_channel = route.channel.clone();
        }
        if route.provider.is_some() {
            entry.last_provider = route.provider.clone();
        }
        if route.to.is_some() {
            entry.last_to = route.to.clone();
        }
        if route.account_id.is_some() {
            entry.last_account_id = route.account_id.clone();
        }
        if route.thread_id.is_some() {
            entry.last_thread_id = route.thread_id.clone();
        }
        entry.updated_at = Utc::now();
    }

    pub fn list(&self) -> Vec<SessionEntry> {
        self.sessions.read().values().cloned().collect()
    }

    /// Persist the current state to disk. Callers hold the session write
    /// lock across load-mutate-flush when other processes share the file.
    pub fn flush(&self) -> Result<()> {
        let sessions = self.sessions.read();
        let json = serde_json::to_string_pretty(&*sessions)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_resolution() {
        assert_eq!(
            resolve_agent_id_from_session_key("agent:main:discord:dm:alice"),
            Some("main")
        );
        assert_eq!(resolve_agent_id_from_session_key("agent:solo"), Some("solo"));
        assert_eq!(resolve_agent_id_from_session_key("session:main"), None);
        assert_eq!(resolve_agent_id_from_session_key("agent:"), None);
    }

    #[test]
    fn load_flush_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = SessionStore::load(&path).unwrap();
        let (_, is_new) = store.resolve_or_create("agent:main:main");
        assert!(is_new);
        store.set_session_id("agent:main:main", "sess-1");
        store.flush().unwrap();

        let reloaded = SessionStore::load(&path).unwrap();
        let entry = reloaded.get("agent:main:main").unwrap();
        assert_eq!(entry.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn record_route_updates_only_present_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(&dir.path().join("s.json")).unwrap();

        store.record_route(
            "agent:main:main",
            &DeliveryRoute {
                channel: Some("slack".into()),
                to: Some("U1".into()),
                ..Default::default()
            },
        );
        store.record_route(
            "agent:main:main",
            &DeliveryRoute {
                to: Some("U2".into()),
                ..Default::default()
            },
        );

        let entry = store.get("agent:main:main").unwrap();
        assert_eq!(entry.last_channel.as_deref(), Some("slack"));
        assert_eq!(entry.last_to.as_deref(), Some("U2"));
        assert!(entry.last_provider.is_none());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "not json").unwrap();

        let store = SessionStore::load(&path).unwrap();
        assert!(store.list().is_empty());
    }

    #[test]
    fn last_route_mirrors_entry_fields() {
        let mut entry = SessionEntry::new("agent:main:main");
        entry.last_channel = Some("telegram".into());
        entry.last_thread_id = Some("t9".into());

        let route = entry.last_route();
        assert_eq!(route.channel.as_deref(), Some("telegram"));
        assert_eq!(route.thread_id.as_deref(), Some("t9"));
        assert!(route.to.is_none());
    }
}
