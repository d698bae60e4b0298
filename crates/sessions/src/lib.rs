//! Session state: the on-disk session store, session-key computation, and
//! the cross-process session write lock.

pub mod lock;
pub mod session_key;
pub mod store;

pub use lock::{
    spawn_signal_cleanup, LockOptions, OsLiveness, ProcessLiveness, SessionLockGuard,
    SessionLockManager,
};
pub use session_key::{compute_session_key, DmScope, InboundMetadata};
pub use store::{resolve_agent_id_from_session_key, SessionEntry, SessionStore};
