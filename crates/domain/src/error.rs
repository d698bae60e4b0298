/// Shared error type used across all Switchboard crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lock timeout after {waited_ms}ms: {path}")]
    LockTimeout { path: String, waited_ms: u64 },

    #[error("gateway: {0}")]
    Gateway(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
