use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("download {0} is already running")]
    AlreadyRunning(String),

    #[error("no running download with id {0}")]
    JobNotRunning(String),

    /// User-facing outcome of a failed metadata resolution; carries no internal detail.
    #[error("could not fetch metadata for this resource")]
    MetadataNotFound,

    #[error("metadata fetch failed: {0}")]
    MetadataFetch(String),

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {secs}s")]
    TimedOut { tool: String, secs: u64 },

    #[error("download manager is no longer running")]
    ManagerClosed,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
