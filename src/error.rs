//! Error types for the job-lifecycle core.

use thiserror::Error;

/// Errors raised by the orchestrator and the components it drives.
///
/// `TransferFailed` and `ListingFailed` are transient: jobs log them and the
/// next cycle retries. Every other variant is fatal.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing required config key '{key}' for {context}")]
    MissingConfigKey { key: String, context: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown job variant '{0}' (expected one of: whole, sharded, sliced)")]
    UnknownVariant(String),

    #[error(
        "job {job}: found more artifacts ({found}) than expected ({expected}), refusing to continue"
    )]
    ArtifactOverCount {
        job: String,
        found: usize,
        expected: usize,
    },

    #[error("chained job {job} already has complete output before its first start (predecessor ids: {predecessor_ids:?})")]
    ChainAlreadyFinished {
        job: String,
        predecessor_ids: Vec<String>,
    },

    #[error("chain starting at {job} revisits workspace {path}")]
    ChainCycle { job: String, path: String },

    #[error("lost connection to {host}: {detail}")]
    ConnectionLost { host: String, detail: String },

    #[error("failed to transfer {local} to {remote}: {detail}")]
    TransferFailed {
        local: String,
        remote: String,
        detail: String,
    },

    #[error("'{command}' failed: {detail}")]
    ListingFailed { command: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
