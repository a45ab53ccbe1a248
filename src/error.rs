//! Error taxonomy for the detection pipeline and gateway.
//!
//! Only two families abort an invocation: `ParseError` (the input itself is
//! unusable) and `RelayError` (the routing action failed and must be retried
//! by the caller). Layer failures degrade the pipeline, persistence failures
//! degrade the outcome; neither is surfaced as a hard error.

pub const LAYER_HEURISTIC: &str = "heuristic";
pub const LAYER_ML: &str = "classifier";
pub const LAYER_LLM: &str = "explainer";

/// Genuinely unrecoverable input. Anything short of this degrades to
/// best-effort fields during parsing.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,

    #[error("unparseable message: {0}")]
    Malformed(String),
}

/// A pipeline layer could not produce a result. The orchestrator records the
/// degradation and continues with the layers that did run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LayerError {
    #[error("{layer} timed out after {timeout_ms}ms")]
    Timeout { layer: &'static str, timeout_ms: u64 },

    #[error("{layer} unavailable: {reason}")]
    Failed { layer: &'static str, reason: String },

    #[error("{layer} is not configured")]
    NotConfigured { layer: &'static str },
}

impl LayerError {
    pub fn layer(&self) -> &'static str {
        match self {
            LayerError::Timeout { layer, .. } => layer,
            LayerError::Failed { layer, .. } => layer,
            LayerError::NotConfigured { layer } => layer,
        }
    }

    pub fn failed(layer: &'static str, reason: impl Into<String>) -> Self {
        LayerError::Failed {
            layer,
            reason: reason.into(),
        }
    }
}

/// Storage write/read failure. Reported, never silently retried; a failed
/// persist does not block relay routing.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("record for message {0} already exists")]
    Duplicate(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

/// The delivery/quarantine action failed. Fatal to the invocation; the
/// caller retries with the same email id and relies on relay idempotency.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay request failed: {0}")]
    Transport(String),

    #[error("relay rejected action: HTTP {status}")]
    Rejected { status: u16 },

    #[error("conflicting route for {email_id}: already routed as {previous}")]
    Conflict { email_id: String, previous: String },
}

/// Top-level error surfaced by the handler entry point. Layer and
/// persistence failures degrade instead of appearing here; model-load
/// failures surface at handler construction.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
}
