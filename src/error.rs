use std::time::Duration;

/// Failures surfaced by the pipeline and its adapters.
///
/// None of these are fatal: the pipeline logs them, counts them and moves
/// on to the next tuple.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
