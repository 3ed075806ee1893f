//! Error types for the row-store gateway.

use thiserror::Error;

/// Errors surfaced by the remote row store and the identity service.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row matched the request.
    #[error("not found in {table}{}", match id {
        Some(id) => format!(": {id}"),
        None => String::new(),
    })]
    NotFound { table: String, id: Option<String> },

    /// The row policy rejected the read or write.
    #[error("permission denied on {table}: {detail}")]
    PermissionDenied { table: String, detail: String },

    /// The write collided with a constraint or concurrent change.
    #[error("conflict on {table}: {detail}")]
    Conflict { table: String, detail: String },

    /// The server is throttling us.
    #[error("rate limited on {table}{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {secs}s)"),
        None => String::new(),
    })]
    RateLimited {
        table: String,
        retry_after_secs: Option<u64>,
    },

    /// The identity service rejected the credentials or session.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The response body did not parse as the expected shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport failure, timeout, or an unclassified server response.
    #[error("store error: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unknown(err.to_string())
    }
}
