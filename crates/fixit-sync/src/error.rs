use fixit_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the sync layer.
///
/// Gateway failures pass through as [`SyncError::Store`]. The two extra
/// variants are produced here: `Stale` when a mutation's optimistic
/// patches were rolled back, `SubscriptionLost` when a realtime channel
/// exhausted its reconnection budget.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("optimistic update rolled back: {source}")]
    Stale { source: StoreError },

    #[error("realtime subscription lost: {topic}")]
    SubscriptionLost { topic: String },

    #[error("realtime transport: {0}")]
    Transport(String),
}
