//! Client-side data synchronization for the FixIt Finder marketplace.
//!
//! This crate keeps a local view of server entities consistent with the
//! remote store: reads go through a stale-while-revalidate query cache,
//! writes run optimistically with compare-and-restore rollback, and chat
//! data is folded live from a WebSocket change feed.
//!
//! ## Features
//!
//! - **Cache**: keyed query cache with request dedup, staleness policies,
//!   and subscriber-aware garbage collection
//! - **Mutations**: optimistic patch / remote write / commit-or-rollback
//!   orchestration with targeted invalidation
//! - **Realtime**: reference-counted change feed channels with reconnect,
//!   idempotent folds into the cache, and typing fan-out
//! - **Facade**: one [`SyncClient`] wiring gateway, cache, mutations, and
//!   realtime together

mod cache;
mod client;
mod error;
pub mod key;
mod mutation;
mod policy;
mod realtime;
mod typing;

pub use cache::{QueryCache, QueryData, QueryRef};
pub use client::{
    ChatSession, DEFAULT_REALTIME_GIVE_UP, SyncClient, SyncClientBuilder, SyncConfig,
};
pub use error::SyncError;
pub use key::{KeyPart, KeyPattern, QueryKey, TypedKey, keys};
pub use mutation::{MutationEngine, MutationPlan, TrackedMutation};
pub use policy::{PolicyTable, QueryPolicy};
pub use realtime::{
    ChangeEvent, ChangeOp, ChannelHandle, ChannelSpec, ChannelState, ClientFrame, MessageHook,
    RealtimeBridge, ServerFrame,
};
pub use typing::{TypingEvent, TypingEvents, TypingPublisher};
