//! Remote data access for the FixIt Finder marketplace.
//!
//! This crate provides the typed HTTP surface of the backend: a REST
//! client for the row store, an authentication client for the identity
//! service, and one gateway function per remote operation.
//!
//! ## Features
//!
//! - **Client**: REST client with API-key and session bearer auth
//! - **Filter**: query builder for the row store's filter dialect
//! - **Gateway**: typed per-operation reads and writes
//! - **Session**: password sign-in, sign-up, and token refresh

mod client;
mod error;
mod filter;
mod gateway;
mod session;
pub mod tables;
mod types;

pub use client::StoreClient;
pub use error::StoreError;
pub use filter::{Filter, Order};
pub use gateway::Gateway;
pub use session::{
    AuthClient, Session, SharedSession, SignUpMetadata, SignUpOutcome, new_session_slot,
};
pub use types::*;
