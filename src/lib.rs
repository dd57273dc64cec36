//! Block server library: a replicated, versioned key-value store.
//!
//! Nodes elect a leader among themselves, replicate client writes through
//! the leader's log, and serve reads from the committed state. Every client
//! request carries a token naming the principal whose keys it may touch.

use std::sync::Arc;

pub mod auth;
pub mod client;
pub mod cluster;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod store;

use crate::auth::TokenVerifier;
use crate::cluster::ConsensusNode;
use crate::config::Config;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// This node's consensus core and replicated store.
    pub node: Arc<ConsensusNode>,
    /// Client token verifier.
    pub verifier: Arc<dyn TokenVerifier>,
}
