//! # Event Adapters
//!
//! An adapter turns host events into cache lookups and off-thread work
//! without ever blocking the thread that fired the event. Each one
//! registers its listeners with an [`EventRegistry`] and resolves its
//! thread requirements through [`ThreadContracts`](crate::contracts::ThreadContracts).

use std::sync::Arc;

use crate::registry::{EventRegistry, ListenerId};

pub mod player_session;

pub use player_session::{
    PlayerId, PlayerJoined, PlayerLeft, PlayerSessionAdapter, UserData, UserDataStore,
};

/// A bundle of listeners installed together.
pub trait EventAdapter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Registers this adapter's listeners, returning their ids.
    fn register(self: Arc<Self>, registry: &EventRegistry) -> Vec<ListenerId>;
}
