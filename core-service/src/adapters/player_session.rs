//! Loads a player's data when they join and saves it when they leave.
//!
//! Loads go through a [`SingleFlightCache`], so repeated joins (or several
//! subsystems asking at once) cost one store read. The loaded data lands in
//! the online-player table from a handler running on the join event's
//! contract context, which is the main thread by default.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use core_cache::SingleFlightCache;
use core_dispatch::{FetchError, FutureHandle, SuspendToFutureBridge, ThreadContext};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::EventAdapter;
use crate::contracts::ThreadContracts;
use crate::registry::{EventRegistry, HostEvent, ListenerId, ListenerOptions};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserData {
    pub name: String,
}

/// Persistent storage for per-player data.
#[async_trait]
pub trait UserDataStore: Send + Sync {
    async fn load(&self, player: &PlayerId) -> anyhow::Result<UserData>;

    async fn save(&self, player: &PlayerId, data: &UserData) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PlayerJoined {
    pub player: PlayerId,
}

impl HostEvent for PlayerJoined {
    const NAME: &'static str = "player_joined";
}

#[derive(Debug, Clone)]
pub struct PlayerLeft {
    pub player: PlayerId,
}

impl HostEvent for PlayerLeft {
    const NAME: &'static str = "player_left";
}

type LoadedHook = Arc<dyn Fn(&PlayerId, &UserData) + Send + Sync>;
type OnlineTable = Arc<Mutex<HashMap<PlayerId, UserData>>>;
/// Leaves seen per player. A join only applies its data if no leave for
/// that player happened after the join started.
type LeaveEpochs = Arc<Mutex<HashMap<PlayerId, u64>>>;

pub struct PlayerSessionAdapter {
    store: Arc<dyn UserDataStore>,
    cache: Arc<SingleFlightCache<PlayerId, UserData>>,
    bridge: SuspendToFutureBridge,
    join_context: ThreadContext,
    leave_context: ThreadContext,
    fetch_timeout: Option<Duration>,
    online: OnlineTable,
    leaves: LeaveEpochs,
    on_loaded: Option<LoadedHook>,
}

impl PlayerSessionAdapter {
    pub fn new(
        store: Arc<dyn UserDataStore>,
        cache: Arc<SingleFlightCache<PlayerId, UserData>>,
        contracts: &ThreadContracts,
    ) -> Self {
        Self {
            store,
            bridge: cache.bridge().clone(),
            cache,
            join_context: contracts.context_for(PlayerJoined::NAME),
            leave_context: contracts.context_for(PlayerLeft::NAME),
            fetch_timeout: None,
            online: Arc::new(Mutex::new(HashMap::new())),
            leaves: Arc::new(Mutex::new(HashMap::new())),
            on_loaded: None,
        }
    }

    /// Fail a join's load after `timeout`. The underlying fetch keeps
    /// running and still populates the cache.
    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Host logic run on the join contract context once a player's data
    /// is available (a welcome message, say).
    pub fn on_loaded<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PlayerId, &UserData) + Send + Sync + 'static,
    {
        self.on_loaded = Some(Arc::new(hook));
        self
    }

    pub fn cache(&self) -> &Arc<SingleFlightCache<PlayerId, UserData>> {
        &self.cache
    }

    pub fn is_online(&self, player: &PlayerId) -> bool {
        self.online().contains_key(player)
    }

    pub fn user_data(&self, player: &PlayerId) -> Option<UserData> {
        self.online().get(player).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.online().len()
    }

    fn online(&self) -> std::sync::MutexGuard<'_, HashMap<PlayerId, UserData>> {
        self.online.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts (or joins) the load for the joining player and returns at
    /// once. The returned handle settles after the player's data has been
    /// applied, or with the load's error. If the player leaves before the
    /// load completes, nothing is applied and the handle fails with
    /// [`FetchError::Cancelled`].
    #[instrument(skip_all, fields(player = %event.player))]
    pub fn handle_join(&self, event: &PlayerJoined) -> FutureHandle<()> {
        let store = Arc::clone(&self.store);
        let loaded = self
            .cache
            .get_or_fetch(event.player.clone(), self.join_context.clone(), move |player| {
                let player = player.clone();
                async move { store.load(&player).await.map_err(FetchError::failed) }
            });
        let loaded = match self.fetch_timeout {
            Some(timeout) => self.bridge.with_timeout(&loaded, timeout),
            None => loaded,
        };

        let done = self.bridge.handle::<()>(self.join_context.clone());
        let player = event.player.clone();
        let online = Arc::clone(&self.online);
        let leaves = Arc::clone(&self.leaves);
        let epoch = leave_epoch(&self.leaves, &player);
        let hook = self.on_loaded.clone();
        let settled = done.clone();
        loaded.on_complete(move |outcome| match outcome {
            Ok(data) => {
                {
                    let leaves = leaves.lock().unwrap_or_else(PoisonError::into_inner);
                    if leaves.get(&player).copied().unwrap_or(0) != epoch {
                        debug!(player = %player, "Player left before their data loaded");
                        drop(leaves);
                        settled.fail(FetchError::Cancelled);
                        return;
                    }
                    online
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(player.clone(), data.clone());
                }
                debug!(player = %player, name = %data.name, "Player data loaded");
                if let Some(hook) = &hook {
                    hook(&player, &data);
                }
                settled.succeed(());
            }
            Err(error) => {
                warn!(player = %player, %error, "Failed to load player data");
                settled.fail(error);
            }
        });
        done
    }

    /// Removes the player from the online table, invalidates their cache
    /// entry and saves their data off-thread.
    #[instrument(skip_all, fields(player = %event.player))]
    pub fn handle_leave(&self, event: &PlayerLeft) -> FutureHandle<()> {
        let data = {
            let mut leaves = self.leaves.lock().unwrap_or_else(PoisonError::into_inner);
            *leaves.entry(event.player.clone()).or_insert(0) += 1;
            self.online().remove(&event.player)
        };
        self.cache.invalidate(&event.player);

        let Some(data) = data else {
            debug!("Player was not online, nothing to save");
            return FutureHandle::resolved(
                Arc::clone(self.bridge.dispatcher()),
                self.leave_context.clone(),
                Ok(()),
            );
        };

        let store = Arc::clone(&self.store);
        let player = event.player.clone();
        self.bridge.invoke(
            async move {
                let saved = store.save(&player, &data).await.map_err(FetchError::failed);
                if saved.is_ok() {
                    info!(player = %player, "Player data saved");
                }
                saved
            },
            self.leave_context.clone(),
        )
    }
}

fn leave_epoch(leaves: &LeaveEpochs, player: &PlayerId) -> u64 {
    leaves
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(player)
        .copied()
        .unwrap_or(0)
}

impl EventAdapter for PlayerSessionAdapter {
    fn name(&self) -> &'static str {
        "player_session"
    }

    fn register(self: Arc<Self>, registry: &EventRegistry) -> Vec<ListenerId> {
        let joins = Arc::clone(&self);
        let leaves = self;
        vec![
            registry.register_with(
                ListenerOptions::new().ignore_cancelled(),
                move |event: &PlayerJoined| joins.handle_join(event),
            ),
            registry.register(move |event: &PlayerLeft| leaves.handle_leave(event)),
        ]
    }
}

impl fmt::Debug for PlayerSessionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerSessionAdapter")
            .field("join_context", &self.join_context)
            .field("leave_context", &self.leave_context)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("online", &self.online_count())
            .finish()
    }
}
