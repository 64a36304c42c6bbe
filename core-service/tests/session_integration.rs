//! End-to-end session behaviour: host events in, main-thread handlers out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use bridge_traits::host::BoundThread;
use core_async::time::sleep;
use core_dispatch::{FetchError, FutureHandle, Outcome, ThreadContext};
use core_runtime::config::{CoreConfig, ThreadRequirement};
use core_service::adapters::{PlayerId, PlayerJoined, PlayerLeft, UserData};
use core_service::{CoreService, ExecutionType, PlayerSessionAdapter, UserDataStore};

/// Store whose loads take `delay` and always find Alice.
struct SlowStore {
    delay: Duration,
    loads: AtomicUsize,
    saved: Mutex<Vec<(PlayerId, UserData)>>,
}

impl SlowStore {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            loads: AtomicUsize::new(0),
            saved: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl UserDataStore for SlowStore {
    async fn load(&self, _player: &PlayerId) -> anyhow::Result<UserData> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        Ok(UserData {
            name: "Alice".to_string(),
        })
    }

    async fn save(&self, player: &PlayerId, data: &UserData) -> anyhow::Result<()> {
        self.saved.lock().unwrap().push((player.clone(), data.clone()));
        Ok(())
    }
}

fn wait(handle: &FutureHandle<()>) -> Outcome<()> {
    let (tx, rx) = mpsc::channel();
    handle.on_complete_in(ThreadContext::Any, move |outcome| tx.send(outcome).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn desktop_config() -> CoreConfig {
    CoreConfig::builder()
        .tick_interval(Duration::from_millis(1))
        .worker_threads(2)
        .build()
        .unwrap()
}

#[test]
fn concurrent_joins_share_one_load_and_apply_on_the_main_thread() {
    let (service, host) = CoreService::start_desktop(desktop_config()).unwrap();
    let store = SlowStore::new(Duration::from_millis(50));
    let applied_on = Arc::new(Mutex::new(Vec::new()));

    let record = Arc::clone(&applied_on);
    let adapter = Arc::new(
        PlayerSessionAdapter::new(
            store.clone(),
            Arc::new(service.cache()),
            service.registry().contracts(),
        )
        .on_loaded(move |_, data| {
            let thread = thread::current().name().map(str::to_string);
            record.lock().unwrap().push((thread, data.name.clone()));
        }),
    );
    service.install(Arc::clone(&adapter)).unwrap();

    let joins: Vec<_> = (0..2)
        .map(|_| {
            let registry = Arc::clone(service.registry());
            thread::spawn(move || {
                let done = registry.fire(
                    PlayerJoined {
                        player: "player-42".into(),
                    },
                    ExecutionType::Concurrent,
                );
                wait(&done)
            })
        })
        .collect();
    for join in joins {
        assert!(join.join().unwrap().is_ok());
    }

    assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    let applied = applied_on.lock().unwrap();
    assert_eq!(applied.len(), 2);
    for (thread, name) in applied.iter() {
        assert_eq!(thread.as_deref(), Some("server-main"));
        assert_eq!(name, "Alice");
    }
    assert!(adapter.is_online(&PlayerId::from("player-42")));

    host.stop();
}

#[test]
fn leaving_saves_player_data() {
    let (service, _host) = CoreService::start_desktop(desktop_config()).unwrap();
    let store = SlowStore::new(Duration::from_millis(5));
    let (adapter, listeners) = service.install_player_sessions(store.clone()).unwrap();
    assert_eq!(listeners.len(), 2);

    let player = PlayerId::from("player-42");
    let joined = service.registry().fire(
        PlayerJoined {
            player: player.clone(),
        },
        ExecutionType::Consecutive,
    );
    assert!(wait(&joined).is_ok());

    let left = service.registry().fire(
        PlayerLeft {
            player: player.clone(),
        },
        ExecutionType::Consecutive,
    );
    assert!(wait(&left).is_ok());

    assert!(!adapter.is_online(&player));
    assert_eq!(
        *store.saved.lock().unwrap(),
        vec![(
            player,
            UserData {
                name: "Alice".to_string()
            }
        )]
    );
}

#[test]
fn leaving_before_the_load_finishes_keeps_the_player_offline() {
    let (service, _host) = CoreService::start_desktop(desktop_config()).unwrap();
    let store = SlowStore::new(Duration::from_millis(50));
    let (adapter, _) = service.install_player_sessions(store.clone()).unwrap();
    let player = PlayerId::from("player-42");

    let joined = adapter.handle_join(&PlayerJoined {
        player: player.clone(),
    });
    let left = adapter.handle_leave(&PlayerLeft {
        player: player.clone(),
    });

    assert!(wait(&left).is_ok());
    assert!(matches!(wait(&joined), Err(FetchError::Cancelled)));
    assert!(!adapter.is_online(&player));
    assert!(store.saved.lock().unwrap().is_empty());

    // A later join starts a fresh session.
    let rejoined = adapter.handle_join(&PlayerJoined {
        player: player.clone(),
    });
    assert!(wait(&rejoined).is_ok());
    assert!(adapter.is_online(&player));
    assert_eq!(store.loads.load(Ordering::SeqCst), 2);
}

#[test]
fn dispose_fails_joins_still_waiting_with_dispatcher_closed() {
    // Never drained: main-thread continuations can only be abandoned.
    let main = Arc::new(BoundThread::new("server-main"));
    let service = CoreService::new(desktop_config(), main).unwrap();
    let (_adapter, _) = service
        .install_player_sessions(SlowStore::new(Duration::from_millis(200)))
        .unwrap();

    let done = service.registry().fire(
        PlayerJoined {
            player: "player-42".into(),
        },
        ExecutionType::Concurrent,
    );
    service.dispose();

    assert!(matches!(wait(&done), Err(FetchError::DispatcherClosed)));
}

#[tokio::test]
async fn fetch_timeout_fails_the_join_but_not_the_cache_entry() {
    let config = CoreConfig::builder()
        .fetch_timeout(Duration::from_millis(20))
        .event_contract("player_joined", ThreadRequirement::Anywhere)
        .worker_threads(2)
        .build()
        .unwrap();
    let service = CoreService::new(config, Arc::new(BoundThread::new("server-main"))).unwrap();
    let store = SlowStore::new(Duration::from_millis(200));
    let (adapter, _) = service.install_player_sessions(store.clone()).unwrap();
    assert_eq!(service.context_for("player_joined"), ThreadContext::Any);

    let done = service.registry().fire(
        PlayerJoined {
            player: "player-42".into(),
        },
        ExecutionType::Concurrent,
    );
    let player = PlayerId::from("player-42");

    // The listener's failure is logged; the fire itself still completes.
    assert!(done.outcome().await.is_ok());
    assert!(!adapter.is_online(&player));
    assert!(adapter.cache().contains(&player));
    assert_eq!(store.loads.load(Ordering::SeqCst), 1);
}
