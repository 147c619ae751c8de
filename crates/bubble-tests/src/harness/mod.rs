pub mod engine;

use bubble::protocol::{SessionHandle, Uuid};
use bubble::{Bridge, ClientState, ClientStore, LocationSync};
use engine::{MemoryEngine, SeededUser};
use std::sync::Arc;
use std::time::Duration;

pub type TestStore = ClientStore<Arc<MemoryEngine>>;
pub type TestSync = LocationSync<Arc<MemoryEngine>>;

pub const PASSWORD: &str = "correct horse";

/// A client store wired to its own in-memory engine.
pub struct TestClient {
    pub engine: Arc<MemoryEngine>,
    pub store: Arc<TestStore>,
}

impl TestClient {
    /// A store whose session has not been initialized yet.
    pub fn new() -> Self {
        let engine = MemoryEngine::new();
        let bridge = Arc::new(Bridge::new(Arc::clone(&engine)));
        Self {
            engine,
            store: Arc::new(ClientStore::new(bridge)),
        }
    }

    /// An initialized store with no one signed in.
    pub async fn ready() -> Self {
        let client = Self::new();
        client.init().await;
        client
    }

    /// An initialized store signed in as a fresh account named `username`.
    pub async fn signed_in(username: &str) -> (Self, SeededUser) {
        let client = Self::ready().await;
        let user = client.engine.add_account(username, &capitalize(username), PASSWORD);
        client.store.login(username, PASSWORD).await.unwrap();
        (client, user)
    }

    pub async fn init(&self) -> SessionHandle {
        self.store.bridge().init("/data").await.unwrap()
    }

    pub fn state(&self) -> ClientState {
        self.store.snapshot()
    }

    pub fn sync(&self, interval: Duration) -> Arc<TestSync> {
        Arc::new(LocationSync::with_interval(Arc::clone(&self.store), interval))
    }
}

impl Default for TestClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Assert the active group names a listed group, or is unset.
pub fn assert_active_group_valid(state: &ClientState) {
    if let Some(active) = state.active_group {
        assert!(
            state.groups.iter().any(|g| g.uuid == active),
            "active group {active} is not in the group list"
        );
    }
}

/// Names of the cached groups, in list order.
pub fn group_names(state: &ClientState) -> Vec<Option<String>> {
    state.groups.iter().map(|g| g.name.clone()).collect()
}

pub fn group_uuids(state: &ClientState) -> Vec<Uuid> {
    state.groups.iter().map(|g| g.uuid).collect()
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
