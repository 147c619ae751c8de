use crate::engine::Engine;
use crate::error::BridgeResult;
use crate::protocol::{GetLocation, Reply, UserGroupInfo, UserLocation, Uuid};
use crate::store::ClientStore;
use crate::time::now_ms;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Delay between the end of one publish and the start of the next fetch.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Latest locations of one group's members, as published by one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationSnapshot {
    pub group_uuid: Uuid,
    pub generation: u64,
    pub locations: Vec<UserLocation>,
    pub published_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    /// Bumped by every start and stop. A loop only publishes while the
    /// generation it was started with is still current.
    pub generation: u64,
    pub group_uuid: Option<Uuid>,
    pub snapshot: Option<LocationSnapshot>,
}

/// Polls the latest location of every member of one group and publishes
/// the result.
///
/// At most one loop is current. Starting or stopping bumps the generation
/// and clears the snapshot before returning; a superseded loop may finish
/// the fetch it has in flight but never publishes again and exits at its
/// next check.
pub struct LocationSync<E> {
    store: Arc<ClientStore<E>>,
    interval: Duration,
    state: Arc<watch::Sender<SyncState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Engine> LocationSync<E> {
    pub fn new(store: Arc<ClientStore<E>>) -> Self {
        Self::with_interval(store, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(store: Arc<ClientStore<E>>, interval: Duration) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            store,
            interval,
            state: Arc::new(state),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> Option<LocationSnapshot> {
        self.state.borrow().snapshot.clone()
    }

    pub fn current_group(&self) -> Option<Uuid> {
        self.state.borrow().group_uuid
    }

    /// True while the current generation's loop task is alive.
    pub fn is_running(&self) -> bool {
        self.task_slot()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Begin polling `group_uuid`, superseding any running loop. Returns the
    /// new generation.
    pub fn start(&self, group_uuid: Uuid) -> u64 {
        // The slot stays locked until it holds this generation's task.
        let mut slot = self.task_slot();
        let generation = advance(&self.state, Some(group_uuid));
        tracing::info!(group = %group_uuid, generation, "location sync started");
        *slot = Some(tokio::spawn(run(
            Arc::clone(&self.store),
            Arc::clone(&self.state),
            group_uuid,
            generation,
            self.interval,
        )));
        generation
    }

    /// Cancel the running loop, if any, and clear the snapshot.
    pub fn stop(&self) {
        let mut slot = self.task_slot();
        let generation = advance(&self.state, None);
        tracing::info!(generation, "location sync stopped");
        // The previous loop winds down on its own once it sees the new
        // generation.
        *slot = None;
    }

    /// Keep the loop bound to the store's active group: start on set,
    /// restart on change, stop on unset.
    ///
    /// The follower ends once this `LocationSync` is dropped and the active
    /// group changes again, or when aborted through the returned handle.
    pub fn follow_active(self: &Arc<Self>) -> JoinHandle<()> {
        let sync: Weak<Self> = Arc::downgrade(self);
        let mut active = self.store.subscribe();
        tokio::spawn(async move {
            let mut current = None;
            loop {
                let next = active.borrow_and_update().active_group;
                if next != current {
                    let Some(live) = sync.upgrade() else {
                        break;
                    };
                    match next {
                        Some(group_uuid) => {
                            live.start(group_uuid);
                        }
                        None => live.stop(),
                    }
                    current = next;
                }
                if active.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<E> Drop for LocationSync<E> {
    fn drop(&mut self) {
        advance(&self.state, None);
    }
}

/// Start a new generation for `group_uuid` (or none) and clear the snapshot.
fn advance(state: &watch::Sender<SyncState>, group_uuid: Option<Uuid>) -> u64 {
    let mut generation = 0;
    state.send_modify(|s| {
        s.generation += 1;
        s.group_uuid = group_uuid;
        s.snapshot = None;
        generation = s.generation;
    });
    generation
}

fn superseded(state: &mut watch::Receiver<SyncState>, generation: u64) -> bool {
    state.borrow_and_update().generation != generation
}

async fn run<E: Engine>(
    store: Arc<ClientStore<E>>,
    state: Arc<watch::Sender<SyncState>>,
    group_uuid: Uuid,
    generation: u64,
    interval: Duration,
) {
    let mut changes = state.subscribe();
    loop {
        if superseded(&mut changes, generation) {
            break;
        }
        match fetch_locations(&store, group_uuid).await {
            Ok(Some(locations)) => {
                let count = locations.len();
                if !publish(&state, group_uuid, generation, locations) {
                    tracing::debug!(group = %group_uuid, generation, "discarding superseded fetch");
                    break;
                }
                tracing::debug!(group = %group_uuid, generation, count, "locations published");
            }
            Ok(None) => {
                tracing::debug!(group = %group_uuid, "group not in cache, skipping tick");
            }
            Err(err) => {
                tracing::warn!(group = %group_uuid, %err, "location fetch failed");
            }
        }

        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                changed = changes.changed() => {
                    if changed.is_err() || superseded(&mut changes, generation) {
                        tracing::debug!(group = %group_uuid, generation, "location sync loop exiting");
                        return;
                    }
                }
            }
        }
    }
    tracing::debug!(group = %group_uuid, generation, "location sync loop exiting");
}

/// One tick: the newest sample before now for each member's tracked client.
///
/// `Ok(None)` when the group is not in the cache. A member whose fetch is a
/// failure value, or who has no sample, is left out. A channel error fails
/// the whole tick.
async fn fetch_locations<E: Engine>(
    store: &ClientStore<E>,
    group_uuid: Uuid,
) -> BridgeResult<Option<Vec<UserLocation>>> {
    let Some(group) = store.snapshot().group(group_uuid).cloned() else {
        return Ok(None);
    };
    let before_timestamp = now_ms();
    let mut fetches = Vec::with_capacity(group.members.len());
    for member in group.members.into_values() {
        if let Some(client) = member.tracked_client() {
            fetches.push(fetch_member(store, group_uuid, member, client, before_timestamp));
        }
    }

    let mut locations = Vec::new();
    for (member, client, reply) in futures_util::future::join_all(fetches).await {
        match reply? {
            Ok(samples) => {
                if let Some(sample) = samples.into_iter().next() {
                    locations.push(UserLocation {
                        user: member.info,
                        client_uuid: client,
                        latitude: sample.latitude,
                        longitude: sample.longitude,
                        timestamp: sample.timestamp,
                    });
                }
            }
            Err(()) => {
                tracing::debug!(user = %member.info.uuid, %client, "no location for member");
            }
        }
    }
    Ok(Some(locations))
}

async fn fetch_member<E: Engine>(
    store: &ClientStore<E>,
    group_uuid: Uuid,
    member: UserGroupInfo,
    client: Uuid,
    before_timestamp: i64,
) -> (UserGroupInfo, Uuid, BridgeResult<Reply<GetLocation>>) {
    let args = GetLocation {
        group_uuid,
        client,
        before_timestamp,
        amount: 1,
    };
    let reply = store.bridge().invoke(&args).await;
    (member, client, reply)
}

/// Publish under the channel lock, only if `generation` is still current.
fn publish(
    state: &watch::Sender<SyncState>,
    group_uuid: Uuid,
    generation: u64,
    locations: Vec<UserLocation>,
) -> bool {
    state.send_if_modified(|s| {
        if s.generation != generation {
            return false;
        }
        s.snapshot = Some(LocationSnapshot {
            group_uuid,
            generation,
            locations,
            published_at_ms: now_ms(),
        });
        true
    })
}
