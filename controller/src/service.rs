//! The broadcast service: the controller-side coordinator that folds
//! agent-reported state, watches the configuration store, and keeps
//! every connected agent's acknowledged generations converging toward
//! the latest configuration and state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use orchd::{AgentId, Era, NodeUuid};
use orchd_store::SharedStore;
use orchd_tracker::GenerationTracker;
use orchd_transport::{Command, Connection, DomainError, Response, TransportError};
use orchd_tree::{Hash, Leaf, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How long fragment/configuration-change storms are coalesced before
/// a broadcast wave fires.
pub const BATCHING_DELAY: Duration = Duration::from_secs(1);

/// How many past generations each tracker keeps reachable by a
/// forward diff.
const TRACKER_CAPACITY: usize = 100;

struct ConnectionRecord {
    connection: Connection,
    /// `None` until the first acknowledgement -- forces a full
    /// snapshot on a newly connected agent (no generation to diff
    /// from).
    acked_config_hash: Option<Hash>,
    acked_state_hash: Option<Hash>,
}

struct Inflight {
    another_scheduled: bool,
}

/// See the module docs.
pub struct BroadcastService {
    connections: Mutex<HashMap<AgentId, ConnectionRecord>>,
    inflight: Mutex<HashMap<AgentId, Inflight>>,
    config_store: SharedStore,
    config_tracker: Mutex<GenerationTracker>,
    state_tracker: Mutex<GenerationTracker>,
    node_eras: Mutex<HashMap<NodeUuid, Era>>,
    blockdevice_owners: Mutex<HashMap<String, String>>,
    last_activity: Mutex<HashMap<AgentId, Instant>>,
    pending: Mutex<HashSet<AgentId>>,
    timer_armed: Mutex<bool>,
}

impl BroadcastService {
    /// Builds the service, seeding the configuration tracker from
    /// `config_store`'s current snapshot and the state tracker from
    /// `initial_state`, and spawns the task that watches
    /// `config_store` for subsequent writes.
    pub fn new(config_store: SharedStore, initial_state: Value) -> Arc<Self> {
        let config_snapshot = config_store.snapshot();
        let service = Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            config_tracker: Mutex::new(GenerationTracker::new(TRACKER_CAPACITY, config_snapshot)),
            state_tracker: Mutex::new(GenerationTracker::new(TRACKER_CAPACITY, initial_state)),
            node_eras: Mutex::new(HashMap::new()),
            blockdevice_owners: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            timer_armed: Mutex::new(false),
            config_store: config_store.clone(),
        });
        let watcher = service.clone();
        tokio::spawn(watcher.watch_configuration_changes(config_store));
        service
    }

    async fn watch_configuration_changes(self: Arc<Self>, config_store: SharedStore) {
        let mut changes = config_store.subscribe();
        while changes.next().await.is_some() {
            self.on_configuration_changed().await;
        }
    }

    /// Registers a newly-connected agent and schedules its first
    /// update (always a full snapshot, since it has no acked
    /// generation yet).
    pub async fn on_agent_connected(self: &Arc<Self>, agent_id: AgentId, connection: Connection) {
        self.connections.lock().await.insert(
            agent_id,
            ConnectionRecord {
                connection,
                acked_config_hash: None,
                acked_state_hash: None,
            },
        );
        info!(%agent_id, "agent connected");
        self.clone().schedule_update([agent_id]).await;
    }

    /// Deregisters `agent_id` and drops its inflight bookkeeping.
    /// Subsequent broadcasts silently skip it.
    pub async fn on_agent_disconnected(&self, agent_id: AgentId) {
        self.connections.lock().await.remove(&agent_id);
        self.inflight.lock().await.remove(&agent_id);
        info!(%agent_id, "agent disconnected");
    }

    /// Folds an agent's reported state fragments into the aggregate
    /// state, records its activity, and schedules a broadcast to
    /// every connected agent.
    ///
    /// `source` identifies the reporting connection. Fragments are
    /// aggregated under the node identity sharing `source`'s 16
    /// bytes -- the same convention [`on_set_node_era`](Self::on_set_node_era)
    /// uses to key era tracking, so a subsequent era bump for this
    /// node clears exactly the fragments folded in here.
    pub async fn on_state_fragment(self: &Arc<Self>, source: AgentId, fragments: Vec<Value>) {
        self.last_activity.lock().await.insert(source, Instant::now());
        let node_uuid = node_uuid_of(source);
        let next = {
            let tracker = self.state_tracker.lock().await;
            fold_fragments(tracker.get_latest().clone(), node_uuid, fragments)
        };
        self.state_tracker.lock().await.insert_latest(next);
        let conns = self.all_agent_ids().await;
        self.clone().schedule_update(conns).await;
    }

    /// Invoked by the configuration store's observer after a
    /// successful write: refreshes the configuration tracker and
    /// schedules a broadcast.
    pub async fn on_configuration_changed(self: &Arc<Self>) {
        let snapshot = self.config_store.snapshot();
        self.config_tracker.lock().await.insert_latest(snapshot);
        let conns = self.all_agent_ids().await;
        self.clone().schedule_update(conns).await;
    }

    /// Clears any state fragments aggregated for `node_uuid` under a
    /// prior era before recording `era` as current. A no-op on the
    /// aggregated state if the era is unchanged.
    pub async fn on_set_node_era(&self, node_uuid: NodeUuid, era: Era) {
        let changed = {
            let mut eras = self.node_eras.lock().await;
            let changed = eras.get(&node_uuid) != Some(&era);
            eras.insert(node_uuid, era);
            changed
        };
        if !changed {
            return;
        }
        let next = {
            let tracker = self.state_tracker.lock().await;
            clear_node_fragments(tracker.get_latest().clone(), node_uuid)
        };
        self.state_tracker.lock().await.insert_latest(next);
    }

    /// Records a dataset/blockdevice ownership binding, idempotently.
    /// Fails if a *different* binding is already recorded.
    pub async fn on_set_blockdevice_id(
        &self,
        dataset_id: String,
        blockdevice_id: String,
    ) -> Result<(), DomainError> {
        let mut owners = self.blockdevice_owners.lock().await;
        match owners.get(&dataset_id) {
            Some(existing) if existing != &blockdevice_id => Err(DomainError::AlreadyOwned),
            _ => {
                owners.insert(dataset_id, blockdevice_id);
                Ok(())
            }
        }
    }

    async fn all_agent_ids(&self) -> Vec<AgentId> {
        self.connections.lock().await.keys().copied().collect()
    }

    /// Adds `conns` to the pending set and arms the batching timer if
    /// one isn't already running.
    async fn schedule_update(self: Arc<Self>, conns: impl IntoIterator<Item = AgentId>) {
        self.pending.lock().await.extend(conns);
        let mut armed = self.timer_armed.lock().await;
        if *armed {
            return;
        }
        *armed = true;
        drop(armed);
        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BATCHING_DELAY).await;
            service.fire_batch().await;
        });
    }

    async fn fire_batch(self: Arc<Self>) {
        let conns: Vec<AgentId> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending).into_iter().collect()
        };
        *self.timer_armed.lock().await = false;
        for agent_id in conns {
            self.clone().dispatch(agent_id).await;
        }
    }

    /// The per-connection send decision: send now if idle, mark a
    /// follow-up if one is inflight (this also covers eliding a
    /// second follow-up request -- setting the flag again is a
    /// no-op).
    async fn dispatch(self: Arc<Self>, agent_id: AgentId) {
        let send_now = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get_mut(&agent_id) {
                None => {
                    inflight.insert(agent_id, Inflight { another_scheduled: false });
                    true
                }
                Some(record) => {
                    record.another_scheduled = true;
                    false
                }
            }
        };
        if send_now {
            tokio::spawn(self.send_update(agent_id));
        }
    }

    async fn send_update(self: Arc<Self>, agent_id: AgentId) {
        if let Err(error) = self.attempt_send(agent_id).await {
            warn!(%agent_id, %error, "update send failed; a later broadcast will resend");
        }
        let reschedule = {
            let mut inflight = self.inflight.lock().await;
            match inflight.remove(&agent_id) {
                Some(record) => record.another_scheduled,
                None => false,
            }
        };
        if reschedule {
            self.clone().schedule_update([agent_id]).await;
        }
    }

    async fn attempt_send(self: &Arc<Self>, agent_id: AgentId) -> Result<(), TransportError> {
        let (connection, acked_config_hash, acked_state_hash) = {
            let connections = self.connections.lock().await;
            match connections.get(&agent_id) {
                Some(record) => (
                    record.connection.clone(),
                    record.acked_config_hash,
                    record.acked_state_hash,
                ),
                None => return Ok(()),
            }
        };

        let (config_value, config_hash, config_diff) = {
            let tracker = self.config_tracker.lock().await;
            (
                tracker.get_latest().clone(),
                tracker.get_latest_hash(),
                acked_config_hash.and_then(|h| tracker.get_diff_from_hash_to_latest(h)),
            )
        };
        let (state_value, state_hash, state_diff) = {
            let tracker = self.state_tracker.lock().await;
            (
                tracker.get_latest().clone(),
                tracker.get_latest_hash(),
                acked_state_hash.and_then(|h| tracker.get_diff_from_hash_to_latest(h)),
            )
        };

        let command = match (config_diff, state_diff) {
            (Some(configuration_diff), Some(state_diff)) => Command::UpdateDiff {
                configuration_diff,
                start_configuration_generation: acked_config_hash.expect("diff implies a prior ack"),
                end_configuration_generation: config_hash,
                state_diff,
                start_state_generation: acked_state_hash.expect("diff implies a prior ack"),
                end_state_generation: state_hash,
                eliot_context: String::new(),
            },
            _ => Command::UpdateFull {
                configuration: config_value,
                configuration_generation: config_hash,
                state: state_value,
                state_generation: state_hash,
                eliot_context: String::new(),
            },
        };

        let response = connection.call(command).await?;
        match response {
            Response::Ack {
                current_configuration_generation,
                current_state_generation,
            } => {
                self.handle_ack(agent_id, current_configuration_generation, current_state_generation)
                    .await;
                Ok(())
            }
            other => Err(TransportError::ProtocolViolation(format!(
                "unexpected response to update: {other:?}"
            ))),
        }
    }

    async fn handle_ack(
        self: &Arc<Self>,
        agent_id: AgentId,
        current_config_hash: Hash,
        current_state_hash: Hash,
    ) {
        {
            let mut connections = self.connections.lock().await;
            if let Some(record) = connections.get_mut(&agent_id) {
                record.acked_config_hash = Some(current_config_hash);
                record.acked_state_hash = Some(current_state_hash);
            }
        }
        let (latest_config_hash, latest_state_hash) = {
            let config_tracker = self.config_tracker.lock().await;
            let state_tracker = self.state_tracker.lock().await;
            (config_tracker.get_latest_hash(), state_tracker.get_latest_hash())
        };
        if current_config_hash != latest_config_hash || current_state_hash != latest_state_hash {
            self.clone().schedule_update([agent_id]).await;
        }
    }
}

/// Maps a connection's stable [`AgentId`] onto the [`NodeUuid`]
/// key-space used for state-fragment aggregation and era tracking.
/// The two identifiers share their 16 bytes by convention -- see
/// [`BroadcastService::on_state_fragment`].
fn node_uuid_of(agent_id: AgentId) -> NodeUuid {
    NodeUuid::new(*agent_id.as_ref())
}

fn fold_fragments(current: Value, node_uuid: NodeUuid, fragments: Vec<Value>) -> Value {
    let mut map = match current {
        Value::Mapping(m) => m,
        _ => BTreeMap::new(),
    };
    map.insert(Leaf::Str(node_uuid.to_string()), Value::Sequence(fragments));
    Value::Mapping(map)
}

fn clear_node_fragments(current: Value, node_uuid: NodeUuid) -> Value {
    match current {
        Value::Mapping(mut map) => {
            map.remove(&Leaf::Str(node_uuid.to_string()));
            Value::Mapping(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchd_store::{ConfigurationStore, InMemoryStore};
    use tokio::sync::mpsc;

    fn node(n: u8) -> NodeUuid {
        NodeUuid::new([n; 16])
    }

    #[tokio::test]
    async fn new_agent_is_scheduled_for_a_full_snapshot() {
        let store: SharedStore = Arc::new(InMemoryStore::new(Value::leaf(1i64)));
        let service = BroadcastService::new(store, Value::leaf(0i64));

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        let agent_side = Connection::spawn(client_io, agent_tx);
        let (ctrl_tx, _ctrl_rx) = mpsc::unbounded_channel();
        let controller_side = Connection::spawn(server_io, ctrl_tx);

        let agent_id = AgentId::new([7; 16]);
        service.on_agent_connected(agent_id, controller_side).await;

        let (request_id, command) = agent_rx.recv().await.unwrap();
        match command {
            Command::UpdateFull { .. } => {}
            other => panic!("expected UpdateFull, got {other:?}"),
        }
        agent_side
            .respond(
                request_id,
                Response::Ack {
                    current_configuration_generation: orchd_tree::hash(&Value::leaf(1i64)),
                    current_state_generation: orchd_tree::hash(&Value::leaf(0i64)),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn set_blockdevice_id_rejects_a_conflicting_rebind() {
        let store: SharedStore = Arc::new(InMemoryStore::new(Value::leaf(1i64)));
        let service = BroadcastService::new(store, Value::leaf(0i64));
        service
            .on_set_blockdevice_id("dataset-a".to_string(), "disk-1".to_string())
            .await
            .unwrap();
        service
            .on_set_blockdevice_id("dataset-a".to_string(), "disk-1".to_string())
            .await
            .unwrap();
        let result = service
            .on_set_blockdevice_id("dataset-a".to_string(), "disk-2".to_string())
            .await;
        assert_eq!(result, Err(DomainError::AlreadyOwned));
    }

    #[tokio::test]
    async fn node_era_change_clears_its_state_fragments() {
        let store: SharedStore = Arc::new(InMemoryStore::new(Value::leaf(1i64)));
        let service = BroadcastService::new(store, Value::mapping(std::iter::empty()));
        let n = node(1);
        let source = AgentId::new(*n.as_bytes());
        service.on_set_node_era(n, Era::new([1; 16])).await;
        service
            .on_state_fragment(source, vec![Value::leaf("observed")])
            .await;
        {
            let tracker = service.state_tracker.lock().await;
            assert!(tracker.get_latest().as_mapping().unwrap().contains_key(&Leaf::Str(n.to_string())));
        }
        service.on_set_node_era(n, Era::new([2; 16])).await;
        let tracker = service.state_tracker.lock().await;
        assert!(!tracker.get_latest().as_mapping().unwrap().contains_key(&Leaf::Str(n.to_string())));
    }

    /// Three rapid configuration changes land while an agent's initial
    /// snapshot is still unacked. Acking it (against a now-stale hash)
    /// must produce exactly one follow-up, carrying the third change's
    /// hash -- not an immediate resend and not three separate sends.
    #[tokio::test]
    async fn ack_mismatch_during_rapid_changes_yields_exactly_one_follow_up() {
        let store: SharedStore = Arc::new(InMemoryStore::new(Value::leaf(0i64)));
        let service = BroadcastService::new(store.clone(), Value::leaf(100i64));

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (agent_tx, mut agent_rx) = mpsc::unbounded_channel();
        let agent_side = Connection::spawn(client_io, agent_tx);
        let (ctrl_tx, _ctrl_rx) = mpsc::unbounded_channel();
        let controller_side = Connection::spawn(server_io, ctrl_tx);

        let agent_id = AgentId::new([9; 16]);
        service.on_agent_connected(agent_id, controller_side).await;

        let (initial_request_id, initial_command) = agent_rx.recv().await.unwrap();
        match initial_command {
            Command::UpdateFull {
                configuration_generation,
                ..
            } => {
                assert_eq!(configuration_generation, orchd_tree::hash(&Value::leaf(0i64)));
            }
            other => panic!("expected UpdateFull, got {other:?}"),
        }

        store.replace(Value::leaf(1i64));
        service.on_configuration_changed().await;
        store.replace(Value::leaf(2i64));
        service.on_configuration_changed().await;
        store.replace(Value::leaf(3i64));
        service.on_configuration_changed().await;

        // Let the coalesced follow-up timer mark the still-inflight
        // record rather than spawn a second send.
        tokio::time::sleep(BATCHING_DELAY + Duration::from_millis(200)).await;

        agent_side
            .respond(
                initial_request_id,
                Response::Ack {
                    current_configuration_generation: orchd_tree::hash(&Value::leaf(0i64)),
                    current_state_generation: orchd_tree::hash(&Value::leaf(100i64)),
                },
            )
            .await
            .unwrap();

        let (_, follow_up) = tokio::time::timeout(
            BATCHING_DELAY + Duration::from_secs(1),
            agent_rx.recv(),
        )
        .await
        .expect("follow-up update did not arrive")
        .unwrap();
        let end_hash = match follow_up {
            Command::UpdateFull {
                configuration_generation,
                ..
            } => configuration_generation,
            Command::UpdateDiff {
                end_configuration_generation,
                ..
            } => end_configuration_generation,
            other => panic!("expected an update, got {other:?}"),
        };
        assert_eq!(end_hash, orchd_tree::hash(&Value::leaf(3i64)));

        let extra = tokio::time::timeout(Duration::from_millis(300), agent_rx.recv()).await;
        assert!(extra.is_err(), "unexpected extra update after the single follow-up");
    }
}
