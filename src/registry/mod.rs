//! Registry service (C4): the process-wide singleton assigning server
//! ranks and tracking liveness by heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::codec::{self, Envelope, Status};
use crate::model::PersistedServerDescriptor;
use crate::net::{self, RepSocket};
use crate::store::DataStore;
use crate::utils::BbsError;
use crate::{pf_info, pf_warn};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
const EVICTION_SWEEP: Duration = Duration::from_secs(10);
const ROSTER_DOC: &str = "reference";

/// One tracked server, as held in memory by the registry.
#[derive(Debug, Clone)]
struct Entry {
    rank: u32,
    last_heartbeat: Instant,
}

#[derive(Debug, Default)]
struct RegistryState {
    roster: HashMap<String, Entry>,
    next_rank: u32,
}

/// The registry: a single REP endpoint serving `rank`, `list`, and
/// `heartbeat`, plus a background eviction sweep. All mutations are
/// serialized by one mutex, per spec S4.4/S5.
pub struct RegistryService {
    state: Mutex<RegistryState>,
    store: DataStore,
}

impl RegistryService {
    /// Rehydrates the roster from disk, resetting every entry's
    /// `last_heartbeat` to now -- this intentionally avoids spurious
    /// eviction of servers that were alive when the registry last shut
    /// down, per spec S4.4.
    pub fn new(store: DataStore) -> Self {
        let persisted: Vec<PersistedServerDescriptor> = store.load(ROSTER_DOC, Vec::new());
        let mut roster = HashMap::new();
        let mut next_rank = 1;
        let now = Instant::now();
        for p in persisted {
            next_rank = next_rank.max(p.rank + 1);
            roster.insert(
                p.name,
                Entry {
                    rank: p.rank,
                    last_heartbeat: now,
                },
            );
        }
        pf_info!("registry rehydrated {} server(s), next_rank={}", roster.len(), next_rank);
        RegistryService {
            state: Mutex::new(RegistryState { roster, next_rank }),
            store,
        }
    }

    fn persist_locked(&self, state: &RegistryState) {
        let persisted: Vec<PersistedServerDescriptor> = state
            .roster
            .iter()
            .map(|(name, e)| PersistedServerDescriptor {
                name: name.clone(),
                rank: e.rank,
                last_heartbeat: codec::wall_time(),
            })
            .collect();
        if let Err(e) = self.store.save(ROSTER_DOC, &persisted) {
            pf_warn!("failed to persist registry roster: {}", e);
        }
    }

    /// Handles `rank`: returns the server's existing rank (refreshing its
    /// heartbeat) or allocates a new one.
    async fn handle_rank(&self, server_name: &str) -> u32 {
        let mut state = self.state.lock().await;
        let rank = if let Some(entry) = state.roster.get_mut(server_name) {
            entry.last_heartbeat = Instant::now();
            entry.rank
        } else {
            let rank = state.next_rank;
            state.next_rank += 1;
            state.roster.insert(
                server_name.to_string(),
                Entry {
                    rank,
                    last_heartbeat: Instant::now(),
                },
            );
            pf_info!("assigned rank {} to {}", rank, server_name);
            rank
        };
        self.persist_locked(&state);
        rank
    }

    /// Handles `heartbeat`: refreshes `last_heartbeat`, auto-registering
    /// unknown servers exactly as `rank` would.
    async fn handle_heartbeat(&self, server_name: &str) -> u32 {
        self.handle_rank(server_name).await
    }

    /// Handles `list`: returns every currently live server.
    async fn handle_list(&self) -> Vec<(String, u32)> {
        let state = self.state.lock().await;
        state
            .roster
            .iter()
            .map(|(name, e)| (name.clone(), e.rank))
            .collect()
    }

    /// Evicts any server whose last heartbeat is older than
    /// `HEARTBEAT_TIMEOUT`, re-persisting the roster.
    async fn evict_stale(&self) {
        let mut state = self.state.lock().await;
        let before = state.roster.len();
        state
            .roster
            .retain(|_, e| e.last_heartbeat.elapsed() <= HEARTBEAT_TIMEOUT);
        if state.roster.len() != before {
            pf_info!(
                "evicted {} stale server(s)",
                before - state.roster.len()
            );
            self.persist_locked(&state);
        }
    }

    /// Runs the background eviction sweep forever (spec S4.4/S5 task h).
    pub async fn run_eviction_sweep(self: Arc<Self>) {
        let mut interval = tokio::time::interval(EVICTION_SWEEP);
        loop {
            interval.tick().await;
            self.evict_stale().await;
        }
    }

    /// Builds the reply envelope for one request, dispatching on
    /// `service`.
    async fn dispatch(&self, request: &Envelope) -> Vec<u8> {
        let result = match request.service.as_str() {
            "rank" => {
                let Some(name) = request.get_str("user") else {
                    return error_response("rank", "missing_field: user");
                };
                let rank = self.handle_rank(name).await;
                let mut data = std::collections::HashMap::new();
                data.insert("rank".to_string(), rmpv::Value::from(rank));
                codec::encode_response("rank", Status::Sucesso, data, 0, None)
            }
            "heartbeat" => {
                let Some(name) = request.get_str("user") else {
                    return error_response("heartbeat", "missing_field: user");
                };
                let rank = self.handle_heartbeat(name).await;
                let mut data = std::collections::HashMap::new();
                data.insert("rank".to_string(), rmpv::Value::from(rank));
                codec::encode_response("heartbeat", Status::Sucesso, data, 0, None)
            }
            "list" => {
                let servers = self.handle_list().await;
                let list: Vec<rmpv::Value> = servers
                    .into_iter()
                    .map(|(name, rank)| {
                        rmpv::Value::Map(vec![
                            (rmpv::Value::from("name"), rmpv::Value::from(name)),
                            (rmpv::Value::from("rank"), rmpv::Value::from(rank)),
                        ])
                    })
                    .collect();
                let mut data = std::collections::HashMap::new();
                data.insert("list".to_string(), rmpv::Value::Array(list));
                codec::encode_response("list", Status::Sucesso, data, 0, None)
            }
            other => error_response_encoded(other),
        };
        match result {
            Ok(bytes) => bytes,
            Err(e) => {
                pf_warn!("failed to encode registry response: {}", e);
                Vec::new()
            }
        }
    }

    /// Binds the REP socket and serves requests forever.
    pub async fn serve(self: Arc<Self>, bind_addr: &str) -> Result<(), BbsError> {
        let ctx = net::new_context()?;
        let socket = RepSocket::bind(&ctx, bind_addr).await?;
        pf_info!("registry listening on {}", bind_addr);
        loop {
            let raw = match socket.recv().await {
                Ok(r) => r,
                Err(e) => {
                    pf_warn!("registry recv failed: {}", e);
                    continue;
                }
            };
            let reply = match codec::decode_message(&raw) {
                Ok(envelope) => self.dispatch(&envelope).await,
                Err(_) => error_response_encoded("unknown"),
            };
            if let Err(e) = socket.reply(reply).await {
                pf_warn!("registry reply failed: {}", e);
            }
        }
    }
}

fn error_response(service: &str, description: &str) -> Vec<u8> {
    codec::encode_response(
        service,
        Status::Erro,
        std::collections::HashMap::new(),
        0,
        Some(description),
    )
    .unwrap_or_default()
}

fn error_response_encoded(service: &str) -> Vec<u8> {
    error_response(service, "invalid_envelope")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DataStore {
        let dir = tempfile::tempdir().unwrap();
        // leak the tempdir so it outlives the store for the duration of the test
        let path = dir.keep();
        DataStore::new(path).unwrap()
    }

    #[tokio::test]
    async fn rank_is_assigned_once_and_stable() {
        let svc = RegistryService::new(store());
        let r1 = svc.handle_rank("alice").await;
        let r2 = svc.handle_rank("alice").await;
        assert_eq!(r1, r2);
    }

    #[tokio::test]
    async fn ranks_are_assigned_in_increasing_order_from_one() {
        let svc = RegistryService::new(store());
        let r1 = svc.handle_rank("s1").await;
        let r2 = svc.handle_rank("s2").await;
        let r3 = svc.handle_rank("s3").await;
        assert_eq!((r1, r2, r3), (1, 2, 3));
    }

    #[tokio::test]
    async fn ranks_are_unique_across_distinct_names() {
        let svc = RegistryService::new(store());
        let mut seen = std::collections::HashSet::new();
        for name in ["a", "b", "c", "d"] {
            assert!(seen.insert(svc.handle_rank(name).await));
        }
    }

    #[tokio::test]
    async fn list_reflects_registered_servers() {
        let svc = RegistryService::new(store());
        svc.handle_rank("a").await;
        svc.handle_rank("b").await;
        let list = svc.handle_list().await;
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_auto_registers_unknown_server() {
        let svc = RegistryService::new(store());
        let rank = svc.handle_heartbeat("new").await;
        assert_eq!(rank, 1);
    }
}
