//! Election manager (C6): Bully leader election over server ranks.
//!
//! Rank convention (spec S9 resolution): rank 1 is assigned first and is
//! the initial coordinator; lower rank wins. A server contacts peers with
//! a *lower* rank than itself and yields to them; if none answer, it
//! becomes coordinator. This is the reverse of the original Python's
//! higher-rank contact set, which spec S9 flags as an inconsistency with
//! the registry's min-rank coordinator selection -- that inconsistency is
//! not carried over here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::codec::{self, Envelope, Status};
use crate::model::{ElectionEvent, ElectionLogEntry};
use crate::net::{self, PubSocket, ReqSocket};
use crate::store::DataStore;
use crate::utils::{BbsError, Timer};
use crate::{pf_info, pf_warn};

const ELECTION_RPC_TIMEOUT: Duration = Duration::from_secs(2);
const ELECTION_LOG_DOC: &str = "election_log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    Electing,
    Coordinator,
}

#[derive(Debug, Clone)]
struct PeerInfo {
    rank: u32,
    addr: String,
}

struct Inner {
    state: ElectionState,
    coordinator: Option<String>,
    is_coordinator: bool,
    peers: HashMap<String, PeerInfo>, // name -> (rank, election addr), excludes self
}

/// Bully election over server ranks. One REP endpoint (peer election
/// requests) plus outbound REQ calls to lower-ranked peers, and PUB
/// announcements on topic `servers`. Peer election addresses are tracked
/// internally (refreshed by the server's peer-list task) so call sites
/// never need to pass address-lookup callbacks across an await point.
pub struct ElectionManager {
    my_name: String,
    my_rank: u32,
    inner: Mutex<Inner>,
    store: DataStore,
    /// Reset whenever a `coordinator` announcement is received (including
    /// self becoming coordinator); the liveness monitor compares this
    /// against the election timeout (spec S4.6: "resets the
    /// coordinator-heartbeat timer").
    last_coordinator_contact: Mutex<Timer>,
}

impl ElectionManager {
    /// Constructs the manager. `is_coordinator = (rank == 1)` at boot, per
    /// spec S4.8 step 2.
    pub fn new(my_name: String, my_rank: u32, store: DataStore) -> Self {
        ElectionManager {
            my_name: my_name.clone(),
            my_rank,
            inner: Mutex::new(Inner {
                state: if my_rank == 1 {
                    ElectionState::Coordinator
                } else {
                    ElectionState::Follower
                },
                coordinator: if my_rank == 1 { Some(my_name) } else { None },
                is_coordinator: my_rank == 1,
                peers: HashMap::new(),
            }),
            store,
            last_coordinator_contact: Mutex::new(Timer::new(Duration::default())),
        }
    }

    /// True if more than `timeout` has elapsed since the last time a
    /// coordinator announcement (or this server's own ascension) was
    /// observed.
    pub async fn coordinator_contact_expired(&self, timeout: Duration) -> bool {
        self.last_coordinator_contact.lock().await.elapsed() > timeout
    }

    /// Replaces the known peer roster: name -> (rank, election addr),
    /// called from the periodic peer-list refresh task.
    pub async fn set_peers(&self, peers: HashMap<String, (u32, String)>) {
        let mut inner = self.inner.lock().await;
        inner.peers = peers
            .into_iter()
            .map(|(name, (rank, addr))| (name, PeerInfo { rank, addr }))
            .collect();
    }

    pub async fn is_coordinator(&self) -> bool {
        self.inner.lock().await.is_coordinator
    }

    pub async fn coordinator(&self) -> Option<String> {
        self.inner.lock().await.coordinator.clone()
    }

    fn log(&self, event: ElectionEvent, server: &str, rank: u32) {
        let entry = ElectionLogEntry {
            timestamp: codec::wall_time(),
            event,
            server: server.to_string(),
            rank,
            local_server: self.my_name.clone(),
        };
        if let Err(e) = self.store.append(ELECTION_LOG_DOC, entry) {
            pf_warn!("failed to persist election log entry: {}", e);
        }
    }

    /// Starts a new election. Per the rank convention above: build the set
    /// of peers with a *lower* rank; if empty, become coordinator
    /// directly; else ask each with a 2s timeout; any `OK` means stand
    /// down, none means become coordinator.
    pub async fn start_election(self: &Arc<Self>, ctx: &rzmq::Context, pub_socket: &PubSocket) {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == ElectionState::Electing {
                return;
            }
            inner.state = ElectionState::Electing;
        }
        self.log(ElectionEvent::ElectionStarted, &self.my_name, self.my_rank);
        pf_info!("starting election, rank={}", self.my_rank);

        let lower: Vec<(String, String)> = {
            let inner = self.inner.lock().await;
            inner
                .peers
                .iter()
                .filter(|(_, info)| info.rank < self.my_rank)
                .map(|(name, info)| (name.clone(), info.addr.clone()))
                .collect()
        };

        if lower.is_empty() {
            self.become_coordinator(ctx, pub_socket).await;
            return;
        }

        let mut any_ok = false;
        for (name, addr) in &lower {
            match self.send_election(ctx, addr).await {
                Ok(true) => any_ok = true,
                Ok(false) => {}
                Err(e) => pf_warn!("election request to {} failed: {}", name, e),
            }
        }

        if any_ok {
            let mut inner = self.inner.lock().await;
            inner.state = ElectionState::Follower;
            pf_info!("stood down, awaiting coordinator announcement");
        } else {
            self.become_coordinator(ctx, pub_socket).await;
        }
    }

    async fn send_election(&self, ctx: &rzmq::Context, addr: &str) -> Result<bool, BbsError> {
        let socket = ReqSocket::connect(ctx, addr).await?;
        let mut data = HashMap::new();
        data.insert("rank".to_string(), rmpv::Value::from(self.my_rank));
        data.insert("server".to_string(), rmpv::Value::from(self.my_name.clone()));
        let payload = codec::encode_message("election", data, 0)?;
        let reply = socket.request(payload, ELECTION_RPC_TIMEOUT).await?;
        let env = codec::decode_message(&reply)?;
        Ok(env.get_str("status") == Some("OK"))
    }

    /// Transitions to coordinator: publishes the `new_coordinator`
    /// announcement on topic `servers`, then unicasts `coordinator` to
    /// every peer, logs the transition.
    async fn become_coordinator(self: &Arc<Self>, ctx: &rzmq::Context, pub_socket: &PubSocket) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = ElectionState::Coordinator;
            inner.is_coordinator = true;
            inner.coordinator = Some(self.my_name.clone());
        }
        self.last_coordinator_contact.lock().await.reset();
        pf_info!("became coordinator, rank={}", self.my_rank);
        self.log(ElectionEvent::BecameCoordinator, &self.my_name, self.my_rank);

        if let Err(e) = self.publish_announcement(pub_socket).await {
            pf_warn!("failed to publish new_coordinator announcement: {}", e);
        }

        let peer_addrs: Vec<(String, String)> = {
            let inner = self.inner.lock().await;
            inner
                .peers
                .iter()
                .map(|(name, info)| (name.clone(), info.addr.clone()))
                .collect()
        };
        for (name, addr) in peer_addrs {
            if let Err(e) = self.announce_to_peer(ctx, &addr).await {
                pf_warn!("coordinator announcement to {} failed: {}", name, e);
            }
        }
    }

    async fn announce_to_peer(&self, ctx: &rzmq::Context, addr: &str) -> Result<(), BbsError> {
        let socket = ReqSocket::connect(ctx, addr).await?;
        let mut data = HashMap::new();
        data.insert("coordinator".to_string(), rmpv::Value::from(self.my_name.clone()));
        data.insert("rank".to_string(), rmpv::Value::from(self.my_rank));
        let payload = codec::encode_message("coordinator", data, 0)?;
        socket.request(payload, ELECTION_RPC_TIMEOUT).await?;
        Ok(())
    }

    /// Publishes the `new_coordinator` announcement on the shared PUB
    /// socket, topic `servers`.
    pub async fn publish_announcement(&self, pub_socket: &PubSocket) -> Result<(), BbsError> {
        let mut data = HashMap::new();
        data.insert("event".to_string(), rmpv::Value::from("new_coordinator"));
        data.insert("coordinator".to_string(), rmpv::Value::from(self.my_name.clone()));
        data.insert("rank".to_string(), rmpv::Value::from(self.my_rank));
        let payload = codec::encode_message("election", data, 0)?;
        pub_socket.publish("servers", payload).await
    }

    /// Handles an inbound `election {rank}` request. Per the resolved
    /// convention: if I am more senior (`self.rank < r`), reply `OK` and
    /// spawn my own election in the background; otherwise just reply
    /// `OK`. `self.rank == r` cannot happen (rank uniqueness).
    pub async fn handle_election(
        self: &Arc<Self>,
        r: u32,
        ctx: Arc<rzmq::Context>,
        pub_socket: Arc<PubSocket>,
    ) -> Vec<u8> {
        if self.my_rank < r {
            let me = Arc::clone(self);
            tokio::spawn(async move {
                me.start_election(&ctx, &pub_socket).await;
            });
        }
        codec::encode_response("election", Status::Ok, HashMap::new(), 0, None)
            .unwrap_or_default()
    }

    /// Handles an inbound `coordinator` announcement: atomically updates
    /// coordinator state and logs the transition.
    pub async fn handle_coordinator(&self, coordinator: &str, rank: u32) -> Vec<u8> {
        {
            let mut inner = self.inner.lock().await;
            inner.coordinator = Some(coordinator.to_string());
            inner.is_coordinator = coordinator == self.my_name;
            inner.state = if inner.is_coordinator {
                ElectionState::Coordinator
            } else {
                ElectionState::Follower
            };
        }
        self.last_coordinator_contact.lock().await.reset();
        self.log(ElectionEvent::CoordinatorAnnounced, coordinator, rank);
        pf_info!("coordinator announced: {} (rank {})", coordinator, rank);
        codec::encode_response("coordinator", Status::Ok, HashMap::new(), 0, None)
            .unwrap_or_default()
    }

    /// Dispatches one inbound envelope arriving on the election REP
    /// socket.
    pub async fn dispatch(
        self: &Arc<Self>,
        request: &Envelope,
        ctx: Arc<rzmq::Context>,
        pub_socket: Arc<PubSocket>,
    ) -> Vec<u8> {
        match request.service.as_str() {
            "election" => {
                let rank = request.get_u64("rank").unwrap_or(0) as u32;
                self.handle_election(rank, ctx, pub_socket).await
            }
            "coordinator" => {
                let coordinator = request.get_str("coordinator").unwrap_or("").to_string();
                let rank = request.get_u64("rank").unwrap_or(0) as u32;
                self.handle_coordinator(&coordinator, rank).await
            }
            _ => codec::encode_response(
                "election",
                Status::Erro,
                HashMap::new(),
                0,
                Some("unknown_service"),
            )
            .unwrap_or_default(),
        }
    }

    /// Binds the election REP socket and serves forever.
    pub async fn serve(
        self: Arc<Self>,
        ctx: Arc<rzmq::Context>,
        pub_socket: Arc<PubSocket>,
        bind_addr: &str,
    ) -> Result<(), BbsError> {
        let socket = net::RepSocket::bind(&ctx, bind_addr).await?;
        pf_info!("election service listening on {}", bind_addr);
        loop {
            let raw = match socket.recv().await {
                Ok(r) => r,
                Err(e) => {
                    pf_warn!("election recv failed: {}", e);
                    continue;
                }
            };
            let reply = match codec::decode_message(&raw) {
                Ok(envelope) => {
                    self.dispatch(&envelope, Arc::clone(&ctx), Arc::clone(&pub_socket))
                        .await
                }
                Err(_) => codec::encode_response(
                    "election",
                    Status::Erro,
                    HashMap::new(),
                    0,
                    Some("invalid_envelope"),
                )
                .unwrap_or_default(),
            };
            if let Err(e) = socket.reply(reply).await {
                pf_warn!("election reply failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DataStore {
        let dir = tempfile::tempdir().unwrap();
        DataStore::new(dir.keep()).unwrap()
    }

    #[tokio::test]
    async fn rank_one_is_coordinator_at_boot() {
        let mgr = ElectionManager::new("s1".into(), 1, store());
        assert!(mgr.is_coordinator().await);
    }

    #[tokio::test]
    async fn other_ranks_are_followers_at_boot() {
        let mgr = ElectionManager::new("s2".into(), 2, store());
        assert!(!mgr.is_coordinator().await);
    }

    #[tokio::test]
    async fn coordinator_announcement_updates_state_for_self() {
        let mgr = ElectionManager::new("s2".into(), 2, store());
        mgr.handle_coordinator("s2", 2).await;
        assert!(mgr.is_coordinator().await);
        assert_eq!(mgr.coordinator().await.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn coordinator_announcement_for_peer_clears_self_flag() {
        let mgr = ElectionManager::new("s1".into(), 1, store());
        mgr.handle_coordinator("s3", 3).await;
        assert!(!mgr.is_coordinator().await);
        assert_eq!(mgr.coordinator().await.as_deref(), Some("s3"));
    }
}
