//! Message server (C8): orchestrates the logical clock, persistence
//! store, registry client, replication/election/Berkeley managers, and
//! the client-facing request loop.

mod handlers;
mod tasks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::berkeley::BerkeleySynchronizer;
use crate::clock::LogicalClock;
use crate::codec::{self, Status};
use crate::election::ElectionManager;
use crate::model::{ChannelRecord, MessageRecord, UserRecord};
use crate::net::{self, PubSocket, RepSocket, ReqSocket, SubSocket};
use crate::replication::ReplicationManager;
use crate::store::DataStore;
use crate::utils::{BbsError, CoordConfig};
use crate::{pf_info, pf_warn};

const SYNC_INTERVAL: u64 = 10;

/// Network addresses this server needs to know about, fixed for the
/// process lifetime. Modeled as a plain aggregate (spec S9: "cyclic
/// dependencies... model as a capability record") rather than having the
/// election/replication/Berkeley managers own sockets back to the server.
#[derive(Debug, Clone)]
pub struct ServerAddrs {
    pub registry_addr: String,
    pub broker_backend_addr: String,
    pub proxy_backend_addr: String,
    pub proxy_frontend_addr: String,
    pub replication_bind_addr: String,
    pub election_bind_addr: String,
}

/// Everything the server needs to reach a peer by name: its rank,
/// replication endpoint, and election endpoint, derived from the registry's
/// `list` response.
#[derive(Debug, Clone, Default)]
pub struct PeerBook {
    peers: HashMap<String, (u32, String, String)>, // name -> (rank, replication addr, election addr)
}

impl PeerBook {
    pub fn new() -> Self {
        PeerBook::default()
    }

    pub fn set(&mut self, name: &str, rank: u32, host: &str) {
        self.peers.insert(
            name.to_string(),
            (
                rank,
                format!("tcp://{host}:6000"),
                format!("tcp://{host}:6001"),
            ),
        );
    }

    pub fn replication_addrs(&self) -> Vec<String> {
        self.peers.values().map(|(_, r, _)| r.clone()).collect()
    }

    /// Peer name -> (rank, election addr), for handing to the election
    /// manager's `set_peers`.
    pub fn ranks_and_election_addrs(&self) -> HashMap<String, (u32, String)> {
        self.peers
            .iter()
            .map(|(name, (rank, _, e))| (name.clone(), (*rank, e.clone())))
            .collect()
    }
}

struct Collections {
    users: Mutex<Vec<UserRecord>>,
    channels: Mutex<Vec<ChannelRecord>>,
    messages: Mutex<Vec<MessageRecord>>,
}

/// Owns the core replicated state and orchestrates every background task
/// and client-facing RPC.
pub struct MessageServer {
    pub name: String,
    pub rank: u32,
    pub config: CoordConfig,
    clock: LogicalClock,
    store: DataStore,
    collections: Collections,
    message_count: AtomicU64,
    election: Arc<ElectionManager>,
    replication: Arc<ReplicationManager>,
    berkeley: Arc<BerkeleySynchronizer>,
    peers: Mutex<PeerBook>,
    ctx: Arc<rzmq::Context>,
    addrs: ServerAddrs,
    pub_socket: Arc<PubSocket>,
}

impl MessageServer {
    /// Boots a server: loads persisted state, registers with the
    /// registry to obtain a rank, and constructs the election/replication/
    /// Berkeley managers, per spec S4.8's construction order.
    pub async fn bootstrap(
        name: String,
        addrs: ServerAddrs,
        config: CoordConfig,
        store: DataStore,
    ) -> Result<Self, BbsError> {
        let users: Vec<UserRecord> = store.load("logins", Vec::new());
        let channels: Vec<ChannelRecord> = store.load("channels", Vec::new());
        let messages: Vec<MessageRecord> = store.load("messages", Vec::new());

        let ctx = Arc::new(net::new_context()?);

        let rank = Self::register_with_registry(&ctx, &addrs.registry_addr, &name).await?;
        pf_info!("registered with rank {}", rank);

        let election = Arc::new(ElectionManager::new(name.clone(), rank, store.clone()));
        let replication = Arc::new(ReplicationManager::new(name.clone(), store.clone()));
        let berkeley = Arc::new(BerkeleySynchronizer::new(name.clone(), store.clone()));

        let pub_socket = Arc::new(PubSocket::connect(&ctx, &addrs.proxy_backend_addr).await?);

        Ok(MessageServer {
            name,
            rank,
            config,
            clock: LogicalClock::new(),
            store,
            collections: Collections {
                users: Mutex::new(users),
                channels: Mutex::new(channels),
                messages: Mutex::new(messages),
            },
            message_count: AtomicU64::new(0),
            election,
            replication,
            berkeley,
            peers: Mutex::new(PeerBook::new()),
            ctx,
            addrs,
            pub_socket,
        })
    }

    async fn register_with_registry(
        ctx: &rzmq::Context,
        registry_addr: &str,
        name: &str,
    ) -> Result<u32, BbsError> {
        let socket = ReqSocket::connect(ctx, registry_addr).await?;
        let mut data = HashMap::new();
        data.insert("user".to_string(), rmpv::Value::from(name));
        let payload = codec::encode_message("rank", data, 0)?;
        let reply = socket.request(payload, Duration::from_secs(5)).await?;
        let env = codec::decode_message(&reply)?;
        env.get_u64("rank")
            .map(|r| r as u32)
            .ok_or_else(|| BbsError::msg("registry `rank` reply missing `rank`"))
    }

    /// Binds the replication (6000) and election (6001) REP endpoints and
    /// subscribes to the `servers` topic, then spawns every background
    /// task, per spec S4.8 steps 3-5.
    pub async fn run(self: Arc<Self>) -> Result<(), BbsError> {
        let replication_bind = self.addrs.replication_bind_addr.clone();
        let election_bind = self.addrs.election_bind_addr.clone();
        let proxy_frontend = self.addrs.proxy_frontend_addr.clone();
        let broker_backend = self.addrs.broker_backend_addr.clone();

        let me = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = me.serve_replication(&replication_bind).await {
                pf_warn!("replication server exited: {}", e);
            }
        });

        let election = Arc::clone(&self.election);
        let ctx = Arc::clone(&self.ctx);
        let pub_socket = Arc::clone(&self.pub_socket);
        tokio::spawn(async move {
            if let Err(e) = election.serve(ctx, pub_socket, &election_bind).await {
                pf_warn!("election server exited: {}", e);
            }
        });

        let me = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = me.serve_clients(&broker_backend).await {
                pf_warn!("client server exited: {}", e);
            }
        });

        let me = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = me.serve_topic(&proxy_frontend).await {
                pf_warn!("servers-topic reader exited: {}", e);
            }
        });

        let me = Arc::clone(&self);
        tokio::spawn(async move { me.heartbeat_loop().await });

        let me = Arc::clone(&self);
        tokio::spawn(async move { me.peer_refresh_loop().await });

        let me = Arc::clone(&self);
        tokio::spawn(async move { me.coordinator_monitor_loop().await });

        std::future::pending::<()>().await;
        Ok(())
    }

    async fn serve_replication(&self, bind_addr: &str) -> Result<(), BbsError> {
        let socket = RepSocket::bind(&self.ctx, bind_addr).await?;
        pf_info!("replication service listening on {}", bind_addr);
        loop {
            let raw = match socket.recv().await {
                Ok(r) => r,
                Err(e) => {
                    pf_warn!("replication recv failed: {}", e);
                    continue;
                }
            };
            let reply = self.handle_replication_envelope(&raw).await;
            if let Err(e) = socket.reply(reply).await {
                pf_warn!("replication reply failed: {}", e);
            }
        }
    }

    async fn handle_replication_envelope(&self, raw: &[u8]) -> Vec<u8> {
        let Ok(envelope) = codec::decode_message(raw) else {
            return codec::encode_response(
                "replicate",
                Status::Erro,
                HashMap::new(),
                self.clock.peek(),
                Some("invalid_envelope"),
            )
            .unwrap_or_default();
        };
        match envelope.service.as_str() {
            "replicate" => {
                let mut users = self.collections.users.lock().await;
                let mut channels = self.collections.channels.lock().await;
                let mut messages = self.collections.messages.lock().await;
                self.replication
                    .handle_replicate(&envelope, &mut users, &mut channels, &mut messages)
                    .await
            }
            "get_time" => {
                let mut data = HashMap::new();
                data.insert(
                    "time".to_string(),
                    rmpv::Value::from(self.berkeley.local_time()),
                );
                codec::encode_response("get_time", Status::Sucesso, data, self.clock.peek(), None)
                    .unwrap_or_default()
            }
            "apply_offset" => {
                if let Some(offset) = envelope.get_f64("offset") {
                    self.berkeley.apply_offset(offset).await;
                }
                codec::encode_response(
                    "apply_offset",
                    Status::Sucesso,
                    HashMap::new(),
                    self.clock.peek(),
                    None,
                )
                .unwrap_or_default()
            }
            "sync_state" => {
                let users = self.collections.users.lock().await;
                let channels = self.collections.channels.lock().await;
                let messages = self.collections.messages.lock().await;
                self.replication
                    .handle_sync_state(&users, &channels, &messages)
            }
            _ => codec::encode_response(
                "replicate",
                Status::Erro,
                HashMap::new(),
                self.clock.peek(),
                Some("unknown_service"),
            )
            .unwrap_or_default(),
        }
    }

    async fn serve_topic(&self, proxy_frontend: &str) -> Result<(), BbsError> {
        let socket = SubSocket::connect(&self.ctx, proxy_frontend, "servers").await?;
        loop {
            let (topic, payload) = socket.recv().await?;
            if topic != "servers" {
                continue;
            }
            let Ok(envelope) = codec::decode_message(&payload) else {
                continue;
            };
            if envelope.get_str("event") == Some("new_coordinator") {
                let coordinator = envelope.get_str("coordinator").unwrap_or("").to_string();
                let rank = envelope.get_u64("rank").unwrap_or(0) as u32;
                self.election.handle_coordinator(&coordinator, rank).await;
            }
        }
    }

    /// Every SYNC_INTERVAL processed requests: persist, kick off
    /// replication for all three datasets, and (if coordinator) a
    /// Berkeley round.
    async fn maybe_sync(self: &Arc<Self>) {
        let count = self.message_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count % SYNC_INTERVAL.max(1) != 0 {
            return;
        }

        let (users, channels, messages) = {
            let users = self.collections.users.lock().await;
            let channels = self.collections.channels.lock().await;
            let messages = self.collections.messages.lock().await;
            (users.clone(), channels.clone(), messages.clone())
        };
        if let Err(e) = self.store.save("logins", &users) {
            pf_warn!("failed to persist logins: {}", e);
        }
        if let Err(e) = self.store.save("channels", &channels) {
            pf_warn!("failed to persist channels: {}", e);
        }
        if let Err(e) = self.store.save("messages", &messages) {
            pf_warn!("failed to persist messages: {}", e);
        }

        let peer_addrs = self.peers.lock().await.replication_addrs();
        let me = Arc::clone(self);
        let (u, c, m) = (users, channels, messages);
        let peer_addrs_clone = peer_addrs.clone();
        tokio::spawn(async move {
            let ctx = &me.ctx;
            let logins_payload = rmpv::ext::to_value(&u).unwrap_or(rmpv::Value::Nil);
            me.replication
                .replicate_to_all(
                    ctx,
                    &peer_addrs_clone,
                    crate::replication::DatasetKind::Logins,
                    logins_payload,
                )
                .await;
            let channels_payload = rmpv::ext::to_value(&c).unwrap_or(rmpv::Value::Nil);
            me.replication
                .replicate_to_all(
                    ctx,
                    &peer_addrs_clone,
                    crate::replication::DatasetKind::Channels,
                    channels_payload,
                )
                .await;
            let messages_payload = rmpv::ext::to_value(&m).unwrap_or(rmpv::Value::Nil);
            me.replication
                .replicate_to_all(
                    ctx,
                    &peer_addrs_clone,
                    crate::replication::DatasetKind::Messages,
                    messages_payload,
                )
                .await;
        });

        if self.election.is_coordinator().await {
            let me = Arc::clone(self);
            tokio::spawn(async move {
                me.berkeley
                    .run_round(&me.ctx, &me.replication, &peer_addrs)
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_book_derives_fixed_ports() {
        let mut book = PeerBook::new();
        book.set("s2", 2, "10.0.0.2");
        assert_eq!(
            book.replication_addrs(),
            vec!["tcp://10.0.0.2:6000".to_string()]
        );
        let ranks = book.ranks_and_election_addrs();
        assert_eq!(ranks.get("s2"), Some(&(2, "tcp://10.0.0.2:6001".to_string())));
    }
}
