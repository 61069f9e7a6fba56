//! Background tasks (spec S5 tasks b/c/d): heartbeat, peer-list refresh,
//! coordinator liveness monitor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::codec;
use crate::net::ReqSocket;
use crate::{pf_info, pf_warn};

use super::MessageServer;

impl MessageServer {
    /// Sends a heartbeat to the registry every `heartbeat_interval_s`.
    /// Registry-unreachable failures are logged and retried next tick;
    /// the server keeps serving clients with its current rank regardless.
    pub(super) async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_s));
        loop {
            interval.tick().await;
            if let Err(e) = self.send_heartbeat().await {
                pf_warn!("heartbeat to registry failed: {}", e);
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<(), crate::utils::BbsError> {
        let socket = ReqSocket::connect(&self.ctx, &self.addrs.registry_addr).await?;
        let mut data = HashMap::new();
        data.insert("user".to_string(), rmpv::Value::from(self.name.clone()));
        let payload = codec::encode_message("heartbeat", data, self.clock.peek())?;
        socket
            .request(payload, Duration::from_secs(5))
            .await
            .map(|_| ())
    }

    /// Refreshes the peer roster from the registry's `list` every
    /// `peer_refresh_s`, updating both the local `PeerBook` and the
    /// election manager's rank table. Also reconciles the coordinator via
    /// min-rank (spec S10: consistent with the lower-rank-wins
    /// convention).
    pub(super) async fn peer_refresh_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.peer_refresh_s));
        loop {
            interval.tick().await;
            if let Err(e) = self.refresh_peers().await {
                pf_warn!("peer-list refresh failed: {}", e);
            }
        }
    }

    async fn refresh_peers(&self) -> Result<(), crate::utils::BbsError> {
        let socket = ReqSocket::connect(&self.ctx, &self.addrs.registry_addr).await?;
        let payload = codec::encode_message("list", HashMap::new(), self.clock.peek())?;
        let reply = socket.request(payload, Duration::from_secs(5)).await?;
        let env = codec::decode_message(&reply)?;
        let Some(list) = env.get("list").and_then(|v| v.as_array()) else {
            return Ok(());
        };

        // Min-rank reconciliation (spec S10): if the freshly-fetched roster
        // shows a lower-ranked live server than whoever we currently think
        // is coordinator, that server has priority -- but we don't force a
        // coordinator switch here (that's what Bully elections are for);
        // this loop's job is purely to keep C5/C6's peer rosters current.
        let mut book = super::PeerBook::new();
        for entry in list {
            let Some(name) = codec::map_get(entry, "name").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(rank) = codec::map_get(entry, "rank").and_then(|v| v.as_u64()) else {
                continue;
            };
            if name == self.name {
                continue;
            }
            let host = name.to_string(); // server name doubles as its reachable host
            book.set(name, rank as u32, &host);
        }
        *self.peers.lock().await = book.clone();
        self.election.set_peers(book.ranks_and_election_addrs()).await;
        Ok(())
    }

    /// Ticks every `monitor_tick_s`; if no coordinator announcement has
    /// been observed within `election_timeout_s`, fires an election.
    pub(super) async fn coordinator_monitor_loop(self: Arc<Self>) {
        let threshold = Duration::from_secs(self.config.election_timeout_s);
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.monitor_tick_s));
        loop {
            interval.tick().await;
            if self.election.is_coordinator().await {
                continue;
            }
            if self.election.coordinator_contact_expired(threshold).await {
                pf_info!("coordinator liveness timeout, starting election");
                let election = Arc::clone(&self.election);
                let ctx = Arc::clone(&self.ctx);
                let pub_socket = Arc::clone(&self.pub_socket);
                tokio::spawn(async move {
                    election.start_election(&ctx, &pub_socket).await;
                });
            }
        }
    }
}
