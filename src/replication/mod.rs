//! Replication manager (C5): inter-server RPC endpoint merging replicated
//! datasets and pushing local state to peers.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::codec::{self, Envelope, Status};
use crate::model::{ChannelRecord, MessageRecord, ReplicationLogEntry, UserRecord};
use crate::net::ReqSocket;
use crate::store::DataStore;
use crate::utils::BbsError;
use crate::pf_warn;

const REPLICATION_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// The three replicable dataset kinds, matching spec S4.5's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Logins,
    Channels,
    Messages,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Logins => "logins",
            DatasetKind::Channels => "channels",
            DatasetKind::Messages => "messages",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "logins" => Some(DatasetKind::Logins),
            "channels" => Some(DatasetKind::Channels),
            "messages" => Some(DatasetKind::Messages),
            _ => None,
        }
    }
}

/// Merges `incoming` logins into `local` by set union on `user`; existing
/// entries are never overwritten. Idempotent and commutative (P3/P4).
pub fn merge_logins(local: &mut Vec<UserRecord>, incoming: &[UserRecord]) -> usize {
    let known: HashSet<String> = local.iter().map(|u| u.user.clone()).collect();
    let mut added = 0;
    for u in incoming {
        if !known.contains(&u.user) && !local.iter().any(|e| e.user == u.user) {
            local.push(u.clone());
            added += 1;
        }
    }
    added
}

/// Merges `incoming` channels into `local` by set union on `channel`.
pub fn merge_channels(local: &mut Vec<ChannelRecord>, incoming: &[ChannelRecord]) -> usize {
    let mut added = 0;
    for c in incoming {
        if !local.iter().any(|e| e.channel == c.channel) {
            local.push(c.clone());
            added += 1;
        }
    }
    added
}

/// Merges `incoming` messages into `local` by the dedup tuple, then
/// re-sorts by `(timestamp, clock)` (P3/P4/P5/P6).
pub fn merge_messages(local: &mut Vec<MessageRecord>, incoming: &[MessageRecord]) -> usize {
    let known: HashSet<_> = local.iter().map(|m| m.dedup_key()).collect();
    let mut added = 0;
    for m in incoming {
        let key = m.dedup_key();
        if !known.contains(&key) && !local.iter().any(|e| e.dedup_key() == key) {
            local.push(m.clone());
            added += 1;
        }
    }
    crate::model::sort_messages(local);
    added
}

/// A peer's replication endpoint address.
pub type PeerAddr = String;

/// Replication manager state: the in-memory replication log, persisted
/// after every applied `replicate` call.
pub struct ReplicationManager {
    my_name: String,
    store: DataStore,
    log: Mutex<Vec<ReplicationLogEntry>>,
}

impl ReplicationManager {
    pub fn new(my_name: String, store: DataStore) -> Self {
        ReplicationManager {
            my_name,
            store,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Records one applied replication event and persists the log under
    /// `replication/<server_name>.json`.
    async fn record(&self, source: &str, kind: DatasetKind, records: usize) {
        let entry = ReplicationLogEntry {
            timestamp: codec::wall_time(),
            source: source.to_string(),
            kind: kind.as_str().to_string(),
            records,
        };
        let mut log = self.log.lock().await;
        log.push(entry);
        if let Err(e) = self.store.replication_save(&self.my_name, &*log) {
            pf_warn!("failed to persist replication log: {}", e);
        }
    }

    /// Applies one `replicate` call's merge, recording the event.
    pub async fn apply_replicate(
        &self,
        source: &str,
        kind: DatasetKind,
        logins: &mut Vec<UserRecord>,
        channels: &mut Vec<ChannelRecord>,
        messages: &mut Vec<MessageRecord>,
        incoming_logins: Vec<UserRecord>,
        incoming_channels: Vec<ChannelRecord>,
        incoming_messages: Vec<MessageRecord>,
    ) -> usize {
        let received = match kind {
            DatasetKind::Logins => merge_logins(logins, &incoming_logins),
            DatasetKind::Channels => merge_channels(channels, &incoming_channels),
            DatasetKind::Messages => merge_messages(messages, &incoming_messages),
        };
        self.record(source, kind, received).await;
        received
    }

    /// Sends one dataset to one peer, bounded by a 3s send/recv deadline.
    /// Best-effort: failures are returned, not retried here.
    pub async fn replicate_to_peer(
        &self,
        ctx: &rzmq::Context,
        addr: &str,
        kind: DatasetKind,
        payload: rmpv::Value,
    ) -> Result<(), BbsError> {
        let socket = ReqSocket::connect(ctx, addr).await?;
        let mut data = HashMap::new();
        data.insert("source_server".to_string(), rmpv::Value::from(self.my_name.clone()));
        data.insert("type".to_string(), rmpv::Value::from(kind.as_str()));
        data.insert("payload".to_string(), payload);
        let bytes = codec::encode_message("replicate", data, 0)?;
        socket.request(bytes, REPLICATION_RPC_TIMEOUT).await?;
        Ok(())
    }

    /// Fans `kind`/`payload` out to every peer sequentially; a failing
    /// peer is logged and does not stop the fan-out (best-effort, per
    /// spec S4.5).
    pub async fn replicate_to_all(
        &self,
        ctx: &rzmq::Context,
        peers: &[PeerAddr],
        kind: DatasetKind,
        payload: rmpv::Value,
    ) {
        for addr in peers {
            if let Err(e) = self
                .replicate_to_peer(ctx, addr, kind, payload.clone())
                .await
            {
                pf_warn!("replication of {} to {} failed: {}", kind.as_str(), addr, e);
            }
        }
    }

    /// Requests a peer's wall-clock time, used by the Berkeley
    /// synchronizer.
    pub async fn get_time(&self, ctx: &rzmq::Context, addr: &str) -> Result<f64, BbsError> {
        let socket = ReqSocket::connect(ctx, addr).await?;
        let bytes = codec::encode_message("get_time", HashMap::new(), 0)?;
        let reply = socket.request(bytes, REPLICATION_RPC_TIMEOUT).await?;
        let env = codec::decode_message(&reply)?;
        env.get_f64("time")
            .ok_or_else(|| BbsError::msg("get_time reply missing `time`"))
    }

    /// Sends an `apply_offset` request to a peer.
    pub async fn send_apply_offset(
        &self,
        ctx: &rzmq::Context,
        addr: &str,
        offset: f64,
        coordinator: &str,
    ) -> Result<(), BbsError> {
        let socket = ReqSocket::connect(ctx, addr).await?;
        let mut data = HashMap::new();
        data.insert("offset".to_string(), rmpv::Value::from(offset));
        data.insert("coordinator".to_string(), rmpv::Value::from(coordinator));
        let bytes = codec::encode_message("apply_offset", data, 0)?;
        socket.request(bytes, REPLICATION_RPC_TIMEOUT).await?;
        Ok(())
    }

    /// Handles `replicate`. Malformed input yields `{status: "error"}` per
    /// spec S7.
    pub async fn handle_replicate(
        &self,
        request: &Envelope,
        logins: &mut Vec<UserRecord>,
        channels: &mut Vec<ChannelRecord>,
        messages: &mut Vec<MessageRecord>,
    ) -> Vec<u8> {
        let source = request.get_str("source_server").unwrap_or("unknown").to_string();
        let Some(kind) = request.get_str("type").and_then(DatasetKind::parse) else {
            return malformed_replicate_response();
        };
        let Some(payload) = request.get("payload") else {
            return malformed_replicate_response();
        };

        let records_received = match kind {
            DatasetKind::Logins => {
                let Ok(incoming) = rmpv::ext::from_value::<Vec<UserRecord>>(payload.clone())
                else {
                    return malformed_replicate_response();
                };
                self.apply_replicate(
                    &source,
                    kind,
                    logins,
                    channels,
                    messages,
                    incoming,
                    Vec::new(),
                    Vec::new(),
                )
                .await
            }
            DatasetKind::Channels => {
                let Ok(incoming) = rmpv::ext::from_value::<Vec<ChannelRecord>>(payload.clone())
                else {
                    return malformed_replicate_response();
                };
                self.apply_replicate(
                    &source,
                    kind,
                    logins,
                    channels,
                    messages,
                    Vec::new(),
                    incoming,
                    Vec::new(),
                )
                .await
            }
            DatasetKind::Messages => {
                let Ok(incoming) = rmpv::ext::from_value::<Vec<MessageRecord>>(payload.clone())
                else {
                    return malformed_replicate_response();
                };
                self.apply_replicate(
                    &source,
                    kind,
                    logins,
                    channels,
                    messages,
                    Vec::new(),
                    Vec::new(),
                    incoming,
                )
                .await
            }
        };

        let mut data = HashMap::new();
        data.insert(
            "records_received".to_string(),
            rmpv::Value::from(records_received as u64),
        );
        codec::encode_response("replicate", Status::Sucesso, data, 0, None).unwrap_or_default()
    }

    /// Handles `sync_state`: returns a full snapshot for a
    /// newly-recovered peer.
    pub fn handle_sync_state(
        &self,
        logins: &[UserRecord],
        channels: &[ChannelRecord],
        messages: &[MessageRecord],
    ) -> Vec<u8> {
        let mut data = HashMap::new();
        data.insert(
            "logins".to_string(),
            rmpv::ext::to_value(logins).unwrap_or(rmpv::Value::Nil),
        );
        data.insert(
            "channels".to_string(),
            rmpv::ext::to_value(channels).unwrap_or(rmpv::Value::Nil),
        );
        data.insert(
            "messages".to_string(),
            rmpv::ext::to_value(messages).unwrap_or(rmpv::Value::Nil),
        );
        codec::encode_response("sync_state", Status::Sucesso, data, 0, None).unwrap_or_default()
    }
}

fn malformed_replicate_response() -> Vec<u8> {
    let mut data = HashMap::new();
    data.insert("status".to_string(), rmpv::Value::from("error"));
    rmp_serde::to_vec_named(&codec::Envelope {
        service: "replicate".to_string(),
        data,
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(u: &str) -> UserRecord {
        UserRecord {
            user: u.to_string(),
            timestamp: 1.0,
            clock: 1,
        }
    }

    fn publish(body: &str, ts: f64, clock: u64) -> MessageRecord {
        MessageRecord::Publish {
            user: "a".into(),
            channel: "c".into(),
            message: body.into(),
            timestamp: ts,
            clock,
        }
    }

    #[test]
    fn merge_logins_is_idempotent() {
        let mut local = vec![user("alice")];
        let incoming = vec![user("alice"), user("bob")];
        merge_logins(&mut local, &incoming);
        let added_again = merge_logins(&mut local, &incoming);
        assert_eq!(added_again, 0);
        assert_eq!(local.len(), 2);
    }

    #[test]
    fn merge_logins_is_commutative() {
        let mut a = vec![user("alice")];
        merge_logins(&mut a, &[user("bob")]);
        merge_logins(&mut a, &[user("carol")]);

        let mut b = vec![user("alice")];
        merge_logins(&mut b, &[user("carol")]);
        merge_logins(&mut b, &[user("bob")]);

        let mut names_a: Vec<_> = a.iter().map(|u| u.user.clone()).collect();
        let mut names_b: Vec<_> = b.iter().map(|u| u.user.clone()).collect();
        names_a.sort();
        names_b.sort();
        assert_eq!(names_a, names_b);
    }

    #[test]
    fn merge_messages_dedups_by_tuple() {
        let mut local = vec![publish("m1", 1.0, 1)];
        let incoming = vec![publish("m1", 1.0, 1), publish("m2", 2.0, 2)];
        let added = merge_messages(&mut local, &incoming);
        assert_eq!(added, 1);
        assert_eq!(local.len(), 2);
    }

    #[test]
    fn merge_messages_orders_by_timestamp_then_clock() {
        let mut local = vec![publish("late", 5.0, 1)];
        merge_messages(&mut local, &[publish("early", 1.0, 1)]);
        assert_eq!(local[0].timestamp(), 1.0);
        assert_eq!(local[1].timestamp(), 5.0);
    }
}
