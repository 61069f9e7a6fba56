//! Data model (S 3): server descriptors, users, channels, messages, and the
//! append-only log entries kept by the election/replication/Berkeley
//! subsystems.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// On-disk form of a server roster entry: `last_heartbeat` as wall-clock
/// seconds, matching the original roster file's plain-JSON shape. The
/// registry's in-memory roster uses its own process-local `Entry` (keyed
/// on a non-serializable `Instant`) and rehydrates from this on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedServerDescriptor {
    pub name: String,
    pub rank: u32,
    pub last_heartbeat: f64,
}

/// A registered user. Unique by `user`; created on login, never mutated or
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user: String,
    pub timestamp: f64,
    pub clock: u64,
}

/// A created channel. Unique by `channel`; created on successful
/// `channel`, never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel: String,
    pub timestamp: f64,
    pub clock: u64,
}

/// A stored message, either a channel publication or a private message
/// between two users. The wire discriminator is `type`, with `Private`
/// serializing as the literal `"message"` to match the original protocol's
/// vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageRecord {
    Publish {
        user: String,
        channel: String,
        message: String,
        timestamp: f64,
        clock: u64,
    },
    #[serde(rename = "message")]
    Private {
        src: String,
        dst: String,
        message: String,
        timestamp: f64,
        clock: u64,
    },
}

/// The dedup identity of a message: `(timestamp, clock, type, author,
/// target, body)`. Two messages with the same key are the same message for
/// merge purposes, regardless of delivery order.
pub type DedupKey = (OrderedFloat<f64>, u64, &'static str, String, String, String);

impl MessageRecord {
    pub fn timestamp(&self) -> f64 {
        match self {
            MessageRecord::Publish { timestamp, .. } => *timestamp,
            MessageRecord::Private { timestamp, .. } => *timestamp,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            MessageRecord::Publish { clock, .. } => *clock,
            MessageRecord::Private { clock, .. } => *clock,
        }
    }

    /// Computes this message's dedup identity, per spec SS3/SS9.
    pub fn dedup_key(&self) -> DedupKey {
        match self {
            MessageRecord::Publish {
                user,
                channel,
                message,
                timestamp,
                clock,
            } => (
                OrderedFloat(*timestamp),
                *clock,
                "publish",
                user.clone(),
                channel.clone(),
                message.clone(),
            ),
            MessageRecord::Private {
                src,
                dst,
                message,
                timestamp,
                clock,
            } => (
                OrderedFloat(*timestamp),
                *clock,
                "message",
                src.clone(),
                dst.clone(),
                message.clone(),
            ),
        }
    }

    /// Returns true if this message belongs to `channel` (publish only).
    pub fn in_channel(&self, channel: &str) -> bool {
        matches!(self, MessageRecord::Publish { channel: c, .. } if c == channel)
    }

    /// Returns true if this message is a private message with `user` as
    /// either source or destination.
    pub fn involves_user(&self, user: &str) -> bool {
        matches!(self, MessageRecord::Private { src, dst, .. } if src == user || dst == user)
    }
}

/// Sorts messages in place by `(timestamp, clock)`, the total order
/// required after every merge (invariant I5).
pub fn sort_messages(messages: &mut [MessageRecord]) {
    messages.sort_by(|a, b| {
        OrderedFloat(a.timestamp())
            .cmp(&OrderedFloat(b.timestamp()))
            .then(a.clock().cmp(&b.clock()))
    });
}

/// One entry in the election log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionLogEntry {
    pub timestamp: f64,
    pub event: ElectionEvent,
    pub server: String,
    pub rank: u32,
    pub local_server: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionEvent {
    ElectionStarted,
    BecameCoordinator,
    CoordinatorAnnounced,
}

/// One entry in the Berkeley sync history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub timestamp: f64,
    pub offset_applied: f64,
    pub total_offset: f64,
}

/// One entry in a server's replication log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationLogEntry {
    pub timestamp: f64,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub records: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_message_serializes_tag_as_message() {
        let m = MessageRecord::Private {
            src: "alice".into(),
            dst: "bob".into(),
            message: "hi".into(),
            timestamp: 1.0,
            clock: 1,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "message");
    }

    #[test]
    fn publish_message_serializes_tag_as_publish() {
        let m = MessageRecord::Publish {
            user: "alice".into(),
            channel: "geral".into(),
            message: "hi".into(),
            timestamp: 1.0,
            clock: 1,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "publish");
    }

    #[test]
    fn dedup_key_distinguishes_publish_and_private() {
        let p = MessageRecord::Publish {
            user: "a".into(),
            channel: "c".into(),
            message: "m".into(),
            timestamp: 1.0,
            clock: 1,
        };
        let pr = MessageRecord::Private {
            src: "a".into(),
            dst: "c".into(),
            message: "m".into(),
            timestamp: 1.0,
            clock: 1,
        };
        assert_ne!(p.dedup_key(), pr.dedup_key());
    }

    #[test]
    fn sort_orders_by_timestamp_then_clock() {
        let mut msgs = vec![
            MessageRecord::Publish {
                user: "a".into(),
                channel: "c".into(),
                message: "2".into(),
                timestamp: 1.0,
                clock: 5,
            },
            MessageRecord::Publish {
                user: "a".into(),
                channel: "c".into(),
                message: "1".into(),
                timestamp: 1.0,
                clock: 2,
            },
            MessageRecord::Publish {
                user: "a".into(),
                channel: "c".into(),
                message: "0".into(),
                timestamp: 0.5,
                clock: 99,
            },
        ];
        sort_messages(&mut msgs);
        let bodies: Vec<&str> = msgs
            .iter()
            .map(|m| match m {
                MessageRecord::Publish { message, .. } => message.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(bodies, vec!["0", "1", "2"]);
    }
}
