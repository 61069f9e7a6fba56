//! Client-facing services (spec S4.8 table): `login`, `users`, `channel`,
//! `channels`, `publish`, `message`, `get_history`, `get_private_history`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{self, Envelope, Status};
use crate::model::{ChannelRecord, MessageRecord, UserRecord};
use crate::net::RepSocket;
use crate::utils::BbsError;
use crate::pf_warn;

use super::MessageServer;

const DEFAULT_HISTORY_LIMIT: usize = 50;

impl MessageServer {
    /// Binds the broker-facing REP socket and serves client requests
    /// forever. Bad envelopes yield `status: "erro"`, never a crash.
    pub(super) async fn serve_clients(self: &Arc<Self>, bind_addr: &str) -> Result<(), BbsError> {
        let socket = RepSocket::bind(&self.ctx, bind_addr).await?;
        loop {
            let raw = match socket.recv().await {
                Ok(r) => r,
                Err(e) => {
                    pf_warn!("client recv failed: {}", e);
                    continue;
                }
            };
            let reply = self.handle_client_envelope(&raw).await;
            if let Err(e) = socket.reply(reply).await {
                pf_warn!("client reply failed: {}", e);
            }
        }
    }

    async fn handle_client_envelope(self: &Arc<Self>, raw: &[u8]) -> Vec<u8> {
        let envelope = match codec::decode_message(raw) {
            Ok(e) => e,
            Err(_) => {
                return error_response("unknown", self.clock.peek(), "invalid_envelope");
            }
        };
        if let Some(received) = envelope.get_u64("clock") {
            self.clock.update(received);
        } else {
            self.clock.increment();
        }

        let reply = match envelope.service.as_str() {
            "login" => self.handle_login(&envelope).await,
            "users" => self.handle_users().await,
            "channel" => self.handle_channel(&envelope).await,
            "channels" => self.handle_channels().await,
            "publish" => self.handle_publish(&envelope).await,
            "message" => self.handle_message(&envelope).await,
            "get_history" => self.handle_get_history(&envelope).await,
            "get_private_history" => self.handle_get_private_history(&envelope).await,
            other => error_response(other, self.clock.peek(), "unknown_service"),
        };

        self.maybe_sync().await;
        reply
    }

    async fn handle_login(&self, req: &Envelope) -> Vec<u8> {
        let Some(user) = req.get_str("user") else {
            return error_response("login", self.clock.peek(), "missing_field: user");
        };
        let mut users = self.collections.users.lock().await;
        if users.iter().any(|u| u.user == user) {
            return error_response("login", self.clock.peek(), "Usuário já cadastrado");
        }
        let clock = self.clock.increment();
        users.push(UserRecord {
            user: user.to_string(),
            timestamp: codec::wall_time(),
            clock,
        });
        drop(users);
        ok_response("login", Status::Sucesso, HashMap::new(), clock)
    }

    async fn handle_users(&self) -> Vec<u8> {
        let users = self.collections.users.lock().await;
        let list: Vec<rmpv::Value> = users.iter().map(|u| rmpv::Value::from(u.user.clone())).collect();
        let mut data = HashMap::new();
        data.insert("users".to_string(), rmpv::Value::Array(list));
        ok_response("users", Status::Sucesso, data, self.clock.peek())
    }

    async fn handle_channel(&self, req: &Envelope) -> Vec<u8> {
        let Some(channel) = req.get_str("channel") else {
            return error_response("channel", self.clock.peek(), "missing_field: channel");
        };
        let mut channels = self.collections.channels.lock().await;
        if channels.iter().any(|c| c.channel == channel) {
            return error_response("channel", self.clock.peek(), "Canal já existe");
        }
        let clock = self.clock.increment();
        channels.push(ChannelRecord {
            channel: channel.to_string(),
            timestamp: codec::wall_time(),
            clock,
        });
        drop(channels);
        ok_response("channel", Status::Sucesso, HashMap::new(), clock)
    }

    async fn handle_channels(&self) -> Vec<u8> {
        let channels = self.collections.channels.lock().await;
        let list: Vec<rmpv::Value> = channels
            .iter()
            .map(|c| rmpv::Value::from(c.channel.clone()))
            .collect();
        let mut data = HashMap::new();
        data.insert("channels".to_string(), rmpv::Value::Array(list));
        ok_response("channels", Status::Sucesso, data, self.clock.peek())
    }

    async fn handle_publish(&self, req: &Envelope) -> Vec<u8> {
        let (Some(user), Some(channel), Some(message)) = (
            req.get_str("user"),
            req.get_str("channel"),
            req.get_str("message"),
        ) else {
            return error_response("publish", self.clock.peek(), "missing_field");
        };
        let channel_exists = self
            .collections
            .channels
            .lock()
            .await
            .iter()
            .any(|c| c.channel == channel);
        if !channel_exists {
            return error_response("publish", self.clock.peek(), "Canal inexistente");
        }

        let clock = self.clock.increment();
        let record = MessageRecord::Publish {
            user: user.to_string(),
            channel: channel.to_string(),
            message: message.to_string(),
            timestamp: codec::wall_time(),
            clock,
        };
        self.collections.messages.lock().await.push(record.clone());

        if let Ok(bytes) = codec::encode_message("publish", HashMap::new(), clock) {
            if let Err(e) = self.pub_socket.publish(channel, bytes).await {
                pf_warn!("failed to publish to channel {}: {}", channel, e);
            }
        }

        ok_response("publish", Status::Ok, HashMap::new(), clock)
    }

    async fn handle_message(&self, req: &Envelope) -> Vec<u8> {
        let (Some(src), Some(dst), Some(message)) = (
            req.get_str("src"),
            req.get_str("dst"),
            req.get_str("message"),
        ) else {
            return error_response("message", self.clock.peek(), "missing_field");
        };
        let dst_exists = self
            .collections
            .users
            .lock()
            .await
            .iter()
            .any(|u| u.user == dst);
        if !dst_exists {
            return error_response("message", self.clock.peek(), "Usuário desconhecido");
        }

        let clock = self.clock.increment();
        let record = MessageRecord::Private {
            src: src.to_string(),
            dst: dst.to_string(),
            message: message.to_string(),
            timestamp: codec::wall_time(),
            clock,
        };
        self.collections.messages.lock().await.push(record.clone());

        if let Ok(bytes) = codec::encode_message("message", HashMap::new(), clock) {
            if let Err(e) = self.pub_socket.publish(dst, bytes).await {
                pf_warn!("failed to publish to user {}: {}", dst, e);
            }
        }

        ok_response("message", Status::Ok, HashMap::new(), clock)
    }

    async fn handle_get_history(&self, req: &Envelope) -> Vec<u8> {
        let Some(channel) = req.get_str("channel") else {
            return error_response("get_history", self.clock.peek(), "missing_field: channel");
        };
        let channel_exists = self
            .collections
            .channels
            .lock()
            .await
            .iter()
            .any(|c| c.channel == channel);
        if !channel_exists {
            return error_response("get_history", self.clock.peek(), "Canal inexistente");
        }
        let limit = req.get_u64("limit").unwrap_or(DEFAULT_HISTORY_LIMIT as u64) as usize;

        let messages = self.collections.messages.lock().await;
        let filtered: Vec<&MessageRecord> =
            messages.iter().filter(|m| m.in_channel(channel)).collect();
        let tail: Vec<rmpv::Value> = filtered
            .iter()
            .rev()
            .take(limit)
            .rev()
            .map(|m| rmpv::ext::to_value(*m).unwrap_or(rmpv::Value::Nil))
            .collect();
        let mut data = HashMap::new();
        data.insert("messages".to_string(), rmpv::Value::Array(tail));
        ok_response("get_history", Status::Sucesso, data, self.clock.peek())
    }

    async fn handle_get_private_history(&self, req: &Envelope) -> Vec<u8> {
        let Some(user) = req.get_str("user") else {
            return error_response("get_private_history", self.clock.peek(), "missing_field: user");
        };
        let limit = req.get_u64("limit").unwrap_or(DEFAULT_HISTORY_LIMIT as u64) as usize;

        let messages = self.collections.messages.lock().await;
        let filtered: Vec<&MessageRecord> =
            messages.iter().filter(|m| m.involves_user(user)).collect();
        let tail: Vec<rmpv::Value> = filtered
            .iter()
            .rev()
            .take(limit)
            .rev()
            .map(|m| rmpv::ext::to_value(*m).unwrap_or(rmpv::Value::Nil))
            .collect();
        let mut data = HashMap::new();
        data.insert("messages".to_string(), rmpv::Value::Array(tail));
        ok_response(
            "get_private_history",
            Status::Sucesso,
            data,
            self.clock.peek(),
        )
    }
}

fn ok_response(service: &str, status: Status, data: HashMap<String, rmpv::Value>, clock: u64) -> Vec<u8> {
    codec::encode_response(service, status, data, clock, None).unwrap_or_default()
}

fn error_response(service: &str, clock: u64, description: &str) -> Vec<u8> {
    codec::encode_response(service, Status::Erro, HashMap::new(), clock, Some(description))
        .unwrap_or_default()
}
