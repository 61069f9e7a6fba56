//! ZeroMQ transport helpers built on `rzmq`, the pure-Rust tokio-native
//! ZeroMQ implementation. The broker and proxy intermediaries themselves
//! are out of scope; this module only wraps the four socket roles this
//! server speaks to them (and to peers) with: REQ (outbound RPC), REP
//! (inbound RPC), PUB (announcements/publications), SUB (topic reader).

use std::time::Duration;

use rzmq::socket::{SocketType, ZmqMessage};
use rzmq::Context;

use crate::utils::BbsError;

/// One shared ZeroMQ context per process, matching spec SS5/SS9's "global
/// process state... explicit construct/destroy lifecycle owned by the
/// top-level server object."
pub fn new_context() -> Result<Context, BbsError> {
    Context::new().map_err(|e| BbsError::msg(format!("failed to create zmq context: {e}")))
}

/// A bound or connected REQ/REP-style request socket, used for the
/// point-to-point RPCs (registry rank/list/heartbeat, replication,
/// election, Berkeley `get_time`/`apply_offset`).
pub struct ReqSocket {
    socket: rzmq::socket::Socket,
}

impl ReqSocket {
    /// Connects a REQ socket to `addr` (e.g. `tcp://127.0.0.1:5559`).
    pub async fn connect(ctx: &Context, addr: &str) -> Result<Self, BbsError> {
        let socket = ctx
            .socket(SocketType::Req)
            .map_err(|e| BbsError::msg(format!("failed to create REQ socket: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| BbsError::msg(format!("failed to connect REQ socket to {addr}: {e}")))?;
        Ok(ReqSocket { socket })
    }

    /// Sends `payload` and waits for a single reply, both bounded by
    /// `timeout`. Matches the original's per-peer `RCVTIMEO`/`SNDTIMEO`
    /// pattern.
    pub async fn request(&self, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BbsError> {
        tokio::time::timeout(timeout, self.socket.send(ZmqMessage::from(payload)))
            .await
            .map_err(BbsError::from)?
            .map_err(|e| BbsError::msg(format!("zmq send failed: {e}")))?;
        let reply = tokio::time::timeout(timeout, self.socket.recv())
            .await
            .map_err(BbsError::from)?
            .map_err(|e| BbsError::msg(format!("zmq recv failed: {e}")))?;
        Ok(reply.into_vec())
    }
}

/// A bound REP socket serving inbound RPC requests.
pub struct RepSocket {
    socket: rzmq::socket::Socket,
}

impl RepSocket {
    /// Binds a REP socket on `addr` (e.g. `tcp://*:6000`).
    pub async fn bind(ctx: &Context, addr: &str) -> Result<Self, BbsError> {
        let socket = ctx
            .socket(SocketType::Rep)
            .map_err(|e| BbsError::msg(format!("failed to create REP socket: {e}")))?;
        socket
            .bind(addr)
            .await
            .map_err(|e| BbsError::msg(format!("failed to bind REP socket on {addr}: {e}")))?;
        Ok(RepSocket { socket })
    }

    /// Blocks until the next request arrives.
    pub async fn recv(&self) -> Result<Vec<u8>, BbsError> {
        let msg = self
            .socket
            .recv()
            .await
            .map_err(|e| BbsError::msg(format!("zmq recv failed: {e}")))?;
        Ok(msg.into_vec())
    }

    /// Sends the reply to the most recently received request.
    pub async fn reply(&self, payload: Vec<u8>) -> Result<(), BbsError> {
        self.socket
            .send(ZmqMessage::from(payload))
            .await
            .map_err(|e| BbsError::msg(format!("zmq send failed: {e}")))
    }
}

/// A PUB socket used for both coordinator announcements (topic `servers`)
/// and client-facing publications (topic = channel or destination user).
pub struct PubSocket {
    socket: rzmq::socket::Socket,
}

impl PubSocket {
    /// Connects a PUB socket to the proxy backend (e.g.
    /// `tcp://127.0.0.1:5557`).
    pub async fn connect(ctx: &Context, addr: &str) -> Result<Self, BbsError> {
        let socket = ctx
            .socket(SocketType::Pub)
            .map_err(|e| BbsError::msg(format!("failed to create PUB socket: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| BbsError::msg(format!("failed to connect PUB socket to {addr}: {e}")))?;
        Ok(PubSocket { socket })
    }

    /// Publishes `payload` on `topic`: first multipart frame is the topic
    /// bytes, second is the serialized envelope, per spec S6.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BbsError> {
        self.socket
            .send_multipart(vec![
                ZmqMessage::from(topic.as_bytes().to_vec()),
                ZmqMessage::from(payload),
            ])
            .await
            .map_err(|e| BbsError::msg(format!("zmq publish failed: {e}")))
    }
}

/// A SUB socket reading the `servers` topic (coordinator announcements)
/// off the proxy frontend.
pub struct SubSocket {
    socket: rzmq::socket::Socket,
}

impl SubSocket {
    /// Connects a SUB socket to the proxy frontend (e.g.
    /// `tcp://127.0.0.1:5558`) and subscribes to `topic`.
    pub async fn connect(ctx: &Context, addr: &str, topic: &str) -> Result<Self, BbsError> {
        let socket = ctx
            .socket(SocketType::Sub)
            .map_err(|e| BbsError::msg(format!("failed to create SUB socket: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| BbsError::msg(format!("failed to connect SUB socket to {addr}: {e}")))?;
        socket
            .subscribe(topic.as_bytes())
            .await
            .map_err(|e| BbsError::msg(format!("failed to subscribe to {topic}: {e}")))?;
        Ok(SubSocket { socket })
    }

    /// Blocks until the next published message arrives on the subscribed
    /// topic, returning `(topic, payload)`.
    pub async fn recv(&self) -> Result<(String, Vec<u8>), BbsError> {
        let frames = self
            .socket
            .recv_multipart()
            .await
            .map_err(|e| BbsError::msg(format!("zmq recv failed: {e}")))?;
        let mut it = frames.into_iter();
        let topic = it
            .next()
            .map(|f| String::from_utf8_lossy(&f.into_vec()).into_owned())
            .unwrap_or_default();
        let payload = it.next().map(|f| f.into_vec()).unwrap_or_default();
        Ok((topic, payload))
    }
}
