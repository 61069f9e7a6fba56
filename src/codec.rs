//! Message codec (C3): the self-describing MessagePack wire envelope.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::utils::BbsError;

/// Response status, serialized to the literal wire vocabulary the original
/// protocol uses. Clients speak this wire protocol; the strings are not
/// cosmetic and must not be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "sucesso")]
    Sucesso,
    #[serde(rename = "erro")]
    Erro,
    #[serde(rename = "OK")]
    Ok,
}

/// The wire envelope: `{service: string, data: map}`. `data` is untyped
/// (`rmpv::Value`) because every service's payload shape differs and the
/// original protocol never declares a schema; per-service typed structs
/// live in `server::handlers` and convert to/from this at the edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub service: String,
    pub data: HashMap<String, rmpv::Value>,
}

impl Envelope {
    pub fn new(service: impl Into<String>) -> Self {
        Envelope {
            service: service.into(),
            data: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&rmpv::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<rmpv::Value>) {
        self.data.insert(key.into(), value.into());
    }
}

/// Looks up `key` in a msgpack map value. `rmpv::Value` has no built-in
/// map-lookup-by-string-key helper (unlike `serde_json::Value`), so this
/// fills that gap for reading nested structures out of `data`/`payload`
/// fields (e.g. the `list` array's `{name, rank}` entries).
pub fn map_get<'a>(v: &'a rmpv::Value, key: &str) -> Option<&'a rmpv::Value> {
    match v {
        rmpv::Value::Map(entries) => entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v),
        _ => None,
    }
}

/// Current wall-clock time in seconds, matching the original's
/// `time.time()` timestamps.
pub fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Builds and serializes an outbound request/announcement envelope,
/// stamping `clock` (the sender's post-increment Lamport value) and
/// `timestamp` (wall time) into `data`, per S 4.3.
pub fn encode_message(
    service: &str,
    mut data: HashMap<String, rmpv::Value>,
    clock: u64,
) -> Result<Vec<u8>, BbsError> {
    data.insert("clock".into(), rmpv::Value::from(clock));
    data.insert("timestamp".into(), rmpv::Value::from(wall_time()));
    let envelope = Envelope {
        service: service.to_string(),
        data,
    };
    rmp_serde::to_vec_named(&envelope).map_err(BbsError::from)
}

/// Parses an inbound wire envelope.
pub fn decode_message(bytes: &[u8]) -> Result<Envelope, BbsError> {
    rmp_serde::from_slice(bytes).map_err(BbsError::from)
}

/// Builds and serializes a response envelope: like [`encode_message`], but
/// additionally carries `status` and, on failure, a human-readable
/// `description`.
pub fn encode_response(
    service: &str,
    status: Status,
    mut data: HashMap<String, rmpv::Value>,
    clock: u64,
    description: Option<&str>,
) -> Result<Vec<u8>, BbsError> {
    let status_str = match status {
        Status::Sucesso => "sucesso",
        Status::Erro => "erro",
        Status::Ok => "OK",
    };
    data.insert("status".into(), rmpv::Value::from(status_str));
    if let Some(desc) = description {
        data.insert("description".into(), rmpv::Value::from(desc));
    }
    data.insert("clock".into(), rmpv::Value::from(clock));
    data.insert("timestamp".into(), rmpv::Value::from(wall_time()));
    let envelope = Envelope {
        service: service.to_string(),
        data,
    };
    rmp_serde::to_vec_named(&envelope).map_err(BbsError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_service_and_fields() {
        let mut data = HashMap::new();
        data.insert("user".to_string(), rmpv::Value::from("alice"));
        let bytes = encode_message("login", data, 5).unwrap();
        let env = decode_message(&bytes).unwrap();
        assert_eq!(env.service, "login");
        assert_eq!(env.get_str("user"), Some("alice"));
        assert_eq!(env.get_u64("clock"), Some(5));
        assert!(env.get_f64("timestamp").is_some());
    }

    #[test]
    fn response_carries_status_literal() {
        let bytes =
            encode_response("login", Status::Sucesso, HashMap::new(), 1, None).unwrap();
        let env = decode_message(&bytes).unwrap();
        assert_eq!(env.get_str("status"), Some("sucesso"));
    }

    #[test]
    fn error_response_carries_description() {
        let bytes = encode_response(
            "login",
            Status::Erro,
            HashMap::new(),
            1,
            Some("Usuário já cadastrado"),
        )
        .unwrap();
        let env = decode_message(&bytes).unwrap();
        assert_eq!(env.get_str("status"), Some("erro"));
        assert_eq!(env.get_str("description"), Some("Usuário já cadastrado"));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = decode_message(&[0xc1, 0xc1, 0xc1]);
        assert!(err.is_err());
    }
}
