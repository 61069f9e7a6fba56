//! Crate-wide error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Crate-wide error type. Most fallible APIs in this crate return
/// `Result<T, BbsError>`; the catch-all `Msg` variant is the Rust-side
/// equivalent of the original implementation's practice of logging an
/// exception and returning a failure value rather than propagating a typed
/// error.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
pub enum BbsError {
    /// Catch-all message, used at call sites that just need to explain
    /// what went wrong (mirrors `SummersetError::msg`).
    #[error("{0}")]
    Msg(String),

    /// Failure encoding or decoding the wire envelope or a persisted
    /// document.
    #[error("codec error: {0}")]
    Codec(String),

    /// A peer RPC (election, replication, Berkeley) did not answer within
    /// its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Local filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl BbsError {
    /// Constructs a `Msg` variant from anything string-like.
    pub fn msg(s: impl Into<String>) -> Self {
        BbsError::Msg(s.into())
    }
}

impl From<std::io::Error> for BbsError {
    fn from(e: std::io::Error) -> Self {
        BbsError::Io(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BbsError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BbsError::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BbsError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BbsError::Codec(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for BbsError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        BbsError::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_display() {
        let e = BbsError::msg("bad thing");
        assert_eq!(format!("{}", e), "bad thing");
    }
}
