use crate::codec::FlvError;
use std::io;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Client disconnected: {0}")]
    Disconnected(#[from] io::Error),

    #[error("Connection timeout")]
    ConnectionTimeout(#[from] Elapsed),

    #[error("RTMP handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("RTMP session error: {0}")]
    Session(String),

    #[error("Stream key can not be empty")]
    EmptyStreamKey,

    #[error("RTMP publish request for {0} was rejected: {1}")]
    RequestRejected(String, String),

    #[error("Undecodable {kind} tag: {source}")]
    MediaDecode {
        kind: &'static str,
        #[source]
        source: FlvError,
    },

    #[error("Stream sink for {0} closed")]
    SinkClosed(String),
}

impl Error {
    /// The peer broke the protocol, as opposed to going away or timing out.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::HandshakeFailed(_)
                | Error::Session(_)
                | Error::EmptyStreamKey
                | Error::RequestRejected(..)
                | Error::MediaDecode { .. }
        )
    }
}
