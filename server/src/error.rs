//! Error taxonomy for the chat core

use axum::http::StatusCode;
use thiserror::Error;

/// Bearer credential rejected by the token authenticator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("missing authorization header")]
    MissingHeader,

    #[error("malformed authorization header")]
    MalformedHeader,

    #[error("token expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,
}

/// Reasons a WebSocket handshake is refused before the upgrade is accepted
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),

    #[error("missing username query parameter")]
    MissingUsername,

    #[error("token subject {0} does not resolve to a user")]
    UnknownSubject(i64),

    #[error("peer {0:?} does not resolve to a user")]
    UnknownPeer(String),

    #[error("directory lookup failed: {0:#}")]
    Directory(anyhow::Error),
}

impl HandshakeError {
    /// Bare status used to refuse the upgrade; no detail reaches the client
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::Auth(_) => StatusCode::UNAUTHORIZED,
            HandshakeError::MissingUsername
            | HandshakeError::UnknownSubject(_)
            | HandshakeError::UnknownPeer(_) => StatusCode::FORBIDDEN,
            HandshakeError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Failure while handling one inbound chat frame; the connection stays open
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("failed to persist message: {0:#}")]
    Storage(anyhow::Error),

    #[error("failed to publish to {group}: {reason:#}")]
    Publish { group: String, reason: anyhow::Error },
}
