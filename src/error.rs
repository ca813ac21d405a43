//! Error types for the signaling client.

use thiserror::Error;

use crate::model::{Phase, SessionState};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the relay link, the negotiator and the data-channel layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The relay or the session transport could not be created or opened.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A message was sent on a relay link that is not open.
    #[error("relay link is not connected")]
    NotConnected,

    /// An inbound message was malformed or of an unknown type.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Creating or applying a session description failed.
    #[error("negotiation failed during {phase}: {reason}")]
    Negotiation { phase: Phase, reason: String },

    /// The relay reported an error for one of our messages.
    #[error("relay error: {0}")]
    Relay(String),

    /// The liveness probe could not be sent.
    #[error("liveness probe send failed: {0}")]
    ProbeSend(String),

    /// The requested operation is not allowed in the current state.
    #[error("cannot {action} while {state}")]
    InvalidState {
        state: SessionState,
        action: &'static str,
    },
}

/// Failure reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(reason: impl ToString) -> Self {
        Self(reason.to_string())
    }
}
