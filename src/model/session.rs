//! Negotiation session state.

use std::fmt;

/// Where a negotiation attempt currently stands.
///
/// `Failed` and `Closed` are terminal: a new attempt always starts from a
/// fresh `Idle` negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Transport created, waiting for the local description.
    AwaitingTransport,
    /// Offer sent through the relay, waiting for the answer.
    OfferSent,
    /// Remote description applied, waiting for connectivity.
    AnswerApplied,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingTransport => "awaiting-transport",
            SessionState::OfferSent => "offer-sent",
            SessionState::AnswerApplied => "answer-applied",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The negotiation step during which a description operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CreateChannel,
    CreateOffer,
    ApplyAnswer,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::CreateChannel => "data channel creation",
            Phase::CreateOffer => "offer creation",
            Phase::ApplyAnswer => "answer application",
        };
        f.write_str(name)
    }
}
