//! Identity of this client on the relay.

use std::fmt;

/// Identifies this client and its single negotiation peer to the relay.
///
/// Fixed for the lifetime of the process: every outbound offer and candidate
/// is addressed to `target_id`, and the relay registration carries `client_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    client_id: String,
    target_id: String,
}

impl ClientIdentity {
    pub fn new(client_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            target_id: target_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client_id, self.target_id)
    }
}
