//! Relay wire protocol.
//!
//! Every frame on the relay connection is a JSON text frame tagged by `type`.
//! Outbound offers and candidates carry `target`; the relay rewrites them to
//! carry `from` when forwarding.

use serde::{Deserialize, Serialize};

use crate::model::identity::ClientIdentity;

/// A session description as exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A connectivity candidate in the shape browsers serialize `RTCIceCandidate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(mid.into());
        self
    }
}

/// One message on the relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Registration (outbound) or its acknowledgement (inbound).
    #[serde(rename_all = "camelCase")]
    Connection {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    /// A `null` candidate marks the end of the remote candidate stream.
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default)]
        candidate: Option<IceCandidate>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Error {
        message: String,
    },
}

impl SignalingMessage {
    /// The relay-level handshake sent as soon as the link opens.
    pub fn registration(identity: &ClientIdentity) -> Self {
        SignalingMessage::Connection {
            client_id: identity.client_id().to_string(),
            status: None,
        }
    }

    pub fn offer(identity: &ClientIdentity, offer: SessionDescription) -> Self {
        SignalingMessage::Offer {
            target: Some(identity.target_id().to_string()),
            offer,
            from: None,
        }
    }

    pub fn ice_candidate(identity: &ClientIdentity, candidate: IceCandidate) -> Self {
        SignalingMessage::IceCandidate {
            target: Some(identity.target_id().to_string()),
            candidate: Some(candidate),
            from: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SignalingMessage::Error {
            message: message.into(),
        }
    }

    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Connection { .. } => "connection",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Error { .. } => "error",
        }
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { target, .. }
            | SignalingMessage::Answer { target, .. }
            | SignalingMessage::IceCandidate { target, .. } => target.as_deref(),
            _ => None,
        }
    }

    /// Rewrites an addressed message the way the relay forwards it: the
    /// `target` is dropped and `from` names the sender.
    ///
    /// Returns `None` for messages that are never forwarded.
    pub fn forwarded_from(self, sender: &str) -> Option<Self> {
        let from = Some(sender.to_string());
        match self {
            SignalingMessage::Offer { offer, .. } => Some(SignalingMessage::Offer {
                target: None,
                offer,
                from,
            }),
            SignalingMessage::Answer { answer, .. } => Some(SignalingMessage::Answer {
                target: None,
                answer,
                from,
            }),
            SignalingMessage::IceCandidate { candidate, .. } => {
                Some(SignalingMessage::IceCandidate {
                    target: None,
                    candidate,
                    from,
                })
            }
            SignalingMessage::Connection { .. } | SignalingMessage::Error { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
