//! The transport collaborator driven by the negotiator
//!
//! A [`Transport`] owns one peer connection attempt: it produces the local
//! description, accepts the remote one, takes remote candidates and carries
//! the data channel. Everything it observes asynchronously (local candidates,
//! connectivity changes, channel traffic) is pushed as a [`TransportEvent`]
//! into the sender handed to it at creation.

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::model::{IceCandidate, SessionDescription};

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Connectivity of the underlying peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// One message received on the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Whether the sender marked the payload as binary rather than text.
    pub binary: bool,
    pub data: Vec<u8>,
}

impl ChannelData {
    pub fn text(text: &str) -> Self {
        Self {
            binary: false,
            data: text.as_bytes().to_vec(),
        }
    }

    pub fn binary(data: Vec<u8>) -> Self {
        Self { binary: true, data }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    ChannelOpen,
    ChannelData(ChannelData),
    ChannelClosed,
}

/// One peer connection attempt.
pub trait Transport: Send {
    /// Declares the data channel to be negotiated with the offer.
    fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError>;

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    fn apply_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError>;

    /// Sends a text message on the data channel.
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    fn close_data_channel(&mut self);

    /// Releases every resource held by this attempt. Further calls are no-ops.
    fn close(&mut self);
}

/// Builds a fresh [`Transport`] for every negotiation attempt.
pub trait TransportFactory {
    type Transport: Transport;

    fn create(
        &mut self,
        ice_servers: &[String],
        events: TransportEvents,
    ) -> Result<Self::Transport, TransportError>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Recording transport for tests.

    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        CreateDataChannel(String),
        CreateOffer,
        ApplyRemote(String),
        AddCandidate(String),
        SendText(String),
        CloseDataChannel,
        Close,
    }

    #[derive(Debug, Default)]
    pub struct MockState {
        pub calls: Vec<Call>,
        pub fail_offer: bool,
        pub fail_answer: bool,
        pub fail_send: bool,
        pub created: usize,
        pub events: Option<TransportEvents>,
    }

    pub type Shared = Arc<Mutex<MockState>>;

    pub struct MockTransport {
        state: Shared,
    }

    impl MockTransport {
        pub fn new(state: Shared) -> Self {
            Self { state }
        }

        fn record(&self, call: Call) {
            self.state.lock().calls.push(call);
        }
    }

    impl Transport for MockTransport {
        fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError> {
            self.record(Call::CreateDataChannel(label.to_string()));
            Ok(())
        }

        fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
            self.record(Call::CreateOffer);
            if self.state.lock().fail_offer {
                return Err(TransportError::new("no codecs"));
            }
            Ok(SessionDescription::offer("v=0 mock-offer"))
        }

        fn apply_remote_description(
            &mut self,
            description: &SessionDescription,
        ) -> Result<(), TransportError> {
            self.record(Call::ApplyRemote(description.sdp.clone()));
            if self.state.lock().fail_answer {
                return Err(TransportError::new("bad answer"));
            }
            Ok(())
        }

        fn add_remote_candidate(
            &mut self,
            candidate: &IceCandidate,
        ) -> Result<(), TransportError> {
            self.record(Call::AddCandidate(candidate.candidate.clone()));
            Ok(())
        }

        fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.record(Call::SendText(text.to_string()));
            if self.state.lock().fail_send {
                return Err(TransportError::new("channel closed"));
            }
            Ok(())
        }

        fn close_data_channel(&mut self) {
            self.record(Call::CloseDataChannel);
        }

        fn close(&mut self) {
            self.record(Call::Close);
        }
    }

    /// Hands out [`MockTransport`]s sharing one recording state, and keeps the
    /// latest event sender so tests can play the transport's role.
    #[derive(Clone, Default)]
    pub struct MockFactory {
        pub state: Shared,
    }

    impl MockFactory {
        pub fn emit(&self, event: TransportEvent) {
            if let Some(events) = &self.state.lock().events {
                let _ = events.send(event);
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.state.lock().calls.clone()
        }
    }

    impl TransportFactory for MockFactory {
        type Transport = MockTransport;

        fn create(
            &mut self,
            _ice_servers: &[String],
            events: TransportEvents,
        ) -> Result<MockTransport, TransportError> {
            let mut state = self.state.lock();
            state.created += 1;
            state.events = Some(events);
            Ok(MockTransport::new(self.state.clone()))
        }
    }
}
