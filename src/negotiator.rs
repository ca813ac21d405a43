//! Session negotiation state machine
//!
//! The [`Negotiator`] drives one [`Transport`] from offer creation to a
//! connected (or failed) peer connection. It is sans-IO: inputs arrive through
//! the `handle_*` methods, and everything it wants the outside world to do or
//! know is queued and taken with [`Negotiator::poll_output`].
//!
//! ```text
//! Idle --start--> AwaitingTransport --local description--> OfferSent
//!      --answer--> AnswerApplied --connected--> Connected
//! (any non-terminal) --failed / closed / relay gone--> Failed | Closed
//! ```

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::candidates::CandidateQueue;
use crate::error::{Error, Result};
use crate::model::{
    ClientIdentity, IceCandidate, Phase, SdpKind, SessionDescription, SessionState,
    SignalingMessage,
};
use crate::transport::{ConnectionState, Transport};

/// Something the negotiator wants handled by its owner.
#[derive(Debug)]
pub enum NegotiatorOutput {
    /// A message to send through the relay.
    Signal(SignalingMessage),
    /// The session moved to a new state.
    StateChange(SessionState),
    /// A recovered problem worth reporting. The session continues.
    Diagnostic(Error),
    /// The attempt ended. Emitted exactly once, after the final state change.
    Terminated {
        state: SessionState,
        reason: Option<Error>,
    },
}

pub struct Negotiator<T: Transport> {
    identity: ClientIdentity,
    channel_label: String,
    state: SessionState,
    transport: Option<T>,
    candidates: CandidateQueue,
    offer_sent: bool,
    remote_applied: bool,
    outputs: VecDeque<NegotiatorOutput>,
}

impl<T: Transport> Negotiator<T> {
    pub fn new(identity: ClientIdentity, channel_label: impl Into<String>) -> Self {
        Self {
            identity,
            channel_label: channel_label.into(),
            state: SessionState::Idle,
            transport: None,
            candidates: CandidateQueue::new(),
            offer_sent: false,
            remote_applied: false,
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn remote_description_applied(&self) -> bool {
        self.remote_applied
    }

    /// Remote candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    pub fn poll_output(&mut self) -> Option<NegotiatorOutput> {
        self.outputs.pop_front()
    }

    /// Takes ownership of a fresh transport, declares the data channel and
    /// creates the offer.
    ///
    /// Only allowed from `Idle`. Description failures do not return an error;
    /// they end the attempt with a [`NegotiatorOutput::Terminated`].
    pub fn start(&mut self, mut transport: T) -> Result<()> {
        if self.state != SessionState::Idle {
            transport.close();
            return Err(Error::InvalidState {
                state: self.state,
                action: "start negotiation",
            });
        }

        let offer = transport
            .create_data_channel(&self.channel_label)
            .map_err(|e| (Phase::CreateChannel, e))
            .and_then(|()| transport.create_offer().map_err(|e| (Phase::CreateOffer, e)));

        self.transport = Some(transport);
        self.transition(SessionState::AwaitingTransport);

        match offer {
            Ok(description) => self.handle_local_description(description),
            Err((phase, e)) => self.fail(Error::Negotiation {
                phase,
                reason: e.to_string(),
            }),
        }

        Ok(())
    }

    /// The transport produced the local description: send it as the offer.
    pub fn handle_local_description(&mut self, description: SessionDescription) {
        if self.state != SessionState::AwaitingTransport || self.offer_sent {
            self.diagnostic(Error::InvalidState {
                state: self.state,
                action: "send a second offer",
            });
            return;
        }

        self.offer_sent = true;
        self.candidates.mark_local_ready();
        info!("Sending offer to {}", self.identity.target_id());
        self.outputs
            .push_back(NegotiatorOutput::Signal(SignalingMessage::offer(
                &self.identity,
                description,
            )));
        self.transition(SessionState::OfferSent);
    }

    /// The transport discovered a local candidate. Forwarded right away in
    /// every live state.
    pub fn handle_local_candidate(&mut self, candidate: IceCandidate) {
        if self.state == SessionState::Idle || self.state.is_terminal() {
            debug!("Dropping local candidate while {}", self.state);
            return;
        }

        debug!("Sending local candidate {}", candidate.candidate);
        self.outputs
            .push_back(NegotiatorOutput::Signal(SignalingMessage::ice_candidate(
                &self.identity,
                candidate,
            )));
    }

    /// Interprets one inbound relay message.
    pub fn handle_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Connection { client_id, .. } => {
                debug!("Relay acknowledged registration of {}", client_id);
            }
            SignalingMessage::Answer { answer, .. } => self.handle_answer(answer),
            SignalingMessage::IceCandidate {
                candidate: Some(candidate),
                ..
            } => self.handle_remote_candidate(candidate),
            SignalingMessage::IceCandidate {
                candidate: None, ..
            } => {
                debug!("Remote peer finished sending candidates");
            }
            SignalingMessage::Error { message } => {
                warn!("Relay error: {}", message);
                self.diagnostic(Error::Relay(message));
            }
            SignalingMessage::Offer { from, .. } => {
                self.diagnostic(Error::ProtocolViolation(format!(
                    "unexpected offer from {}",
                    from.as_deref().unwrap_or("unknown peer")
                )));
            }
        }
    }

    fn handle_answer(&mut self, answer: SessionDescription) {
        if self.state != SessionState::OfferSent || self.remote_applied {
            self.diagnostic(Error::ProtocolViolation(format!(
                "answer ignored while {}",
                self.state
            )));
            return;
        }

        if answer.kind != SdpKind::Answer {
            self.diagnostic(Error::ProtocolViolation(format!(
                "answer message carries a {:?} description",
                answer.kind
            )));
            return;
        }

        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        info!("Applying answer from {}", self.identity.target_id());
        if let Err(e) = transport.apply_remote_description(&answer) {
            self.fail(Error::Negotiation {
                phase: Phase::ApplyAnswer,
                reason: e.to_string(),
            });
            return;
        }

        self.remote_applied = true;
        self.candidates.mark_remote_ready();
        self.transition(SessionState::AnswerApplied);

        let queued = self.candidates.drain_ready();
        if !queued.is_empty() {
            debug!("Applying {} queued remote candidates", queued.len());
        }
        for candidate in queued {
            self.apply_remote_candidate(candidate);
        }
    }

    fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state == SessionState::Idle || self.state.is_terminal() {
            self.diagnostic(Error::ProtocolViolation(format!(
                "remote candidate ignored while {}",
                self.state
            )));
            return;
        }

        if let Some(candidate) = self.candidates.push(candidate) {
            self.apply_remote_candidate(candidate);
        }
    }

    fn apply_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        if let Err(e) = transport.add_remote_candidate(&candidate) {
            self.diagnostic(Error::ProtocolViolation(format!(
                "remote candidate {} rejected: {}",
                candidate.candidate, e
            )));
        }
    }

    /// Connectivity reported by the transport.
    pub fn handle_connection_state(&mut self, connection: ConnectionState) {
        if self.state == SessionState::Idle || self.state.is_terminal() {
            return;
        }

        match connection {
            ConnectionState::Connected => {
                if self.state == SessionState::AnswerApplied {
                    self.transition(SessionState::Connected);
                } else {
                    debug!("Connectivity reported while {}", self.state);
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                self.fail(Error::TransportUnavailable(format!(
                    "peer connection {:?}",
                    connection
                )));
            }
            ConnectionState::Closed => self.terminate(SessionState::Closed, None),
            ConnectionState::New | ConnectionState::Checking => {
                debug!("Peer connection {:?}", connection);
            }
        }
    }

    /// The relay link closed and nobody asked for a reconnect.
    pub fn handle_relay_closed(&mut self) {
        self.terminate(
            SessionState::Closed,
            Some(Error::TransportUnavailable("relay link closed".to_string())),
        );
    }

    pub fn close_data_channel(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            transport.close_data_channel();
        }
    }

    /// Ends the attempt on request. Idempotent.
    pub fn close(&mut self) {
        self.terminate(SessionState::Closed, None);
        self.release_transport();
    }

    /// Ends the attempt as `Failed`, for problems found outside the
    /// negotiator such as an unreachable relay.
    pub fn fail(&mut self, reason: Error) {
        warn!("Negotiation failed: {}", reason);
        self.terminate(SessionState::Failed, Some(reason));
    }

    fn terminate(&mut self, state: SessionState, reason: Option<Error>) {
        if self.state.is_terminal() {
            return;
        }
        self.release_transport();
        self.transition(state);
        self.outputs
            .push_back(NegotiatorOutput::Terminated { state, reason });
    }

    fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    fn transition(&mut self, to: SessionState) {
        info!("Session {} -> {}", self.state, to);
        self.state = to;
        self.outputs.push_back(NegotiatorOutput::StateChange(to));
    }

    fn diagnostic(&mut self, error: Error) {
        debug!("{}", error);
        self.outputs.push_back(NegotiatorOutput::Diagnostic(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Call, MockFactory, MockTransport};

    fn negotiator() -> (Negotiator<MockTransport>, MockFactory) {
        let factory = MockFactory::default();
        let negotiator = Negotiator::new(
            ClientIdentity::new("browser-client", "device"),
            "video-streaming",
        );
        (negotiator, factory)
    }

    fn start(negotiator: &mut Negotiator<MockTransport>, factory: &MockFactory) {
        negotiator
            .start(MockTransport::new(factory.state.clone()))
            .unwrap();
    }

    fn drain(negotiator: &mut Negotiator<MockTransport>) -> Vec<NegotiatorOutput> {
        std::iter::from_fn(|| negotiator.poll_output()).collect()
    }

    fn signals(outputs: &[NegotiatorOutput]) -> Vec<&SignalingMessage> {
        outputs
            .iter()
            .filter_map(|o| match o {
                NegotiatorOutput::Signal(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn answer(sdp: &str) -> SignalingMessage {
        SignalingMessage::Answer {
            target: None,
            answer: SessionDescription::answer(sdp),
            from: Some("device".into()),
        }
    }

    fn remote_candidate(c: &str) -> SignalingMessage {
        SignalingMessage::IceCandidate {
            target: None,
            candidate: Some(IceCandidate::new(c)),
            from: Some("device".into()),
        }
    }

    #[test]
    fn start_sends_exactly_one_offer_to_target() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);

        let outputs = drain(&mut negotiator);
        let sent = signals(&outputs);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "offer");
        assert_eq!(sent[0].target(), Some("device"));
        assert_eq!(negotiator.state(), SessionState::OfferSent);
        assert_eq!(
            factory.calls(),
            vec![
                Call::CreateDataChannel("video-streaming".into()),
                Call::CreateOffer
            ]
        );

        negotiator.handle_local_description(SessionDescription::offer("again"));
        assert!(signals(&drain(&mut negotiator)).is_empty());
    }

    #[test]
    fn start_is_rejected_outside_idle() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);
        let second = negotiator.start(MockTransport::new(factory.state.clone()));
        assert!(matches!(second, Err(Error::InvalidState { .. })));
        assert_eq!(negotiator.state(), SessionState::OfferSent);
    }

    #[test]
    fn candidates_before_answer_are_applied_after_it() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);
        drain(&mut negotiator);

        negotiator.handle_signal(remote_candidate("C1"));
        assert_eq!(negotiator.pending_candidates(), 1);
        assert_eq!(negotiator.state(), SessionState::OfferSent);

        negotiator.handle_signal(answer("A"));
        assert_eq!(negotiator.state(), SessionState::AnswerApplied);
        assert_eq!(negotiator.pending_candidates(), 0);

        let calls = factory.calls();
        assert_eq!(
            &calls[2..],
            &[Call::ApplyRemote("A".into()), Call::AddCandidate("C1".into())]
        );
    }

    #[test]
    fn queued_candidates_keep_arrival_order() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);
        for c in ["C1", "C2", "C3"] {
            negotiator.handle_signal(remote_candidate(c));
        }
        negotiator.handle_signal(answer("A"));
        negotiator.handle_signal(remote_candidate("C4"));

        let added: Vec<_> = factory
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddCandidate(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(added, ["C1", "C2", "C3", "C4"]);
    }

    #[test]
    fn remote_description_is_applied_once() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);
        negotiator.handle_signal(answer("A"));
        negotiator.handle_signal(answer("B"));
        negotiator.handle_connection_state(ConnectionState::Connected);
        negotiator.handle_signal(answer("C"));

        let applied = factory
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::ApplyRemote(_)))
            .count();
        assert_eq!(applied, 1);
        assert_eq!(negotiator.state(), SessionState::Connected);
    }

    #[test]
    fn answer_before_offer_is_ignored() {
        let (mut negotiator, factory) = negotiator();
        negotiator.handle_signal(answer("A"));
        assert_eq!(negotiator.state(), SessionState::Idle);
        assert!(matches!(
            drain(&mut negotiator).as_slice(),
            [NegotiatorOutput::Diagnostic(Error::ProtocolViolation(_))]
        ));
        assert!(factory.calls().is_empty());
    }

    #[test]
    fn local_candidates_are_forwarded_to_target() {
        let (mut negotiator, factory) = negotiator();
        negotiator.handle_local_candidate(IceCandidate::new("early"));
        assert!(drain(&mut negotiator).is_empty());

        start(&mut negotiator, &factory);
        drain(&mut negotiator);
        negotiator.handle_local_candidate(IceCandidate::new("L1"));
        negotiator.handle_local_candidate(IceCandidate::new("L2"));

        let outputs = drain(&mut negotiator);
        let sent = signals(&outputs);
        assert_eq!(sent.len(), 2);
        assert!(sent
            .iter()
            .all(|m| m.kind() == "ice-candidate" && m.target() == Some("device")));
    }

    #[test]
    fn offer_failure_terminates_as_failed() {
        let (mut negotiator, factory) = negotiator();
        factory.state.lock().fail_offer = true;
        start(&mut negotiator, &factory);

        assert_eq!(negotiator.state(), SessionState::Failed);
        let outputs = drain(&mut negotiator);
        assert!(signals(&outputs).is_empty());
        assert!(matches!(
            outputs.last(),
            Some(NegotiatorOutput::Terminated {
                state: SessionState::Failed,
                reason: Some(Error::Negotiation {
                    phase: Phase::CreateOffer,
                    ..
                }),
            })
        ));
        assert_eq!(factory.calls().last(), Some(&Call::Close));
    }

    #[test]
    fn answer_failure_terminates_as_failed() {
        let (mut negotiator, factory) = negotiator();
        factory.state.lock().fail_answer = true;
        start(&mut negotiator, &factory);
        negotiator.handle_signal(remote_candidate("C1"));
        negotiator.handle_signal(answer("A"));

        assert_eq!(negotiator.state(), SessionState::Failed);
        assert!(!factory.calls().contains(&Call::AddCandidate("C1".into())));
        negotiator.handle_signal(remote_candidate("C2"));
        assert!(!factory.calls().contains(&Call::AddCandidate("C2".into())));
    }

    #[test]
    fn relay_errors_do_not_change_state() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);
        drain(&mut negotiator);
        negotiator.handle_signal(SignalingMessage::error("Target client device not found"));
        assert_eq!(negotiator.state(), SessionState::OfferSent);
        assert!(matches!(
            drain(&mut negotiator).as_slice(),
            [NegotiatorOutput::Diagnostic(Error::Relay(_))]
        ));
    }

    #[test]
    fn transport_failure_and_relay_loss_are_terminal() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);
        negotiator.handle_signal(answer("A"));
        negotiator.handle_connection_state(ConnectionState::Failed);
        assert_eq!(negotiator.state(), SessionState::Failed);

        negotiator.handle_relay_closed();
        negotiator.handle_connection_state(ConnectionState::Connected);
        assert_eq!(negotiator.state(), SessionState::Failed);

        let terminations = drain(&mut negotiator)
            .into_iter()
            .filter(|o| matches!(o, NegotiatorOutput::Terminated { .. }))
            .count();
        assert_eq!(terminations, 1);

        let (mut negotiator, factory) = self::negotiator();
        start(&mut negotiator, &factory);
        negotiator.handle_relay_closed();
        assert_eq!(negotiator.state(), SessionState::Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut negotiator, factory) = negotiator();
        start(&mut negotiator, &factory);
        negotiator.close();
        negotiator.close();

        let closes = factory
            .calls()
            .into_iter()
            .filter(|c| *c == Call::Close)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(negotiator.state(), SessionState::Closed);
    }
}
