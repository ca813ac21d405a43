//! Signaling client
//!
//! [`SignalingClient`] owns the relay link, the negotiator and the
//! data-channel collector, and runs the single event loop that feeds them:
//! caller commands, relay events, transport events, probe ticks and the
//! periodic stats report are handled one at a time, in arrival order.

use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::channel::{ChannelStatsCollector, LossEstimator, Payload, RandomLoss};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::{ChannelStats, SessionState, SignalingMessage};
use crate::negotiator::{Negotiator, NegotiatorOutput};
use crate::probe::ProbeTick;
use crate::relay::{RelayEvent, RelayLink};
use crate::sink::{DiscardFrames, FrameSink, LatestFrameFile, LogStatus, StatusSink};
use crate::transport::{TransportEvent, TransportFactory};

/// How a session attempt ended.
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub reason: Option<Error>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Stop,
    Reconnect,
}

/// Controls a running [`SignalingClient`] from elsewhere.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }
}

enum Wake {
    Command(Option<Command>),
    Relay(RelayEvent),
    Transport(TransportEvent),
    Probe(ProbeTick),
    Report,
}

pub struct SignalingClient<F: TransportFactory> {
    config: Config,
    factory: F,
    relay: RelayLink,
    negotiator: Negotiator<F::Transport>,
    collector: ChannelStatsCollector,
    status: Box<dyn StatusSink>,
    frames: Box<dyn FrameSink>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    probe_tx: mpsc::UnboundedSender<ProbeTick>,
    probe_rx: mpsc::UnboundedReceiver<ProbeTick>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    outcome: Option<SessionOutcome>,
    stopped: bool,
}

impl<F: TransportFactory> SignalingClient<F> {
    pub fn new(config: Config, factory: F) -> Self {
        let identity = config.identity();
        let relay = RelayLink::new(&config.relay_url, identity.clone(), config.relay_keepalive());
        let negotiator = Negotiator::new(identity, &config.channel_label);
        let collector = ChannelStatsCollector::new(
            Utc::now(),
            config.probe_interval(),
            Box::new(RandomLoss::new(config.loss_probability)),
        );
        let frames: Box<dyn FrameSink> = match &config.frames_dir {
            Some(dir) => Box::new(LatestFrameFile::new(dir)),
            None => Box::new(DiscardFrames),
        };
        let (probe_tx, probe_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Self {
            config,
            factory,
            relay,
            negotiator,
            collector,
            status: Box::new(LogStatus),
            frames,
            transport_events: None,
            probe_tx,
            probe_rx,
            commands_tx,
            commands_rx,
            outcome: None,
            stopped: false,
        }
    }

    pub fn with_status(mut self, status: impl StatusSink + 'static) -> Self {
        self.status = Box::new(status);
        self
    }

    pub fn with_frames(mut self, frames: impl FrameSink + 'static) -> Self {
        self.frames = Box::new(frames);
        self
    }

    pub fn with_loss_estimator(mut self, estimator: impl LossEstimator + 'static) -> Self {
        self.collector = ChannelStatsCollector::new(
            Utc::now(),
            self.config.probe_interval(),
            Box::new(estimator),
        );
        self
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.negotiator.state()
    }

    pub fn stats(&self) -> Option<&ChannelStats> {
        self.collector.stats()
    }

    pub fn collector(&self) -> &ChannelStatsCollector {
        &self.collector
    }

    pub fn relay_connected(&self) -> bool {
        self.relay.is_open()
    }

    /// Connects to the relay and starts negotiating with the target.
    ///
    /// After `Failed` or `Closed` this begins a new attempt with a fresh
    /// negotiator and transport. Refused while an attempt is in progress.
    pub async fn start(&mut self) -> Result<()> {
        let state = self.negotiator.state();
        if state.is_terminal() {
            self.reset_attempt();
        } else if state != SessionState::Idle {
            return Err(Error::InvalidState {
                state,
                action: "start",
            });
        }

        self.report(&format!("Connecting to relay {}", self.relay.url()));
        if let Err(e) = self.relay.connect().await {
            let reason = e.to_string();
            self.negotiator.fail(Error::TransportUnavailable(reason.clone()));
            self.flush_negotiator();
            return Err(Error::TransportUnavailable(reason));
        }
        self.report("Connected to relay");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.factory.create(&self.config.ice_servers, events_tx) {
            Ok(transport) => {
                self.transport_events = Some(events_rx);
                self.negotiator.start(transport)?;
            }
            Err(e) => self.negotiator.fail(Error::TransportUnavailable(e.to_string())),
        }
        self.flush_negotiator();
        Ok(())
    }

    /// Handles events until the session reaches a terminal state or is
    /// stopped.
    pub async fn run(&mut self) -> SessionOutcome {
        let period = self.config.stats_interval();
        let mut stats_timer =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(outcome) = self.outcome.take() {
                return outcome;
            }
            if self.negotiator.state().is_terminal() {
                return SessionOutcome {
                    state: self.negotiator.state(),
                    reason: None,
                };
            }

            let wake = tokio::select! {
                command = self.commands_rx.recv() => Wake::Command(command),
                event = self.relay.next_event() => Wake::Relay(event),
                Some(event) = next_transport_event(&mut self.transport_events) => {
                    Wake::Transport(event)
                }
                Some(tick) = self.probe_rx.recv() => Wake::Probe(tick),
                _ = stats_timer.tick() => Wake::Report,
            };

            match wake {
                Wake::Command(Some(Command::Stop)) => self.stop().await,
                Wake::Command(Some(Command::Reconnect)) => {
                    if let Err(e) = self.reconnect().await {
                        self.report(&format!("Reconnect failed: {e}"));
                    }
                }
                Wake::Command(None) => {}
                Wake::Relay(event) => self.handle_relay_event(event),
                Wake::Transport(event) => self.handle_transport_event(event),
                Wake::Probe(tick) => self.handle_probe_tick(tick),
                Wake::Report => self.report_stats(),
            }
        }
    }

    /// Cancels the probe loop, closes the data channel, the transport and the
    /// relay link, in that order. Calling it again does nothing.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Stopping signaling client");

        self.collector.stop_probe();
        self.negotiator.close_data_channel();
        self.negotiator.close();
        self.relay.close().await;
        self.transport_events = None;

        self.flush_negotiator();
        self.report("Stopped");
    }

    /// Tears down the current attempt and starts a fresh one with a new
    /// transport and reset state. Refused while connected.
    pub async fn reconnect(&mut self) -> Result<()> {
        if self.negotiator.state() == SessionState::Connected {
            return Err(Error::InvalidState {
                state: SessionState::Connected,
                action: "reconnect",
            });
        }

        self.report("Reconnecting");
        self.collector.stop_probe();
        self.negotiator.close_data_channel();
        self.negotiator.close();
        while let Some(output) = self.negotiator.poll_output() {
            if let NegotiatorOutput::Diagnostic(e) = output {
                self.report(&e.to_string());
            }
        }
        self.relay.close().await;

        self.start().await
    }

    fn reset_attempt(&mut self) {
        self.negotiator = Negotiator::new(self.config.identity(), &self.config.channel_label);
        self.collector.reset();
        self.transport_events = None;
        self.outcome = None;
        self.stopped = false;
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Message(message) => {
                if let SignalingMessage::Connection { client_id, .. } = &message {
                    self.report(&format!("Registered with relay as {client_id}"));
                }
                self.negotiator.handle_signal(message);
            }
            RelayEvent::ProtocolViolation(reason) => {
                self.report(&Error::ProtocolViolation(reason).to_string());
            }
            RelayEvent::Disconnected(reason) => {
                match reason {
                    Some(reason) => self.report(&format!("Disconnected from relay: {reason}")),
                    None => self.report("Disconnected from relay"),
                }
                if !self.stopped {
                    self.negotiator.handle_relay_closed();
                }
            }
        }
        self.flush_negotiator();
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.negotiator.handle_local_candidate(candidate);
            }
            TransportEvent::ConnectionState(state) => {
                self.report(&format!("Peer connection: {state:?}"));
                self.negotiator.handle_connection_state(state);
            }
            TransportEvent::ChannelOpen => {
                if matches!(
                    self.negotiator.state(),
                    SessionState::AnswerApplied | SessionState::Connected
                ) {
                    self.report("Data channel open");
                    self.collector
                        .on_channel_open(Instant::now(), self.probe_tx.clone());
                } else {
                    self.report(&format!(
                        "Ignoring data channel open while {}",
                        self.negotiator.state()
                    ));
                }
            }
            TransportEvent::ChannelData(data) => {
                if self.negotiator.state().is_terminal() {
                    return;
                }
                match self.collector.on_payload(data, Instant::now()) {
                    Payload::Text(text) => self.report(&format!("< {text}")),
                    Payload::Frame(frame) => self.frames.render(&frame),
                    Payload::Anomaly(reason) => {
                        self.report(&Error::ProtocolViolation(reason).to_string())
                    }
                }
            }
            TransportEvent::ChannelClosed => {
                self.report("Data channel closed");
                self.collector.on_channel_close();
            }
        }
        self.flush_negotiator();
    }

    fn handle_probe_tick(&mut self, tick: ProbeTick) {
        let Some(transport) = self.negotiator.transport_mut() else {
            self.collector.stop_probe();
            return;
        };

        match self.collector.send_probe(tick, Utc::now(), transport) {
            Ok(Some(text)) => self.report(&format!("> {text}")),
            Ok(None) => {}
            Err(e) => self.report(&e.to_string()),
        }
    }

    fn report_stats(&mut self) {
        if let Some(stats) = self.collector.stats() {
            let line = format!("Stats: {stats}");
            self.report(&line);
        }
    }

    fn flush_negotiator(&mut self) {
        while let Some(output) = self.negotiator.poll_output() {
            match output {
                NegotiatorOutput::Signal(message) => {
                    if !self.relay.is_open() {
                        self.report(&format!(
                            "Dropping {}: {}",
                            message.kind(),
                            Error::NotConnected
                        ));
                        continue;
                    }
                    if let Err(e) = self.relay.send(&message) {
                        warn!("Could not send {}: {}", message.kind(), e);
                        self.report(&format!("Could not send {}: {e}", message.kind()));
                    }
                }
                NegotiatorOutput::StateChange(state) => {
                    self.report(&format!("State: {state}"));
                }
                NegotiatorOutput::Diagnostic(e) => self.report(&e.to_string()),
                NegotiatorOutput::Terminated { state, reason } => {
                    self.collector.stop_probe();
                    self.transport_events = None;
                    match &reason {
                        Some(reason) => self.report(&format!("Session {state}: {reason}")),
                        None => self.report(&format!("Session {state}")),
                    }
                    self.outcome = Some(SessionOutcome { state, reason });
                }
            }
        }
    }

    fn report(&mut self, line: &str) {
        self.status.status(line);
    }
}

async fn next_transport_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::channel::NoLoss;
    use crate::model::{ClientIdentity, SessionDescription};
    use crate::server;
    use crate::transport::mock::{Call, MockFactory};
    use crate::transport::{ChannelData, ConnectionState};

    fn config(addr: SocketAddr) -> Config {
        Config {
            relay_url: format!("ws://{addr}/ws"),
            probe_interval_ms: 50,
            ..Config::default()
        }
    }

    fn client(
        config: Config,
        factory: &MockFactory,
    ) -> (SignalingClient<MockFactory>, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let client = SignalingClient::new(config, factory.clone())
            .with_loss_estimator(NoLoss)
            .with_status(move |line: &str| sink.lock().push(line.to_string()));
        (client, lines)
    }

    async fn device(addr: SocketAddr) -> RelayLink {
        let mut device = RelayLink::new(
            format!("ws://{addr}/ws"),
            ClientIdentity::new("device", "browser-client"),
            Duration::from_secs(20),
        );
        device.connect().await.unwrap();
        // Registration ack.
        next_message(&mut device).await;
        device
    }

    async fn next_message(link: &mut RelayLink) -> SignalingMessage {
        match tokio::time::timeout(Duration::from_secs(5), link.next_event()).await {
            Ok(RelayEvent::Message(message)) => message,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn answer() -> SignalingMessage {
        SignalingMessage::Answer {
            target: Some("browser-client".into()),
            answer: SessionDescription::answer("v=0 mock-answer"),
            from: None,
        }
    }

    #[tokio::test]
    async fn negotiates_probes_and_collects_frames() {
        let (addr, _server) = server::spawn("127.0.0.1:0").await.unwrap();
        let mut device = device(addr).await;

        let factory = MockFactory::default();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let rendered = frames.clone();
        let (client, _lines) = client(config(addr), &factory);
        let mut client = client.with_frames(move |frame: &[u8]| rendered.lock().push(frame.len()));
        let handle = client.handle();

        let session = tokio::spawn(async move {
            client.start().await.unwrap();
            let outcome = client.run().await;
            (client, outcome)
        });

        match next_message(&mut device).await {
            SignalingMessage::Offer { offer, from, .. } => {
                assert_eq!(offer.sdp, "v=0 mock-offer");
                assert_eq!(from.as_deref(), Some("browser-client"));
            }
            other => panic!("expected an offer, got {other:?}"),
        }

        device.send(&answer()).unwrap();
        wait_until(|| {
            factory
                .calls()
                .contains(&Call::ApplyRemote("v=0 mock-answer".into()))
        })
        .await;

        factory.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        factory.emit(TransportEvent::ChannelOpen);
        factory.emit(TransportEvent::ChannelData(ChannelData::binary(vec![0; 1000])));
        factory.emit(TransportEvent::ChannelData(ChannelData::binary(vec![0; 500])));
        factory.emit(TransportEvent::ChannelData(ChannelData::text("pong 1 s")));

        wait_until(|| {
            factory
                .calls()
                .iter()
                .any(|call| matches!(call, Call::SendText(text) if text.starts_with("ping ")))
        })
        .await;
        wait_until(|| frames.lock().len() == 2).await;

        handle.stop();
        let (mut client, outcome) = tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.state, SessionState::Closed);
        assert!(outcome.reason.is_none());
        assert_eq!(*frames.lock(), vec![1000, 500]);

        let stats = client.stats().unwrap();
        assert_eq!(stats.total_frames_received, 2);
        assert_eq!(stats.total_bytes_received, 1500);
        assert_eq!(stats.lost_frames, 0);
        assert_eq!(client.collector().pongs_received(), 1);
        assert!(!client.collector().probe_active());
        assert!(!client.relay_connected());

        let calls = factory.calls();
        let close_channel = calls.iter().position(|c| *c == Call::CloseDataChannel);
        let close = calls.iter().position(|c| *c == Call::Close);
        assert!(close_channel.unwrap() < close.unwrap());

        client.stop().await;
        assert_eq!(factory.calls().len(), calls.len());
    }

    fn probes_sent(factory: &MockFactory) -> usize {
        factory
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::SendText(text) if text.starts_with("ping ")))
            .count()
    }

    #[tokio::test]
    async fn stop_cancels_the_next_probe() {
        let (addr, _server) = server::spawn("127.0.0.1:0").await.unwrap();
        let mut device = device(addr).await;

        let factory = MockFactory::default();
        let config = Config {
            probe_interval_ms: 1000,
            ..config(addr)
        };
        let (mut client, _lines) = client(config, &factory);
        let handle = client.handle();
        let session = tokio::spawn(async move {
            client.start().await.unwrap();
            let outcome = client.run().await;
            (client, outcome)
        });

        assert_eq!(next_message(&mut device).await.kind(), "offer");
        device.send(&answer()).unwrap();
        wait_until(|| {
            factory
                .calls()
                .contains(&Call::ApplyRemote("v=0 mock-answer".into()))
        })
        .await;

        tokio::time::pause();
        factory.emit(TransportEvent::ChannelOpen);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(probes_sent(&factory), 2);

        handle.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (mut client, outcome) = session.await.unwrap();
        assert_eq!(outcome.state, SessionState::Closed);
        assert_eq!(probes_sent(&factory), 2);

        // A tick still queued from the cancelled loop sends nothing.
        client.handle_probe_tick(ProbeTick {
            generation: 1,
            seq: 2,
        });
        assert_eq!(probes_sent(&factory), 2);
        assert!(!client.collector().probe_active());
    }

    #[tokio::test]
    async fn sends_registration_then_one_offer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut seen = Vec::new();
            while let Ok(Some(Ok(message))) =
                tokio::time::timeout(Duration::from_millis(300), ws.next()).await
            {
                if let Message::Text(text) = message {
                    seen.push(SignalingMessage::from_json(&text).unwrap());
                }
            }
            seen
        });

        let factory = MockFactory::default();
        let (mut client, _lines) = client(config(addr), &factory);
        client.start().await.unwrap();
        assert_eq!(client.state(), SessionState::OfferSent);

        let seen = relay.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            SignalingMessage::Connection {
                client_id: "browser-client".into(),
                status: None,
            }
        );
        assert_eq!(seen[1].kind(), "offer");
        assert_eq!(seen[1].target(), Some("device"));
    }

    #[tokio::test]
    async fn unreachable_relay_fails_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = MockFactory::default();
        let (mut client, lines) = client(config(addr), &factory);
        let err = client.start().await.unwrap_err();

        assert!(matches!(err, Error::TransportUnavailable(_)));
        assert_eq!(client.state(), SessionState::Failed);
        assert_eq!(factory.state.lock().created, 0);
        assert!(lines.lock().iter().any(|l| l.starts_with("Session failed")));
    }

    #[tokio::test]
    async fn start_after_failure_begins_a_fresh_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let factory = MockFactory::default();
        let (mut client, _lines) = client(config(addr), &factory);
        assert!(client.start().await.is_err());
        assert_eq!(client.state(), SessionState::Failed);

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
        assert_eq!(client.state(), SessionState::Failed);

        let (_addr, _server) = server::spawn(&addr.to_string()).await.unwrap();
        client.start().await.unwrap();
        assert_eq!(client.state(), SessionState::OfferSent);
        assert_eq!(factory.state.lock().created, 1);

        let err = client.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: SessionState::OfferSent,
                ..
            }
        ));
        assert_eq!(factory.state.lock().created, 1);

        client.stop().await;
        assert_eq!(client.state(), SessionState::Closed);
        client.start().await.unwrap();
        assert_eq!(client.state(), SessionState::OfferSent);
        assert_eq!(factory.state.lock().created, 2);
        assert!(client.stats().is_none());

        client.stop().await;
    }

    #[tokio::test]
    async fn relay_loss_closes_the_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _registration = ws.next().await;
            let _offer = ws.next().await;
        });

        let factory = MockFactory::default();
        let (mut client, _lines) = client(config(addr), &factory);
        client.start().await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), client.run())
            .await
            .unwrap();
        assert_eq!(outcome.state, SessionState::Closed);
        assert!(matches!(
            outcome.reason,
            Some(Error::TransportUnavailable(_))
        ));
        assert!(factory.calls().contains(&Call::Close));
    }

    #[tokio::test]
    async fn reconnect_starts_a_fresh_attempt() {
        let (addr, _server) = server::spawn("127.0.0.1:0").await.unwrap();
        let factory = MockFactory::default();
        let (mut client, _lines) = client(config(addr), &factory);
        client.start().await.unwrap();
        assert_eq!(factory.state.lock().created, 1);

        client.reconnect().await.unwrap();
        assert_eq!(factory.state.lock().created, 2);
        assert_eq!(client.state(), SessionState::OfferSent);
        assert!(client.relay_connected());

        client.handle_relay_event(RelayEvent::Message(answer()));
        client.handle_transport_event(TransportEvent::ConnectionState(ConnectionState::Connected));
        assert_eq!(client.state(), SessionState::Connected);

        let err = client.reconnect().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(factory.state.lock().created, 2);

        client.stop().await;
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn channel_open_before_answer_is_ignored() {
        let (addr, _server) = server::spawn("127.0.0.1:0").await.unwrap();
        let factory = MockFactory::default();
        let (mut client, _lines) = client(config(addr), &factory);
        client.start().await.unwrap();

        client.handle_transport_event(TransportEvent::ChannelOpen);
        assert!(!client.collector().probe_active());
        assert!(client.stats().is_none());

        client.stop().await;
    }
}
