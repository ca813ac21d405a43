//! Relay connection
//!
//! [`RelayLink`] keeps one WebSocket connection to the relay. Frames are
//! written by a writer task (which also owns the keepalive timer) and read by
//! a reader task that parses them into [`RelayEvent`]s. Opening registers the
//! client before anything else is sent; reconnecting is always an explicit
//! call.

use std::fmt::Display;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{ClientIdentity, SignalingMessage};

/// How long `close` waits for the close frame to be flushed.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Message(SignalingMessage),
    /// An inbound frame could not be understood. The link stays open.
    ProtocolViolation(String),
    /// The connection ended, with the reason if one was given.
    Disconnected(Option<String>),
}

pub struct RelayLink {
    url: String,
    identity: ClientIdentity,
    keepalive: Duration,
    open: Arc<AtomicBool>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    inbound: Option<mpsc::UnboundedReceiver<RelayEvent>>,
    /// `Disconnected` for a close we initiated, handed out by `next_event`.
    closed: Option<RelayEvent>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl RelayLink {
    pub fn new(url: impl Into<String>, identity: ClientIdentity, keepalive: Duration) -> Self {
        Self {
            url: url.into(),
            identity,
            keepalive,
            open: Arc::new(AtomicBool::new(false)),
            outbound: None,
            inbound: None,
            closed: None,
            reader: None,
            writer: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether messages can be sent right now.
    pub fn is_open(&self) -> bool {
        self.outbound.is_some() && self.open.load(Ordering::SeqCst)
    }

    /// Opens the connection and registers this client.
    ///
    /// A failure is returned as-is; no retry is scheduled.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.shutdown();
        self.closed = None;

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::TransportUnavailable(format!("relay {}: {}", self.url, e)))?;
        info!("Connected to relay {}", self.url);

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        self.writer = Some(tokio::spawn(write_loop(
            sink,
            out_rx,
            self.keepalive,
            open.clone(),
        )));
        self.reader = Some(tokio::spawn(read_loop(stream, in_tx, open.clone())));
        self.open = open;
        self.outbound = Some(out_tx);
        self.inbound = Some(in_rx);

        self.send(&SignalingMessage::registration(&self.identity))
    }

    /// Closes the current connection, if any, and opens a new one.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.close().await;
        self.connect().await
    }

    /// Queues `message` for the relay.
    ///
    /// Fails with [`Error::NotConnected`] when the link is not open; check
    /// [`RelayLink::is_open`] first.
    pub fn send(&self, message: &SignalingMessage) -> Result<()> {
        let Some(outbound) = self.outbound.as_ref().filter(|_| self.is_open()) else {
            return Err(Error::NotConnected);
        };

        let text = message
            .to_json()
            .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
        debug!("-> relay: {}", message.kind());
        outbound
            .send(Message::Text(text))
            .map_err(|_| Error::NotConnected)
    }

    /// Waits for the next event of the current connection.
    ///
    /// Never resolves while there is no connection.
    pub async fn next_event(&mut self) -> RelayEvent {
        if let Some(event) = self.closed.take() {
            return event;
        }
        if let Some(inbound) = self.inbound.as_mut() {
            if let Some(event) = inbound.recv().await {
                return event;
            }
            self.inbound = None;
        }
        std::future::pending().await
    }

    /// Sends a close frame and tears the connection down. Idempotent.
    ///
    /// Closing an open link queues one `Disconnected` event; events the
    /// reader had not handed out yet are dropped. A later `connect` discards
    /// it.
    pub async fn close(&mut self) {
        let was_open = self.is_open();
        self.open.store(false, Ordering::SeqCst);

        // Dropping the sender lets the writer send the close frame and exit.
        self.outbound = None;
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                debug!("Relay writer did not finish in time");
            }
        }
        self.shutdown();

        if was_open {
            info!("Relay link to {} closed", self.url);
            self.closed = Some(RelayEvent::Disconnected(None));
        }
    }

    fn shutdown(&mut self) {
        self.outbound = None;
        self.inbound = None;
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    keepalive: Duration,
    open: Arc<AtomicBool>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => message,
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        if let Err(e) = sink.send(message).await {
            warn!("Relay write failed: {}", e);
            break;
        }
    }

    open.store(false, Ordering::SeqCst);
}

async fn read_loop<S, E>(mut stream: S, events: mpsc::UnboundedSender<RelayEvent>, open: Arc<AtomicBool>)
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let reason = loop {
        let event = match stream.next().await {
            Some(Ok(Message::Text(text))) => match SignalingMessage::from_json(&text) {
                Ok(message) => {
                    debug!("<- relay: {}", message.kind());
                    RelayEvent::Message(message)
                }
                Err(e) => {
                    warn!("Malformed relay message ({}): {}", e, text);
                    RelayEvent::ProtocolViolation(format!("{e}: {text}"))
                }
            },
            Some(Ok(Message::Binary(data))) => {
                RelayEvent::ProtocolViolation(format!("unexpected {} byte binary frame", data.len()))
            }
            Some(Ok(Message::Close(frame))) => break frame.map(|f| f.reason.to_string()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };

        if events.send(event).is_err() {
            break None;
        }
    };

    open.store(false, Ordering::SeqCst);
    info!("Disconnected from relay");
    let _ = events.send(RelayEvent::Disconnected(reason));
}
