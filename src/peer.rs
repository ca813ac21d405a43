//! str0m-backed transport
//!
//! This module implements [`Transport`] on top of a sans-IO `str0m::Rtc`.
//! The `Rtc` lives behind a mutex shared with a driver task that owns the UDP
//! socket: the driver polls output until str0m asks for a timeout, transmits
//! packets, turns str0m events into [`TransportEvent`]s, and sleeps until the
//! next packet, the timeout, or a wake-up after a call on the transport.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use str0m::change::{SdpAnswer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::model::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    ChannelData, ConnectionState, Transport, TransportEvent, TransportEvents, TransportFactory,
};
use crate::util::select_host_address;

struct Shared {
    rtc: Rtc,
    channel: Option<ChannelId>,
}

/// Creates one [`Str0mTransport`] per negotiation attempt, each on its own
/// UDP port.
#[derive(Debug, Default, Clone)]
pub struct Str0mFactory {
    host: Option<IpAddr>,
}

impl Str0mFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds to `host` instead of auto-detecting an address.
    pub fn with_host(host: IpAddr) -> Self {
        Self { host: Some(host) }
    }
}

impl TransportFactory for Str0mFactory {
    type Transport = Str0mTransport;

    fn create(
        &mut self,
        ice_servers: &[String],
        events: TransportEvents,
    ) -> Result<Str0mTransport, TransportError> {
        for server in ice_servers {
            debug!("Connectivity server {} (host candidates only)", server);
        }

        let host = match self.host {
            Some(host) => host,
            None => select_host_address().map_err(TransportError::new)?,
        };

        let socket =
            std::net::UdpSocket::bind(SocketAddr::new(host, 0)).map_err(TransportError::new)?;
        socket.set_nonblocking(true).map_err(TransportError::new)?;
        let local_addr = socket.local_addr().map_err(TransportError::new)?;
        let socket = UdpSocket::from_std(socket).map_err(TransportError::new)?;
        info!("Bound UDP port: {}", local_addr);

        let mut rtc = Rtc::builder().build();
        let candidate = Candidate::host(local_addr, "udp").map_err(TransportError::new)?;
        rtc.add_local_candidate(candidate.clone());

        let shared = Arc::new(Mutex::new(Shared { rtc, channel: None }));
        let wake = Arc::new(Notify::new());
        let driver = tokio::spawn(drive(
            shared.clone(),
            socket,
            local_addr,
            events.clone(),
            wake.clone(),
        ));

        Ok(Str0mTransport {
            shared,
            wake,
            driver,
            events,
            label: None,
            pending: None,
            local_candidates: vec![candidate],
        })
    }
}

pub struct Str0mTransport {
    shared: Arc<Mutex<Shared>>,
    wake: Arc<Notify>,
    driver: JoinHandle<()>,
    events: TransportEvents,
    label: Option<String>,
    pending: Option<SdpPendingOffer>,
    local_candidates: Vec<Candidate>,
}

impl Transport for Str0mTransport {
    fn create_data_channel(&mut self, label: &str) -> Result<(), TransportError> {
        // str0m adds the channel as part of the offer's SDP change.
        self.label = Some(label.to_string());
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let label = self
            .label
            .clone()
            .ok_or_else(|| TransportError::new("no data channel declared"))?;

        let offer = {
            let mut shared = self.shared.lock();
            let mut change = shared.rtc.sdp_api();
            let cid = change.add_channel(label);
            let (offer, pending) = change
                .apply()
                .ok_or_else(|| TransportError::new("sdp change produced no offer"))?;
            shared.channel = Some(cid);
            self.pending = Some(pending);
            offer
        };
        self.wake.notify_one();

        let sdp = offer.to_sdp_string();
        let (index, mid) = application_mid(&sdp)
            .ok_or_else(|| TransportError::new("offer has no data channel section"))?;
        for candidate in &self.local_candidates {
            let mut local = IceCandidate::new(candidate.to_sdp_string()).with_mid(mid.clone());
            local.sdp_mline_index = Some(index);
            let _ = self.events.send(TransportEvent::LocalCandidate(local));
        }

        Ok(SessionDescription::offer(sdp))
    }

    fn apply_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        if description.kind != SdpKind::Answer {
            return Err(TransportError::new(format!(
                "expected an answer, got {:?}",
                description.kind
            )));
        }

        let answer = SdpAnswer::from_sdp_string(&description.sdp).map_err(TransportError::new)?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| TransportError::new("no pending offer"))?;

        self.shared
            .lock()
            .rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(TransportError::new)?;
        self.wake.notify_one();
        Ok(())
    }

    fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let line = candidate.candidate.trim().trim_start_matches("a=");
        if line.is_empty() {
            // Browsers signal the end of gathering with an empty candidate.
            return Ok(());
        }

        let remote = Candidate::from_sdp_string(line).map_err(TransportError::new)?;
        self.shared.lock().rtc.add_remote_candidate(remote);
        self.wake.notify_one();
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        {
            let mut shared = self.shared.lock();
            let cid = shared
                .channel
                .ok_or_else(|| TransportError::new("no data channel"))?;
            let mut channel = shared
                .rtc
                .channel(cid)
                .ok_or_else(|| TransportError::new("data channel is not open"))?;
            channel
                .write(false, text.as_bytes())
                .map_err(TransportError::new)?;
        }
        self.wake.notify_one();
        Ok(())
    }

    fn close_data_channel(&mut self) {
        if self.shared.lock().channel.take().is_some() {
            debug!("Data channel released");
            let _ = self.events.send(TransportEvent::ChannelClosed);
        }
    }

    fn close(&mut self) {
        {
            let mut shared = self.shared.lock();
            if shared.rtc.is_alive() {
                shared.rtc.disconnect();
            }
            shared.channel = None;
        }
        self.driver.abort();
    }
}

impl Drop for Str0mTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drive(
    shared: Arc<Mutex<Shared>>,
    socket: UdpSocket,
    local_addr: SocketAddr,
    events: TransportEvents,
    wake: Arc<Notify>,
) {
    let mut buf = vec![0; 2000];

    loop {
        let Some(timeout) = poll_until_timeout(&mut shared.lock(), &socket, &events) else {
            break;
        };

        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    let datagram: &[u8] = &buf[..n];
                    let Ok(contents) = datagram.try_into() else {
                        trace!("Ignoring unrecognised datagram from {}", source);
                        continue;
                    };
                    let input = Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: local_addr,
                            contents,
                        },
                    );
                    handle_input(&mut shared.lock(), input);
                }
                Err(e) => {
                    warn!("UdpSocket read failed: {}", e);
                    break;
                }
            },
            _ = tokio::time::sleep_until(timeout.into()) => {
                handle_input(&mut shared.lock(), Input::Timeout(Instant::now()));
            }
            _ = wake.notified() => {}
        }
    }

    debug!("Transport driver for {} stopped", local_addr);
    let _ = events.send(TransportEvent::ConnectionState(ConnectionState::Closed));
}

/// Index and mid of the `m=application` section that carries the data
/// channel.
fn application_mid(sdp: &str) -> Option<(u16, String)> {
    let mut index = None;
    let mut sections = 0;
    for line in sdp.lines().map(str::trim) {
        if line.starts_with("m=") {
            index = line.starts_with("m=application").then_some(sections);
            sections += 1;
        } else if let (Some(index), Some(mid)) = (index, line.strip_prefix("a=mid:")) {
            return Some((index, mid.to_string()));
        }
    }
    None
}

fn handle_input(shared: &mut Shared, input: Input) {
    if !shared.rtc.is_alive() {
        return;
    }
    if let Err(e) = shared.rtc.handle_input(input) {
        warn!("Peer connection failed: {:?}", e);
        shared.rtc.disconnect();
    }
}

/// Poll all output until str0m returns a timeout. Returns `None` once the
/// connection is dead.
fn poll_until_timeout(
    shared: &mut Shared,
    socket: &UdpSocket,
    events: &TransportEvents,
) -> Option<Instant> {
    loop {
        if !shared.rtc.is_alive() {
            return None;
        }

        match shared.rtc.poll_output() {
            Ok(Output::Timeout(t)) => return Some(t),
            Ok(Output::Transmit(transmit)) => {
                if let Err(e) = socket.try_send_to(&transmit.contents, transmit.destination) {
                    debug!("Dropping packet to {}: {}", transmit.destination, e);
                }
            }
            Ok(Output::Event(event)) => forward_event(shared, event, events),
            Err(e) => {
                warn!("Poll output error: {:?}", e);
                shared.rtc.disconnect();
                return None;
            }
        }
    }
}

fn forward_event(shared: &Shared, event: Event, events: &TransportEvents) {
    let event = match event {
        Event::IceConnectionStateChange(state) => {
            info!("ICE Connection State: {:?}", state);
            TransportEvent::ConnectionState(match state {
                IceConnectionState::New => ConnectionState::New,
                IceConnectionState::Checking => ConnectionState::Checking,
                IceConnectionState::Connected | IceConnectionState::Completed => {
                    ConnectionState::Connected
                }
                IceConnectionState::Disconnected => ConnectionState::Disconnected,
            })
        }
        Event::ChannelOpen(cid, label) if shared.channel == Some(cid) => {
            info!("Data channel '{}' ({:?}) is open", label, cid);
            TransportEvent::ChannelOpen
        }
        Event::ChannelData(data) if shared.channel == Some(data.id) => {
            TransportEvent::ChannelData(ChannelData {
                binary: data.binary,
                data: data.data,
            })
        }
        Event::ChannelClose(cid) if shared.channel == Some(cid) => TransportEvent::ChannelClosed,
        other => {
            trace!("Event (other): {:?}", other);
            return;
        }
    };

    let _ = events.send(event);
}
