//! Data-channel observation
//!
//! [`ChannelStatsCollector`] takes over once the data channel opens: it owns
//! the liveness [`ProbeLoop`], sorts inbound payloads into text and frames,
//! and keeps the running [`ChannelStats`].

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::model::ChannelStats;
use crate::probe::{ProbeLoop, ProbeTick};
use crate::transport::{ChannelData, Transport};

/// Decides whether a received frame counts as lost.
///
/// The channel carries no sequence numbers, so loss can only be estimated.
pub trait LossEstimator: Send {
    fn frame_lost(&mut self, byte_len: usize) -> bool;
}

impl<F> LossEstimator for F
where
    F: FnMut(usize) -> bool + Send,
{
    fn frame_lost(&mut self, byte_len: usize) -> bool {
        self(byte_len)
    }
}

/// Counts each frame as lost with a fixed probability.
#[derive(Debug, Clone, Copy)]
pub struct RandomLoss {
    probability: f64,
}

impl RandomLoss {
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }
}

impl LossEstimator for RandomLoss {
    fn frame_lost(&mut self, _byte_len: usize) -> bool {
        rand::thread_rng().gen_bool(self.probability)
    }
}

/// Never counts a frame as lost.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLoss;

impl LossEstimator for NoLoss {
    fn frame_lost(&mut self, _byte_len: usize) -> bool {
        false
    }
}

/// What became of one inbound payload.
#[derive(Debug, PartialEq, Eq)]
pub enum Payload {
    /// Text for the log sink.
    Text(String),
    /// A binary frame, already accounted, for the frame renderer.
    Frame(Vec<u8>),
    /// Dropped and counted as an anomaly.
    Anomaly(String),
}

pub struct ChannelStatsCollector {
    started: DateTime<Utc>,
    probe_interval: Duration,
    estimator: Box<dyn LossEstimator>,
    stats: Option<ChannelStats>,
    probe: Option<ProbeLoop>,
    generation: u64,
    probes_sent: u64,
    pongs_received: u64,
    last_pong: Option<u64>,
    anomalies: u64,
}

impl ChannelStatsCollector {
    /// `started` is the reference point for the elapsed seconds carried by
    /// every probe.
    pub fn new(
        started: DateTime<Utc>,
        probe_interval: Duration,
        estimator: Box<dyn LossEstimator>,
    ) -> Self {
        Self {
            started,
            probe_interval,
            estimator,
            stats: None,
            probe: None,
            generation: 0,
            probes_sent: 0,
            pongs_received: 0,
            last_pong: None,
            anomalies: 0,
        }
    }

    /// Statistics for the current channel, once it has opened.
    pub fn stats(&self) -> Option<&ChannelStats> {
        self.stats.as_ref()
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs_received
    }

    /// Elapsed seconds echoed by the most recent pong.
    pub fn last_pong(&self) -> Option<u64> {
        self.last_pong
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    pub fn probe_active(&self) -> bool {
        self.probe.is_some()
    }

    /// Starts fresh statistics and the one probe loop for this channel.
    pub fn on_channel_open(&mut self, now: Instant, ticks: mpsc::UnboundedSender<ProbeTick>) {
        self.stop_probe();
        self.generation += 1;
        self.probe = Some(ProbeLoop::start(
            self.generation,
            self.probe_interval,
            ticks,
        ));
        self.stats = Some(ChannelStats::new(now));
    }

    pub fn on_channel_close(&mut self) {
        self.stop_probe();
    }

    pub fn stop_probe(&mut self) {
        if let Some(probe) = self.probe.take() {
            debug!("Cancelling probe loop {}", probe.generation());
            probe.cancel();
        }
    }

    /// Forgets everything about the previous channel.
    pub fn reset(&mut self) {
        self.stop_probe();
        self.stats = None;
        self.probes_sent = 0;
        self.pongs_received = 0;
        self.last_pong = None;
        self.anomalies = 0;
    }

    pub fn probe_text(&self, now: DateTime<Utc>) -> String {
        let elapsed = (now.timestamp() - self.started.timestamp()).max(0);
        format!("ping {elapsed} s")
    }

    /// Sends the probe for `tick` on `transport`.
    ///
    /// Returns the probe text, or `None` for a tick from a loop that is no
    /// longer active. A failed send stops the loop.
    pub fn send_probe<T>(
        &mut self,
        tick: ProbeTick,
        now: DateTime<Utc>,
        transport: &mut T,
    ) -> Result<Option<String>, Error>
    where
        T: Transport + ?Sized,
    {
        let current = self
            .probe
            .as_ref()
            .is_some_and(|p| p.generation() == tick.generation);
        if !current {
            return Ok(None);
        }

        let text = self.probe_text(now);
        match transport.send_text(&text) {
            Ok(()) => {
                self.probes_sent += 1;
                Ok(Some(text))
            }
            Err(e) => {
                warn!("Probe send failed, stopping probe loop: {}", e);
                self.stop_probe();
                Err(Error::ProbeSend(e.to_string()))
            }
        }
    }

    pub fn on_payload(&mut self, payload: ChannelData, now: Instant) -> Payload {
        if payload.binary {
            return self.on_frame(payload.data, now);
        }

        match String::from_utf8(payload.data) {
            Ok(text) => {
                if let Some(seconds) = parse_pong(&text) {
                    self.pongs_received += 1;
                    self.last_pong = Some(seconds);
                }
                Payload::Text(text)
            }
            Err(e) => self.anomaly(format!("text payload is not UTF-8: {e}")),
        }
    }

    fn on_frame(&mut self, frame: Vec<u8>, now: Instant) -> Payload {
        let Some(stats) = self.stats.as_mut() else {
            return self.anomaly(format!(
                "{} byte frame before the channel opened",
                frame.len()
            ));
        };

        let lost = self.estimator.frame_lost(frame.len());
        stats.record_frame(frame.len(), now, lost);
        Payload::Frame(frame)
    }

    fn anomaly(&mut self, reason: String) -> Payload {
        self.anomalies += 1;
        debug!("Dropping payload: {}", reason);
        Payload::Anomaly(reason)
    }
}

/// Parses the device's reply to a probe, `"pong <n> s"`.
fn parse_pong(text: &str) -> Option<u64> {
    text.strip_prefix("pong")?
        .trim()
        .strip_suffix('s')?
        .trim()
        .parse()
        .ok()
}
