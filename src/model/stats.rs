//! Running throughput statistics for the data channel.

use std::fmt;
use std::time::{Duration, Instant};

/// Smallest inter-arrival interval used when computing the instantaneous
/// rate. Frames arriving closer together than this are treated as this far
/// apart.
pub const MIN_RATE_INTERVAL: Duration = Duration::from_millis(1);

/// Counters for binary frames received on one data channel lifetime.
///
/// Created when the channel opens. All counters only grow; the instantaneous
/// rate is recomputed from the inter-arrival interval of every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub total_bytes_received: u64,
    pub total_frames_received: u64,
    pub lost_frames: u64,
    pub instantaneous_rate_bytes_per_sec: f64,
    pub last_frame_bytes: u64,
    pub window_start: Instant,
    pub last_update: Instant,
}

impl ChannelStats {
    pub fn new(now: Instant) -> Self {
        Self {
            total_bytes_received: 0,
            total_frames_received: 0,
            lost_frames: 0,
            instantaneous_rate_bytes_per_sec: 0.0,
            last_frame_bytes: 0,
            window_start: now,
            last_update: now,
        }
    }

    pub(crate) fn record_frame(&mut self, byte_len: usize, now: Instant, lost: bool) {
        let byte_len = byte_len as u64;
        let elapsed = now
            .saturating_duration_since(self.last_update)
            .max(MIN_RATE_INTERVAL);

        self.total_frames_received += 1;
        self.total_bytes_received += byte_len;
        self.last_frame_bytes = byte_len;
        self.instantaneous_rate_bytes_per_sec = byte_len as f64 / elapsed.as_secs_f64();
        self.last_update = now;

        if lost {
            self.lost_frames += 1;
        }
    }

    /// Estimated loss as a percentage of frames received.
    pub fn loss_percent(&self) -> f64 {
        if self.total_frames_received == 0 {
            return 0.0;
        }
        self.lost_frames as f64 / self.total_frames_received as f64 * 100.0
    }

    /// Average rate since the channel opened.
    pub fn average_rate_bytes_per_sec(&self) -> f64 {
        let window = self.last_update.saturating_duration_since(self.window_start);
        if window.is_zero() {
            return 0.0;
        }
        self.total_bytes_received as f64 / window.as_secs_f64()
    }
}

impl fmt::Display for ChannelStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames: {}, size: {:.2} KB, total: {:.2} MB, rate: {:.2} KB/s, lost: {} ({:.2}%)",
            self.total_frames_received,
            self.last_frame_bytes as f64 / 1024.0,
            self.total_bytes_received as f64 / (1024.0 * 1024.0),
            self.instantaneous_rate_bytes_per_sec / 1024.0,
            self.lost_frames,
            self.loss_percent(),
        )
    }
}
