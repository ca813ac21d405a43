//! Outlets for what the client observes: human-readable status lines and
//! received frames.

use std::path::PathBuf;

use tracing::{info, trace, warn};

/// Accepts status and log lines for display.
pub trait StatusSink: Send {
    fn status(&mut self, line: &str);
}

impl<F> StatusSink for F
where
    F: FnMut(&str) + Send,
{
    fn status(&mut self, line: &str) {
        self(line)
    }
}

/// Writes status lines to the `status` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn status(&mut self, line: &str) {
        info!(target: "status", "{}", line);
    }
}

/// Accepts raw binary frames for display. Frames are not decoded.
pub trait FrameSink: Send {
    fn render(&mut self, frame: &[u8]);
}

impl<F> FrameSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn render(&mut self, frame: &[u8]) {
        self(frame)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFrames;

impl FrameSink for DiscardFrames {
    fn render(&mut self, frame: &[u8]) {
        trace!("Discarding {} byte frame", frame.len());
    }
}

/// Keeps the most recent frame on disk as `latest.jpg`.
#[derive(Debug)]
pub struct LatestFrameFile {
    path: PathBuf,
    failed: bool,
}

impl LatestFrameFile {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join("latest.jpg"),
            failed: false,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl FrameSink for LatestFrameFile {
    fn render(&mut self, frame: &[u8]) {
        match std::fs::write(&self.path, frame) {
            Ok(()) => self.failed = false,
            // Warn once per run of failures.
            Err(e) if !self.failed => {
                warn!("Could not write frame to {}: {}", self.path.display(), e);
                self.failed = true;
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_frame_overwrites_previous() {
        let dir = std::env::temp_dir().join(format!("relay-rtc-frames-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut sink = LatestFrameFile::new(&dir);
        sink.render(&[0xff, 0xd8, 1]);
        sink.render(&[0xff, 0xd8, 2, 3]);
        assert_eq!(std::fs::read(sink.path()).unwrap(), vec![0xff, 0xd8, 2, 3]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn closures_are_sinks() {
        let mut lines = Vec::new();
        {
            let mut sink = |line: &str| lines.push(line.to_string());
            StatusSink::status(&mut sink, "hello");
        }
        assert_eq!(lines, ["hello"]);
    }
}
