//! Ordering buffer for remote connectivity candidates.

use std::collections::VecDeque;

use crate::model::IceCandidate;

/// Holds remote candidates until both the local and the remote description
/// exist on the transport.
///
/// Candidates are released in arrival order and never dropped. Once both
/// descriptions are in place, new candidates pass straight through.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    local_ready: bool,
    remote_ready: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.local_ready && self.remote_ready
    }

    /// Queues `candidate`, or hands it back if it can be applied right away.
    pub fn push(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.is_ready() && self.pending.is_empty() {
            return Some(candidate);
        }
        self.pending.push_back(candidate);
        None
    }

    pub fn mark_local_ready(&mut self) {
        self.local_ready = true;
    }

    pub fn mark_remote_ready(&mut self) {
        self.remote_ready = true;
    }

    /// Takes every queued candidate in arrival order, if both descriptions
    /// exist. Returns an empty list otherwise.
    pub fn drain_ready(&mut self) -> Vec<IceCandidate> {
        if !self.is_ready() {
            return Vec::new();
        }
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
