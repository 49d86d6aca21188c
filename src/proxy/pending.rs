use std::collections::VecDeque;

use bytes::Bytes;

use crate::codec::RequestFrame;

/// Upstream link state as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialState {
    Idle,
    Dialing,
    Connected,
    Failed,
}

/// One unit waiting for the upstream link
#[derive(Debug)]
pub enum PendingUnit {
    /// A decoded request frame that has already been through the intercept chain
    Frame(RequestFrame),
    /// Raw tunnel bytes
    Raw(Bytes),
}

/// FIFO of units produced while the upstream dial is still in flight.
///
/// Owned by a single session task, so the queue and the dial flag are only ever
/// touched from that task's select loop.
#[derive(Debug)]
pub struct PendingFrameQueue {
    units: VecDeque<PendingUnit>,
    state: DialState,
}

impl Default for PendingFrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingFrameQueue {
    pub fn new() -> Self {
        Self {
            units: VecDeque::new(),
            state: DialState::Idle,
        }
    }

    pub fn state(&self) -> DialState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == DialState::Connected
    }

    pub fn dialing(&mut self) {
        self.state = DialState::Dialing;
    }

    pub fn push(&mut self, unit: PendingUnit) {
        self.units.push_back(unit);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Mark the link established and hand back everything queued, oldest first.
    pub fn connected(&mut self) -> Vec<PendingUnit> {
        self.state = DialState::Connected;
        self.units.drain(..).collect()
    }

    /// Mark the dial failed and release everything queued. Returns how many units were dropped.
    pub fn failed(&mut self) -> usize {
        self.state = DialState::Failed;
        let dropped = self.units.len();
        self.units.clear();
        dropped
    }

    /// Forget the current link so the next unit dials again.
    pub fn reset(&mut self) {
        self.state = DialState::Idle;
        self.units.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tag: &'static [u8]) -> PendingUnit {
        PendingUnit::Raw(Bytes::from_static(tag))
    }

    #[test]
    fn test_flush_preserves_order() {
        let mut queue = PendingFrameQueue::new();
        queue.dialing();
        queue.push(raw(b"one"));
        queue.push(raw(b"two"));
        queue.push(raw(b"three"));

        let flushed: Vec<_> = queue
            .connected()
            .into_iter()
            .map(|unit| match unit {
                PendingUnit::Raw(bytes) => bytes,
                PendingUnit::Frame(_) => panic!("unexpected frame"),
            })
            .collect();
        assert_eq!(flushed, vec![&b"one"[..], &b"two"[..], &b"three"[..]]);
        assert!(queue.is_connected());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failure_releases_units() {
        let mut queue = PendingFrameQueue::new();
        queue.dialing();
        queue.push(raw(b"lost"));
        assert_eq!(queue.failed(), 1);
        assert_eq!(queue.state(), DialState::Failed);
        assert!(queue.is_empty());
    }
}
