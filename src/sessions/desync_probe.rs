//! Checksum cadence and relay status tracking.

use smallvec::SmallVec;

use crate::{Slot, MAX_PLAYERS};

/// Decides on which emulated frames a checksum datagram is due.
///
/// The frame counter starts at 0, so the very first frame is checksummed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesyncProbe {
    frame_counter: u32,
    interval: u32,
}

impl DesyncProbe {
    /// Creates a probe firing every `interval` frames. An interval of 0 is treated as 1.
    #[must_use]
    pub fn new(interval: u32) -> Self {
        Self {
            frame_counter: 0,
            interval: interval.max(1),
        }
    }

    /// Advances one frame. Returns the frame number if a checksum is due for it.
    pub fn tick(&mut self) -> Option<u32> {
        let frame = self.frame_counter;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        (frame % self.interval == 0).then_some(frame)
    }

    /// Frames ticked so far.
    #[must_use]
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }
}

/// A bit of the relay's status mask that flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusChange {
    /// Bit 0: peers' checksums diverged or converged again.
    Desync,
    /// Bits 1..=4: a player's connection flag changed.
    PlayerDisconnected(Slot),
}

/// Remembers the last status mask seen and reports flips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusTracker {
    last: u8,
}

impl StatusTracker {
    /// Creates a tracker with every bit clear.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `mask` and returns one change per flipped bit, lowest bit first.
    ///
    /// Bits above 4 are stored but never reported.
    pub fn observe(&mut self, mask: u8) -> SmallVec<[StatusChange; MAX_PLAYERS + 1]> {
        let flipped = self.last ^ mask;
        self.last = mask;
        let mut changes = SmallVec::new();
        if flipped & 1 != 0 {
            changes.push(StatusChange::Desync);
        }
        for bit in 1..=MAX_PLAYERS {
            if flipped & (1 << bit) != 0 {
                if let Some(slot) = Slot::new(bit - 1) {
                    changes.push(StatusChange::PlayerDisconnected(slot));
                }
            }
        }
        changes
    }

    /// The last mask observed.
    #[must_use]
    pub fn mask(&self) -> u8 {
        self.last
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_fires_on_multiples_of_interval() {
        let mut probe = DesyncProbe::new(600);
        let fired: Vec<u32> = (0..1300).filter_map(|_| probe.tick()).collect();
        assert_eq!(fired, vec![0, 600, 1200]);
        assert_eq!(probe.frame_counter(), 1300);
    }

    #[test]
    fn test_probe_zero_interval_fires_every_frame() {
        let mut probe = DesyncProbe::new(0);
        assert_eq!(probe.tick(), Some(0));
        assert_eq!(probe.tick(), Some(1));
    }

    #[test]
    fn test_tracker_reports_each_flip_once() {
        let mut tracker = StatusTracker::new();
        assert_eq!(
            tracker.observe(0b0000_0101).as_slice(),
            &[
                StatusChange::Desync,
                StatusChange::PlayerDisconnected(Slot::P2)
            ]
        );
        assert!(tracker.observe(0b0000_0101).is_empty());
        assert_eq!(
            tracker.observe(0b0000_0100).as_slice(),
            &[StatusChange::Desync]
        );
        assert_eq!(tracker.mask(), 0b100);
    }

    #[test]
    fn test_tracker_maps_bits_to_slots() {
        let mut tracker = StatusTracker::new();
        let changes = tracker.observe(0b0001_1110);
        assert_eq!(
            changes.as_slice(),
            &[
                StatusChange::PlayerDisconnected(Slot::P1),
                StatusChange::PlayerDisconnected(Slot::P2),
                StatusChange::PlayerDisconnected(Slot::P3),
                StatusChange::PlayerDisconnected(Slot::P4),
            ]
        );
    }

    #[test]
    fn test_tracker_ignores_high_bits() {
        let mut tracker = StatusTracker::new();
        assert!(tracker.observe(0b1110_0000).is_empty());
        assert_eq!(tracker.mask(), 0b1110_0000);
    }
}
