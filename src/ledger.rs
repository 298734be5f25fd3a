//! Per-slot buffer of relay-delivered input events.
//!
//! Each slot keeps a sequence-keyed map and the next sequence it will consume.
//! Events may arrive in any order, more than once, or long after they were
//! needed; the ledger keeps each sequence at most once and never stores one
//! that is already behind the counter.

use std::collections::BTreeMap;

use crate::telemetry::{InvariantChecker, InvariantViolation};
use crate::{NetplayError, PeripheralKind, Sequence, Slot, MAX_PLAYERS};

/// One relay-issued input for one slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct InputEvent {
    /// Position of this event in the slot's input stream.
    pub sequence: Sequence,
    /// Button word as the controller reported it.
    pub buttons: u32,
    /// Peripheral active on the controller for this poll.
    pub peripheral: PeripheralKind,
}

/// What [`EventLedger::insert`] did with an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InsertOutcome {
    /// Stored for later consumption.
    Inserted,
    /// The sequence was already buffered; the existing event is kept.
    Duplicate,
    /// The sequence is behind the slot counter and was dropped.
    Stale,
}

#[derive(Debug, Default, Clone)]
struct SlotLedger {
    next_sequence: Sequence,
    // keyed by raw sequence value; ordering across wraparound is not relied on
    events: BTreeMap<u32, InputEvent>,
}

/// Buffered events for all [`MAX_PLAYERS`] slots.
#[derive(Debug, Default, Clone)]
pub struct EventLedger {
    slots: [SlotLedger; MAX_PLAYERS],
}

impl EventLedger {
    /// Creates an empty ledger with every counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers an event to a slot.
    ///
    /// No-op unless the sequence is new and not older than the slot counter.
    pub fn insert(
        &mut self,
        slot: Slot,
        sequence: Sequence,
        buttons: u32,
        peripheral: PeripheralKind,
    ) -> InsertOutcome {
        let ledger = &mut self.slots[slot.index()];
        if sequence.is_older_than(ledger.next_sequence) {
            return InsertOutcome::Stale;
        }
        if ledger.events.contains_key(&sequence.as_u32()) {
            return InsertOutcome::Duplicate;
        }
        ledger.events.insert(
            sequence.as_u32(),
            InputEvent {
                sequence,
                buttons,
                peripheral,
            },
        );
        InsertOutcome::Inserted
    }

    /// Returns `true` if the slot holds an event with this sequence.
    #[must_use]
    pub fn contains(&self, slot: Slot, sequence: Sequence) -> bool {
        self.slots[slot.index()]
            .events
            .contains_key(&sequence.as_u32())
    }

    /// Removes the event matching the slot counter and advances the counter by one.
    ///
    /// # Errors
    ///
    /// [`NetplayError::InternalError`] if that event is not buffered. Callers check
    /// [`contains`](Self::contains) first.
    pub fn take_oldest_matching(&mut self, slot: Slot) -> Result<InputEvent, NetplayError> {
        let ledger = &mut self.slots[slot.index()];
        let event = ledger
            .events
            .remove(&ledger.next_sequence.as_u32())
            .ok_or_else(|| NetplayError::InternalError {
                context: format!(
                    "slot {} has no event for sequence {}",
                    slot, ledger.next_sequence
                ),
            })?;
        ledger.next_sequence = ledger.next_sequence.next();
        Ok(event)
    }

    /// Number of buffered events for the slot, saturating at 255.
    #[must_use]
    pub fn pending_count(&self, slot: Slot) -> u8 {
        u8::try_from(self.slots[slot.index()].events.len()).unwrap_or(u8::MAX)
    }

    /// The sequence the slot will consume next.
    #[must_use]
    pub fn next_sequence(&self, slot: Slot) -> Sequence {
        self.slots[slot.index()].next_sequence
    }

    /// Drops every buffered event. Counters are kept.
    pub fn clear(&mut self) {
        for ledger in &mut self.slots {
            ledger.events.clear();
        }
    }
}

impl InvariantChecker for EventLedger {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for (index, ledger) in self.slots.iter().enumerate() {
            for (&key, event) in &ledger.events {
                if key != event.sequence.as_u32() {
                    return Err(InvariantViolation::new(
                        "EventLedger",
                        "event stored under a foreign sequence",
                    )
                    .with_details(format!(
                        "slot={index}, key={key}, sequence={}",
                        event.sequence
                    )));
                }
                if event.sequence.is_older_than(ledger.next_sequence) {
                    return Err(InvariantViolation::new(
                        "EventLedger",
                        "event retained behind the slot counter",
                    )
                    .with_details(format!(
                        "slot={index}, sequence={}, counter={}",
                        event.sequence, ledger.next_sequence
                    )));
                }
            }
        }
        Ok(())
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

    fn insert(ledger: &mut EventLedger, slot: Slot, seq: u32, buttons: u32) -> InsertOutcome {
        ledger.insert(slot, Sequence::new(seq), buttons, PeripheralKind::None)
    }

    #[test]
    fn test_insert_then_take_advances_counter() {
        let mut ledger = EventLedger::new();
        assert_eq!(insert(&mut ledger, Slot::P1, 0, 0x80), InsertOutcome::Inserted);
        assert!(ledger.contains(Slot::P1, Sequence::ZERO));

        let event = ledger.take_oldest_matching(Slot::P1).unwrap();
        assert_eq!(event.buttons, 0x80);
        assert_eq!(ledger.next_sequence(Slot::P1), Sequence::new(1));
        assert_eq!(ledger.pending_count(Slot::P1), 0);
    }

    #[test]
    fn test_duplicate_keeps_first_event() {
        let mut ledger = EventLedger::new();
        insert(&mut ledger, Slot::P2, 3, 1);
        assert_eq!(insert(&mut ledger, Slot::P2, 3, 2), InsertOutcome::Duplicate);
        assert_eq!(ledger.pending_count(Slot::P2), 1);
    }

    #[test]
    fn test_stale_event_is_dropped() {
        let mut ledger = EventLedger::new();
        insert(&mut ledger, Slot::P1, 0, 0);
        ledger.take_oldest_matching(Slot::P1).unwrap();
        assert_eq!(insert(&mut ledger, Slot::P1, 0, 0), InsertOutcome::Stale);
        assert!(!ledger.contains(Slot::P1, Sequence::ZERO));
    }

    #[test]
    fn test_take_without_match_is_an_error() {
        let mut ledger = EventLedger::new();
        insert(&mut ledger, Slot::P1, 1, 0);
        assert!(matches!(
            ledger.take_oldest_matching(Slot::P1),
            Err(NetplayError::InternalError { .. })
        ));
        assert_eq!(ledger.next_sequence(Slot::P1), Sequence::ZERO);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut ledger = EventLedger::new();
        insert(&mut ledger, Slot::P4, 2, 20);
        insert(&mut ledger, Slot::P4, 0, 0);
        insert(&mut ledger, Slot::P4, 1, 10);
        let buttons: Vec<u32> = (0..3)
            .map(|_| ledger.take_oldest_matching(Slot::P4).unwrap().buttons)
            .collect();
        assert_eq!(buttons, vec![0, 10, 20]);
    }

    #[test]
    fn test_slots_are_independent() {
        let mut ledger = EventLedger::new();
        insert(&mut ledger, Slot::P1, 0, 1);
        assert!(!ledger.contains(Slot::P2, Sequence::ZERO));
        assert_eq!(ledger.pending_count(Slot::P2), 0);
    }

    #[test]
    fn test_pending_count_saturates() {
        let mut ledger = EventLedger::new();
        for seq in 0..300 {
            insert(&mut ledger, Slot::P3, seq, 0);
        }
        assert_eq!(ledger.pending_count(Slot::P3), 255);
    }

    #[test]
    fn test_wraparound_consumption() {
        let mut ledger = EventLedger::new();
        ledger.slots[0].next_sequence = Sequence::new(u32::MAX);
        insert(&mut ledger, Slot::P1, u32::MAX, 1);
        insert(&mut ledger, Slot::P1, 0, 2);
        assert_eq!(ledger.take_oldest_matching(Slot::P1).unwrap().buttons, 1);
        assert_eq!(ledger.next_sequence(Slot::P1), Sequence::ZERO);
        assert_eq!(ledger.take_oldest_matching(Slot::P1).unwrap().buttons, 2);
        assert_eq!(
            insert(&mut ledger, Slot::P1, u32::MAX, 3),
            InsertOutcome::Stale
        );
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn test_clear_keeps_counters() {
        let mut ledger = EventLedger::new();
        insert(&mut ledger, Slot::P1, 0, 1);
        ledger.take_oldest_matching(Slot::P1).unwrap();
        insert(&mut ledger, Slot::P1, 1, 1);
        ledger.clear();
        assert_eq!(ledger.pending_count(Slot::P1), 0);
        assert_eq!(ledger.next_sequence(Slot::P1), Sequence::new(1));
    }

    #[test]
    fn test_invariant_checker_flags_stale_entries() {
        let mut ledger = EventLedger::new();
        insert(&mut ledger, Slot::P2, 0, 0);
        ledger.slots[1].next_sequence = Sequence::new(5);
        let violation = ledger.check_invariants().unwrap_err();
        assert!(violation.invariant.contains("behind the slot counter"));
    }
}
