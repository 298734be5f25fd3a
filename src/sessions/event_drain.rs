use std::collections::vec_deque::Drain;
use std::iter::FusedIterator;

use crate::NetplayEvent;

/// A zero-allocation opaque iterator that drains events from a session.
///
/// This type wraps the internal event queue drain, providing a stable public API
/// that doesn't expose `std::collections::vec_deque::Drain` directly. It implements
/// [`Iterator`], [`DoubleEndedIterator`], [`ExactSizeIterator`], and [`FusedIterator`].
///
/// Obtain an `EventDrain` by calling [`NetplaySession::events()`] or
/// [`NetplayContext::events()`].
///
/// # Examples
///
/// ```ignore
/// for event in session.events() {
///     match event {
///         NetplayEvent::DesyncDetected { frame } => {
///             tracing::warn!("desync flag changed at frame {frame}");
///         }
///         _ => { /* handle other events */ }
///     }
/// }
/// ```
///
/// [`NetplaySession::events()`]: crate::NetplaySession::events
/// [`NetplayContext::events()`]: crate::NetplayContext::events
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct EventDrain<'a> {
    inner: EventDrainInner<'a>,
}

enum EventDrainInner<'a> {
    Queue(Drain<'a, NetplayEvent>),
    Empty,
}

impl<'a> EventDrain<'a> {
    pub(crate) fn from_drain(drain: Drain<'a, NetplayEvent>) -> Self {
        Self {
            inner: EventDrainInner::Queue(drain),
        }
    }

    /// A drain with nothing in it, handed out while no session is live.
    pub(crate) fn empty() -> Self {
        Self {
            inner: EventDrainInner::Empty,
        }
    }
}

impl Iterator for EventDrain<'_> {
    type Item = NetplayEvent;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EventDrainInner::Queue(drain) => drain.next(),
            EventDrainInner::Empty => None,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.inner {
            EventDrainInner::Queue(drain) => drain.size_hint(),
            EventDrainInner::Empty => (0, Some(0)),
        }
    }
}

impl DoubleEndedIterator for EventDrain<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EventDrainInner::Queue(drain) => drain.next_back(),
            EventDrainInner::Empty => None,
        }
    }
}

impl ExactSizeIterator for EventDrain<'_> {
    fn len(&self) -> usize {
        match &self.inner {
            EventDrainInner::Queue(drain) => drain.len(),
            EventDrainInner::Empty => 0,
        }
    }
}

impl FusedIterator for EventDrain<'_> {}

impl std::fmt::Debug for EventDrain<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrain")
            .field("remaining", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::iter_with_drain
)]
mod tests {
    use super::*;
    use crate::Slot;
    use std::collections::VecDeque;

    fn make_event(frame: u32) -> NetplayEvent {
        NetplayEvent::DesyncDetected { frame }
    }

    #[test]
    fn empty_drain_returns_none() {
        let mut drain = EventDrain::empty();
        assert!(drain.next().is_none());
        assert_eq!(drain.len(), 0);
    }

    #[test]
    fn drain_from_queue_yields_all_events_in_order() {
        let mut queue: VecDeque<NetplayEvent> = VecDeque::new();
        queue.push_back(make_event(600));
        queue.push_back(NetplayEvent::PlayerDisconnected { slot: Slot::P3 });
        let events: Vec<_> = EventDrain::from_drain(queue.drain(..)).collect();
        assert_eq!(
            events,
            vec![
                make_event(600),
                NetplayEvent::PlayerDisconnected { slot: Slot::P3 }
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_is_fused() {
        let mut queue: VecDeque<NetplayEvent> = VecDeque::new();
        queue.push_back(make_event(1));
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert!(drain.next().is_some());
        assert!(drain.next().is_none());
        assert!(drain.next().is_none());
    }

    #[test]
    fn double_ended_iteration() {
        let mut queue: VecDeque<NetplayEvent> = (1..=3).map(make_event).collect();
        let mut drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(drain.next_back(), Some(make_event(3)));
        assert_eq!(drain.next(), Some(make_event(1)));
        assert_eq!(drain.len(), 1);
        assert_eq!(drain.next_back(), Some(make_event(2)));
        assert!(drain.next().is_none());
    }

    #[test]
    fn debug_shows_remaining() {
        let mut queue: VecDeque<NetplayEvent> = (0..2).map(make_event).collect();
        let drain = EventDrain::from_drain(queue.drain(..));
        assert_eq!(format!("{drain:?}"), "EventDrain { remaining: 2 }");
    }
}
