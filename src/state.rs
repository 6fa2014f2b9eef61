//! The partition consumer's lifecycle state, stored atomically so every actor can read
//! and gate on it without a lock (`spec.md` §3, "PartitionConsumer state").
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// One of the four lifecycle states a partition consumer passes through.
///
/// Transitions: `Initializing -> Ready` on first successful subscribe; `Ready ->
/// Closing` on close or unsubscribe; `Closing -> Closed` on completion. There is no path
/// back to an earlier state, except the explicit rollback `Closing -> Ready` performed by
/// a failed `Unsubscribe` (`spec.md` §4.5).
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum ConsumerState {
    Initializing = 0,
    Ready = 1,
    Closing = 2,
    Closed = 3,
}

impl ConsumerState {
    fn from_u8(value: u8) -> ConsumerState {
        match value {
            0 => ConsumerState::Initializing,
            1 => ConsumerState::Ready,
            2 => ConsumerState::Closing,
            _ => ConsumerState::Closed,
        }
    }
}

/// An [`ConsumerState`] behind an [`AtomicU8`].
pub struct AtomicConsumerState(AtomicU8);

impl AtomicConsumerState {
    pub fn new(initial: ConsumerState) -> AtomicConsumerState {
        AtomicConsumerState(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> ConsumerState {
        ConsumerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConsumerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition from `expected` to `next`, returning `true` if this call performed
    /// the transition.
    pub fn compare_transition(&self, expected: ConsumerState, next: ConsumerState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `true` if the consumer is closing or already closed; gates every externally
    /// triggered operation per `spec.md` §4.5.
    pub fn is_closing_or_closed(&self) -> bool {
        matches!(self.load(), ConsumerState::Closing | ConsumerState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_init_to_ready() {
        let state = AtomicConsumerState::new(ConsumerState::Initializing);
        assert!(state.compare_transition(ConsumerState::Initializing, ConsumerState::Ready));
        assert_eq!(state.load(), ConsumerState::Ready);
    }

    #[test]
    fn compare_transition_fails_on_mismatch() {
        let state = AtomicConsumerState::new(ConsumerState::Ready);
        assert!(!state.compare_transition(ConsumerState::Initializing, ConsumerState::Ready));
        assert_eq!(state.load(), ConsumerState::Ready);
    }

    #[test]
    fn closing_and_closed_report_closing_or_closed() {
        let state = AtomicConsumerState::new(ConsumerState::Closing);
        assert!(state.is_closing_or_closed());
        state.store(ConsumerState::Closed);
        assert!(state.is_closing_or_closed());
    }

    #[test]
    fn ready_does_not_report_closing_or_closed() {
        let state = AtomicConsumerState::new(ConsumerState::Ready);
        assert!(!state.is_closing_or_closed());
    }
}
