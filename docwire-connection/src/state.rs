//! Connection lifecycle state.
//!
//! `Unopened -> Opening -> Open -> Closed`. Closed is absorbing and can be
//! entered from any state.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Unopened = 0,
    Opening = 1,
    Open = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Unopened,
            1 => ConnectionState::Opening,
            2 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// A [`ConnectionState`] with atomic transitions.
#[derive(Debug)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Unopened as u8))
    }

    pub(crate) fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `from` to `to`. On failure returns the actual state.
    pub(crate) fn transition(
        &self,
        from: ConnectionState,
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Enter `Closed`, returning the previous state.
    ///
    /// Exactly one caller observes a previous state other than `Closed`.
    pub(crate) fn close(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(ConnectionState::Closed as u8, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lifecycle() {
        let state = AtomicState::new();
        assert_eq!(state.load(), ConnectionState::Unopened);
        state
            .transition(ConnectionState::Unopened, ConnectionState::Opening)
            .unwrap();
        state
            .transition(ConnectionState::Opening, ConnectionState::Open)
            .unwrap();
        assert_eq!(state.load(), ConnectionState::Open);
        assert_eq!(state.close(), ConnectionState::Open);
        assert_eq!(state.close(), ConnectionState::Closed);
    }

    #[test]
    fn test_second_open_rejected() {
        let state = AtomicState::new();
        state
            .transition(ConnectionState::Unopened, ConnectionState::Opening)
            .unwrap();
        assert_eq!(
            state.transition(ConnectionState::Unopened, ConnectionState::Opening),
            Err(ConnectionState::Opening)
        );
    }

    #[test]
    fn test_closed_is_absorbing() {
        let state = AtomicState::new();
        state.close();
        assert_eq!(
            state.transition(ConnectionState::Unopened, ConnectionState::Opening),
            Err(ConnectionState::Closed)
        );
    }

    #[test]
    fn test_concurrent_close_has_one_winner() {
        let state = Arc::new(AtomicState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || state.close() != ConnectionState::Closed)
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
