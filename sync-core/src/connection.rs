//! Push-channel lifecycle: the state machine and reconnect backoff.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }

    /// The push channel is not delivering and is not about to be torn down.
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Open,
    Close,
    Error,
    HeartbeatTimeout,
    BackoffElapsed,
    Shutdown,
}

/// Transition table for one push-channel connection. `Closed` is terminal.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> SyncResult<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;
        let next = match (self.state, event) {
            (S::Closed, _) => None,
            (_, E::Shutdown) => Some(S::Closed),
            (S::Disconnected, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::Open) => Some(S::Connected),
            (S::Connecting, E::Close | E::Error) => Some(S::Reconnecting),
            (S::Connected, E::Close | E::Error | E::HeartbeatTimeout) => Some(S::Reconnecting),
            (S::Reconnecting, E::BackoffElapsed) => Some(S::Connecting),
            _ => None,
        };
        match next {
            Some(s) => {
                self.state = s;
                Ok(s)
            }
            None => Err(SyncError::InvalidTransition {
                from: self.state,
                event,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub is_connected: bool,
    pub status: ConnectionState,
    pub latency_ms: u64,
}

/// Exponential reconnect delay with a floor, a cap and bounded jitter.
///
/// Jitter is a fraction of the current base strictly below 1.0, and the
/// result is clamped to `cap`, so successive delays never decrease: the next
/// base is double the previous one, which always exceeds base * (1 + jitter).
#[derive(Debug, Clone)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    jitter_ratio: f64,
    base: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration, jitter_ratio: f64) -> Self {
        let floor = floor.max(Duration::from_millis(1));
        let cap = cap.max(floor);
        Self {
            floor,
            cap,
            jitter_ratio: jitter_ratio.clamp(0.0, 0.99),
            base: floor,
        }
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay to wait before the next attempt; advances the base.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let jitter = if self.jitter_ratio > 0.0 {
            rng.gen_range(0.0..=self.jitter_ratio)
        } else {
            0.0
        };
        let delay = self.base.mul_f64(1.0 + jitter).min(self.cap);
        self.base = (self.base * 2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.base = self.floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn happy_path_and_reconnect_cycle() {
        let mut sm = ConnectionStateMachine::new();
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        assert_eq!(sm.apply(ConnectionEvent::Connect).unwrap(), ConnectionState::Connecting);
        assert_eq!(sm.apply(ConnectionEvent::Open).unwrap(), ConnectionState::Connected);
        assert_eq!(
            sm.apply(ConnectionEvent::HeartbeatTimeout).unwrap(),
            ConnectionState::Reconnecting
        );
        assert_eq!(
            sm.apply(ConnectionEvent::BackoffElapsed).unwrap(),
            ConnectionState::Connecting
        );
        assert_eq!(sm.apply(ConnectionEvent::Error).unwrap(), ConnectionState::Reconnecting);
    }

    #[test]
    fn undefined_edges_are_rejected_without_changing_state() {
        let mut sm = ConnectionStateMachine::new();
        assert!(sm.apply(ConnectionEvent::Open).is_err());
        assert_eq!(sm.state(), ConnectionState::Disconnected);
        sm.apply(ConnectionEvent::Connect).unwrap();
        assert!(sm.apply(ConnectionEvent::BackoffElapsed).is_err());
        assert_eq!(sm.state(), ConnectionState::Connecting);
    }

    #[test]
    fn closed_is_terminal() {
        let mut sm = ConnectionStateMachine::new();
        sm.apply(ConnectionEvent::Connect).unwrap();
        assert_eq!(sm.apply(ConnectionEvent::Shutdown).unwrap(), ConnectionState::Closed);
        for ev in [
            ConnectionEvent::Connect,
            ConnectionEvent::Open,
            ConnectionEvent::BackoffElapsed,
            ConnectionEvent::Shutdown,
        ] {
            assert!(sm.apply(ev).is_err());
            assert_eq!(sm.state(), ConnectionState::Closed);
        }
    }

    #[test]
    fn arbitrary_event_sequences_stay_in_defined_states() {
        let events = [
            ConnectionEvent::Connect,
            ConnectionEvent::Open,
            ConnectionEvent::Close,
            ConnectionEvent::Error,
            ConnectionEvent::HeartbeatTimeout,
            ConnectionEvent::BackoffElapsed,
            ConnectionEvent::Shutdown,
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut sm = ConnectionStateMachine::new();
            let mut closed = false;
            for _ in 0..50 {
                let ev = events[rng.gen_range(0..events.len())];
                let _ = sm.apply(ev);
                if closed {
                    assert_eq!(sm.state(), ConnectionState::Closed);
                }
                closed = sm.state() == ConnectionState::Closed;
            }
        }
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let mut rng = StdRng::seed_from_u64(42);
        for jitter in [0.0, 0.3, 0.99, 5.0] {
            let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), jitter);
            let mut prev = Duration::ZERO;
            for _ in 0..20 {
                let d = b.next_delay(&mut rng);
                assert!(d >= prev, "{:?} < {:?} (jitter {})", d, prev, jitter);
                assert!(d <= Duration::from_secs(30));
                assert!(d >= Duration::from_secs(1));
                prev = d;
            }
            assert_eq!(prev, Duration::from_secs(30));
        }
    }

    #[test]
    fn backoff_resets_to_floor() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        b.next_delay(&mut rng);
        b.next_delay(&mut rng);
        assert_eq!(b.next_delay(&mut rng), Duration::from_secs(4));
        b.reset();
        assert_eq!(b.next_delay(&mut rng), Duration::from_secs(1));
    }
}
