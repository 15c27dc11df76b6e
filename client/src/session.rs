//! Connection session state machine
//!
//! One explicit machine owns every reconnect decision: heartbeat liveness,
//! retry budget, backoff choice and cancellation of superseded attempts.
//! The network loop asks it what to do; it never touches sockets itself,
//! which keeps every transition unit-testable.
//!
//! State graph:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |             |
//!                     v             v
//!                  Failed <- Reconnecting -> Connecting
//! ```

use log::{info, warn};
use rand::Rng;
use shared::{HEARTBEAT_MISS_LIMIT, MAX_RECONNECT_ATTEMPTS};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted. Terminal; surfaced to the user.
    Failed,
}

/// Why the link went down. Abrupt loss retries more aggressively because
/// state divergence risk is higher than after a polite server close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    Abrupt,
    GracefulClose,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub max_attempts: u32,
    /// Backoff base after abrupt transport loss.
    pub abrupt_backoff: Duration,
    /// Backoff base after a graceful server-initiated close.
    pub graceful_backoff: Duration,
    pub heartbeat_miss_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            abrupt_backoff: Duration::from_millis(250),
            graceful_backoff: Duration::from_secs(1),
            heartbeat_miss_limit: HEARTBEAT_MISS_LIMIT,
        }
    }
}

/// Generates the opaque client-side session token, stable across
/// reconnects within one logical play session.
fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

pub struct ConnectionSession {
    config: SessionConfig,
    state: SessionState,
    session_id: String,
    /// Connect attempts since the last successful connection.
    attempts_made: u32,
    /// Incremented per connect attempt; results tagged with an older
    /// generation belong to a superseded attempt and are ignored.
    generation: u64,
    missed_heartbeats: u32,
    last_cause: DisconnectCause,
}

impl ConnectionSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            session_id: generate_session_id(),
            attempts_made: 0,
            generation: 0,
            missed_heartbeats: 0,
            last_cause: DisconnectCause::Abrupt,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token sent with every join so the server can correlate this
    /// connection with its predecessor after a reconnect.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_failed(&self) -> bool {
        self.state == SessionState::Failed
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Starts a connect attempt and returns its generation token. Any
    /// still-in-flight previous attempt is superseded: its eventual result
    /// will carry a stale generation and be dropped.
    pub fn begin_connect(&mut self) -> u64 {
        if self.state == SessionState::Failed {
            warn!("Connect requested on failed session");
            return self.generation;
        }
        self.generation += 1;
        self.state = match self.state {
            SessionState::Reconnecting => SessionState::Reconnecting,
            _ => SessionState::Connecting,
        };
        self.generation
    }

    /// Reports a successful connection for the attempt `generation`.
    /// Returns false when the attempt was superseded or the session has
    /// already failed; the caller must then discard the new socket state.
    pub fn on_connected(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.state == SessionState::Failed {
            info!("Ignoring completion of superseded connect attempt");
            return false;
        }
        self.state = SessionState::Connected;
        self.attempts_made = 0;
        self.missed_heartbeats = 0;
        true
    }

    pub fn on_heartbeat_ack(&mut self) {
        self.missed_heartbeats = 0;
    }

    /// Records a missed heartbeat. Returns true when consecutive misses
    /// reached the limit and the session moved to Reconnecting.
    pub fn on_heartbeat_miss(&mut self) -> bool {
        if self.state != SessionState::Connected {
            return false;
        }
        self.missed_heartbeats += 1;
        if self.missed_heartbeats >= self.config.heartbeat_miss_limit {
            warn!(
                "{} consecutive heartbeats missed; reconnecting",
                self.missed_heartbeats
            );
            self.state = SessionState::Reconnecting;
            self.last_cause = DisconnectCause::Abrupt;
            true
        } else {
            false
        }
    }

    /// Explicit disconnect notification from the transport or server.
    pub fn on_disconnected(&mut self, cause: DisconnectCause) {
        if self.state == SessionState::Failed {
            return;
        }
        self.last_cause = cause;
        self.state = SessionState::Reconnecting;
    }

    /// Backoff before the next reconnect attempt, or `None` once the retry
    /// budget is exhausted (the session is then terminally Failed).
    /// Exponential per attempt; the base depends on the disconnect cause.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.state == SessionState::Failed {
            return None;
        }
        if self.attempts_made >= self.config.max_attempts {
            warn!(
                "Giving up after {} reconnect attempts",
                self.attempts_made
            );
            self.state = SessionState::Failed;
            return None;
        }
        let base = match self.last_cause {
            DisconnectCause::Abrupt => self.config.abrupt_backoff,
            DisconnectCause::GracefulClose => self.config.graceful_backoff,
        };
        let backoff = base * 2u32.saturating_pow(self.attempts_made);
        self.attempts_made += 1;
        Some(backoff)
    }
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
