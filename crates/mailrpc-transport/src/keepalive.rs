//! Client-side keepalive monitoring.
//!
//! One ping cycle runs at a time: on each tick a ping is sent unless one is
//! already outstanding, and an outstanding ping older than the watchdog timeout
//! marks the connection dead.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const STATE_ACTIVE: u8 = 0;
const STATE_AWAITING_PONG: u8 = 1;
const STATE_DEAD: u8 = 2;
const STATE_DISABLED: u8 = 3;

/// Keepalive state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    /// No ping outstanding.
    Active,
    /// A ping was sent and no pong has arrived yet.
    AwaitingPong,
    /// The watchdog expired.
    Dead,
    /// Monitoring is turned off.
    Disabled,
}

impl From<u8> for KeepAliveState {
    fn from(raw: u8) -> Self {
        match raw {
            STATE_AWAITING_PONG => KeepAliveState::AwaitingPong,
            STATE_DEAD => KeepAliveState::Dead,
            STATE_DISABLED => KeepAliveState::Disabled,
            _ => KeepAliveState::Active,
        }
    }
}

/// What the keepalive task should do on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Write a ping frame.
    SendPing,
    /// A ping is outstanding but still within the watchdog window.
    Wait,
    /// Close the connection.
    Dead,
}

/// Keepalive settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Whether the client pings the server.
    pub enabled: bool,
    /// Interval between ticks.
    pub ping_interval_ms: u64,
    /// Age at which an unanswered ping declares the peer dead.
    pub watchdog_timeout_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ping_interval_ms: 30_000,
            watchdog_timeout_ms: 10_000,
        }
    }
}

impl KeepAliveConfig {
    /// Tick interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Watchdog timeout.
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }
}

/// Keepalive statistics of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAliveStats {
    /// Pings written.
    pub pings_sent: u64,
    /// Pongs received.
    pub pongs_received: u64,
    /// Average round-trip time in microseconds, if a pong has arrived.
    pub average_rtt_us: Option<u64>,
}

/// Tracks the ping cycle of a single connection.
#[derive(Debug)]
pub struct KeepAliveMonitor {
    config: KeepAliveConfig,
    state: AtomicU8,
    outstanding: Mutex<Option<Instant>>,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    rtt_sum_us: AtomicU64,
}

impl KeepAliveMonitor {
    /// Creates a monitor.
    pub fn new(config: KeepAliveConfig) -> Self {
        let initial = if config.enabled {
            STATE_ACTIVE
        } else {
            STATE_DISABLED
        };
        Self {
            config,
            state: AtomicU8::new(initial),
            outstanding: Mutex::new(None),
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            rtt_sum_us: AtomicU64::new(0),
        }
    }

    /// Settings this monitor runs with.
    pub fn config(&self) -> &KeepAliveConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> KeepAliveState {
        KeepAliveState::from(self.state.load(Ordering::SeqCst))
    }

    /// Decides the action for a tick at `now`.
    pub fn check(&self, now: Instant) -> KeepAliveAction {
        match self.state() {
            KeepAliveState::Disabled => return KeepAliveAction::Wait,
            KeepAliveState::Dead => return KeepAliveAction::Dead,
            _ => {}
        }
        let outstanding = *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner);
        match outstanding {
            None => KeepAliveAction::SendPing,
            Some(sent) if now.saturating_duration_since(sent) > self.config.watchdog_timeout() => {
                self.state.store(STATE_DEAD, Ordering::SeqCst);
                KeepAliveAction::Dead
            }
            Some(_) => KeepAliveAction::Wait,
        }
    }

    /// Records that a ping was written at `now`.
    pub fn record_ping(&self, now: Instant) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        *self.outstanding.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.state.store(STATE_AWAITING_PONG, Ordering::SeqCst);
    }

    /// Records a pong received at `now`, clearing the outstanding ping.
    pub fn record_pong(&self, now: Instant) {
        let sent = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sent) = sent else {
            return;
        };
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
        let rtt_us = now.saturating_duration_since(sent).as_micros() as u64;
        self.rtt_sum_us.fetch_add(rtt_us, Ordering::Relaxed);
        let _ = self.state.compare_exchange(
            STATE_AWAITING_PONG,
            STATE_ACTIVE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Current statistics.
    pub fn stats(&self) -> KeepAliveStats {
        let pongs = self.pongs_received.load(Ordering::Relaxed);
        KeepAliveStats {
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pongs_received: pongs,
            average_rtt_us: (pongs > 0).then(|| self.rtt_sum_us.load(Ordering::Relaxed) / pongs),
        }
    }
}
