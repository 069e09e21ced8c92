//! Connection phases and observable status channels
//!
//! ```text
//! Idle ──Connect──► Attempting ──Established──► Up
//!                      ▲  │                      │
//!       RetryScheduled │  └──────Fault───────┐   │ Fault
//!                      │                     ▼   ▼
//!                      └──────────────────── Failed ──RetriesExhausted──► Dormant
//!
//! any ──Disconnect──► Closed      Closed/Dormant ──Connect──► Attempting
//! ```

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

/// Lifecycle phase of one identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    /// State allocated, nothing attempted yet
    Idle,
    /// Binding/listening or dialing
    Attempting,
    /// Socket established with the instrument
    Up,
    /// Socket lost; waiting for the retry decision
    Failed,
    /// Explicitly disconnected
    Closed,
    /// Automatic retries exhausted; waits for a manual reconnect
    Dormant,
}

/// Trigger for a phase change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connect,
    Established,
    Fault,
    RetryScheduled,
    RetriesExhausted,
    Disconnect,
}

impl ConnectionPhase {
    /// Next phase for `trigger`, or `None` when the trigger does not apply.
    ///
    /// A Fault outside Attempting/Up yields `None`, so a second close event
    /// for an already failed socket is ignored.
    pub fn next(self, trigger: Transition) -> Option<ConnectionPhase> {
        use ConnectionPhase::*;
        match (self, trigger) {
            (_, Transition::Disconnect) => Some(Closed),
            (Idle | Closed | Dormant | Failed, Transition::Connect) => Some(Attempting),
            (Attempting | Up, Transition::Connect) => None,
            (Attempting | Up, Transition::Established) => Some(Up),
            (Attempting | Up, Transition::Fault) => Some(Failed),
            (Failed, Transition::RetryScheduled) => Some(Attempting),
            (Failed, Transition::RetriesExhausted) => Some(Dormant),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionPhase::Attempting | ConnectionPhase::Up)
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Attempting => "attempting",
            ConnectionPhase::Up => "up",
            ConnectionPhase::Failed => "failed",
            ConnectionPhase::Closed => "closed",
            ConnectionPhase::Dormant => "dormant",
        };
        f.write_str(s)
    }
}

/// Three boolean signal channels: up, attempting, transmitting
#[derive(Debug)]
pub struct ConnectionStatus {
    up: watch::Sender<bool>,
    attempting: watch::Sender<bool>,
    transmitting: watch::Sender<bool>,
}

impl ConnectionStatus {
    pub fn new() -> Self {
        Self {
            up: watch::channel(false).0,
            attempting: watch::channel(false).0,
            transmitting: watch::channel(false).0,
        }
    }

    /// Side effects of entering `phase`
    pub fn apply_phase(&self, phase: ConnectionPhase) {
        match phase {
            ConnectionPhase::Idle => {},
            ConnectionPhase::Attempting => {
                self.set_up(false);
                self.set_attempting(true);
            },
            ConnectionPhase::Up => {
                self.set_up(true);
                self.set_attempting(false);
            },
            ConnectionPhase::Failed => {
                self.set_up(false);
                self.set_transmitting(false);
            },
            ConnectionPhase::Closed => {
                self.set_up(false);
                self.set_attempting(false);
                self.set_transmitting(false);
            },
            ConnectionPhase::Dormant => {
                self.set_up(false);
                self.set_attempting(false);
                self.set_transmitting(false);
            },
        }
    }

    pub fn set_up(&self, value: bool) {
        self.up.send_if_modified(|v| std::mem::replace(v, value) != value);
    }

    pub fn set_attempting(&self, value: bool) {
        self.attempting
            .send_if_modified(|v| std::mem::replace(v, value) != value);
    }

    pub fn set_transmitting(&self, value: bool) {
        self.transmitting
            .send_if_modified(|v| std::mem::replace(v, value) != value);
    }

    pub fn is_up(&self) -> bool {
        *self.up.borrow()
    }

    pub fn is_attempting(&self) -> bool {
        *self.attempting.borrow()
    }

    pub fn is_transmitting(&self) -> bool {
        *self.transmitting.borrow()
    }

    pub fn subscribe_up(&self) -> watch::Receiver<bool> {
        self.up.subscribe()
    }

    pub fn subscribe_attempting(&self) -> watch::Receiver<bool> {
        self.attempting.subscribe()
    }

    pub fn subscribe_transmitting(&self) -> watch::Receiver<bool> {
        self.transmitting.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            up: self.is_up(),
            attempting: self.is_attempting(),
            transmitting: self.is_transmitting(),
        }
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the three signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub up: bool,
    pub attempting: bool,
    pub transmitting: bool,
}
