//! Heartbeat evaluation
//!
//! Each tick looks at the health counters and picks one action. The
//! decision is a pure function so it can be checked without sockets.

use std::time::{Duration, Instant};

use crate::core::{ConnectionHealth, ProtocolKind, TransportMode};

/// Tick interval when the instrument dials in
pub const LISTEN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Tick interval when we dial the instrument
pub const DIAL_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Silence after which an unanswered keepalive or payload means the peer is gone
pub const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(10);

pub fn heartbeat_interval(mode: TransportMode) -> Duration {
    match mode {
        TransportMode::Listen => LISTEN_HEARTBEAT_INTERVAL,
        TransportMode::Dial => DIAL_HEARTBEAT_INTERVAL,
    }
}

/// Outcome of one heartbeat tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Connection is down
    Skip,
    /// Peer did not answer our last transmission; tear down and reconnect
    DeadPeer,
    /// Link has been quiet for half an interval; send a keepalive
    SendKeepalive,
    /// Recent traffic, nothing to do
    Idle,
}

/// Decide the action for a tick at `now`.
///
/// Dead peer: the protocol answers keepalives, a send that needs an answer
/// has been outstanding for at least the inactivity threshold and nothing
/// arrived for longer than that. Link-level replies we wrote do not count.
/// Otherwise a keepalive goes out when
/// neither direction saw traffic within half the interval.
pub fn evaluate(
    health: &ConnectionHealth,
    now: Instant,
    interval: Duration,
    up: bool,
    protocol: ProtocolKind,
) -> HeartbeatAction {
    if !up {
        return HeartbeatAction::Skip;
    }
    let since_received = health.since_received(now).unwrap_or(Duration::ZERO);
    let since_sent = health.since_sent(now).unwrap_or(Duration::ZERO);

    let unanswered = health.awaiting_reply_for(now).unwrap_or(Duration::ZERO);
    if protocol.expects_keepalive_reply()
        && unanswered >= INACTIVITY_THRESHOLD
        && since_received > INACTIVITY_THRESHOLD
    {
        return HeartbeatAction::DeadPeer;
    }

    let half = interval / 2;
    if since_received >= half && since_sent >= half {
        HeartbeatAction::SendKeepalive
    } else {
        HeartbeatAction::Idle
    }
}
