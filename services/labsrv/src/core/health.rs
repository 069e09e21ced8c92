//! Per-connection health counters

use serde::Serialize;
use std::time::{Duration, Instant};

/// Connection health statistics
///
/// Lives as long as the identity key and survives reconnect cycles.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHealth {
    /// Last time any inbound bytes arrived
    pub last_data_received: Option<Instant>,
    /// Last time any outbound bytes were written
    pub last_data_sent: Option<Instant>,
    /// Last heartbeat tick that evaluated the link
    pub last_heartbeat: Option<Instant>,
    /// When the current socket came up
    pub established_at: Option<Instant>,
    /// Oldest unanswered send that the peer must answer (keepalive ENQ,
    /// outbound payloads). Link-level replies never set it.
    pub reply_expected_since: Option<Instant>,
    /// Cumulative bytes received
    pub bytes_received: u64,
    /// Cumulative bytes sent
    pub bytes_sent: u64,
    /// Number of automatic reconnects scheduled
    pub reconnect_count: u64,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new socket coming up
    pub fn record_established(&mut self, now: Instant) {
        self.established_at = Some(now);
        self.reply_expected_since = None;
    }

    /// Record inbound bytes
    pub fn record_received(&mut self, bytes: usize, now: Instant) {
        self.bytes_received += bytes as u64;
        self.last_data_received = Some(now);
        self.reply_expected_since = None;
    }

    /// Record outbound bytes
    pub fn record_sent(&mut self, bytes: usize, now: Instant) {
        self.bytes_sent += bytes as u64;
        self.last_data_sent = Some(now);
    }

    /// Record a send the peer is expected to answer. The first unanswered
    /// one is kept.
    pub fn record_expecting_reply(&mut self, now: Instant) {
        self.reply_expected_since.get_or_insert(now);
    }

    /// Record a heartbeat evaluation
    pub fn record_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = Some(now);
    }

    /// Record a scheduled automatic reconnect
    pub fn record_reconnect(&mut self) {
        self.reconnect_count += 1;
    }

    /// Time since the peer last sent anything (or since the socket came up)
    pub fn since_received(&self, now: Instant) -> Option<Duration> {
        self.last_data_received
            .or(self.established_at)
            .map(|t| now.saturating_duration_since(t))
    }

    /// Time since we last sent anything (or since the socket came up)
    pub fn since_sent(&self, now: Instant) -> Option<Duration> {
        self.last_data_sent
            .or(self.established_at)
            .map(|t| now.saturating_duration_since(t))
    }

    /// Most recent traffic in either direction, used for idle timeouts
    pub fn last_activity(&self) -> Option<Instant> {
        [
            self.last_data_received,
            self.last_data_sent,
            self.established_at,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// Time since the oldest unanswered send, if one is outstanding
    pub fn awaiting_reply_for(&self, now: Instant) -> Option<Duration> {
        self.reply_expected_since
            .map(|t| now.saturating_duration_since(t))
    }

    /// Read-only view for observers
    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        let ago = |t: Option<Instant>| t.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        HealthSnapshot {
            bytes_received: self.bytes_received,
            bytes_sent: self.bytes_sent,
            reconnect_count: self.reconnect_count,
            last_received_ms_ago: ago(self.last_data_received),
            last_sent_ms_ago: ago(self.last_data_sent),
            last_heartbeat_ms_ago: ago(self.last_heartbeat),
            connected_for_ms: ago(self.established_at),
        }
    }
}

/// Serializable health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub reconnect_count: u64,
    pub last_received_ms_ago: Option<u64>,
    pub last_sent_ms_ago: Option<u64>,
    pub last_heartbeat_ms_ago: Option<u64>,
    pub connected_for_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let t0 = Instant::now();
        let mut health = ConnectionHealth::new();
        health.record_established(t0);
        health.record_received(12, t0 + Duration::from_secs(1));
        health.record_received(3, t0 + Duration::from_secs(2));
        health.record_sent(1, t0 + Duration::from_secs(3));

        assert_eq!(health.bytes_received, 15);
        assert_eq!(health.bytes_sent, 1);
        assert_eq!(health.last_activity(), Some(t0 + Duration::from_secs(3)));
        // plain sends (ACKs and the like) never wait for an answer
        assert_eq!(health.awaiting_reply_for(t0 + Duration::from_secs(4)), None);

        let snap = health.snapshot(t0 + Duration::from_secs(5));
        assert_eq!(snap.last_received_ms_ago, Some(3000));
        assert_eq!(snap.last_sent_ms_ago, Some(2000));
        assert_eq!(snap.connected_for_ms, Some(5000));
    }

    #[test]
    fn test_since_falls_back_to_established() {
        let t0 = Instant::now();
        let mut health = ConnectionHealth::new();
        assert_eq!(health.since_received(t0), None);
        health.record_established(t0);
        assert_eq!(
            health.since_received(t0 + Duration::from_secs(7)),
            Some(Duration::from_secs(7))
        );
        assert_eq!(health.awaiting_reply_for(t0), None);
    }

    #[test]
    fn test_reply_expectation_cleared_by_inbound() {
        let t0 = Instant::now();
        let mut health = ConnectionHealth::new();
        health.record_established(t0);
        health.record_expecting_reply(t0 + Duration::from_secs(1));
        health.record_expecting_reply(t0 + Duration::from_secs(5));
        assert_eq!(
            health.awaiting_reply_for(t0 + Duration::from_secs(11)),
            Some(Duration::from_secs(10))
        );

        health.record_received(1, t0 + Duration::from_secs(12));
        assert_eq!(health.awaiting_reply_for(t0 + Duration::from_secs(20)), None);
    }
}
