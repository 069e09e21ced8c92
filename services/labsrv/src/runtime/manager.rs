//! Connection registry keyed by instrument identity
//!
//! [`ConnectionManager`] is the public entry point of the runtime. It owns
//! one [`ConnectionHandle`] per identity key and at most one session task
//! per handle.

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, SendOutcome, SessionGuard};
use super::reconnect::ReconnectPolicy;
use super::session::{self, SessionContext};
use super::transport::SocketOptions;
use crate::config::ConnectionSettings;
use crate::core::{
    ConnectionKey, ConnectionParams, ConnectionPhase, HealthSnapshot, StatusSnapshot, Transition,
};
use crate::error::{LabSrvError, Result};
use crate::interpreter::MessageInterpreter;
use crate::protocols::{build_astm_order, build_hl7_order, frame_astm_message, hl7, OrderRequest, SequenceRegistry};
use crate::storage::ResultSink;

/// Sending application stamped on outbound HL7 orders
pub const SENDING_APPLICATION: &str = "LABSRV";

/// Owns every instrument connection
pub struct ConnectionManager {
    connections: DashMap<ConnectionKey, Arc<ConnectionHandle>>,
    settings: ConnectionSettings,
    policy: ReconnectPolicy,
    context: SessionContext,
    sequences: SequenceRegistry,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.connections.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, interpreter: MessageInterpreter, sink: Arc<dyn ResultSink>) -> Self {
        let context = SessionContext {
            interpreter,
            sink,
            socket: SocketOptions::from(&settings),
        };
        Self {
            connections: DashMap::new(),
            settings,
            policy: ReconnectPolicy::default(),
            context,
            sequences: SequenceRegistry::new(),
        }
    }

    /// Override the reconnect policy for handles created from now on
    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start connecting `params`. Idempotent while a session for the same
    /// key is live; a dormant or closed key is restarted.
    pub fn connect(&self, params: ConnectionParams) -> Result<ConnectionKey> {
        params.validate()?;
        let key = params.key();

        let handle = self
            .connections
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(ConnectionHandle::new(
                    params.clone(),
                    self.settings.clone(),
                    self.policy.clone(),
                ))
            })
            .clone();

        if handle.has_live_session() {
            debug!("{}: already connecting or connected", key);
            return Ok(key);
        }
        handle.set_params(params);
        self.start_session(&handle);
        Ok(key)
    }

    /// Close the socket, stop retries and drop all state for the key.
    /// Unknown keys are a no-op.
    pub async fn disconnect(&self, params: &ConnectionParams) {
        self.disconnect_key(&params.key()).await;
    }

    pub async fn disconnect_key(&self, key: &ConnectionKey) {
        let Some((_, handle)) = self.connections.remove(key) else {
            debug!("{}: disconnect for unknown connection ignored", key);
            return;
        };
        handle.stop_session().await;
        handle.transition(Transition::Disconnect);
        handle.clear_writer().await;
        handle.clear_queue();
        info!("{}: disconnected", key);
    }

    /// Manual reconnect: reset the attempt counter and restart the session.
    /// Health counters and queued payloads are kept.
    pub async fn reconnect(&self, params: ConnectionParams) -> Result<ConnectionKey> {
        params.validate()?;
        let key = params.key();
        let Some(handle) = self.handle(&key) else {
            return self.connect(params);
        };

        handle.stop_session().await;
        handle.transition(Transition::Disconnect);
        handle.clear_writer().await;
        handle.with_reconnect(|r| r.reset());
        handle.set_params(params);
        self.start_session(&handle);
        info!("{}: manual reconnect", key);
        Ok(key)
    }

    fn start_session(&self, handle: &Arc<ConnectionHandle>) {
        let cancel = CancellationToken::new();
        handle.transition(Transition::Connect);
        let task = tokio::spawn(session::run(
            Arc::clone(handle),
            self.context.clone(),
            cancel.clone(),
        ));
        handle.set_session(SessionGuard { cancel, task });
    }

    /// Disconnect every key concurrently
    pub async fn shutdown_all(&self) {
        let keys = self.keys();
        if keys.is_empty() {
            return;
        }
        info!("Shutting down {} connection(s)", keys.len());
        join_all(keys.iter().map(|key| self.disconnect_key(key))).await;
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Write now when the socket is up, otherwise queue for the next
    /// established socket.
    pub async fn send_data(&self, params: &ConnectionParams, payload: Bytes) -> Result<SendOutcome> {
        let handle = self.require(&params.key())?;
        Ok(handle.send_data(payload).await)
    }

    /// Encode a test order in the instrument's protocol and send it
    pub async fn dispatch_order(&self, params: &ConnectionParams, order: &OrderRequest) -> Result<SendOutcome> {
        let handle = self.require(&params.key())?;
        let frame = if params.protocol.is_astm() {
            let body = build_astm_order(order, &params.lab_name);
            Bytes::from(frame_astm_message(&self.sequences, &params.instrument_id, &body))
        } else {
            let message = build_hl7_order(order, SENDING_APPLICATION, &params.instrument_id);
            Bytes::from(hl7::wrap(&message))
        };
        let outcome = handle.send_data(frame).await;
        info!(
            "{}: order {} for test {} {:?}",
            params.key(),
            order.order_id,
            order.test_code,
            outcome
        );
        Ok(outcome)
    }

    /// Restart the outbound ASTM sequence for an instrument
    pub fn reset_sequence_number(&self, instrument_id: &str) {
        self.sequences.reset(instrument_id);
    }

    pub fn sequences(&self) -> &SequenceRegistry {
        &self.sequences
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn handle(&self, key: &ConnectionKey) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn require(&self, key: &ConnectionKey) -> Result<Arc<ConnectionHandle>> {
        self.handle(key).ok_or_else(|| {
            warn!("{}: no such connection", key);
            LabSrvError::state(format!("No connection for {key}"))
        })
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn phase(&self, key: &ConnectionKey) -> Option<ConnectionPhase> {
        self.handle(key).map(|h| h.phase())
    }

    pub fn status(&self, key: &ConnectionKey) -> Option<StatusSnapshot> {
        self.handle(key).map(|h| h.status())
    }

    pub fn health(&self, key: &ConnectionKey) -> Option<HealthSnapshot> {
        self.handle(key).map(|h| h.health())
    }

    pub fn queued(&self, key: &ConnectionKey) -> Option<usize> {
        self.handle(key).map(|h| h.queued())
    }

    pub fn subscribe_up(&self, key: &ConnectionKey) -> Option<watch::Receiver<bool>> {
        self.handle(key).map(|h| h.subscribe_up())
    }

    pub fn subscribe_attempting(&self, key: &ConnectionKey) -> Option<watch::Receiver<bool>> {
        self.handle(key).map(|h| h.subscribe_attempting())
    }

    pub fn subscribe_transmitting(&self, key: &ConnectionKey) -> Option<watch::Receiver<bool>> {
        self.handle(key).map(|h| h.subscribe_transmitting())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::sample_params;
    use crate::core::{ProtocolKind, TransportMode};
    use crate::protocols::orders::sample_order;
    use crate::storage::MemoryResultStore;
    use std::time::Duration;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(
            ConnectionSettings::default(),
            MessageInterpreter::default(),
            Arc::new(MemoryResultStore::new()),
        )
    }

    /// Dial target nobody listens on
    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_params() {
        let m = manager();
        let mut params = sample_params(TransportMode::Dial, ProtocolKind::AstmChecksum);
        params.host.clear();
        assert!(matches!(m.connect(params), Err(LabSrvError::ConfigError(_))));
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let m = manager();
        let mut params = sample_params(TransportMode::Dial, ProtocolKind::AstmChecksum);
        params.port = closed_port().await;

        let key = m.connect(params.clone()).unwrap();
        assert_eq!(m.connect(params.clone()).unwrap(), key);
        assert_eq!(m.len(), 1);
        assert!(m.status(&key).unwrap().attempting || m.phase(&key) == Some(ConnectionPhase::Failed));

        m.disconnect(&params).await;
        assert!(!m.contains(&key));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_is_noop() {
        let m = manager();
        m.disconnect(&sample_params(TransportMode::Listen, ProtocolKind::Hl7)).await;
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_fails() {
        let m = manager();
        let params = sample_params(TransportMode::Dial, ProtocolKind::Hl7);
        let err = m.send_data(&params, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, LabSrvError::StateError(_)));
    }

    #[tokio::test]
    async fn test_order_queued_while_down() {
        let m = manager().with_policy(ReconnectPolicy {
            initial_delay: Duration::from_secs(60),
            ..ReconnectPolicy::default()
        });
        let mut params = sample_params(TransportMode::Dial, ProtocolKind::AstmChecksum);
        params.port = closed_port().await;
        let key = m.connect(params.clone()).unwrap();

        let outcome = m.dispatch_order(&params, &sample_order()).await.unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
        assert_eq!(m.queued(&key), Some(1));
        assert_eq!(m.sequences().current(&params.instrument_id), Some(1));

        m.reset_sequence_number(&params.instrument_id);
        assert_eq!(m.sequences().current(&params.instrument_id), Some(100));

        m.shutdown_all().await;
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn test_no_auto_reconnect_goes_dormant() {
        let m = manager();
        let mut params = sample_params(TransportMode::Dial, ProtocolKind::AstmChecksum);
        params.port = closed_port().await;
        params.auto_reconnect = false;
        let key = m.connect(params.clone()).unwrap();

        let mut attempting = m.subscribe_attempting(&key).unwrap();
        tokio::time::timeout(Duration::from_secs(5), attempting.wait_for(|a| !*a))
            .await
            .unwrap()
            .unwrap();
        let handle = m.handle(&key).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.has_live_session() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(m.phase(&key), Some(ConnectionPhase::Dormant));
        assert!(!m.status(&key).unwrap().up);
    }

    #[tokio::test]
    async fn test_exhausted_retries_go_dormant() {
        let m = manager().with_policy(ReconnectPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            ..ReconnectPolicy::default()
        });
        let mut params = sample_params(TransportMode::Dial, ProtocolKind::AstmChecksum);
        params.port = closed_port().await;
        assert!(params.auto_reconnect);
        let key = m.connect(params).unwrap();

        let handle = m.handle(&key).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.has_live_session() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(m.phase(&key), Some(ConnectionPhase::Dormant));
        let status = m.status(&key).unwrap();
        assert!(!status.attempting);
        assert!(!status.up);
        assert_eq!(m.health(&key).unwrap().reconnect_count, 2);
        assert!(m.contains(&key));
    }
}
