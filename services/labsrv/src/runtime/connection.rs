//! Per-identity-key connection state
//!
//! A [`ConnectionHandle`] lives from the first `connect` of a key until its
//! explicit `disconnect`. Health counters, the send queue and the reconnect
//! counter survive reconnect cycles; the socket writer and the framer buffer
//! are replaced every time a new socket comes up.

use bytes::Bytes;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::heartbeat::{self, HeartbeatAction};
use super::reconnect::{ReconnectHelper, ReconnectPolicy};
use crate::config::ConnectionSettings;
use crate::core::{
    ConnectionHealth, ConnectionKey, ConnectionParams, ConnectionPhase, ConnectionStatus, HealthSnapshot,
    SendQueue, StatusSnapshot, Transition,
};
use crate::error::{LabSrvError, Result};
use crate::protocols::control;
use crate::protocols::ProtocolFramer;

/// Write half of the active socket
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How `send_data` disposed of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Written,
    Queued,
}

/// Running session task of a key
#[derive(Debug)]
pub(crate) struct SessionGuard {
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

/// State of one identity key
pub struct ConnectionHandle {
    key: ConnectionKey,
    params: Mutex<ConnectionParams>,
    settings: ConnectionSettings,
    status: ConnectionStatus,
    phase: Mutex<ConnectionPhase>,
    health: Mutex<ConnectionHealth>,
    queue: Mutex<SendQueue>,
    queue_notify: Notify,
    reconnect: Mutex<ReconnectHelper>,
    framer: Mutex<ProtocolFramer>,
    idle_timeout: Mutex<Duration>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    session: Mutex<Option<SessionGuard>>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.key)
            .field("phase", &*self.phase.lock())
            .field("status", &self.status.snapshot())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn new(params: ConnectionParams, settings: ConnectionSettings, policy: ReconnectPolicy) -> Self {
        Self {
            key: params.key(),
            framer: Mutex::new(ProtocolFramer::new(params.protocol)),
            params: Mutex::new(params),
            status: ConnectionStatus::new(),
            phase: Mutex::new(ConnectionPhase::Idle),
            health: Mutex::new(ConnectionHealth::new()),
            queue: Mutex::new(SendQueue::new(settings.send_queue_capacity)),
            queue_notify: Notify::new(),
            reconnect: Mutex::new(ReconnectHelper::new(policy)),
            idle_timeout: Mutex::new(settings.idle_timeout()),
            writer: tokio::sync::Mutex::new(None),
            session: Mutex::new(None),
            settings,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Parameters of the current attempt
    pub fn params(&self) -> ConnectionParams {
        self.params.lock().clone()
    }

    /// Replace the parameters before a new attempt; the identity key stays
    pub(crate) fn set_params(&self, params: ConnectionParams) {
        let mut framer = self.framer.lock();
        if framer.protocol() != params.protocol {
            *framer = ProtocolFramer::new(params.protocol);
        }
        *self.params.lock() = params;
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    // ------------------------------------------------------------------
    // Phase and status
    // ------------------------------------------------------------------

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    /// Apply a trigger. Returns the new phase, or `None` when the trigger
    /// does not apply to the current phase.
    pub fn transition(&self, trigger: Transition) -> Option<ConnectionPhase> {
        let mut phase = self.phase.lock();
        let Some(next) = phase.next(trigger) else {
            debug!("{}: {:?} ignored in phase {}", self.key, trigger, *phase);
            return None;
        };
        if next != *phase {
            info!("{}: {} -> {}", self.key, *phase, next);
        }
        *phase = next;
        self.status.apply_phase(next);
        Some(next)
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    pub fn set_transmitting(&self, value: bool) {
        self.status.set_transmitting(value);
    }

    pub fn subscribe_up(&self) -> watch::Receiver<bool> {
        self.status.subscribe_up()
    }

    pub fn subscribe_attempting(&self) -> watch::Receiver<bool> {
        self.status.subscribe_attempting()
    }

    pub fn subscribe_transmitting(&self) -> watch::Receiver<bool> {
        self.status.subscribe_transmitting()
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub fn health(&self) -> HealthSnapshot {
        self.health.lock().snapshot(Instant::now())
    }

    pub(crate) fn with_health<R>(&self, f: impl FnOnce(&mut ConnectionHealth) -> R) -> R {
        f(&mut self.health.lock())
    }

    /// Current read idle timeout
    pub fn idle_timeout(&self) -> Duration {
        *self.idle_timeout.lock()
    }

    /// Widen the idle timeout after the first idle event; returns the value
    /// that applies from now on.
    pub fn on_idle_timeout(&self) -> Duration {
        let mut current = self.idle_timeout.lock();
        let widened = self.settings.widened_idle_timeout();
        if *current < widened {
            info!("{}: idle timeout widened from {:?} to {:?}", self.key, *current, widened);
            *current = widened;
        }
        *current
    }

    /// Instant at which the socket counts as idle
    pub(crate) fn idle_deadline(&self) -> Instant {
        let last = self.health.lock().last_activity().unwrap_or_else(Instant::now);
        last + self.idle_timeout()
    }

    // ------------------------------------------------------------------
    // Reconnect counter
    // ------------------------------------------------------------------

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.lock().current_attempt()
    }

    pub(crate) fn with_reconnect<R>(&self, f: impl FnOnce(&mut ReconnectHelper) -> R) -> R {
        f(&mut self.reconnect.lock())
    }

    // ------------------------------------------------------------------
    // Session task
    // ------------------------------------------------------------------

    /// Whether a session task is running for this key
    pub fn has_live_session(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|guard| !guard.task.is_finished())
    }

    pub(crate) fn set_session(&self, guard: SessionGuard) {
        if let Some(previous) = self.session.lock().replace(guard) {
            previous.cancel.cancel();
        }
    }

    /// Cancel the session task and wait up to the grace period, then abort
    pub(crate) async fn stop_session(&self) {
        let guard = self.session.lock().take();
        let Some(SessionGuard { cancel, mut task }) = guard else {
            return;
        };
        cancel.cancel();
        let grace = self.settings.disconnect_grace();
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!("{}: session did not stop within {:?}, aborting", self.key, grace);
            task.abort();
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub(crate) fn reset_framer(&self) {
        self.framer.lock().reset();
    }

    /// Run a chunk through the framer and write its replies. Returns the
    /// completed logical messages.
    pub(crate) async fn on_inbound(&self, chunk: &[u8]) -> Result<Vec<String>> {
        self.health.lock().record_received(chunk.len(), Instant::now());
        let output = self.framer.lock().on_chunk(chunk);
        if let Some(transmitting) = output.transmitting {
            self.status.set_transmitting(transmitting);
        }
        for reply in &output.replies {
            self.write_frame(reply, Instant::now()).await?;
        }
        Ok(output.messages)
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    pub(crate) async fn install_writer(&self, writer: BoxedWriter) {
        let previous = self.writer.lock().await.replace(writer);
        if let Some(mut old) = previous {
            if let Err(e) = old.shutdown().await {
                debug!("{}: shutdown of replaced writer: {}", self.key, e);
            }
        }
    }

    /// Close and drop the writer, if any
    pub(crate) async fn clear_writer(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("{}: shutdown on close: {}", self.key, e);
            }
        }
    }

    pub async fn has_writer(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Write link-level bytes (replies, keepalives) directly
    pub(crate) async fn write_frame(&self, bytes: &[u8], now: Instant) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(LabSrvError::not_connected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        drop(guard);
        self.health.lock().record_sent(bytes.len(), now);
        debug!("{}: sent {}", self.key, control::describe_bytes(bytes));
        Ok(())
    }

    /// Write `payload` now if the socket is writable and nothing is queued
    /// ahead of it; otherwise queue it. Never fails.
    pub async fn send_data(&self, payload: Bytes) -> SendOutcome {
        {
            let mut guard = self.writer.lock().await;
            let queue_empty = self.queue.lock().is_empty();
            if let (Some(writer), true) = (guard.as_mut(), queue_empty) {
                match write_payload(writer, &payload).await {
                    Ok(()) => {
                        drop(guard);
                        self.record_payload_sent(payload.len(), Instant::now());
                        return SendOutcome::Written;
                    },
                    Err(e) => warn!("{}: write failed, queueing payload: {}", self.key, e),
                }
            }
        }
        self.queue.lock().push(payload);
        self.queue_notify.notify_one();
        SendOutcome::Queued
    }

    /// Write queued payloads in FIFO order. A failed payload goes back to
    /// the head of the queue.
    pub(crate) async fn drain_queue(&self) -> Result<usize> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Ok(0);
        };
        let mut written = 0;
        loop {
            let Some(payload) = self.queue.lock().pop() else {
                break;
            };
            if let Err(e) = write_payload(writer, &payload).await {
                self.queue.lock().requeue_front(payload);
                return Err(LabSrvError::io(format!("Queue drain interrupted: {e}")));
            }
            self.record_payload_sent(payload.len(), Instant::now());
            written += 1;
        }
        if written > 0 {
            debug!("{}: drained {} queued payload(s)", self.key, written);
        }
        Ok(written)
    }

    /// Application payloads are answered by the instrument, unlike link replies
    fn record_payload_sent(&self, bytes: usize, now: Instant) {
        let mut health = self.health.lock();
        health.record_sent(bytes, now);
        health.record_expecting_reply(now);
    }

    /// Resolves when `send_data` queued something
    pub(crate) async fn queue_signalled(&self) {
        self.queue_notify.notified().await;
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn clear_queue(&self) {
        self.queue.lock().clear();
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// Evaluate the link at `now` and send a keepalive if it has been quiet
    pub async fn heartbeat_tick(&self, now: Instant) -> Result<HeartbeatAction> {
        let params = self.params();
        let action = {
            let mut health = self.health.lock();
            let action = heartbeat::evaluate(
                &health,
                now,
                heartbeat::heartbeat_interval(params.mode),
                self.status.is_up(),
                params.protocol,
            );
            if action != HeartbeatAction::Skip {
                health.record_heartbeat(now);
            }
            action
        };

        match action {
            HeartbeatAction::SendKeepalive => {
                let frame = self.framer.lock().keepalive_frame();
                self.write_frame(&frame, now).await?;
                self.health.lock().record_expecting_reply(now);
            },
            HeartbeatAction::DeadPeer => {
                warn!("{}: no reply from instrument, treating peer as dead", self.key);
            },
            HeartbeatAction::Skip | HeartbeatAction::Idle => {},
        }
        Ok(action)
    }
}

async fn write_payload(writer: &mut BoxedWriter, payload: &[u8]) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}
