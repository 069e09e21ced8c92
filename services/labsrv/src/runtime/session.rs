//! Session task: one per identity key while connected or retrying
//!
//! The task owns the socket read half. It brings the socket up (dial or
//! listen/accept), then multiplexes reads, heartbeat ticks, the idle
//! deadline, queued sends and cancellation. Any transport failure funnels
//! into a single fault path that applies the reconnect policy.

use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionHandle;
use super::heartbeat::{heartbeat_interval, HeartbeatAction};
use super::reconnect::RetryDecision;
use super::transport::{self, SocketOptions};
use crate::core::{ConnectionParams, TransportMode, Transition};
use crate::error::{LabSrvError, Result};
use crate::interpreter::MessageInterpreter;
use crate::storage::ResultSink;

const READ_BUFFER_SIZE: usize = 4096;

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionContext {
    pub interpreter: MessageInterpreter,
    pub sink: Arc<dyn ResultSink>,
    pub socket: SocketOptions,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

/// Why a served socket stopped without an error
enum SessionEnd {
    Cancelled,
    /// Listen mode: a newer client connected and replaces the current one
    Replaced(TcpStream),
}

/// Drive one key until cancelled, retries are exhausted or a failure hits a
/// key without automatic reconnect.
pub(crate) async fn run(handle: Arc<ConnectionHandle>, ctx: SessionContext, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let params = handle.params();
        let outcome = match params.mode {
            TransportMode::Dial => run_dial(&handle, &params, &ctx, &cancel).await,
            TransportMode::Listen => run_listen(&handle, &params, &ctx, &cancel).await,
        };

        let err = match outcome {
            Ok(()) => break,
            Err(e) => e,
        };
        handle.clear_writer().await;
        if cancel.is_cancelled() {
            break;
        }
        warn!("{}: {}", handle.key(), err);
        if handle.transition(Transition::Fault).is_none() {
            break;
        }

        if !params.auto_reconnect {
            info!("{}: automatic reconnect disabled", handle.key());
            handle.transition(Transition::RetriesExhausted);
            break;
        }

        match handle.with_reconnect(|r| r.on_failure()) {
            RetryDecision::Retry { attempt, delay } => {
                handle.with_health(|h| h.record_reconnect());
                handle.transition(Transition::RetryScheduled);
                debug!("{}: retry {} in {:?}", handle.key(), attempt, delay);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {},
                }
            },
            RetryDecision::Exhausted => {
                error!(
                    "{}: reconnect attempts exhausted, waiting for manual reconnect",
                    handle.key()
                );
                handle.transition(Transition::RetriesExhausted);
                break;
            },
        }
    }
    handle.clear_writer().await;
    debug!("{}: session task finished", handle.key());
}

async fn run_dial(
    handle: &Arc<ConnectionHandle>,
    params: &ConnectionParams,
    ctx: &SessionContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let addr = params.socket_addr();
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        dialed = transport::dial(&addr, &ctx.socket) => dialed?,
    };
    match serve_socket(handle, stream, None, ctx, cancel).await? {
        SessionEnd::Cancelled | SessionEnd::Replaced(_) => Ok(()),
    }
}

async fn run_listen(
    handle: &Arc<ConnectionHandle>,
    params: &ConnectionParams,
    ctx: &SessionContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let addr = params.socket_addr();
    let listener = transport::listen(&addr).await?;
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        accepted = listener.accept() => {
            let (stream, peer) = accepted?;
            info!("{}: instrument connected from {}", handle.key(), peer);
            stream
        },
    };

    loop {
        transport::configure_socket(&stream, &ctx.socket);
        match serve_socket(handle, stream, Some(&listener), ctx, cancel).await? {
            SessionEnd::Cancelled => return Ok(()),
            SessionEnd::Replaced(next) => stream = next,
        }
    }
}

async fn accept_next(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn serve_socket(
    handle: &Arc<ConnectionHandle>,
    stream: TcpStream,
    listener: Option<&TcpListener>,
    ctx: &SessionContext,
    cancel: &CancellationToken,
) -> Result<SessionEnd> {
    let (mut reader, writer) = stream.into_split();
    handle.install_writer(Box::new(writer)).await;
    handle.reset_framer();
    handle.set_transmitting(false);
    handle.with_health(|h| h.record_established(std::time::Instant::now()));
    handle.with_reconnect(|r| r.mark_connected());
    handle.transition(Transition::Established);
    handle.drain_queue().await?;

    let interval = heartbeat_interval(handle.params().mode);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let idle_deadline = tokio::time::Instant::from_std(handle.idle_deadline());
        tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),

            _ = ticker.tick() => {
                if handle.heartbeat_tick(std::time::Instant::now()).await? == HeartbeatAction::DeadPeer {
                    return Err(LabSrvError::timeout("Instrument stopped answering keepalives"));
                }
            },

            _ = tokio::time::sleep_until(idle_deadline) => {
                let previous = handle.idle_timeout();
                handle.on_idle_timeout();
                return Err(LabSrvError::timeout(format!("No traffic for {previous:?}")));
            },

            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Err(LabSrvError::connection("Connection closed by instrument"));
                }
                for message in handle.on_inbound(&buf[..n]).await? {
                    dispatch_message(handle.params(), ctx, message);
                }
            },

            _ = handle.queue_signalled() => {
                handle.drain_queue().await?;
            },

            accepted = accept_next(listener) => {
                let (next, peer) = accepted?;
                info!("{}: new client {} replaces the current one", handle.key(), peer);
                return Ok(SessionEnd::Replaced(next));
            },
        }
    }
}

/// Hand a completed transmission to persistence and interpretation without
/// holding up the socket.
fn dispatch_message(params: ConnectionParams, ctx: &SessionContext, message: String) {
    let interpreter = ctx.interpreter.clone();
    let sink = Arc::clone(&ctx.sink);
    tokio::spawn(async move {
        interpreter.process(sink.as_ref(), &params, &message).await;
    });
}
