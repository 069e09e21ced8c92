//! TCP establishment: dialing, listening and socket options

use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ConnectionSettings;
use crate::error::{ErrorExt, LabSrvError, Result};

/// Idle time before the OS starts sending TCP keep-alive probes
const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Options applied to every established socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub connect_timeout: Duration,
}

impl From<&ConnectionSettings> for SocketOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            send_buffer_size: settings.send_buffer_size,
            recv_buffer_size: settings.recv_buffer_size,
            connect_timeout: settings.connect_timeout(),
        }
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

/// Keep-alive on, no send delay, explicit buffer sizes.
///
/// Failures are logged and the socket is used as-is.
pub fn configure_socket(stream: &TcpStream, options: &SocketOptions) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {e}");
    }

    let socket = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to set keep-alive: {e}");
    }
    if let Err(e) = socket.set_send_buffer_size(options.send_buffer_size) {
        warn!("Failed to set send buffer size: {e}");
    }
    if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer_size) {
        warn!("Failed to set receive buffer size: {e}");
    }
}

/// Open an outbound connection within the connect timeout
pub async fn dial(addr: &str, options: &SocketOptions) -> Result<TcpStream> {
    debug!("Connecting to instrument at {addr}");
    let stream = match timeout(options.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(LabSrvError::connection(format!(
                "Failed to connect to {addr}: {e}"
            )))
        },
        Err(_) => {
            return Err(LabSrvError::timeout(format!(
                "Connection to {addr} timed out after {:?}",
                options.connect_timeout
            )))
        },
    };
    configure_socket(&stream, options);
    info!("Connected to instrument at {addr}");
    Ok(stream)
}

/// Bind the listening socket for instruments that dial in
pub async fn listen(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .connection_error(&format!("Failed to listen on {addr}"))?;
    let local = listener
        .local_addr()
        .map_or_else(|_| addr.to_string(), |a| a.to_string());
    info!("Listening for instrument on {local}");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_configure() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let options = SocketOptions::default();

        let (dialed, accepted) = tokio::join!(dial(&addr, &options), listener.accept());
        let stream = dialed.unwrap();
        assert!(accepted.is_ok());
        assert!(stream.nodelay().unwrap());
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_dial_refused_is_connection_error() {
        // Bind then drop to get a port nobody listens on
        let listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = dial(&addr, &SocketOptions::default()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_listen_on_bad_address() {
        assert!(matches!(
            listen("256.0.0.1:1").await,
            Err(LabSrvError::ConnectionError(_))
        ));
    }
}
