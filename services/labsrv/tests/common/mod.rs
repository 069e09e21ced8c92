//! Shared helpers for labsrv integration tests
//!
//! A fake instrument is just a loopback TCP socket driven by the test.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use labsrv::protocols::astm::checksum;
use labsrv::protocols::control::{ETX, FS, STX};
use labsrv::{
    ConnectionManager, ConnectionParams, ConnectionSettings, MemoryResultStore, MessageInterpreter,
    ProtocolKind, TransportMode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const WAIT: Duration = Duration::from_secs(5);

/// Manager wired to an in-memory store
pub fn manager_with_store() -> (ConnectionManager, Arc<MemoryResultStore>) {
    let store = Arc::new(MemoryResultStore::new());
    let manager = ConnectionManager::new(
        ConnectionSettings::default(),
        MessageInterpreter::default(),
        store.clone(),
    );
    (manager, store)
}

pub fn params(mode: TransportMode, protocol: ProtocolKind, port: u16, machine_type: &str) -> ConnectionParams {
    ConnectionParams {
        mode,
        protocol,
        host: "127.0.0.1".to_string(),
        port,
        instrument_id: "TEST-01".to_string(),
        machine_type: machine_type.to_string(),
        lab_name: "Test Lab".to_string(),
        auto_reconnect: true,
    }
}

/// Port that was free a moment ago
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `check` until it returns true or the wait expires
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(WAIT, async {
        loop {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Dial `port` until something accepts
pub async fn dial_with_retry(port: u16) -> TcpStream {
    tokio::time::timeout(WAIT, async {
        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => return stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("listener never came up")
}

/// Send `bytes` and wait for a single-byte reply
pub async fn send_and_expect(stream: &mut TcpStream, bytes: &[u8], expected: u8) {
    stream.write_all(bytes).await.unwrap();
    let mut reply = [0u8; 1];
    tokio::time::timeout(WAIT, stream.read_exact(&mut reply))
        .await
        .expect("no reply")
        .unwrap();
    assert_eq!(reply[0], expected, "unexpected reply to {bytes:?}");
}

/// Read until an MLLP envelope ends
pub async fn read_mllp(stream: &mut TcpStream) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 512];
    tokio::time::timeout(WAIT, async {
        while !collected.contains(&FS) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "closed before the envelope ended");
            collected.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("no MLLP reply");
    String::from_utf8_lossy(&collected).into_owned()
}

/// One checksummed ASTM frame around `body`
pub fn astm_frame(body: &str) -> Vec<u8> {
    let mut frame = vec![STX];
    frame.extend_from_slice(body.as_bytes());
    frame.push(ETX);
    let cs = checksum(&frame);
    frame.extend_from_slice(cs.as_bytes());
    frame.extend_from_slice(b"\r\n");
    frame
}

pub const ASTM_VIRAL_LOAD: &str = "1H|\\^&|||LAB|||||||P|1\rP|1||||ORD123\rO|1|T1|T1||HIV-VL\rR|1|^^^HIV-VL|12345^U/mL||||F\rL|1|N";

pub const HL7_VIRAL_LOAD: &str =
    "MSH|^~\\&|PCR|DEV|LIS|LAB|20240301120000||ORU^R01|M1|P|2.5.1\rOBR|1||ORD-7\rOBX|1|NM|VL^Viral Load||77|cp/mL|||||F\r";
