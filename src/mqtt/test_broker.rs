//! Loopback stand-in for an MQTT 3.1.1 broker, enough to accept a client and
//! record what it sends until the socket closes.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use super::config::ConnectionConfig;

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const DISCONNECT: [u8; 2] = [0xE0, 0x00];

/// Everything one client sent after its CONNECT was accepted.
#[derive(Debug)]
pub struct ClosedSession {
    pub bytes: Vec<u8>,
}

impl ClosedSession {
    pub fn sent_disconnect(&self) -> bool {
        self.bytes.windows(2).any(|packet| packet == DISCONNECT)
    }
}

pub struct TestBroker {
    pub config: ConnectionConfig,
    closed: mpsc::UnboundedReceiver<ClosedSession>,
}

impl TestBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (closed_tx, closed) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    // CONNECT only
                    if n == 0 || buf[0] >> 4 != 1 {
                        return;
                    }
                    if socket.write_all(&CONNACK_ACCEPTED).await.is_err() {
                        return;
                    }
                    let mut bytes = Vec::new();
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => bytes.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = closed_tx.send(ClosedSession { bytes });
                });
            }
        });

        Self {
            config: ConnectionConfig {
                hostname: "127.0.0.1".to_string(),
                port,
                ..ConnectionConfig::default()
            },
            closed,
        }
    }

    /// Waits until the next client connection is closed.
    pub async fn closed_session(&mut self) -> ClosedSession {
        self.closed.recv().await.unwrap()
    }
}
