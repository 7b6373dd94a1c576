//! TCP session with the collector.
//!
//! ```text
//! Disconnected --connect--> AwaitingLoginAck --ack--> Ready
//!       ^                          |                    |
//!       +--------- any failure ----+--------------------+
//! ```
//!
//! The session never retries on its own; scheduling is the
//! orchestrator's job.

use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::CollectorConfig;
use crate::packet::WirePacket;

/// Transport errors, one per failure site.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {peer} failed: {source}")]
    Connect {
        peer: String,
        #[source]
        source: io::Error,
    },
    #[error("Connection to {peer} timed out after {timeout:?}")]
    ConnectTimeout { peer: String, timeout: Duration },
    #[error("Failed to send login packet: {0}")]
    Login(#[source] io::Error),
    #[error("Failed to read login acknowledgment: {0}")]
    Ack(#[source] io::Error),
    #[error("No login acknowledgment within {0:?}")]
    AckTimeout(Duration),
    #[error("Collector closed the connection before acknowledging login")]
    AckClosed,
    #[error("Failed to send packet: {0}")]
    Send(#[source] io::Error),
    #[error("Sending packet timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("Transport is not ready")]
    NotReady,
}

impl TransportError {
    /// Session phase that failed: `connect`, `login` or `send`.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Connect { .. } | Self::ConnectTimeout { .. } => "connect",
            Self::Login(_) | Self::Ack(_) | Self::AckTimeout(_) | Self::AckClosed => "login",
            Self::Send(_) | Self::SendTimeout(_) | Self::NotReady => "send",
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    AwaitingLoginAck,
    Ready,
}

/// Opens byte streams to the collector.
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Human-readable peer address for logs and errors.
    fn peer(&self) -> String;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port)).await
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timeouts and limits for a [`TransportSession`].
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Applies to connect, login write, acknowledgment read and sends.
    pub io_timeout: Duration,
    /// Read buffer for the login acknowledgment.
    pub ack_max_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            ack_max_bytes: 64,
        }
    }
}

impl From<&CollectorConfig> for TransportOptions {
    fn from(config: &CollectorConfig) -> Self {
        Self {
            io_timeout: Duration::from_secs(config.connect_timeout_secs),
            ack_max_bytes: config.ack_max_bytes,
        }
    }
}

enum Link<S> {
    Disconnected,
    AwaitingLoginAck(S),
    Ready(S),
}

/// Owns the collector connection.
pub struct TransportSession<C: Connector> {
    connector: C,
    options: TransportOptions,
    link: Link<C::Stream>,
}

impl<C: Connector> TransportSession<C> {
    pub fn new(connector: C, options: TransportOptions) -> Self {
        Self {
            connector,
            options,
            link: Link::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.link {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::AwaitingLoginAck(_) => ConnectionState::AwaitingLoginAck,
            Link::Ready(_) => ConnectionState::Ready,
        }
    }

    /// Connect and log in unless already `Ready`.
    ///
    /// On any failure the session is left `Disconnected` with no socket.
    pub async fn ensure_ready(&mut self, login: &WirePacket) -> Result<(), TransportError> {
        if matches!(self.link, Link::Ready(_)) {
            return Ok(());
        }
        self.disconnect().await;

        let peer = self.connector.peer();
        info!(%peer, "Connecting to collector");

        let stream = match timeout(self.options.io_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { peer, source }),
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    peer,
                    timeout: self.options.io_timeout,
                });
            }
        };
        info!(%peer, "Connected");

        self.link = Link::AwaitingLoginAck(stream);
        let result = match &mut self.link {
            Link::AwaitingLoginAck(stream) => handshake(stream, login, &self.options).await,
            _ => Err(TransportError::NotReady),
        };

        match result {
            Ok(ack) => {
                info!("Server response: {:02X?}", ack);
                if let Link::AwaitingLoginAck(stream) =
                    std::mem::replace(&mut self.link, Link::Disconnected)
                {
                    self.link = Link::Ready(stream);
                }
                Ok(())
            }
            Err(e) => {
                self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Write `packet` in one operation. Only valid when `Ready`.
    ///
    /// A failed write drops the connection.
    pub async fn send(&mut self, packet: &WirePacket) -> Result<(), TransportError> {
        let Link::Ready(stream) = &mut self.link else {
            return Err(TransportError::NotReady);
        };

        let bytes = packet.to_bytes();
        let io_timeout = self.options.io_timeout;
        let result = match timeout(io_timeout, write_all(stream, &bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Send(e)),
            Err(_) => Err(TransportError::SendTimeout(io_timeout)),
        };

        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    /// Close the connection, if any. Idempotent.
    pub async fn disconnect(&mut self) {
        match std::mem::replace(&mut self.link, Link::Disconnected) {
            Link::Disconnected => {}
            Link::AwaitingLoginAck(mut stream) | Link::Ready(mut stream) => {
                if let Err(e) = stream.shutdown().await {
                    debug!(error = %e, "Error shutting down collector connection");
                }
                debug!("Collector connection closed");
            }
        }
    }
}

async fn handshake<S>(
    stream: &mut S,
    login: &WirePacket,
    options: &TransportOptions,
) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = login.to_bytes();
    debug!("Sending login packet: {:02X?}", bytes);
    match timeout(options.io_timeout, write_all(stream, &bytes)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(TransportError::Login(e)),
        Err(_) => {
            return Err(TransportError::Login(io::Error::new(
                io::ErrorKind::TimedOut,
                "login write timed out",
            )));
        }
    }

    let mut ack = vec![0u8; options.ack_max_bytes.max(1)];
    let n = match timeout(options.io_timeout, stream.read(&mut ack)).await {
        Ok(Ok(0)) => return Err(TransportError::AckClosed),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(TransportError::Ack(e)),
        Err(_) => return Err(TransportError::AckTimeout(options.io_timeout)),
    };
    ack.truncate(n);
    Ok(ack)
}

async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SensorReading;
    use crate::packet::{ClockSample, encode_login};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio_test::io::{Builder, Mock};

    const IDENTITY: &str = "862942071230965";

    /// Hands out scripted streams; refuses once they run out.
    struct MockConnector {
        streams: Mutex<VecDeque<Mock>>,
    }

    impl MockConnector {
        fn new(streams: Vec<Mock>) -> Self {
            Self {
                streams: Mutex::new(streams.into()),
            }
        }
    }

    impl Connector for MockConnector {
        type Stream = Mock;

        async fn connect(&self) -> io::Result<Mock> {
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }

        fn peer(&self) -> String {
            "mock:9619".to_string()
        }
    }

    /// Never completes a connection.
    struct BlackholeConnector;

    impl Connector for BlackholeConnector {
        type Stream = Mock;

        async fn connect(&self) -> io::Result<Mock> {
            std::future::pending().await
        }

        fn peer(&self) -> String {
            "blackhole:9619".to_string()
        }
    }

    fn login() -> WirePacket {
        encode_login(IDENTITY).unwrap()
    }

    fn data() -> WirePacket {
        WirePacket::sensor_data(
            &SensorReading::from_registers([1, 2, 3, 4, 5, 6, 7, 8]),
            &ClockSample {
                year: 2024,
                month: 3,
                day: 5,
                hour: 14,
                minute: 22,
                second: 7,
            },
        )
    }

    #[tokio::test]
    async fn test_login_then_send() {
        let stream = Builder::new()
            .write(&login().to_bytes())
            .read(b"OK")
            .write(&data().to_bytes())
            .build();
        let mut session =
            TransportSession::new(MockConnector::new(vec![stream]), TransportOptions::default());

        assert_eq!(session.state(), ConnectionState::Disconnected);
        session.ensure_ready(&login()).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);

        // Already ready: no second connection attempt
        session.ensure_ready(&login()).await.unwrap();
        session.send(&data()).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_disconnects() {
        let stream = Builder::new()
            .write(&login().to_bytes())
            .wait(Duration::from_secs(60))
            .build();
        let mut session =
            TransportSession::new(MockConnector::new(vec![stream]), TransportOptions::default());

        let err = session.ensure_ready(&login()).await.unwrap_err();
        assert!(matches!(err, TransportError::AckTimeout(_)));
        assert_eq!(err.phase(), "login");
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ack_closed_disconnects() {
        let stream = Builder::new().write(&login().to_bytes()).build();
        let mut session =
            TransportSession::new(MockConnector::new(vec![stream]), TransportOptions::default());

        let err = session.ensure_ready(&login()).await.unwrap_err();
        assert!(matches!(err, TransportError::AckClosed));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut session =
            TransportSession::new(MockConnector::new(vec![]), TransportOptions::default());

        let err = session.ensure_ready(&login()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(err.phase(), "connect");
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let mut session = TransportSession::new(BlackholeConnector, TransportOptions::default());

        let err = session.ensure_ready(&login()).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectTimeout { timeout, .. } if timeout == Duration::from_secs(10)
        ));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_requires_ready() {
        let mut session =
            TransportSession::new(MockConnector::new(vec![]), TransportOptions::default());

        let err = session.send(&data()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotReady));
    }

    #[tokio::test]
    async fn test_send_failure_demotes_then_reconnects() {
        let first = Builder::new()
            .write(&login().to_bytes())
            .read(b"\x01")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
            .build();
        let second = Builder::new()
            .write(&login().to_bytes())
            .read(b"\x01")
            .write(&data().to_bytes())
            .build();
        let mut session = TransportSession::new(
            MockConnector::new(vec![first, second]),
            TransportOptions::default(),
        );

        session.ensure_ready(&login()).await.unwrap();
        let err = session.send(&data()).await.unwrap_err();
        assert!(matches!(err, TransportError::Send(_)));
        assert_eq!(err.phase(), "send");
        assert_eq!(session.state(), ConnectionState::Disconnected);

        session.ensure_ready(&login()).await.unwrap();
        session.send(&data()).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let stream = Builder::new().write(&login().to_bytes()).read(b"OK").build();
        let mut session =
            TransportSession::new(MockConnector::new(vec![stream]), TransportOptions::default());

        session.ensure_ready(&login()).await.unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }
}
