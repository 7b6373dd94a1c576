//! Serial port primitive consumed by the sensor session.
//!
//! A port can write bytes, read bytes it has already buffered, and
//! report "bytes available" through an [`RxNotifier`] installed by the
//! session. The notifier is the producer end of the session's bounded
//! receive queue.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};
use tracing::{debug, error, info, warn};

use crate::config::SensorConfig;

/// Kind of receive notification raised by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxEventKind {
    /// Bytes are waiting in the port's receive buffer.
    DataReady,
    /// Line or driver error; carries no readable data.
    Error,
}

/// A receive notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxEvent {
    pub kind: RxEventKind,
    /// Bytes available to [`SerialPort::read`].
    pub available: usize,
}

impl RxEvent {
    pub fn data_ready(available: usize) -> Self {
        Self {
            kind: RxEventKind::DataReady,
            available,
        }
    }
}

/// Error raised when a notification cannot be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("Receive queue is full")]
    Overloaded,
    #[error("Sensor session stopped")]
    Stopped,
}

/// Producer end of the bounded receive queue.
///
/// Only [`RxEventKind::DataReady`] events are queued; the queue carries
/// the available length.
#[derive(Debug, Clone)]
pub struct RxNotifier {
    tx: mpsc::Sender<usize>,
}

impl RxNotifier {
    pub(crate) fn new(tx: mpsc::Sender<usize>) -> Self {
        Self { tx }
    }

    /// Queue a notification, waiting for room when the queue is full.
    pub async fn notify(&self, event: RxEvent) -> Result<(), NotifyError> {
        if event.kind != RxEventKind::DataReady {
            debug!(?event, "Ignoring serial event");
            return Ok(());
        }
        self.tx
            .send(event.available)
            .await
            .map_err(|_| NotifyError::Stopped)
    }

    /// Queue a notification without waiting.
    ///
    /// A full queue is reported as [`NotifyError::Overloaded`]; the event
    /// is not queued and the caller decides what to do with the bytes.
    pub fn try_notify(&self, event: RxEvent) -> Result<(), NotifyError> {
        if event.kind != RxEventKind::DataReady {
            debug!(?event, "Ignoring serial event");
            return Ok(());
        }
        self.tx.try_send(event.available).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::Overloaded,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Stopped,
        })
    }
}

/// Byte-level serial port.
pub trait SerialPort: Send + Sync + 'static {
    /// Transmit `bytes`.
    fn write(&self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Take up to `len` received bytes.
    fn read(&self, len: usize) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Install the receive notifier. Called once by the sensor session.
    fn set_notifier(&self, notifier: RxNotifier);
}

/// Serial port backed by `tokio-serial`.
///
/// A background pump buffers incoming bytes and raises one `DataReady`
/// notification per burst, a burst ending after `frame_gap` of silence.
pub struct TokioSerialPort {
    writer: Mutex<WriteHalf<SerialStream>>,
    rx_buffer: Arc<Mutex<VecDeque<u8>>>,
    notifier: Arc<OnceLock<RxNotifier>>,
    pump: JoinHandle<()>,
}

impl TokioSerialPort {
    /// Open and configure the port described by `config`.
    pub fn open(config: &SensorConfig) -> Result<Self, tokio_serial::Error> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(data_bits(config.data_bits))
            .parity(parity(&config.parity))
            .stop_bits(stop_bits(config.stop_bits))
            .flow_control(FlowControl::None);
        let stream = SerialStream::open(&builder)?;

        info!(
            port = %config.port,
            baud = config.baud_rate,
            "Opened serial port"
        );

        let (reader, writer) = tokio::io::split(stream);
        let rx_buffer = Arc::new(Mutex::new(VecDeque::new()));
        let notifier = Arc::new(OnceLock::new());
        let pump = tokio::spawn(pump(
            reader,
            rx_buffer.clone(),
            notifier.clone(),
            Duration::from_millis(config.frame_gap_ms),
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            rx_buffer,
            notifier,
            pump,
        })
    }
}

impl Drop for TokioSerialPort {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl SerialPort for TokioSerialPort {
    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn read(&self, len: usize) -> io::Result<Vec<u8>> {
        let mut buffer = self.rx_buffer.lock().await;
        let len = len.min(buffer.len());
        Ok(buffer.drain(..len).collect())
    }

    fn set_notifier(&self, notifier: RxNotifier) {
        if self.notifier.set(notifier).is_err() {
            warn!("Serial notifier already installed");
        }
    }
}

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// In-memory serial port for dry runs and tests.
///
/// Bytes are fed with [`inject`](Self::inject). An optional responder
/// answers every write, which is enough to stand in for the sensor.
#[derive(Default)]
pub struct MemorySerialPort {
    rx_buffer: Mutex<VecDeque<u8>>,
    written: Mutex<Vec<Vec<u8>>>,
    notifier: OnceLock<RxNotifier>,
    responder: Option<Responder>,
}

impl MemorySerialPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port that answers each write with whatever `responder` returns.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    /// Buffer `bytes` as received and raise a `DataReady` notification.
    pub async fn inject(&self, bytes: &[u8]) -> Result<(), NotifyError> {
        let notifier = self.notifier.get().ok_or(NotifyError::Stopped)?;
        self.rx_buffer.lock().await.extend(bytes);
        notifier.notify(RxEvent::data_ready(bytes.len())).await
    }

    /// Everything written to the port so far.
    pub async fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().await.clone()
    }

    /// Received bytes not yet read.
    pub async fn unread(&self) -> usize {
        self.rx_buffer.lock().await.len()
    }
}

impl SerialPort for MemorySerialPort {
    async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.written.lock().await.push(bytes.to_vec());

        if let Some(reply) = self.responder.as_ref().and_then(|respond| respond(bytes)) {
            self.inject(&reply)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        }
        Ok(())
    }

    async fn read(&self, len: usize) -> io::Result<Vec<u8>> {
        let mut buffer = self.rx_buffer.lock().await;
        let len = len.min(buffer.len());
        Ok(buffer.drain(..len).collect())
    }

    fn set_notifier(&self, notifier: RxNotifier) {
        if self.notifier.set(notifier).is_err() {
            warn!("Serial notifier already installed");
        }
    }
}

/// Receive loop: buffer bytes, notify once the line goes quiet.
async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    rx_buffer: Arc<Mutex<VecDeque<u8>>>,
    notifier: Arc<OnceLock<RxNotifier>>,
    frame_gap: Duration,
) {
    let mut chunk = [0u8; 256];
    let mut pending = 0usize;

    loop {
        let read = if pending == 0 {
            Ok(reader.read(&mut chunk).await)
        } else {
            tokio::time::timeout(frame_gap, reader.read(&mut chunk)).await
        };

        match read {
            Ok(Ok(0)) => {
                warn!("Serial port closed");
                flush_burst(&rx_buffer, &notifier, pending).await;
                break;
            }
            Ok(Ok(n)) => {
                rx_buffer.lock().await.extend(&chunk[..n]);
                pending += n;
            }
            Ok(Err(e)) => {
                error!(error = %e, "Serial read failed");
                break;
            }
            Err(_) => {
                if !flush_burst(&rx_buffer, &notifier, pending).await {
                    debug!("Sensor session gone, stopping serial pump");
                    break;
                }
                pending = 0;
            }
        }
    }
}

/// Report a finished burst of `pending` bytes. Returns false once the
/// session has stopped listening.
async fn flush_burst(
    rx_buffer: &Mutex<VecDeque<u8>>,
    notifier: &OnceLock<RxNotifier>,
    pending: usize,
) -> bool {
    if pending == 0 {
        return true;
    }
    match notifier.get() {
        Some(notifier) => notifier.notify(RxEvent::data_ready(pending)).await.is_ok(),
        None => {
            // Nobody listening yet; keep later frames aligned.
            debug!(bytes = pending, "Discarding unsolicited serial data");
            rx_buffer.lock().await.clear();
            true
        }
    }
}

fn data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn parity(parity: &str) -> Parity {
    match parity.to_lowercase().as_str() {
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => Parity::None,
    }
}

fn stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}
