//! Sensor session: query the soil sensor and keep its latest reading.
//!
//! The serial port raises receive notifications into a bounded queue. A
//! dedicated worker drains the queue, reads the notified bytes, decodes
//! them, and replaces the single-slot latest reading. A failed decode
//! clears the slot; there is never a backlog of readings.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SensorConfig;
use crate::frame::{self, MalformedResponse, QUERY_FRAME, SensorReading};
use crate::serial::{RxNotifier, SerialPort};

/// Error type for sensor operations.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("No reading received within {0:?}")]
    NoReadingYet(Duration),
    #[error("Serial I/O failed: {0}")]
    Serial(#[from] io::Error),
    #[error("Sensor session stopped")]
    Stopped,
}

/// Tuning for a [`SensorSession`].
#[derive(Debug, Clone, Copy)]
pub struct SensorOptions {
    /// Pending receive notifications before the producer has to wait.
    pub queue_capacity: usize,
    /// Require a valid Modbus CRC on responses.
    pub verify_crc: bool,
}

impl Default for SensorOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            verify_crc: true,
        }
    }
}

impl From<&SensorConfig> for SensorOptions {
    fn from(config: &SensorConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            verify_crc: config.verify_crc,
        }
    }
}

type LatestSlot = Arc<watch::Sender<Option<SensorReading>>>;

/// Owns the query cadence and the latest decoded reading.
pub struct SensorSession<P: SerialPort> {
    port: Arc<P>,
    latest_tx: LatestSlot,
    latest: watch::Receiver<Option<SensorReading>>,
    shutdown: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl<P: SerialPort> SensorSession<P> {
    /// Install the receive notifier on `port` and start the decode worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(port: Arc<P>, options: SensorOptions) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (latest_tx, latest) = watch::channel(None);
        let latest_tx = Arc::new(latest_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        port.set_notifier(RxNotifier::new(queue_tx));

        let worker = tokio::spawn(decode_worker(
            port.clone(),
            queue_rx,
            latest_tx.clone(),
            options.verify_crc,
            shutdown_rx,
        ));

        Self {
            port,
            latest_tx,
            latest,
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        }
    }

    /// Send the fixed Modbus query. Does not wait for the reply.
    ///
    /// Clears the latest reading so only a reply to this query counts.
    pub async fn send_query(&mut self) -> Result<(), SensorError> {
        self.latest_tx.send_replace(None);
        self.latest.borrow_and_update();

        self.port.write(&QUERY_FRAME).await?;
        debug!("Query sent: {:02X?}", QUERY_FRAME);
        Ok(())
    }

    /// The current latest reading, if any.
    pub fn latest(&self) -> Option<SensorReading> {
        *self.latest.borrow()
    }

    /// Wait up to `timeout` for a reading, re-checking the slot at least
    /// every `poll_interval`.
    ///
    /// Returns as soon as the decode worker publishes a reading.
    pub async fn await_reading(
        &mut self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<SensorReading, SensorError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(reading) = *self.latest.borrow_and_update() {
                return Ok(reading);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SensorError::NoReadingYet(timeout));
            }

            let tick = poll_interval.min(deadline - now);
            if let Ok(Err(_)) = tokio::time::timeout(tick, self.latest.changed()).await {
                return Err(SensorError::Stopped);
            }
        }
    }

    /// Stop the decode worker and wait for it to exit.
    ///
    /// The receive queue is closed; further notifications from the port
    /// fail with [`NotifyError::Stopped`](crate::serial::NotifyError::Stopped).
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Sensor decode worker ended abnormally");
            }
        }
    }
}

impl<P: SerialPort> Drop for SensorSession<P> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Drain receive notifications and publish decode outcomes.
async fn decode_worker<P: SerialPort>(
    port: Arc<P>,
    mut queue: mpsc::Receiver<usize>,
    latest: LatestSlot,
    verify_crc: bool,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let len = tokio::select! {
            _ = &mut shutdown => break,
            len = queue.recv() => match len {
                Some(len) => len,
                None => break,
            },
        };

        let raw = match port.read(len).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Serial read failed");
                latest.send_replace(None);
                continue;
            }
        };

        match decode(&raw, verify_crc) {
            Ok(reading) => {
                info!(
                    temperature_c = reading.temperature_celsius(),
                    humidity_pct = reading.humidity_percent(),
                    ec_us_cm = reading.ec,
                    ph = reading.ph_value(),
                    nitrogen_mg_kg = reading.nitrogen,
                    phosphor_mg_kg = reading.phosphor,
                    potassium_mg_kg = reading.potassium,
                    salinity_mg_l = reading.salinity,
                    "Decoded sensor values"
                );
                latest.send_replace(Some(reading));
            }
            Err(e) => {
                warn!(error = %e, bytes = raw.len(), "Unexpected or invalid Modbus response");
                latest.send_replace(None);
            }
        }
    }

    queue.close();
    debug!("Sensor decode worker stopped");
}

fn decode(raw: &[u8], verify_crc: bool) -> Result<SensorReading, MalformedResponse> {
    if verify_crc {
        frame::decode_verified(raw)
    } else {
        frame::decode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_response;
    use crate::serial::{MemorySerialPort, NotifyError};

    fn reading(seed: u16) -> SensorReading {
        SensorReading::from_registers([seed, seed + 1, seed + 2, seed + 3, 4, 5, 6, 7])
    }

    const WAIT: Duration = Duration::from_secs(5);
    const TICK: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_query_then_reading() {
        let port = Arc::new(MemorySerialPort::with_responder(|query| {
            (query == QUERY_FRAME).then(|| encode_response(&reading(100)))
        }));
        let mut session = SensorSession::start(port.clone(), SensorOptions::default());

        session.send_query().await.unwrap();
        let got = session.await_reading(WAIT, TICK).await.unwrap();

        assert_eq!(got, reading(100));
        assert_eq!(port.written().await, vec![QUERY_FRAME.to_vec()]);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reading_times_out() {
        let port = Arc::new(MemorySerialPort::new());
        let mut session = SensorSession::start(port, SensorOptions::default());

        session.send_query().await.unwrap();
        let start = Instant::now();
        let result = session.await_reading(WAIT, TICK).await;

        assert!(matches!(result, Err(SensorError::NoReadingYet(d)) if d == WAIT));
        assert!(start.elapsed() >= WAIT);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frames_then_valid() {
        let port = Arc::new(MemorySerialPort::new());
        let mut session = SensorSession::start(port.clone(), SensorOptions::default());
        session.send_query().await.unwrap();

        let mut bad_header = encode_response(&reading(1));
        bad_header[0] = 0x02;
        let mut bad_crc = encode_response(&reading(2));
        bad_crc[20] ^= 0x55;
        port.inject(&bad_header).await.unwrap();
        port.inject(&bad_crc).await.unwrap();
        port.inject(&[0x01, 0x03]).await.unwrap();
        port.inject(&[0x01, 0x83, 0x02, 0xC0, 0xF1]).await.unwrap();
        port.inject(&encode_response(&reading(9))).await.unwrap();

        let got = session.await_reading(WAIT, TICK).await.unwrap();
        assert_eq!(got, reading(9));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_clears_previous_reading() {
        let port = Arc::new(MemorySerialPort::new());
        let session = SensorSession::start(port.clone(), SensorOptions::default());
        let mut updates = session.latest.clone();

        port.inject(&encode_response(&reading(3))).await.unwrap();
        updates.wait_for(|r| r.is_some()).await.unwrap();
        assert_eq!(session.latest(), Some(reading(3)));

        port.inject(&[0xFF; 21]).await.unwrap();
        updates.wait_for(|r| r.is_none()).await.unwrap();
        assert_eq!(session.latest(), None);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_query_discards_stale_reading() {
        let port = Arc::new(MemorySerialPort::new());
        let mut session = SensorSession::start(port.clone(), SensorOptions::default());
        let mut updates = session.latest.clone();

        port.inject(&encode_response(&reading(3))).await.unwrap();
        updates.wait_for(|r| r.is_some()).await.unwrap();

        session.send_query().await.unwrap();
        assert_eq!(session.latest(), None);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_crc_check_can_be_disabled() {
        let port = Arc::new(MemorySerialPort::new());
        let options = SensorOptions {
            verify_crc: false,
            ..SensorOptions::default()
        };
        let mut session = SensorSession::start(port.clone(), options);

        // 19 bytes, no CRC at all
        let frame = encode_response(&reading(5));
        port.inject(&frame[..19]).await.unwrap();

        assert_eq!(session.await_reading(WAIT, TICK).await.unwrap(), reading(5));
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_overload_keeps_order() {
        let port = Arc::new(MemorySerialPort::new());
        let session = SensorSession::start(port.clone(), SensorOptions::default());
        let mut updates = session.latest.clone();

        let producer = {
            let port = port.clone();
            tokio::spawn(async move {
                for seed in 0..50u16 {
                    port.inject(&encode_response(&reading(seed * 10))).await.unwrap();
                }
            })
        };
        producer.await.unwrap();

        let last = reading(490);
        updates.wait_for(|r| *r == Some(last)).await.unwrap();
        assert_eq!(port.unread().await, 0);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_queue() {
        let port = Arc::new(MemorySerialPort::new());
        let session = SensorSession::start(port.clone(), SensorOptions::default());

        session.shutdown().await;
        let result = port.inject(&encode_response(&reading(1))).await;
        assert_eq!(result, Err(NotifyError::Stopped));
    }
}
